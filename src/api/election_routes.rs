//! Election control-plane routes.
//!
//! ## Endpoints
//!
//! - `POST /api/election/start` - initiate an election (optional
//!   `?force_remove=<ip>` to drop a dead peer first)
//! - `GET  /api/election/status` - current election/ring view
//! - `POST /api/election/notify_node_disconnection` - leader-side entry for
//!   lost-peer reports

use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::error_response;
use crate::discovery::wire::WireMessage;
use crate::election::{ElectionStatus, TokenTransport};
use crate::node::Node;

pub fn create_election_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/api/election/start", post(start_election))
        .route("/api/election/status", get(election_status))
        .route(
            "/api/election/notify_node_disconnection",
            post(notify_node_disconnection),
        )
        .with_state(node)
}

#[derive(Debug, Deserialize)]
struct StartParams {
    force_remove: Option<Ipv4Addr>,
}

/// POST /api/election/start
async fn start_election(
    State(node): State<Arc<Node>>,
    Query(params): Query<StartParams>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if let Some(ip) = params.force_remove {
        info!(%ip, "force-removing peer before election");
        if let Err(err) = node
            .transport
            .broadcast(&WireMessage::PopStaleLeader { ip })
            .await
        {
            warn!(error = %err, "force-remove broadcast failed");
        }
        node.election.handle_pop_stale_leader(ip);
    }

    node.election.initiate().await.map_err(error_response)?;
    Ok(Json(json!({
        "status": "Election Initiated",
        "message": "Election process has been started. Ring establishment in progress.",
    })))
}

/// GET /api/election/status
async fn election_status(State(node): State<Arc<Node>>) -> Json<ElectionStatus> {
    Json(node.election.status())
}

#[derive(Debug, Deserialize)]
struct DisconnectionNotice {
    ip: Ipv4Addr,
}

/// POST /api/election/notify_node_disconnection
///
/// Leader-side handling of a lost peer: reassign its frames or cancel its
/// jobs depending on its role in each affected job.
async fn notify_node_disconnection(
    State(node): State<Arc<Node>>,
    Json(notice): Json<DisconnectionNotice>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if !node.membership.contains(notice.ip) {
        return Err((
            StatusCode::NOT_FOUND,
            format!("No device found with IP: {} or Device already removed", notice.ip),
        ));
    }

    let report = node
        .coordinator
        .handle_node_disconnection(notice.ip)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Node {} disconnected.", report.ip),
        "jobs_reset": report.jobs_reset,
    })))
}
