//! Worker intake routes.
//!
//! ## Endpoints
//!
//! - `POST /api/worker/submit-job` - receive a job package from the leader
//! - `POST /api/worker/stop-render` - stop rendering a job on this node

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::api::error_response;
use crate::api::jobs_routes::collect_multipart;
use crate::node::Node;

const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

pub fn create_worker_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/api/worker/submit-job", post(submit_job))
        .route("/api/worker/stop-render", post(stop_render))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(node)
}

/// POST /api/worker/submit-job
///
/// Job package intake: scene file plus the leader's metadata, stored under
/// the job directory. A `JOB_COMMIT` that arrived first is applied now.
async fn submit_job(
    State(node): State<Arc<Node>>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    let (fields, files) = collect_multipart(multipart).await?;

    let blend = files
        .get("blend_file")
        .ok_or((StatusCode::BAD_REQUEST, "No blend file provided".to_string()))?;
    if blend.filename.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Empty filename".into()));
    }
    if !blend.filename.to_lowercase().ends_with(".blend") {
        return Err((StatusCode::BAD_REQUEST, "Invalid file type".into()));
    }

    let metadata = files
        .get("metadata")
        .ok_or((StatusCode::BAD_REQUEST, "No metadata file provided".to_string()))?;
    if !metadata.filename.to_lowercase().ends_with(".json") {
        return Err((StatusCode::BAD_REQUEST, "Invalid metadata file type".into()));
    }

    let job_id = fields
        .get("uuid")
        .filter(|id| !id.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "uuid missing".to_string()))?;

    node.worker
        .accept_job(job_id, &blend.filename, &blend.bytes, &metadata.bytes)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Job created successfully",
            "job_id": job_id,
            "job_dir": node.store.job_dir(job_id),
        })),
    ))
}

#[derive(Debug, Deserialize)]
struct StopRenderRequest {
    job_id: String,
    #[serde(default)]
    ip: Option<String>,
}

/// POST /api/worker/stop-render
async fn stop_render(
    State(node): State<Arc<Node>>,
    Json(body): Json<StopRenderRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if body.job_id.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "IP address or Job ID not provided.".into(),
        ));
    }
    let status = node
        .worker
        .stop_render_local(&body.job_id)
        .await
        .map_err(error_response)?;
    info!(job_id = %body.job_id, requested_by = ?body.ip, "stop-render handled");
    Ok(Json(json!({
        "success": true,
        "result": { "status": status },
    })))
}
