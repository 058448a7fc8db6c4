//! REST API surface of a farm node.
//!
//! Routers are built per area and merged in the binary. Every handler works
//! against the shared [`Node`](crate::node::Node) handle; there are no
//! process-wide singletons behind the routes.

pub mod device_routes;
pub mod election_routes;
pub mod jobs_routes;
pub mod worker_routes;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::Router;

use crate::error::NodeError;
use crate::node::Node;

pub use device_routes::create_device_router;
pub use election_routes::create_election_router;
pub use jobs_routes::create_jobs_router;
pub use worker_routes::create_worker_router;

/// Build the full API router.
pub fn create_router(node: Arc<Node>) -> Router {
    Router::new()
        .merge(create_jobs_router(node.clone()))
        .merge(create_worker_router(node.clone()))
        .merge(create_election_router(node.clone()))
        .merge(create_device_router(node))
}

/// Map a library error onto the HTTP boundary.
pub(crate) fn error_response(err: NodeError) -> (StatusCode, String) {
    let status = match &err {
        NodeError::JobNotFound(_) => StatusCode::NOT_FOUND,
        NodeError::JobNotAccepting { .. } => StatusCode::CONFLICT,
        NodeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        NodeError::NoLeader => StatusCode::INTERNAL_SERVER_ERROR,
        NodeError::NotLeader => StatusCode::FORBIDDEN,
        NodeError::Http(_) | NodeError::PeerRejected { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}
