//! Device and cluster-status routes.
//!
//! ## Endpoints
//!
//! - `GET  /api/my_device` - local resource report and tooling checks
//! - `GET  /api/devices` - membership snapshot
//! - `GET  /api/status` / `GET /api/health` - liveness views
//! - `POST /api/start` / `POST /api/stop` / `POST /api/clear` - discovery control
//! - `POST /api/node_disconnected` - client-observed peer loss, relayed to the leader
//! - `POST /api/leader_is_down_flag` - poll-and-clear the leader-crash flag

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::error_response;
use crate::discovery::wire::Role;
use crate::node::Node;

const GIB: u64 = 1024 * 1024 * 1024;

pub fn create_device_router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/api/my_device", get(my_device))
        .route("/api/devices", get(devices))
        .route("/api/status", get(status))
        .route("/api/health", get(health))
        .route("/api/start", post(start))
        .route("/api/stop", post(stop))
        .route("/api/clear", post(clear))
        .route("/api/node_disconnected", post(node_disconnected))
        .route("/api/leader_is_down_flag", post(leader_is_down_flag))
        .with_state(node)
}

/// Locate a binary on PATH (or accept an absolute/relative path directly).
fn is_installed(binary: &Path) -> bool {
    if binary.components().count() > 1 {
        return binary.exists();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
}

/// GET /api/my_device
async fn my_device(State(node): State<Arc<Node>>) -> Json<Value> {
    let stats = node.prober.device_stats();
    let blender_installed = is_installed(&node.config.blender_path);
    let ffmpeg_installed = is_installed(&node.config.ffmpeg_path);

    Json(json!({
        "pc_name": node.identity.name,
        "local_ip": node.identity.ip.to_string(),
        "cpu_usage": stats.cpu_usage,
        "memory_total": stats.memory_total,
        "memory_used": stats.memory_used,
        "memory_usage": stats.memory_usage,
        "free_disk": stats.free_disk,
        "resource_score": node.prober.score(),
        "checks": {
            "blender_installed": blender_installed,
            "ffmpeg_installed": ffmpeg_installed,
            "memory_sufficient": stats.memory_total >= 8 * GIB,
            "disk_sufficient": stats.free_disk >= 20 * GIB,
        },
    }))
}

#[derive(Debug, Serialize)]
struct DeviceView {
    name: String,
    ip: Ipv4Addr,
    resource_score: u64,
    my_role: Role,
    last_seen_secs: u64,
}

/// GET /api/devices
async fn devices(State(node): State<Arc<Node>>) -> Json<Vec<DeviceView>> {
    let views = node
        .membership
        .snapshot()
        .into_iter()
        .map(|peer| DeviceView {
            name: peer.name.clone(),
            ip: peer.ip,
            resource_score: peer.score,
            my_role: peer.role,
            last_seen_secs: peer.age().as_secs(),
        })
        .collect();
    Json(views)
}

/// GET /api/status
async fn status(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(json!({
        "running": node.discovery.is_running(),
        "local_pc_name": node.identity.name,
        "local_ip": node.identity.ip.to_string(),
    }))
}

/// GET /api/health
async fn health(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "running": node.discovery.is_running(),
        "role": node.election.my_role(),
        "leader": node.election.current_leader().map(|ip| ip.to_string()),
    }))
}

/// POST /api/start
async fn start(State(node): State<Arc<Node>>) -> Json<Value> {
    if node.discovery.is_running() {
        return Json(json!({ "success": true, "message": "Already running" }));
    }
    node.discovery.mark_started();
    Json(json!({ "success": true, "message": "Discovery Service Started" }))
}

/// POST /api/stop
async fn stop(State(node): State<Arc<Node>>) -> Json<Value> {
    node.discovery.mark_stopped();
    Json(json!({ "success": true }))
}

/// POST /api/clear
async fn clear(State(node): State<Arc<Node>>) -> Json<Value> {
    node.membership.clear();
    if node.discovery.is_running() {
        node.discovery.mark_started();
    }
    Json(json!({ "success": true }))
}

#[derive(Debug, Deserialize)]
struct DisconnectedNotice {
    ip: Ipv4Addr,
}

/// POST /api/node_disconnected
///
/// A client observed a peer going down; relay the report to the current
/// leader so job recovery can run there.
async fn node_disconnected(
    State(node): State<Arc<Node>>,
    Json(notice): Json<DisconnectedNotice>,
) -> Result<Json<Value>, (StatusCode, String)> {
    node.notify_leader_of_disconnection(notice.ip)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Device with IP {} removed.", notice.ip),
    })))
}

/// POST /api/leader_is_down_flag
async fn leader_is_down_flag(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(json!({ "leader_is_down": node.monitor.take_leader_down_flag() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_installed_with_absolute_path() {
        // The test binary itself certainly exists.
        let exe = std::env::current_exe().unwrap();
        assert!(is_installed(&exe));
        assert!(!is_installed(Path::new("/definitely/not/a/binary")));
    }

    #[test]
    fn test_is_installed_rejects_missing_path_entry() {
        assert!(!is_installed(Path::new("no-such-binary-on-path-xyz")));
    }
}
