//! Error types shared across the node.
//!
//! Library code returns `NodeError` and propagates with `?`; the HTTP layer
//! maps variants onto status codes at the route boundary.

use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Distinguished error for operations that require an elected leader.
    #[error("no leader elected")]
    NoLeader,

    #[error("operation requires the leader role")]
    NotLeader,

    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The job exists but is not accepting frames (wrong status); maps to
    /// 409 at the HTTP boundary.
    #[error("job {job_id} is not in progress")]
    JobNotAccepting { job_id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("peer rejected request ({peer}): {detail}")]
    PeerRejected { peer: Ipv4Addr, detail: String },

    #[error("renderer failed on frame {frame}: {detail}")]
    Renderer { frame: u32, detail: String },

    #[error("stitcher failed: {0}")]
    Stitcher(String),

    #[error("missing render output: {0}")]
    MissingArtifact(PathBuf),
}

pub type Result<T> = std::result::Result<T, NodeError>;

impl NodeError {
    /// True for failures the caller may recover from by electing a new
    /// leader and retrying.
    pub fn is_leader_related(&self) -> bool {
        matches!(self, NodeError::NoLeader | NodeError::NotLeader)
    }
}
