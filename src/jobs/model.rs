//! Job metadata: the `metadata.json` persisted in every job directory.
//!
//! The leader's copy is authoritative for the job as a whole; each worker's
//! copy is authoritative only for its own slice and local status.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    /// Committed on a worker but not yet rendering.
    Ready,
    InProgress,
    CompletedFrames,
    CompletedVideo,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::CompletedVideo | JobStatus::Canceled)
    }
}

/// Submission parameters captured at upload time. Unknown fields from the
/// submitting client are preserved round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParams {
    pub frame_start: u32,
    pub frame_end: u32,
    pub fps: u32,
    #[serde(default)]
    pub renderer: Option<String>,
    pub initiator_client_ip: Ipv4Addr,
    pub initiator_is_participant: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl JobParams {
    pub fn total_frames(&self) -> u32 {
        self.frame_end.saturating_sub(self.frame_start) + 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_id: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub leader_ip: Ipv4Addr,
    pub no_of_nodes: usize,
    pub metadata: JobParams,
    /// Per-worker frame assignments, written at broadcast time.
    #[serde(default)]
    pub jobs: BTreeMap<Ipv4Addr, Vec<u32>>,
    #[serde(default)]
    pub total_no_frames: u32,
    #[serde(default)]
    pub remaining_frames: u32,
    /// Resource scores snapshotted when the job was created.
    #[serde(default)]
    pub scores: BTreeMap<Ipv4Addr, u64>,
}

impl JobMetadata {
    pub fn assignment_for(&self, ip: Ipv4Addr) -> &[u32] {
        self.jobs.get(&ip).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total frames currently assigned across all workers.
    pub fn assigned_frames(&self) -> u32 {
        self.jobs.values().map(|f| f.len() as u32).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> JobParams {
        JobParams {
            frame_start: 1,
            frame_end: 10,
            fps: 24,
            renderer: Some("CYCLES".into()),
            initiator_client_ip: "10.0.0.1".parse().unwrap(),
            initiator_is_participant: true,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_status_wire_names_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&JobStatus::CompletedFrames).unwrap(),
            "\"completed_frames\""
        );
        assert_eq!(serde_json::to_string(&JobStatus::Canceled).unwrap(), "\"canceled\"");
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Canceled.is_terminal());
        assert!(JobStatus::CompletedVideo.is_terminal());
        assert!(!JobStatus::CompletedFrames.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_assignments_serialize_with_ip_keys() {
        let mut meta = JobMetadata {
            job_id: "j1".into(),
            filename: "scene.blend".into(),
            created_at: Utc::now(),
            status: JobStatus::Created,
            leader_ip: "10.0.0.2".parse().unwrap(),
            no_of_nodes: 2,
            metadata: params(),
            jobs: BTreeMap::new(),
            total_no_frames: 0,
            remaining_frames: 0,
            scores: BTreeMap::new(),
        };
        meta.jobs.insert("10.0.0.3".parse().unwrap(), vec![4, 5]);

        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["jobs"]["10.0.0.3"], serde_json::json!([4, 5]));

        let back: JobMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back.assignment_for("10.0.0.3".parse().unwrap()), &[4, 5]);
        assert!(back.assignment_for("10.0.0.9".parse().unwrap()).is_empty());
    }

    #[test]
    fn test_unknown_param_fields_survive_round_trip() {
        let raw = serde_json::json!({
            "frame_start": 1,
            "frame_end": 2,
            "fps": 30,
            "initiator_client_ip": "10.0.0.1",
            "initiator_is_participant": false,
            "samples": 128,
            "res_x": 1920
        });
        let params: JobParams = serde_json::from_value(raw).unwrap();
        assert_eq!(params.extra["samples"], serde_json::json!(128));
        let back = serde_json::to_value(&params).unwrap();
        assert_eq!(back["res_x"], serde_json::json!(1920));
    }

    #[test]
    fn test_total_frames_inclusive_range() {
        let p = params();
        assert_eq!(p.total_frames(), 10);
    }
}
