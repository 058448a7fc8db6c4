//! Control message wire format: line-delimited JSON
//! `{"seq":<u64>,"type":<string>,"payload":<object>}`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlKind {
    JobCreated,
    JobBroadcastBegin,
    JobSent,
    JobBroadcastDone,
    JobCommit,
    StopRender,
    CancelJob,
    CancelAll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub seq: u64,
    #[serde(rename = "type")]
    pub kind: ControlKind,
    pub payload: serde_json::Value,
}

impl ControlMessage {
    /// Serialize as one wire line, newline included.
    pub fn to_line(&self) -> String {
        // ControlMessage serialization cannot fail: all fields are plain data.
        let mut line = serde_json::to_string(self).expect("control message serializes");
        line.push('\n');
        line
    }

    pub fn parse_line(line: &str) -> Option<ControlMessage> {
        serde_json::from_str(line.trim()).ok()
    }

    pub fn job_id(&self) -> Option<&str> {
        self.payload.get("job_id").and_then(|v| v.as_str())
    }
}

/// Payload helper for the common `{"job_id": ...}` shape.
pub fn job_payload(job_id: &str) -> serde_json::Value {
    serde_json::json!({ "job_id": job_id })
}

/// Payload for per-worker `JOB_SENT` markers.
pub fn job_worker_payload(job_id: &str, worker_ip: std::net::Ipv4Addr) -> serde_json::Value {
    serde_json::json!({ "job_id": job_id, "worker_ip": worker_ip.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_uses_screaming_snake_on_the_wire() {
        let msg = ControlMessage {
            seq: 7,
            kind: ControlKind::JobBroadcastBegin,
            payload: job_payload("abc"),
        };
        let line = msg.to_line();
        assert!(line.contains("\"type\":\"JOB_BROADCAST_BEGIN\""), "line: {line}");
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_parse_line_accepts_wire_shape() {
        let parsed =
            ControlMessage::parse_line(r#"{"seq":3,"type":"JOB_COMMIT","payload":{"job_id":"j1"}}"#)
                .unwrap();
        assert_eq!(parsed.seq, 3);
        assert_eq!(parsed.kind, ControlKind::JobCommit);
        assert_eq!(parsed.job_id(), Some("j1"));
    }

    #[test]
    fn test_parse_line_drops_malformed_input() {
        assert!(ControlMessage::parse_line("not json").is_none());
        assert!(ControlMessage::parse_line(r#"{"seq":"x","type":"JOB_COMMIT"}"#).is_none());
        assert!(ControlMessage::parse_line("").is_none());
    }
}
