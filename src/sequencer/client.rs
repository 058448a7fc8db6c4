//! Worker-side sequenced receiver.
//!
//! Keeps one persistent connection to the current leader's sequencer and
//! releases messages strictly in sequence order: lower-than-expected seqs
//! are discarded, gaps are buffered until filled. The buffering logic lives
//! in [`SequenceBuffer`] so it can be exercised without sockets.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::sequencer::message::ControlMessage;

const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Reorders a stream of control messages into gap-free sequence order.
#[derive(Debug, Default)]
pub struct SequenceBuffer {
    next_expected: u64,
    pending: BTreeMap<u64, ControlMessage>,
}

impl SequenceBuffer {
    pub fn new() -> Self {
        SequenceBuffer {
            next_expected: 1,
            pending: BTreeMap::new(),
        }
    }

    /// Accept one message from the wire; returns every message now ready
    /// for dispatch, in order.
    pub fn push(&mut self, msg: ControlMessage) -> Vec<ControlMessage> {
        if msg.seq < self.next_expected {
            debug!(seq = msg.seq, expected = self.next_expected, "discarding replayed seq");
            return Vec::new();
        }
        if msg.seq > self.next_expected {
            self.pending.insert(msg.seq, msg);
            return Vec::new();
        }

        let mut ready = vec![msg];
        self.next_expected += 1;
        while let Some(next) = self.pending.remove(&self.next_expected) {
            ready.push(next);
            self.next_expected += 1;
        }
        ready
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Drop buffered state and restart at seq 1 for a new leader
    /// incarnation.
    pub fn reset(&mut self) {
        self.next_expected = 1;
        self.pending.clear();
    }
}

/// Handle to the reader task; dropping it (or calling [`stop`]) tears the
/// connection down. A new leader means a new client with a fresh buffer.
pub struct SequencedClient {
    task: JoinHandle<()>,
}

impl SequencedClient {
    /// Connect to `leader_ip:port` and feed ordered messages into `out`.
    /// Reconnects with a fresh buffer until stopped; each (re)connection
    /// expects the sequence to restart only when the leader restarted it.
    pub fn start(
        leader_ip: Ipv4Addr,
        port: u16,
        out: mpsc::UnboundedSender<ControlMessage>,
    ) -> SequencedClient {
        let task = tokio::spawn(async move {
            loop {
                let stream = match TcpStream::connect((leader_ip, port)).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        debug!(%leader_ip, error = %err, "sequencer connect failed; retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };
                info!(%leader_ip, "connected to sequencer");

                let mut buffer = SequenceBuffer::new();
                let mut lines = BufReader::new(stream).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let Some(msg) = ControlMessage::parse_line(&line) else {
                                warn!(%line, "dropping malformed control line");
                                continue;
                            };
                            for ready in buffer.push(msg) {
                                if out.send(ready).is_err() {
                                    // Dispatcher is gone; the node is
                                    // rebuilding its control role.
                                    return;
                                }
                            }
                        }
                        Ok(None) => {
                            warn!(%leader_ip, "sequencer connection closed by leader");
                            break;
                        }
                        Err(err) => {
                            warn!(%leader_ip, error = %err, "sequencer read failed");
                            break;
                        }
                    }
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
        SequencedClient { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for SequencedClient {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::message::{job_payload, ControlKind};

    fn msg(seq: u64, kind: ControlKind) -> ControlMessage {
        ControlMessage {
            seq,
            kind,
            payload: job_payload("job-1"),
        }
    }

    #[test]
    fn test_in_order_stream_passes_through() {
        let mut buf = SequenceBuffer::new();
        for seq in 1..=4u64 {
            let ready = buf.push(msg(seq, ControlKind::JobSent));
            assert_eq!(ready.len(), 1);
            assert_eq!(ready[0].seq, seq);
        }
        assert_eq!(buf.next_expected(), 5);
    }

    #[test]
    fn test_reordered_wire_dispatches_in_seq_order() {
        // Wire order 1,3,2,6,4,5 must dispatch as 1,2,3,4,5,6.
        let kinds = [
            ControlKind::JobCreated,
            ControlKind::JobBroadcastBegin,
            ControlKind::JobSent,
            ControlKind::JobSent,
            ControlKind::JobBroadcastDone,
            ControlKind::JobCommit,
        ];
        let mut buf = SequenceBuffer::new();
        let mut dispatched = Vec::new();
        for seq in [1u64, 3, 2, 6, 4, 5] {
            dispatched.extend(buf.push(msg(seq, kinds[(seq - 1) as usize])));
        }
        let seqs: Vec<u64> = dispatched.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        let kinds_seen: Vec<ControlKind> = dispatched.iter().map(|m| m.kind).collect();
        assert_eq!(kinds_seen.as_slice(), kinds.as_slice());
    }

    #[test]
    fn test_replayed_seq_is_discarded() {
        let mut buf = SequenceBuffer::new();
        buf.push(msg(1, ControlKind::JobCreated));
        buf.push(msg(2, ControlKind::JobCommit));
        let ready = buf.push(msg(1, ControlKind::JobCreated));
        assert!(ready.is_empty(), "seq below next_expected must be dropped");
        assert_eq!(buf.next_expected(), 3);
    }

    #[test]
    fn test_reset_restarts_sequence_space() {
        let mut buf = SequenceBuffer::new();
        buf.push(msg(1, ControlKind::JobCreated));
        buf.push(msg(5, ControlKind::CancelAll));
        buf.reset();
        assert_eq!(buf.next_expected(), 1);
        // The new incarnation's seq 1 dispatches immediately.
        let ready = buf.push(msg(1, ControlKind::JobCreated));
        assert_eq!(ready.len(), 1);
    }
}
