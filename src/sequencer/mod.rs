//! Leader-hosted totally-ordered control channel.
//!
//! The current leader runs a TCP fan-out sequencer; every other node keeps
//! one persistent client connection to it. Each control message gets a
//! sequence number allocated by the leader, and every subscriber dispatches
//! messages in exactly that order. Each leader incarnation starts a fresh
//! sequence space at 1.

mod client;
mod message;
mod server;

pub use client::{SequenceBuffer, SequencedClient};
pub use message::{job_payload, job_worker_payload, ControlKind, ControlMessage};
pub use server::SequencerServer;

use std::sync::{Arc, Mutex};

use tracing::debug;

/// Shared handle to whichever sequencer this node currently hosts.
///
/// Job code broadcasts through this regardless of role: while the node is
/// not the leader there is no server installed and markers are silently
/// skipped (they only ever originate on the leader).
#[derive(Default)]
pub struct ControlBroadcaster {
    server: Mutex<Option<Arc<SequencerServer>>>,
}

impl ControlBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the sequencer of a new leader incarnation (or clear it on
    /// demotion). The previous server, if any, is shut down.
    pub fn install(&self, server: Option<Arc<SequencerServer>>) {
        let previous = {
            let mut slot = self.server.lock().expect("broadcaster lock poisoned");
            std::mem::replace(&mut *slot, server)
        };
        if let Some(old) = previous {
            old.shutdown();
        }
    }

    /// Broadcast a control message; returns the assigned seq, or `None`
    /// when this node is not hosting a sequencer.
    pub fn broadcast(&self, kind: ControlKind, payload: serde_json::Value) -> Option<u64> {
        let server = self
            .server
            .lock()
            .expect("broadcaster lock poisoned")
            .clone();
        match server {
            Some(server) => Some(server.broadcast(kind, payload)),
            None => {
                debug!(?kind, "no sequencer installed; control message skipped");
                None
            }
        }
    }

    pub fn is_installed(&self) -> bool {
        self.server
            .lock()
            .expect("broadcaster lock poisoned")
            .is_some()
    }

    pub fn current(&self) -> Option<Arc<SequencerServer>> {
        self.server
            .lock()
            .expect("broadcaster lock poisoned")
            .clone()
    }
}
