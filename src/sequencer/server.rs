//! Leader-side sequencer: accepts worker connections and fans control
//! messages out in allocation order.
//!
//! Sequence allocation and per-connection enqueue happen under one lock, so
//! the order of seqs on every connection's queue matches allocation order.
//! Actual socket I/O is done by one writer task per connection draining a
//! bounded queue; a dead or hopelessly backlogged connection is dropped and
//! the worker is expected to reconnect and resync.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sequencer::message::{ControlKind, ControlMessage};

/// Per-connection queue depth. A worker that cannot keep up with this much
/// backlog is treated as dead.
const WRITER_QUEUE_DEPTH: usize = 256;

struct Subscriber {
    peer: Ipv4Addr,
    tx: mpsc::Sender<String>,
}

struct FanoutState {
    next_seq: u64,
    subscribers: Vec<Subscriber>,
}

pub struct SequencerServer {
    state: Mutex<FanoutState>,
    /// Local delivery of the leader's own sequence, so the leader node obeys
    /// the same ordered stream its workers see.
    local_tx: mpsc::UnboundedSender<ControlMessage>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    /// Connections accepted over the server's lifetime, exposed for status.
    accepted: AtomicU64,
    local_port: u16,
}

impl SequencerServer {
    /// Bind the sequencer port and start accepting subscribers.
    pub async fn start(
        port: u16,
        local_tx: mpsc::UnboundedSender<ControlMessage>,
    ) -> Result<std::sync::Arc<Self>> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_port = listener.local_addr()?.port();
        info!(port = local_port, "sequencer listening");

        let server = std::sync::Arc::new(SequencerServer {
            state: Mutex::new(FanoutState {
                next_seq: 1,
                subscribers: Vec::new(),
            }),
            local_tx,
            accept_task: Mutex::new(None),
            accepted: AtomicU64::new(0),
            local_port,
        });

        let accept_server = server.clone();
        let handle = tokio::spawn(async move {
            accept_server.accept_loop(listener).await;
        });
        *server.accept_task.lock().expect("sequencer lock poisoned") = Some(handle);
        Ok(server)
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let peer = match addr.ip() {
                        std::net::IpAddr::V4(v4) => v4,
                        std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                    };
                    debug!(%peer, "sequencer subscriber connected");
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = mpsc::channel(WRITER_QUEUE_DEPTH);
                    self.state
                        .lock()
                        .expect("sequencer lock poisoned")
                        .subscribers
                        .push(Subscriber { peer, tx });
                    tokio::spawn(writer_loop(stream, rx, peer));
                }
                Err(err) => {
                    warn!(error = %err, "sequencer accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Allocate the next sequence number and enqueue the message to every
    /// subscriber and to the local dispatcher. Returns the assigned seq.
    pub fn broadcast(&self, kind: ControlKind, payload: serde_json::Value) -> u64 {
        let mut state = self.state.lock().expect("sequencer lock poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;

        let msg = ControlMessage { seq, kind, payload };
        let line = msg.to_line();

        // try_send keeps socket I/O out of the allocation lock; a full or
        // closed queue marks the subscriber dead.
        state.subscribers.retain(|sub| {
            match sub.tx.try_send(line.clone()) {
                Ok(()) => true,
                Err(err) => {
                    warn!(peer = %sub.peer, error = %err, "dropping sequencer subscriber");
                    false
                }
            }
        });
        drop(state);

        let _ = self.local_tx.send(msg);
        seq
    }

    pub fn connected_peers(&self) -> Vec<Ipv4Addr> {
        self.state
            .lock()
            .expect("sequencer lock poisoned")
            .subscribers
            .iter()
            .map(|s| s.peer)
            .collect()
    }

    pub fn next_seq(&self) -> u64 {
        self.state.lock().expect("sequencer lock poisoned").next_seq
    }

    /// Actual bound port (useful when started with port 0).
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn accepted_connections(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Tear the sequencer down: stop accepting and drop every subscriber
    /// queue, which ends their writer tasks.
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .accept_task
            .lock()
            .expect("sequencer lock poisoned")
            .take()
        {
            handle.abort();
        }
        self.state
            .lock()
            .expect("sequencer lock poisoned")
            .subscribers
            .clear();
        info!("sequencer shut down");
    }
}

impl Drop for SequencerServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn writer_loop(mut stream: TcpStream, mut rx: mpsc::Receiver<String>, peer: Ipv4Addr) {
    while let Some(line) = rx.recv().await {
        if let Err(err) = stream.write_all(line.as_bytes()).await {
            warn!(%peer, error = %err, "sequencer write failed; closing connection");
            return;
        }
    }
    // Queue dropped: leader is shutting this subscriber (or itself) down.
    let _ = stream.shutdown().await;
}
