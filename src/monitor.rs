//! Failure monitor: turns missing beacons into recovery actions.
//!
//! Sweeps the membership table every two seconds. A peer not heard from for
//! ten seconds is removed and classified:
//!
//! - lost leader: drop it everywhere (`POP_STALE_LEADER` broadcast), cancel
//!   any local jobs this node initiated, and start a fresh election;
//! - lost worker or client: report to the current leader, which rewrites
//!   the affected jobs (reassignment or cancellation).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{HTTP_TIMEOUT, STALE_AFTER, SWEEP_INTERVAL};
use crate::discovery::membership::MembershipTable;
use crate::discovery::service::{DiscoveryService, UdpTransport};
use crate::discovery::wire::{Role, WireMessage};
use crate::election::{ElectionEngine, TokenTransport};
use crate::identity::NodeIdentity;
use crate::jobs::coordinator::JobCoordinator;
use crate::jobs::model::JobStatus;
use crate::jobs::store::JobStore;

pub struct FailureMonitor {
    identity: NodeIdentity,
    membership: Arc<MembershipTable>,
    discovery: Arc<DiscoveryService>,
    election: Arc<ElectionEngine>,
    transport: Arc<UdpTransport>,
    coordinator: Arc<JobCoordinator>,
    store: JobStore,
    http: reqwest::Client,
    http_port: u16,
    /// Set when this node canceled jobs because its leader crashed; the UI
    /// polls and clears it via `/api/leader_is_down_flag`.
    leader_down: AtomicBool,
}

impl FailureMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: NodeIdentity,
        membership: Arc<MembershipTable>,
        discovery: Arc<DiscoveryService>,
        election: Arc<ElectionEngine>,
        transport: Arc<UdpTransport>,
        coordinator: Arc<JobCoordinator>,
        store: JobStore,
        http: reqwest::Client,
        http_port: u16,
    ) -> Arc<Self> {
        Arc::new(FailureMonitor {
            identity,
            membership,
            discovery,
            election,
            transport,
            coordinator,
            store,
            http,
            http_port,
            leader_down: AtomicBool::new(false),
        })
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run().await })
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.discovery.is_running() {
                continue;
            }
            let stale = self.membership.sweep_stale(STALE_AFTER);
            for peer in stale {
                if peer.ip == self.identity.ip {
                    // Own entry went stale (clock stall); re-seed rather
                    // than treat self as a failed peer.
                    warn!("own membership entry expired; re-seeding");
                    self.discovery.mark_started();
                    continue;
                }
                let was_leader =
                    peer.role == Role::Leader || self.election.current_leader() == Some(peer.ip);
                info!(ip = %peer.ip, name = %peer.name, was_leader, "peer expired");
                if was_leader {
                    self.handle_leader_loss(peer.ip).await;
                } else {
                    self.report_lost_peer(peer.ip).await;
                }
            }
        }
    }

    /// The leader stopped beaconing: drop it cluster-wide, cancel jobs this
    /// node submitted, and re-elect.
    async fn handle_leader_loss(&self, leader_ip: Ipv4Addr) {
        if let Err(err) = self
            .transport
            .broadcast(&WireMessage::PopStaleLeader { ip: leader_ip })
            .await
        {
            warn!(error = %err, "failed to broadcast stale-leader removal");
        }
        self.election.handle_pop_stale_leader(leader_ip);

        if self.cancel_own_client_jobs().await > 0 {
            self.leader_down.store(true, Ordering::Release);
        }

        if let Err(err) = self.election.initiate().await {
            warn!(error = %err, "re-election failed to start");
        }
    }

    /// Cancel every non-terminal job this node initiated. Resubmission is a
    /// client-level decision; nothing is retried automatically.
    async fn cancel_own_client_jobs(&self) -> usize {
        let jobs = match self.store.list_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(error = %err, "could not scan jobs after leader loss");
                return 0;
            }
        };
        let mut canceled = 0;
        for meta in jobs {
            if meta.metadata.initiator_client_ip != self.identity.ip || meta.status.is_terminal() {
                continue;
            }
            match self
                .store
                .update_metadata(&meta.job_id, |m| m.status = JobStatus::Canceled)
                .await
            {
                Ok(_) => {
                    info!(job_id = %meta.job_id, "job canceled after leader loss");
                    canceled += 1;
                }
                Err(err) => warn!(job_id = %meta.job_id, error = %err, "cancel failed"),
            }
        }
        canceled
    }

    /// A non-leader peer disappeared: tell the leader so it can reassign or
    /// cancel. When this node is the leader, handle it directly.
    async fn report_lost_peer(&self, ip: Ipv4Addr) {
        if self.election.my_role() == Role::Leader {
            if let Err(err) = self.coordinator.handle_node_disconnection(ip).await {
                warn!(%ip, error = %err, "local disconnection handling failed");
            }
            return;
        }
        let Some(leader) = self.election.current_leader() else {
            warn!(%ip, "peer lost with no leader to notify");
            return;
        };
        let url = format!(
            "http://{leader}:{}/api/election/notify_node_disconnection",
            self.http_port
        );
        let result = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "ip": ip }))
            .timeout(HTTP_TIMEOUT)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(%ip, status = %response.status(), "leader rejected disconnection report")
            }
            Err(err) => warn!(%ip, error = %err, "could not reach leader to report loss"),
        }
    }

    /// Read and clear the leader-down flag.
    pub fn take_leader_down_flag(&self) -> bool {
        self.leader_down.swap(false, Ordering::AcqRel)
    }
}
