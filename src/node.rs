//! The node: one owned handle wiring every service together.
//!
//! Constructed once in `main` and shared with the HTTP handlers; there is
//! no process-wide mutable state. The node also runs the control-channel
//! manager: a task that watches election events and rebuilds this node's
//! sequencer role (server when leading, client otherwise) for each leader
//! incarnation.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, SCAN_INTERVAL};
use crate::discovery::membership::MembershipTable;
use crate::discovery::service::{DiscoveryService, UdpTransport};
use crate::discovery::wire::Role;
use crate::election::ElectionEngine;
use crate::error::Result;
use crate::identity::NodeIdentity;
use crate::jobs::coordinator::JobCoordinator;
use crate::jobs::model::JobStatus;
use crate::jobs::store::JobStore;
use crate::jobs::worker::WorkerRuntime;
use crate::monitor::FailureMonitor;
use crate::probe::ResourceProber;
use crate::render::BlenderService;
use crate::sequencer::{ControlBroadcaster, ControlMessage, SequencedClient, SequencerServer};
use crate::stitch::FfmpegService;

pub struct Node {
    pub config: Config,
    pub identity: NodeIdentity,
    pub membership: Arc<MembershipTable>,
    pub prober: Arc<ResourceProber>,
    pub election: Arc<ElectionEngine>,
    pub discovery: Arc<DiscoveryService>,
    pub transport: Arc<UdpTransport>,
    pub broadcaster: Arc<ControlBroadcaster>,
    pub store: JobStore,
    pub coordinator: Arc<JobCoordinator>,
    pub worker: Arc<WorkerRuntime>,
    pub monitor: Arc<FailureMonitor>,
    pub renderer: BlenderService,
    pub http: reqwest::Client,
    control_client: Mutex<Option<SequencedClient>>,
    dispatch_tx: mpsc::UnboundedSender<ControlMessage>,
    dispatch_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlMessage>>>,
}

impl Node {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let identity = NodeIdentity::new(config.resolved_name(), config.resolved_ip());
        info!(identity = %identity, "initializing node");

        let membership = Arc::new(MembershipTable::new());
        let prober = Arc::new(ResourceProber::new());
        let transport = UdpTransport::bind(config.discovery_port).await?;
        let election = ElectionEngine::new(
            identity.clone(),
            membership.clone(),
            prober.clone(),
            transport.clone(),
        );
        let discovery = DiscoveryService::new(
            identity.clone(),
            membership.clone(),
            prober.clone(),
            transport.clone(),
            election.clone(),
        );

        let http = reqwest::Client::new();
        let store = JobStore::new(&config.jobs_dir);
        let broadcaster = Arc::new(ControlBroadcaster::new());
        let renderer = BlenderService::new(&config.blender_path);
        let stitcher = FfmpegService::new(&config.ffmpeg_path);

        let coordinator = JobCoordinator::new(
            identity.clone(),
            membership.clone(),
            store.clone(),
            broadcaster.clone(),
            stitcher,
            http.clone(),
            config.http_port,
        );
        let worker = WorkerRuntime::new(
            identity.clone(),
            store.clone(),
            renderer.clone(),
            http.clone(),
            config.http_port,
        );
        let monitor = FailureMonitor::new(
            identity.clone(),
            membership.clone(),
            discovery.clone(),
            election.clone(),
            transport.clone(),
            coordinator.clone(),
            store.clone(),
            http.clone(),
            config.http_port,
        );

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Node {
            config,
            identity,
            membership,
            prober,
            election,
            discovery,
            transport,
            broadcaster,
            store,
            coordinator,
            worker,
            monitor,
            renderer,
            http,
            control_client: Mutex::new(None),
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
        }))
    }

    /// Start every long-running task and mark discovery running.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = self.discovery.spawn();
        tasks.push(self.monitor.spawn());
        tasks.push(self.spawn_control_manager());
        tasks.push(self.spawn_dispatcher());
        tasks.push(self.spawn_job_scanner());
        self.discovery.mark_started();
        tasks
    }

    /// React to leader changes: the new leader hosts a fresh sequencer
    /// (sequence space restarts at 1); everyone else connects as a client
    /// with a fresh reorder buffer.
    fn spawn_control_manager(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        let mut events = self.election.subscribe();
        tokio::spawn(async move {
            loop {
                if events.changed().await.is_err() {
                    return;
                }
                let state = events.borrow_and_update().clone();
                info!(leader = ?state.leader, role = ?state.role, epoch = state.epoch, "rebuilding control channel");

                // Tear down the previous incarnation's role.
                node.broadcaster.install(None);
                if let Some(client) = node
                    .control_client
                    .lock()
                    .expect("control client lock poisoned")
                    .take()
                {
                    client.stop();
                }

                match (state.role, state.leader) {
                    (Role::Leader, _) => {
                        match SequencerServer::start(
                            node.config.sequencer_port,
                            node.dispatch_tx.clone(),
                        )
                        .await
                        {
                            Ok(server) => node.broadcaster.install(Some(server)),
                            Err(err) => warn!(error = %err, "could not start sequencer"),
                        }
                    }
                    (Role::Worker, Some(leader)) => {
                        let client = SequencedClient::start(
                            leader,
                            node.config.sequencer_port,
                            node.dispatch_tx.clone(),
                        );
                        *node
                            .control_client
                            .lock()
                            .expect("control client lock poisoned") = Some(client);
                    }
                    _ => debug!("no leader; control channel idle"),
                }
            }
        })
    }

    /// Single consumer of the ordered control stream. The leader's own
    /// broadcasts and a worker's received messages both land here, already
    /// in sequence order.
    fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let worker = self.worker.clone();
        let mut rx = self
            .dispatch_rx
            .lock()
            .expect("dispatcher lock poisoned")
            .take()
            .expect("dispatcher started twice");
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                debug!(seq = msg.seq, kind = ?msg.kind, "dispatching control message");
                worker.apply_control(&msg).await;
            }
        })
    }

    /// Auto-broadcast jobs still sitting in `created` on the leader. This
    /// replaces the original deployment's directory watcher: a created job
    /// is picked up within one scan tick whether it arrived over HTTP or
    /// was dropped into the jobs root by hand.
    fn spawn_job_scanner(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCAN_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if node.election.my_role() != Role::Leader {
                    continue;
                }
                let jobs = match node.store.list_jobs().await {
                    Ok(jobs) => jobs,
                    Err(err) => {
                        warn!(error = %err, "job scan failed");
                        continue;
                    }
                };
                for meta in jobs {
                    if meta.status != JobStatus::Created {
                        continue;
                    }
                    info!(job_id = %meta.job_id, "scanner broadcasting created job");
                    if let Err(err) = node.coordinator.broadcast_job(&meta.job_id).await {
                        warn!(job_id = %meta.job_id, error = %err, "scanner broadcast failed");
                    }
                }
            }
        })
    }

    /// Forward a lost-peer report to the current leader (client-side hook
    /// for `/api/node_disconnected`).
    pub async fn notify_leader_of_disconnection(&self, ip: std::net::Ipv4Addr) -> Result<()> {
        let leader = self
            .election
            .current_leader()
            .ok_or(crate::error::NodeError::NoLeader)?;
        let url = format!(
            "http://{leader}:{}/api/election/notify_node_disconnection",
            self.config.http_port
        );
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "ip": ip }))
            .timeout(crate::config::HTTP_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(%ip, status = %response.status(), "leader rejected disconnection notice");
        }
        Ok(())
    }
}
