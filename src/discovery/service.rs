//! UDP beacon sender/listener and the shared datagram transport.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BEACON_INTERVAL;
use crate::election::{ElectionEngine, TokenTransport};
use crate::error::Result;
use crate::identity::NodeIdentity;
use crate::probe::ResourceProber;
use crate::discovery::membership::MembershipTable;
use crate::discovery::wire::WireMessage;

/// Shared UDP socket wrapper. Unicast goes straight to a peer's discovery
/// port; broadcast fans out to every interface's IPv4 broadcast address,
/// skipping the global broadcast and loopback.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    port: u16,
}

impl UdpTransport {
    pub async fn bind(port: u16) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        socket.set_broadcast(true)?;
        info!(port, "discovery socket bound");
        Ok(Arc::new(UdpTransport {
            socket: Arc::new(socket),
            port,
        }))
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// IPv4 broadcast addresses of all non-loopback interfaces.
    pub fn broadcast_targets() -> Vec<Ipv4Addr> {
        let mut targets = Vec::new();
        match if_addrs::get_if_addrs() {
            Ok(interfaces) => {
                for iface in interfaces {
                    if iface.is_loopback() {
                        continue;
                    }
                    if let if_addrs::IfAddr::V4(v4) = iface.addr {
                        if let Some(broadcast) = v4.broadcast {
                            if broadcast != Ipv4Addr::BROADCAST && !targets.contains(&broadcast) {
                                targets.push(broadcast);
                            }
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "could not enumerate interfaces"),
        }
        targets
    }
}

#[async_trait]
impl TokenTransport for UdpTransport {
    async fn send_to_node(&self, ip: Ipv4Addr, msg: &WireMessage) -> Result<()> {
        self.socket
            .send_to(msg.encode().as_bytes(), (ip, self.port))
            .await?;
        Ok(())
    }

    async fn broadcast(&self, msg: &WireMessage) -> Result<()> {
        let payload = msg.encode();
        for target in Self::broadcast_targets() {
            if let Err(err) = self
                .socket
                .send_to(payload.as_bytes(), (target, self.port))
                .await
            {
                // Lossy by design; the next beacon or round repeats it.
                debug!(%target, error = %err, "broadcast send failed");
            }
        }
        Ok(())
    }
}

pub struct DiscoveryService {
    identity: NodeIdentity,
    membership: Arc<MembershipTable>,
    prober: Arc<ResourceProber>,
    transport: Arc<UdpTransport>,
    election: Arc<ElectionEngine>,
    running: Arc<AtomicBool>,
}

impl DiscoveryService {
    pub fn new(
        identity: NodeIdentity,
        membership: Arc<MembershipTable>,
        prober: Arc<ResourceProber>,
        transport: Arc<UdpTransport>,
        election: Arc<ElectionEngine>,
    ) -> Arc<Self> {
        Arc::new(DiscoveryService {
            identity,
            membership,
            prober,
            transport,
            election,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Mark the service running and seed the membership table with self so
    /// ring calculations are never empty.
    pub fn mark_started(&self) {
        self.running.store(true, Ordering::Release);
        self.refresh_self();
        info!(identity = %self.identity, "discovery service started");
    }

    /// Stop beaconing and clear discovered state.
    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::Release);
        self.membership.clear();
        info!(identity = %self.identity, "discovery service stopped");
    }

    fn refresh_self(&self) {
        self.membership.upsert(
            &self.identity.name,
            self.identity.ip,
            self.prober.score(),
            self.election.my_role(),
            !self.election.is_active(),
        );
    }

    /// Spawn the beacon and listener loops.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let beacon = {
            let svc = self.clone();
            tokio::spawn(async move { svc.beacon_loop().await })
        };
        let listen = {
            let svc = self.clone();
            tokio::spawn(async move { svc.listen_loop().await })
        };
        vec![beacon, listen]
    }

    async fn beacon_loop(&self) {
        let mut ticker = tokio::time::interval(BEACON_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.is_running() {
                continue;
            }
            self.refresh_self();
            let beacon = WireMessage::Discover {
                name: self.identity.name.clone(),
                ip: self.identity.ip,
                score: self.prober.score(),
                role: self.election.my_role(),
            };
            if let Err(err) = self.transport.broadcast(&beacon).await {
                debug!(error = %err, "beacon broadcast failed");
            }
        }
    }

    async fn listen_loop(&self) {
        let socket = self.transport.socket();
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "discovery receive failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };
            if !self.is_running() {
                continue;
            }
            let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                debug!(%from, "dropping non-utf8 datagram");
                continue;
            };
            let Some(msg) = WireMessage::parse(text) else {
                debug!(%from, text, "dropping malformed datagram");
                continue;
            };
            self.dispatch(msg).await;
        }
    }

    async fn dispatch(&self, msg: WireMessage) {
        match msg {
            WireMessage::Discover {
                name,
                ip,
                score,
                role,
            } => {
                self.membership
                    .upsert(&name, ip, score, role, !self.election.is_active());
            }
            WireMessage::ElectionInit { initiator_ip, .. } => {
                self.election.handle_init(initiator_ip);
            }
            WireMessage::LcrToken {
                score,
                ip,
                is_leader,
            } => {
                if let Err(err) = self.election.handle_token(score, ip, is_leader).await {
                    warn!(error = %err, "token handling failed");
                }
            }
            WireMessage::PopStaleLeader { ip } => {
                self.election.handle_pop_stale_leader(ip);
            }
        }
    }
}
