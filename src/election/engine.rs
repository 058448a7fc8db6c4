use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ELECTION_SETTLE;
use crate::discovery::membership::{successor_in_ring, MembershipTable};
use crate::discovery::wire::{Role, WireMessage};
use crate::error::Result;
use crate::identity::NodeIdentity;

/// Where election tokens go. The UDP transport implements this; tests use
/// an in-memory recording transport.
#[async_trait]
pub trait TokenTransport: Send + Sync {
    async fn send_to_node(&self, ip: Ipv4Addr, msg: &WireMessage) -> Result<()>;
    async fn broadcast(&self, msg: &WireMessage) -> Result<()>;
}

/// Source of this node's own election weight. Scores must hold still while
/// an election is active, so the engine freezes the source for the round.
pub trait ScoreSource: Send + Sync {
    fn score(&self) -> u64;
    fn freeze(&self);
    fn unfreeze(&self);
}

impl ScoreSource for crate::probe::ResourceProber {
    fn score(&self) -> u64 {
        crate::probe::ResourceProber::score(self)
    }
    fn freeze(&self) {
        crate::probe::ResourceProber::freeze(self)
    }
    fn unfreeze(&self) {
        crate::probe::ResourceProber::unfreeze(self)
    }
}

/// Snapshot of who leads, published on every adoption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipState {
    pub leader: Option<Ipv4Addr>,
    pub role: Role,
    /// Bumped on every adoption so subscribers rebuild even when the same
    /// node wins consecutive rounds (each win is a fresh incarnation with a
    /// fresh sequence space).
    pub epoch: u64,
}

impl LeadershipState {
    fn initial() -> Self {
        LeadershipState {
            leader: None,
            role: Role::Undefined,
            epoch: 0,
        }
    }
}

struct ElectionState {
    participant: bool,
    current_leader: Option<Ipv4Addr>,
    role: Role,
    active: bool,
    epoch: u64,
}

pub struct ElectionEngine {
    identity: NodeIdentity,
    membership: Arc<MembershipTable>,
    scores: Arc<dyn ScoreSource>,
    transport: Arc<dyn TokenTransport>,
    state: Mutex<ElectionState>,
    events: watch::Sender<LeadershipState>,
}

impl ElectionEngine {
    pub fn new(
        identity: NodeIdentity,
        membership: Arc<MembershipTable>,
        scores: Arc<dyn ScoreSource>,
        transport: Arc<dyn TokenTransport>,
    ) -> Arc<Self> {
        let (events, _) = watch::channel(LeadershipState::initial());
        Arc::new(ElectionEngine {
            identity,
            membership,
            scores,
            transport,
            state: Mutex::new(ElectionState {
                participant: false,
                current_leader: None,
                role: Role::Undefined,
                active: false,
                epoch: 0,
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().expect("election lock poisoned").active
    }

    pub fn current_leader(&self) -> Option<Ipv4Addr> {
        self.state
            .lock()
            .expect("election lock poisoned")
            .current_leader
    }

    pub fn my_role(&self) -> Role {
        self.state.lock().expect("election lock poisoned").role
    }

    fn my_uid(&self) -> (u64, Ipv4Addr) {
        (self.scores.score(), self.identity.ip)
    }

    fn successor(&self) -> Ipv4Addr {
        self.membership.successor_of(self.identity.ip)
    }

    /// Begin a new election round: broadcast `ELECTION_INIT`, give peers a
    /// moment to reset, then inject this node's candidate token.
    pub async fn initiate(&self) -> Result<()> {
        {
            let mut st = self.state.lock().expect("election lock poisoned");
            st.participant = false;
            st.current_leader = None;
            st.active = true;
            st.role = Role::Worker;
        }
        self.scores.freeze();
        info!(ip = %self.identity.ip, "initiating leader election");

        self.transport
            .broadcast(&WireMessage::ElectionInit {
                initiator_ip: self.identity.ip,
                initiator_name: self.identity.name.clone(),
            })
            .await?;

        tokio::time::sleep(ELECTION_SETTLE).await;
        self.start_round().await
    }

    async fn start_round(&self) -> Result<()> {
        let ring = self.membership.ring();
        debug!(?ring, "ring view at election start");
        if ring.is_empty() {
            warn!("ring is empty; election aborted");
            return Ok(());
        }

        let successor = successor_in_ring(&ring, self.identity.ip);
        if successor == self.identity.ip {
            info!(ip = %self.identity.ip, "only node in ring; declaring self leader");
            self.adopt_leader(self.identity.ip);
            return Ok(());
        }

        let send_candidate = {
            let mut st = self.state.lock().expect("election lock poisoned");
            if st.participant {
                false
            } else {
                st.participant = true;
                true
            }
        };
        if send_candidate {
            let (score, ip) = self.my_uid();
            self.send_token(successor, score, ip, false).await?;
        }
        Ok(())
    }

    /// A peer started an election: reset local state so incoming tokens are
    /// judged fresh.
    pub fn handle_init(&self, initiator_ip: Ipv4Addr) {
        debug!(%initiator_ip, "election init received");
        let mut st = self.state.lock().expect("election lock poisoned");
        st.participant = false;
        st.current_leader = None;
        st.active = true;
        drop(st);
        self.scores.freeze();
    }

    /// Core LCR token rules. Branch order matters: announcement first, then
    /// own-token-returned, then the lexicographic comparison.
    pub async fn handle_token(&self, score: u64, ip: Ipv4Addr, is_leader: bool) -> Result<()> {
        let my_uid = self.my_uid();
        let token_uid = (score, ip);

        if is_leader {
            let am_leader = ip == self.identity.ip;
            self.adopt_leader(ip);
            if !am_leader {
                // Forward the announcement once; the named leader stops it.
                self.send_token(self.successor(), score, ip, true).await?;
            }
            return Ok(());
        }

        if ip == self.identity.ip {
            // Own candidate token survived a full circuit: this node wins.
            info!(ip = %self.identity.ip, "won the election");
            self.adopt_leader(self.identity.ip);
            let (my_score, my_ip) = my_uid;
            self.send_token(self.successor(), my_score, my_ip, true)
                .await?;
            return Ok(());
        }

        if token_uid > my_uid {
            self.set_participant();
            self.send_token(self.successor(), score, ip, false).await?;
        } else if !self.is_participant() {
            self.set_participant();
            let (my_score, my_ip) = my_uid;
            self.send_token(self.successor(), my_score, my_ip, false)
                .await?;
        } else {
            // Weaker token and this node already circulated its own:
            // swallow it to prevent double circulation.
            debug!(token = %ip, "dropping dominated token");
        }
        Ok(())
    }

    /// Drop a dead leader from the local view, clearing leadership if the
    /// popped ip was the current leader. Safe to apply any number of times.
    pub fn handle_pop_stale_leader(&self, ip: Ipv4Addr) {
        if self.membership.remove(ip).is_some() {
            info!(%ip, "removed stale leader from membership");
        }
        let mut st = self.state.lock().expect("election lock poisoned");
        if st.current_leader == Some(ip) {
            st.current_leader = None;
            st.role = Role::Undefined;
            st.epoch += 1;
            let snapshot = LeadershipState {
                leader: None,
                role: Role::Undefined,
                epoch: st.epoch,
            };
            drop(st);
            let _ = self.events.send(snapshot);
        }
    }

    fn is_participant(&self) -> bool {
        self.state.lock().expect("election lock poisoned").participant
    }

    fn set_participant(&self) {
        self.state.lock().expect("election lock poisoned").participant = true;
    }

    fn adopt_leader(&self, leader_ip: Ipv4Addr) {
        let role = if leader_ip == self.identity.ip {
            Role::Leader
        } else {
            Role::Worker
        };
        let mut st = self.state.lock().expect("election lock poisoned");
        let changed = st.current_leader != Some(leader_ip) || st.active || st.role != role;
        st.current_leader = Some(leader_ip);
        st.role = role;
        st.participant = false;
        st.active = false;
        if changed {
            st.epoch += 1;
        }
        let snapshot = LeadershipState {
            leader: Some(leader_ip),
            role,
            epoch: st.epoch,
        };
        drop(st);
        self.scores.unfreeze();
        if changed {
            info!(leader = %leader_ip, ?role, "leader adopted");
            let _ = self.events.send(snapshot);
        }
    }

    async fn send_token(&self, to: Ipv4Addr, score: u64, ip: Ipv4Addr, is_leader: bool) -> Result<()> {
        debug!(%to, %ip, score, is_leader, "sending LCR token");
        self.transport
            .send_to_node(
                to,
                &WireMessage::LcrToken {
                    score,
                    ip,
                    is_leader,
                },
            )
            .await
    }

    /// Status view for the HTTP control plane.
    pub fn status(&self) -> ElectionStatus {
        let st = self.state.lock().expect("election lock poisoned");
        let (active, leader, role, participant) =
            (st.active, st.current_leader, st.role, st.participant);
        drop(st);

        let peers = self.membership.snapshot();
        let ring_topology = peers
            .iter()
            .enumerate()
            .map(|(idx, p)| RingPosition {
                position: idx + 1,
                ip: p.ip,
                name: p.name.clone(),
                resource_score: p.score,
                is_leader: leader == Some(p.ip),
            })
            .collect();

        ElectionStatus {
            election_active: active,
            current_leader: leader,
            my_role: role,
            my_ip: self.identity.ip,
            participant,
            ring_successor: self.successor(),
            ring_topology,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RingPosition {
    pub position: usize,
    pub ip: Ipv4Addr,
    pub name: String,
    pub resource_score: u64,
    pub is_leader: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ElectionStatus {
    pub election_active: bool,
    pub current_leader: Option<Ipv4Addr>,
    pub my_role: Role,
    pub my_ip: Ipv4Addr,
    pub participant: bool,
    pub ring_successor: Ipv4Addr,
    pub ring_topology: Vec<RingPosition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;

    struct FixedScore(u64);

    impl ScoreSource for FixedScore {
        fn score(&self) -> u64 {
            self.0
        }
        fn freeze(&self) {}
        fn unfreeze(&self) {}
    }

    /// Transport that queues unicast sends for the test to route by hand.
    #[derive(Default)]
    struct TestNet {
        queue: StdMutex<VecDeque<(Ipv4Addr, WireMessage)>>,
    }

    #[async_trait]
    impl TokenTransport for TestNet {
        async fn send_to_node(&self, ip: Ipv4Addr, msg: &WireMessage) -> Result<()> {
            self.queue
                .lock()
                .unwrap()
                .push_back((ip, msg.clone()));
            Ok(())
        }

        async fn broadcast(&self, _msg: &WireMessage) -> Result<()> {
            Ok(())
        }
    }

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn engine(
        last: u8,
        score: u64,
        members: &[(u8, u64)],
        net: Arc<TestNet>,
    ) -> Arc<ElectionEngine> {
        let membership = Arc::new(MembershipTable::new());
        for &(m, s) in members {
            membership.upsert(&format!("node-{m}"), ip(m), s, Role::Undefined, true);
        }
        ElectionEngine::new(
            NodeIdentity::new(format!("node-{last}"), ip(last)),
            membership,
            Arc::new(FixedScore(score)),
            net,
        )
    }

    /// Drive queued tokens through the engines until the network is quiet.
    async fn run_to_quiescence(
        net: &TestNet,
        engines: &HashMap<Ipv4Addr, Arc<ElectionEngine>>,
    ) {
        for _ in 0..1000 {
            let next = net.queue.lock().unwrap().pop_front();
            let Some((to, msg)) = next else { break };
            let engine = engines.get(&to).expect("token routed to unknown node");
            match msg {
                WireMessage::LcrToken {
                    score,
                    ip,
                    is_leader,
                } => engine.handle_token(score, ip, is_leader).await.unwrap(),
                other => panic!("unexpected unicast message: {other:?}"),
            }
        }
        assert!(
            net.queue.lock().unwrap().is_empty(),
            "election did not terminate"
        );
    }

    #[tokio::test]
    async fn test_three_nodes_converge_on_max_composite_uid() {
        // A(10.0.0.1, 100), B(10.0.0.2, 200), C(10.0.0.3, 200):
        // C wins because (200, .3) > (200, .2) > (100, .1).
        let members = [(1u8, 100u64), (2, 200), (3, 200)];
        let net = Arc::new(TestNet::default());
        let mut engines = HashMap::new();
        for &(last, score) in &members {
            engines.insert(ip(last), engine(last, score, &members, net.clone()));
        }

        for e in engines.values() {
            e.handle_init(ip(1));
        }
        // Initiator A injects its candidate token.
        engines[&ip(1)].start_round().await.unwrap();
        run_to_quiescence(&net, &engines).await;

        for (node_ip, e) in &engines {
            assert_eq!(
                e.current_leader(),
                Some(ip(3)),
                "node {node_ip} disagrees on the leader"
            );
            assert!(!e.is_active(), "election must be over at {node_ip}");
            let expected = if *node_ip == ip(3) {
                Role::Leader
            } else {
                Role::Worker
            };
            assert_eq!(e.my_role(), expected);
        }
    }

    #[tokio::test]
    async fn test_two_nodes_equal_score_higher_ip_wins() {
        let members = [(1u8, 500u64), (2, 500)];
        let net = Arc::new(TestNet::default());
        let mut engines = HashMap::new();
        for &(last, score) in &members {
            engines.insert(ip(last), engine(last, score, &members, net.clone()));
        }
        for e in engines.values() {
            e.handle_init(ip(1));
        }
        engines[&ip(1)].start_round().await.unwrap();
        run_to_quiescence(&net, &engines).await;

        assert_eq!(engines[&ip(1)].my_role(), Role::Worker);
        assert_eq!(engines[&ip(2)].my_role(), Role::Leader);
        assert_eq!(engines[&ip(1)].current_leader(), Some(ip(2)));
    }

    #[tokio::test]
    async fn test_single_node_elects_itself_without_tokens() {
        let net = Arc::new(TestNet::default());
        let e = engine(7, 42, &[(7, 42)], net.clone());
        e.handle_init(ip(7));
        e.start_round().await.unwrap();

        assert_eq!(e.current_leader(), Some(ip(7)));
        assert_eq!(e.my_role(), Role::Leader);
        assert!(!e.is_active());
        assert!(
            net.queue.lock().unwrap().is_empty(),
            "single-node election must not circulate tokens"
        );
    }

    #[tokio::test]
    async fn test_stronger_token_is_forwarded_unchanged() {
        let members = [(2u8, 100u64), (3, 50)];
        let net = Arc::new(TestNet::default());
        let e = engine(3, 50, &members, net.clone());
        e.handle_init(ip(2));
        e.handle_token(100, ip(2), false).await.unwrap();

        let sent = net.queue.lock().unwrap().pop_front().unwrap();
        assert_eq!(
            sent,
            (
                ip(2),
                WireMessage::LcrToken {
                    score: 100,
                    ip: ip(2),
                    is_leader: false,
                }
            )
        );
    }

    #[tokio::test]
    async fn test_dominated_token_dropped_when_already_participant() {
        let members = [(2u8, 10u64), (3, 50)];
        let net = Arc::new(TestNet::default());
        let e = engine(3, 50, &members, net.clone());
        e.handle_init(ip(2));

        // First weak token: replaced by own candidate.
        e.handle_token(10, ip(2), false).await.unwrap();
        let first = net.queue.lock().unwrap().pop_front().unwrap();
        assert_eq!(
            first.1,
            WireMessage::LcrToken {
                score: 50,
                ip: ip(3),
                is_leader: false,
            }
        );

        // Second weak token while participating: swallowed.
        e.handle_token(10, ip(2), false).await.unwrap();
        assert!(net.queue.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leader_announcement_stops_at_named_leader() {
        let members = [(2u8, 10u64), (3, 50)];
        let net = Arc::new(TestNet::default());
        let e = engine(3, 50, &members, net.clone());
        e.handle_init(ip(3));

        // This node is the named leader: adopt without re-forwarding.
        e.handle_token(50, ip(3), true).await.unwrap();
        assert_eq!(e.my_role(), Role::Leader);
        assert!(net.queue.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pop_stale_leader_is_idempotent_and_clears_leadership() {
        let members = [(2u8, 10u64), (3, 50)];
        let net = Arc::new(TestNet::default());
        let e = engine(3, 50, &members, net.clone());
        e.handle_init(ip(3));
        e.handle_token(10, ip(2), true).await.unwrap();
        assert_eq!(e.current_leader(), Some(ip(2)));

        e.handle_pop_stale_leader(ip(2));
        assert_eq!(e.current_leader(), None);
        assert_eq!(e.my_role(), Role::Undefined);
        let ring_after = e.status().ring_topology.len();

        // Applying the same pop again changes nothing.
        e.handle_pop_stale_leader(ip(2));
        assert_eq!(e.current_leader(), None);
        assert_eq!(e.status().ring_topology.len(), ring_after);
    }
}
