//! Cluster membership table and ring view.
//!
//! One table per process, shared behind a read-write lock. Writers are the
//! beacon listener and the failure monitor; everyone else takes cheap
//! copy-on-read snapshots. The ring is always derived fresh from the table
//! so every node that holds the same membership computes the same successor
//! chain.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::discovery::wire::Role;

#[derive(Debug, Clone)]
pub struct Peer {
    pub name: String,
    pub ip: Ipv4Addr,
    pub score: u64,
    pub role: Role,
    pub last_seen: Instant,
}

impl Peer {
    pub fn age(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

#[derive(Default)]
pub struct MembershipTable {
    peers: RwLock<HashMap<Ipv4Addr, Peer>>,
}

impl MembershipTable {
    pub fn new() -> Self {
        MembershipTable {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or refresh a peer. `allow_score_update` is false while an
    /// election is active so the composite UID stays stable mid-round.
    pub fn upsert(&self, name: &str, ip: Ipv4Addr, score: u64, role: Role, allow_score_update: bool) {
        let mut peers = self.peers.write().expect("membership lock poisoned");
        match peers.get_mut(&ip) {
            Some(peer) => {
                peer.name = name.to_string();
                peer.role = role;
                peer.last_seen = Instant::now();
                if allow_score_update {
                    peer.score = score;
                }
            }
            None => {
                peers.insert(
                    ip,
                    Peer {
                        name: name.to_string(),
                        ip,
                        score,
                        role,
                        last_seen: Instant::now(),
                    },
                );
            }
        }
    }

    /// Remove one peer. Idempotent: removing an absent ip is a no-op, so
    /// repeated `POP_STALE_LEADER` broadcasts converge on the same table.
    pub fn remove(&self, ip: Ipv4Addr) -> Option<Peer> {
        self.peers
            .write()
            .expect("membership lock poisoned")
            .remove(&ip)
    }

    pub fn clear(&self) {
        self.peers.write().expect("membership lock poisoned").clear();
    }

    pub fn get(&self, ip: Ipv4Addr) -> Option<Peer> {
        self.peers
            .read()
            .expect("membership lock poisoned")
            .get(&ip)
            .cloned()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.peers
            .read()
            .expect("membership lock poisoned")
            .contains_key(&ip)
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("membership lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy-on-read snapshot of all peers.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .read()
            .expect("membership lock poisoned")
            .values()
            .cloned()
            .collect();
        peers.sort_by_key(|p| p.ip);
        peers
    }

    /// Score snapshot keyed by ip, recorded into job metadata at creation.
    pub fn scores(&self) -> HashMap<Ipv4Addr, u64> {
        self.peers
            .read()
            .expect("membership lock poisoned")
            .values()
            .map(|p| (p.ip, p.score))
            .collect()
    }

    /// The deterministic ring view: member ips sorted ascending.
    pub fn ring(&self) -> Vec<Ipv4Addr> {
        let mut ips: Vec<Ipv4Addr> = self
            .peers
            .read()
            .expect("membership lock poisoned")
            .keys()
            .copied()
            .collect();
        ips.sort();
        ips
    }

    /// Successor of `ip` in the ring, wrapping around. For a ring that does
    /// not contain `ip` (never expected; self is always present) the node
    /// falls back to itself, which degrades to the single-node case.
    pub fn successor_of(&self, ip: Ipv4Addr) -> Ipv4Addr {
        let ring = self.ring();
        successor_in_ring(&ring, ip)
    }

    /// Remove every peer not seen within `stale_after` and return them.
    pub fn sweep_stale(&self, stale_after: Duration) -> Vec<Peer> {
        let mut peers = self.peers.write().expect("membership lock poisoned");
        let stale: Vec<Ipv4Addr> = peers
            .values()
            .filter(|p| p.last_seen.elapsed() > stale_after)
            .map(|p| p.ip)
            .collect();
        stale.iter().filter_map(|ip| peers.remove(ip)).collect()
    }
}

/// Successor lookup on a pre-sorted ring.
pub fn successor_in_ring(ring: &[Ipv4Addr], ip: Ipv4Addr) -> Ipv4Addr {
    match ring.iter().position(|&r| r == ip) {
        Some(idx) => ring[(idx + 1) % ring.len()],
        None => ip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn table_with(ips: &[u8]) -> MembershipTable {
        let table = MembershipTable::new();
        for &last in ips {
            table.upsert(&format!("node-{last}"), ip(last), 100, Role::Undefined, true);
        }
        table
    }

    #[test]
    fn test_ring_is_sorted_regardless_of_insert_order() {
        let table = table_with(&[9, 2, 7, 1]);
        assert_eq!(table.ring(), vec![ip(1), ip(2), ip(7), ip(9)]);
    }

    #[test]
    fn test_every_member_has_exactly_one_successor() {
        let table = table_with(&[3, 1, 2]);
        let ring = table.ring();
        for &member in &ring {
            let succ = table.successor_of(member);
            assert!(ring.contains(&succ), "successor must be a ring member");
        }
        // Wrap-around: the highest ip points back to the lowest.
        assert_eq!(table.successor_of(ip(3)), ip(1));
        assert_eq!(table.successor_of(ip(1)), ip(2));
    }

    #[test]
    fn test_single_node_ring_is_own_successor() {
        let table = table_with(&[5]);
        assert_eq!(table.successor_of(ip(5)), ip(5));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = table_with(&[1, 2]);
        assert!(table.remove(ip(2)).is_some());
        assert!(table.remove(ip(2)).is_none());
        assert_eq!(table.ring(), vec![ip(1)]);
        // Removing again still yields the same table.
        assert!(table.remove(ip(2)).is_none());
        assert_eq!(table.ring(), vec![ip(1)]);
    }

    #[test]
    fn test_score_frozen_during_election() {
        let table = table_with(&[1]);
        table.upsert("node-1", ip(1), 999, Role::Worker, false);
        assert_eq!(table.get(ip(1)).unwrap().score, 100, "score must not move");
        assert_eq!(table.get(ip(1)).unwrap().role, Role::Worker, "role still updates");
        table.upsert("node-1", ip(1), 999, Role::Worker, true);
        assert_eq!(table.get(ip(1)).unwrap().score, 999);
    }

    #[test]
    fn test_sweep_removes_only_stale_entries() {
        let table = table_with(&[1, 2]);
        // Nothing is stale yet.
        assert!(table.sweep_stale(Duration::from_secs(10)).is_empty());
        // Everything is stale against a zero threshold.
        let removed = table.sweep_stale(Duration::ZERO);
        assert_eq!(removed.len(), 2);
        assert!(table.is_empty());
    }
}
