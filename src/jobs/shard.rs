//! Deterministic frame sharding.
//!
//! Frames are dealt out as consecutive runs in ring order: with `T` frames
//! over `N` workers, each worker gets `T div N` frames and the first
//! `T mod N` workers get one extra. The same rule redistributes a lost
//! worker's frames during reassignment, so fairness (`|a - b| <= 1`) holds
//! everywhere.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Workers eligible for a job, in ring (sorted ip) order. The submitting
/// client is skipped when it opted out of participating.
pub fn eligible_workers(
    ring: &[Ipv4Addr],
    client_ip: Ipv4Addr,
    client_participates: bool,
) -> Vec<Ipv4Addr> {
    ring.iter()
        .copied()
        .filter(|&ip| client_participates || ip != client_ip)
        .collect()
}

/// Shard the inclusive frame range across `workers`.
pub fn shard_range(
    frame_start: u32,
    frame_end: u32,
    workers: &[Ipv4Addr],
) -> BTreeMap<Ipv4Addr, Vec<u32>> {
    let frames: Vec<u32> = (frame_start..=frame_end).collect();
    split_even(&frames, workers)
}

/// Deal an arbitrary frame list out as consecutive chunks, remainder
/// sprinkled over the earliest workers.
pub fn split_even(frames: &[u32], workers: &[Ipv4Addr]) -> BTreeMap<Ipv4Addr, Vec<u32>> {
    let mut assignments = BTreeMap::new();
    if workers.is_empty() {
        return assignments;
    }
    let base = frames.len() / workers.len();
    let extra = frames.len() % workers.len();

    let mut cursor = 0usize;
    for (idx, &worker) in workers.iter().enumerate() {
        let take = base + usize::from(idx < extra);
        let chunk = frames[cursor..cursor + take].to_vec();
        cursor += take;
        assignments.insert(worker, chunk);
    }
    assignments
}
