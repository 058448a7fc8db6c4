//! Resource prober: the election weight of this node.
//!
//! The score favors nodes with free disk (render artifacts accumulate fast),
//! then available memory, then idle CPU:
//!
//! `score = floor(free_disk_GiB * 50 + avail_mem_GiB * 30 + (100 - cpu%) * 30)`
//!
//! The score is recomputed at most every 10 s and frozen entirely while an
//! election is running, so the composite UID `(score, ip)` every peer
//! compares stays stable for the duration of a round.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use sysinfo::{Disks, System};

use crate::config::SCORE_REFRESH;

const GIB: f64 = (1024u64 * 1024 * 1024) as f64;
/// Reported when probing fails outright; keeps the node electable.
const FALLBACK_SCORE: u64 = 10;

pub struct ResourceProber {
    inner: Mutex<ProbeInner>,
    cached: AtomicU64,
    frozen: AtomicBool,
}

struct ProbeInner {
    system: System,
    disks: Disks,
    refreshed_at: Option<Instant>,
}

impl ResourceProber {
    pub fn new() -> Self {
        let prober = ResourceProber {
            inner: Mutex::new(ProbeInner {
                system: System::new(),
                disks: Disks::new_with_refreshed_list(),
                refreshed_at: None,
            }),
            cached: AtomicU64::new(FALLBACK_SCORE),
            frozen: AtomicBool::new(false),
        };
        prober.refresh_now();
        prober
    }

    /// Current score. Refreshes lazily unless frozen or refreshed recently.
    pub fn score(&self) -> u64 {
        if self.frozen.load(Ordering::Acquire) {
            return self.cached.load(Ordering::Acquire);
        }
        let due = {
            let inner = self.inner.lock().expect("prober lock poisoned");
            inner
                .refreshed_at
                .map(|t| t.elapsed() >= SCORE_REFRESH)
                .unwrap_or(true)
        };
        if due {
            self.refresh_now();
        }
        self.cached.load(Ordering::Acquire)
    }

    /// Freeze the score for the duration of an election.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Resume normal refreshing once the election settles.
    pub fn unfreeze(&self) {
        self.frozen.store(false, Ordering::Release);
    }

    fn refresh_now(&self) {
        let mut inner = self.inner.lock().expect("prober lock poisoned");
        inner.system.refresh_memory();
        inner.system.refresh_cpu_usage();
        inner.disks.refresh();

        let free_disk: u64 = inner
            .disks
            .list()
            .iter()
            .map(|d| d.available_space())
            .sum();
        let avail_mem = inner.system.available_memory();
        let cpu_pct = f64::from(inner.system.global_cpu_info().cpu_usage());
        inner.refreshed_at = Some(Instant::now());
        drop(inner);

        let score = compute_score(free_disk, avail_mem, cpu_pct);
        self.cached.store(score, Ordering::Release);
    }

    /// A point-in-time snapshot of raw stats for the device endpoint.
    pub fn device_stats(&self) -> DeviceStats {
        let mut inner = self.inner.lock().expect("prober lock poisoned");
        inner.system.refresh_memory();
        inner.system.refresh_cpu_usage();
        inner.disks.refresh();

        let memory_total = inner.system.total_memory();
        let memory_used = inner.system.used_memory();
        let free_disk: u64 = inner
            .disks
            .list()
            .iter()
            .map(|d| d.available_space())
            .sum();
        DeviceStats {
            cpu_usage: f64::from(inner.system.global_cpu_info().cpu_usage()),
            memory_total,
            memory_used,
            memory_usage: if memory_total > 0 {
                memory_used as f64 / memory_total as f64 * 100.0
            } else {
                0.0
            },
            free_disk,
        }
    }
}

impl Default for ResourceProber {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceStats {
    pub cpu_usage: f64,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_usage: f64,
    pub free_disk: u64,
}

fn compute_score(free_disk_bytes: u64, avail_mem_bytes: u64, cpu_pct: f64) -> u64 {
    let disk_score = free_disk_bytes as f64 / GIB * 50.0;
    let mem_score = avail_mem_bytes as f64 / GIB * 30.0;
    let cpu_score = (100.0 - cpu_pct.clamp(0.0, 100.0)) * 30.0;
    let total = disk_score + mem_score + cpu_score;
    if total.is_finite() && total > 0.0 {
        total.floor() as u64
    } else {
        FALLBACK_SCORE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_formula_weights() {
        // 2 GiB disk, 1 GiB mem, fully idle CPU.
        let score = compute_score(2 * 1024 * 1024 * 1024, 1024 * 1024 * 1024, 0.0);
        assert_eq!(score, 2 * 50 + 30 + 100 * 30);
    }

    #[test]
    fn test_score_floors_fractional_contributions() {
        // Half a GiB of disk contributes 25, not 25.0-rounded-up.
        let score = compute_score(512 * 1024 * 1024, 0, 100.0);
        assert_eq!(score, 25);
    }

    #[test]
    fn test_busy_cpu_lowers_score() {
        let idle = compute_score(0, 0, 0.0);
        let busy = compute_score(0, 0, 100.0);
        assert!(idle > busy, "idle CPU must outscore busy CPU");
        assert_eq!(busy, FALLBACK_SCORE, "all-zero resources fall back");
    }

    #[test]
    fn test_frozen_score_is_stable() {
        let prober = ResourceProber::new();
        prober.freeze();
        let a = prober.score();
        let b = prober.score();
        assert_eq!(a, b, "score must not move while frozen");
        prober.unfreeze();
    }
}
