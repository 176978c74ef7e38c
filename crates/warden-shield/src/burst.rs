//! Burst-rate flood tracking.
//!
//! One global per-second counter, reset by the ticker. Crossing the
//! threshold raises the legacy attack-mode flag immediately: this is the
//! first line of defense, engaged before any statistical analysis runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

pub struct BurstTracker {
    threshold: u64,
    count: AtomicU64,
    attack_mode: Arc<AtomicBool>,
}

impl BurstTracker {
    pub fn new(threshold: u64, attack_mode: Arc<AtomicBool>) -> Self {
        Self {
            threshold,
            count: AtomicU64::new(0),
            attack_mode,
        }
    }

    /// Count one connection. Trips the attack-mode flag on the crossing.
    pub fn record(&self) -> u64 {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if count == self.threshold {
            self.attack_mode.store(true, Ordering::Relaxed);
            warn!(count, "burst threshold crossed, attack mode raised");
        }
        count
    }

    /// Take and reset the current second's count.
    pub fn take(&self) -> u64 {
        self.count.swap(0, Ordering::Relaxed)
    }

    pub fn current(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
