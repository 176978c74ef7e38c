//! Level-gated connection rate limiting.
//!
//! A per-IP token bucket whose effective ceiling depends on the published
//! attack level: full limit at None/Elevated, reduced at High (verified IPs
//! bypass entirely, a deterministic slice of non-verified IPs keeps the
//! full limit), verified-only at Critical, and a bounded reserved slot pool
//! for verified connections at Lockdown. A rejection is final, not queued.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::{DashMap, DashSet};

use crate::AttackLevel;

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Bucket capacity (burst allowance) in connections.
    pub bucket_capacity: f64,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
    /// Capacity/refill multiplier applied to non-bypassed IPs at High.
    pub high_reduction: f64,
    /// Percentage of non-verified IPs keeping the full limit at High.
    pub high_bypass_percent: u64,
    /// Guaranteed verified slots at Lockdown.
    pub lockdown_pool: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: 3.0,
            refill_per_sec: 1.0,
            high_reduction: 0.5,
            high_bypass_percent: 20,
            lockdown_pool: 32,
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleVerdict {
    Allowed,
    Limited,
    VerifiedOnly,
    PoolFull,
}

struct Bucket {
    tokens: f64,
    last_ms: u64,
}

pub struct ThrottleEngine {
    config: ThrottleConfig,
    buckets: DashMap<IpAddr, Bucket>,
    lockdown_used: AtomicUsize,
    lockdown_holders: DashSet<u64>,
}

impl ThrottleEngine {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            lockdown_used: AtomicUsize::new(0),
            lockdown_holders: DashSet::new(),
        }
    }

    pub fn try_acquire(
        &self,
        ip: IpAddr,
        conn_id: u64,
        verified: bool,
        level: AttackLevel,
        now_ms: u64,
    ) -> ThrottleVerdict {
        match level {
            AttackLevel::None | AttackLevel::Elevated => self.take_token(ip, 1.0, now_ms),
            AttackLevel::High => {
                if verified {
                    ThrottleVerdict::Allowed
                } else if self.deterministic_bypass(ip) {
                    self.take_token(ip, 1.0, now_ms)
                } else {
                    self.take_token(ip, self.config.high_reduction, now_ms)
                }
            }
            AttackLevel::Critical => {
                if verified {
                    self.take_token(ip, 1.0, now_ms)
                } else {
                    ThrottleVerdict::VerifiedOnly
                }
            }
            AttackLevel::Lockdown => {
                if !verified {
                    return ThrottleVerdict::VerifiedOnly;
                }
                self.acquire_slot(conn_id)
            }
        }
    }

    /// Release a lockdown slot held by a closing connection. Unknown
    /// connection ids are a no-op.
    pub fn release(&self, conn_id: u64) {
        if self.lockdown_holders.remove(&conn_id).is_some() {
            let _ = self
                .lockdown_used
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }
    }

    pub fn lockdown_slots_used(&self) -> usize {
        self.lockdown_used.load(Ordering::Relaxed)
    }

    fn acquire_slot(&self, conn_id: u64) -> ThrottleVerdict {
        let pool = self.config.lockdown_pool;
        let acquired = self
            .lockdown_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                if used < pool {
                    Some(used + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if acquired {
            self.lockdown_holders.insert(conn_id);
            ThrottleVerdict::Allowed
        } else {
            ThrottleVerdict::PoolFull
        }
    }

    fn take_token(&self, ip: IpAddr, scale: f64, now_ms: u64) -> ThrottleVerdict {
        let capacity = self.config.bucket_capacity * scale;
        let refill = self.config.refill_per_sec * scale;
        let mut bucket = self.buckets.entry(ip).or_insert(Bucket {
            tokens: self.config.bucket_capacity,
            last_ms: now_ms,
        });
        let elapsed_s = now_ms.saturating_sub(bucket.last_ms) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed_s * refill).min(capacity);
        bucket.last_ms = now_ms;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            ThrottleVerdict::Allowed
        } else {
            ThrottleVerdict::Limited
        }
    }

    /// Reduced-rate bucket check for subnet-throttled sources. Charged on
    /// top of the normal level-gated check, so a throttled subnet pays
    /// double for every admission.
    pub fn try_acquire_reduced(&self, ip: IpAddr, now_ms: u64) -> ThrottleVerdict {
        self.take_token(ip, self.config.high_reduction, now_ms)
    }

    /// Same IP, same outcome: hash-based selection, not randomness.
    fn deterministic_bypass(&self, ip: IpAddr) -> bool {
        let mut hasher = DefaultHasher::new();
        ip.hash(&mut hasher);
        hasher.finish() % 100 < self.config.high_bypass_percent
    }

    /// Drop buckets idle long enough to have refilled completely.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let idle_ms = if self.config.refill_per_sec > 0.0 {
            ((self.config.bucket_capacity / self.config.refill_per_sec) * 1000.0) as u64 * 2
        } else {
            60_000
        };
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now_ms.saturating_sub(b.last_ms) < idle_ms);
        before - self.buckets.len()
    }
}
