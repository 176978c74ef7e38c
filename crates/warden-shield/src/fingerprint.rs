//! Connection fingerprinting.
//!
//! Builds a composite key from the protocol version, a normalized hostname
//! bucket, and a handshake-timing class. Many connections sharing one
//! fingerprint inside the TTL window indicate a coordinated client army,
//! and every IP carrying that fingerprint is flagged. Counts live in a
//! TTL-bounded map with lazy expiry on access; the sweep evicts the rest.

use std::net::IpAddr;

use dashmap::DashMap;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct FingerprintConfig {
    /// Lifetime of a fingerprint count.
    pub ttl_ms: u64,
    /// Count at which a fingerprint marks a coordinated client set.
    pub mass_threshold: u64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 10 * 60_000,
            mass_threshold: 30,
        }
    }
}

/// Stable hostname buckets. Bot fleets tend to cluster in the first two.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostnameBucket {
    IpLiteral,
    VeryShort,
    Pattern(String),
}

impl HostnameBucket {
    pub fn classify(hostname: &str) -> Self {
        if hostname.parse::<IpAddr>().is_ok() {
            return Self::IpLiteral;
        }
        if hostname.len() <= 3 {
            return Self::VeryShort;
        }
        // Truncate by characters, not bytes; hostnames may be multibyte.
        let normalized: String = hostname.to_lowercase().chars().take(16).collect();
        Self::Pattern(normalized)
    }
}

/// Handshake timing classes; sub-5ms handshakes are scripted clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimingClass {
    BotFast,
    Fast,
    Normal,
    Slow,
}

impl TimingClass {
    pub fn classify(handshake_ms: u64) -> Self {
        match handshake_ms {
            0..=4 => Self::BotFast,
            5..=49 => Self::Fast,
            50..=299 => Self::Normal,
            _ => Self::Slow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub protocol_version: i32,
    pub hostname: HostnameBucket,
    pub timing: TimingClass,
}

struct FpEntry {
    count: u64,
    expires_ms: u64,
}

pub struct FingerprintTracker {
    config: FingerprintConfig,
    counts: DashMap<Fingerprint, FpEntry>,
    latest: DashMap<IpAddr, Fingerprint>,
}

impl FingerprintTracker {
    pub fn new(config: FingerprintConfig) -> Self {
        Self {
            config,
            counts: DashMap::new(),
            latest: DashMap::new(),
        }
    }

    /// Record a completed handshake; returns true when the fingerprint is
    /// at or past the mass threshold.
    pub fn record(
        &self,
        ip: IpAddr,
        protocol_version: i32,
        hostname: &str,
        handshake_ms: u64,
        now_ms: u64,
    ) -> bool {
        let fp = Fingerprint {
            protocol_version,
            hostname: HostnameBucket::classify(hostname),
            timing: TimingClass::classify(handshake_ms),
        };

        let count = {
            let mut entry = self.counts.entry(fp.clone()).or_insert(FpEntry {
                count: 0,
                expires_ms: 0,
            });
            if entry.expires_ms <= now_ms {
                entry.count = 0;
            }
            entry.count += 1;
            entry.expires_ms = now_ms + self.config.ttl_ms;
            entry.count
        };

        self.latest.insert(ip, fp.clone());

        if count == self.config.mass_threshold {
            warn!(?fp, count, "fingerprint mass threshold crossed");
        }
        count >= self.config.mass_threshold
    }

    /// Whether the IP's most recent fingerprint belongs to a flagged set.
    pub fn is_flagged(&self, ip: IpAddr, now_ms: u64) -> bool {
        let Some(fp) = self.latest.get(&ip) else {
            return false;
        };
        self.counts
            .get(fp.value())
            .map(|e| e.expires_ms > now_ms && e.count >= self.config.mass_threshold)
            .unwrap_or(false)
    }

    pub fn distinct_count(&self) -> usize {
        self.counts.len()
    }

    /// Evict expired fingerprints and orphaned per-IP entries.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.counts.len();
        self.counts.retain(|_, e| e.expires_ms > now_ms);
        self.latest
            .retain(|_, fp| self.counts.contains_key(fp));
        before - self.counts.len()
    }
}
