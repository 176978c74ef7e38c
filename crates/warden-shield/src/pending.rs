//! Pending-connection exhaustion tracking.
//!
//! Counts connections that have been observed but never completed their
//! handshake, per IP and system-wide. A connection that never completes is
//! reclaimed by the periodic sweep after a timeout rather than waiting for
//! a close event, since abandoned half-open connections are exactly the
//! attack this guards against. Pending and active counts are backed by the
//! tracked id sets, so they can never go negative and closing an unknown
//! connection id is a no-op.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::{DashMap, DashSet};

#[derive(Debug, Clone)]
pub struct PendingConfig {
    /// Pending connections from one IP before it is flagged.
    pub per_ip_cap: usize,
    /// System-wide pending/active ratio that raises the global alarm.
    pub global_ratio: f64,
    /// Minimum pending count before the global alarm can fire.
    pub global_min_pending: usize,
    /// Keep-alives closer together than this count as abuse.
    pub keepalive_gap_ms: u64,
    /// Sub-gap keep-alives before the IP is flagged.
    pub keepalive_threshold: u32,
    /// Pending entries older than this are reclaimed by the sweep.
    pub handshake_timeout_ms: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            per_ip_cap: 5,
            global_ratio: 0.3,
            global_min_pending: 10,
            keepalive_gap_ms: 100,
            keepalive_threshold: 5,
            handshake_timeout_ms: 30_000,
        }
    }
}

/// Handshake metadata held while a connection is pending.
#[derive(Debug, Clone)]
pub struct PendingConn {
    pub start_ms: u64,
    pub protocol_version: i32,
    pub hostname: String,
}

#[derive(Debug, Default)]
struct IpPending {
    conns: HashMap<u64, PendingConn>,
    keepalive_last_ms: u64,
    keepalive_streak: u32,
}

pub struct PendingTracker {
    config: PendingConfig,
    per_ip: DashMap<IpAddr, IpPending>,
    /// Ids observed and not yet closed; membership gates the active count.
    active_ids: DashSet<u64>,
    pending_total: AtomicUsize,
    active_total: AtomicUsize,
}

impl PendingTracker {
    pub fn new(config: PendingConfig) -> Self {
        Self {
            config,
            per_ip: DashMap::new(),
            active_ids: DashSet::new(),
            pending_total: AtomicUsize::new(0),
            active_total: AtomicUsize::new(0),
        }
    }

    /// A connection was observed; it is pending until its handshake
    /// completes. Returns the IP's pending count.
    pub fn observe(
        &self,
        ip: IpAddr,
        conn_id: u64,
        protocol_version: i32,
        hostname: &str,
        now_ms: u64,
    ) -> usize {
        let mut entry = self.per_ip.entry(ip).or_default();
        let inserted = entry
            .conns
            .insert(
                conn_id,
                PendingConn {
                    start_ms: now_ms,
                    protocol_version,
                    hostname: hostname.to_string(),
                },
            )
            .is_none();
        if inserted {
            self.pending_total.fetch_add(1, Ordering::Relaxed);
        }
        if self.active_ids.insert(conn_id) {
            self.active_total.fetch_add(1, Ordering::Relaxed);
        }
        entry.conns.len()
    }

    /// Handshake finished; the pending entry is consumed and returned so
    /// the caller can fingerprint the handshake timing.
    pub fn complete(&self, ip: IpAddr, conn_id: u64) -> Option<PendingConn> {
        let removed = self.per_ip.get_mut(&ip).and_then(|mut e| e.conns.remove(&conn_id));
        if removed.is_some() {
            self.pending_total.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Connection closed. Unknown ids are a no-op; returns whether the id
    /// was actually being tracked so the caller can skip churn accounting
    /// for phantom closes.
    pub fn close(&self, ip: IpAddr, conn_id: u64) -> bool {
        if let Some(mut entry) = self.per_ip.get_mut(&ip) {
            if entry.conns.remove(&conn_id).is_some() {
                self.pending_total.fetch_sub(1, Ordering::Relaxed);
            }
        }
        if self.active_ids.remove(&conn_id).is_some() {
            self.active_total.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Whether an IP holds too many half-open connections.
    pub fn is_flagged(&self, ip: IpAddr) -> bool {
        self.per_ip
            .get(&ip)
            .map(|e| e.conns.len() >= self.config.per_ip_cap)
            .unwrap_or(false)
    }

    /// System-wide exhaustion alarm, independent of any single IP.
    pub fn global_alarm(&self) -> bool {
        let pending = self.pending_total.load(Ordering::Relaxed);
        let active = self.active_total.load(Ordering::Relaxed);
        pending >= self.config.global_min_pending
            && active > 0
            && pending as f64 / active as f64 >= self.config.global_ratio
    }

    /// Record a keep-alive; returns true once the IP's sub-gap streak
    /// crosses the abuse threshold.
    pub fn keepalive(&self, ip: IpAddr, now_ms: u64) -> bool {
        let mut entry = self.per_ip.entry(ip).or_default();
        if now_ms.saturating_sub(entry.keepalive_last_ms) < self.config.keepalive_gap_ms {
            entry.keepalive_streak += 1;
        } else {
            entry.keepalive_streak = 1;
        }
        entry.keepalive_last_ms = now_ms;
        entry.keepalive_streak >= self.config.keepalive_threshold
    }

    pub fn pending_count(&self) -> usize {
        self.pending_total.load(Ordering::Relaxed)
    }

    pub fn active_count(&self) -> usize {
        self.active_total.load(Ordering::Relaxed)
    }

    pub fn pending_for(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).map(|e| e.conns.len()).unwrap_or(0)
    }

    /// Reclaim pending entries whose handshake timed out. Returns the
    /// number reclaimed per IP so the caller can apply slow-connection
    /// penalties.
    pub fn reclaim(&self, now_ms: u64) -> Vec<(IpAddr, usize)> {
        let cutoff = now_ms.saturating_sub(self.config.handshake_timeout_ms);
        let mut reclaimed = Vec::new();
        for mut entry in self.per_ip.iter_mut() {
            let before = entry.conns.len();
            entry.conns.retain(|_, c| c.start_ms >= cutoff);
            let dropped = before - entry.conns.len();
            if dropped > 0 {
                self.pending_total.fetch_sub(dropped, Ordering::Relaxed);
                reclaimed.push((*entry.key(), dropped));
            }
        }
        // Entries with no pending connections and no live keep-alive streak
        // carry no state worth keeping.
        self.per_ip.retain(|_, e| {
            !e.conns.is_empty()
                || now_ms.saturating_sub(e.keepalive_last_ms) < self.config.keepalive_gap_ms * 10
        });
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn tracker() -> PendingTracker {
        PendingTracker::new(PendingConfig::default())
    }

    #[test]
    fn test_observe_complete_cycle() {
        let t = tracker();
        let a = ip("1.2.3.4");
        t.observe(a, 1, 760, "play.example.net", 0);
        assert_eq!(t.pending_count(), 1);
        let conn = t.complete(a, 1).expect("pending entry");
        assert_eq!(conn.protocol_version, 760);
        assert_eq!(t.pending_count(), 0);
    }

    #[test]
    fn test_close_unknown_id_is_noop() {
        let t = tracker();
        assert!(!t.close(ip("1.2.3.4"), 999));
        assert_eq!(t.pending_count(), 0);
        assert_eq!(t.active_count(), 0);
        t.observe(ip("1.2.3.4"), 1, 760, "h", 0);
        // Closing an id that was never observed must not touch either count.
        assert!(!t.close(ip("1.2.3.4"), 999));
        assert_eq!(t.pending_count(), 1);
        assert_eq!(t.active_count(), 1);
        assert!(t.close(ip("1.2.3.4"), 1));
        assert_eq!(t.active_count(), 0);
    }

    #[test]
    fn test_close_after_handshake_still_tracked() {
        let t = tracker();
        let a = ip("1.2.3.4");
        t.observe(a, 1, 760, "h", 0);
        t.complete(a, 1);
        assert_eq!(t.active_count(), 1);
        assert!(t.close(a, 1));
        assert_eq!(t.active_count(), 0);
    }

    #[test]
    fn test_per_ip_cap_flags() {
        let t = tracker();
        let a = ip("1.2.3.4");
        for id in 0..5 {
            t.observe(a, id, 760, "h", 0);
        }
        assert!(t.is_flagged(a));
        assert!(!t.is_flagged(ip("5.6.7.8")));
    }

    #[test]
    fn test_global_alarm_on_pending_ratio() {
        let t = tracker();
        // 30 connections, 15 never complete: ratio 0.5 over 30 active.
        for id in 0..30u64 {
            let a = ip(&format!("10.0.0.{}", id + 1));
            t.observe(a, id, 760, "h", 0);
            if id % 2 == 0 {
                t.complete(a, id);
            }
        }
        assert!(t.global_alarm());
    }

    #[test]
    fn test_no_alarm_on_healthy_traffic() {
        let t = tracker();
        for id in 0..30u64 {
            let a = ip(&format!("10.0.0.{}", id + 1));
            t.observe(a, id, 760, "h", 0);
            t.complete(a, id);
        }
        assert!(!t.global_alarm());
    }

    #[test]
    fn test_keepalive_abuse() {
        let t = tracker();
        let a = ip("1.2.3.4");
        let mut flagged = false;
        for i in 0..6 {
            flagged = t.keepalive(a, i * 50); // 50ms apart, under the gap
        }
        assert!(flagged);
        // Normal spacing resets the streak.
        assert!(!t.keepalive(a, 10_000));
    }

    #[test]
    fn test_reclaim_times_out_stale_handshakes() {
        let t = tracker();
        let a = ip("1.2.3.4");
        t.observe(a, 1, 760, "h", 0);
        t.observe(a, 2, 760, "h", 25_000);
        let reclaimed = t.reclaim(40_000);
        assert_eq!(reclaimed, vec![(a, 1)]);
        assert_eq!(t.pending_count(), 1);
    }

    #[test]
    fn test_duplicate_observe_counts_once() {
        let t = tracker();
        let a = ip("1.2.3.4");
        t.observe(a, 1, 760, "h", 0);
        t.observe(a, 1, 760, "h", 100);
        assert_eq!(t.pending_count(), 1);
        assert_eq!(t.active_count(), 1);
    }
}
