//! Per-IP reputation scoring with lazy decay and automatic banning.
//!
//! Scores live in [0, 100] and start at a configured baseline. Discrete
//! events apply deltas; elapsed time restores penalized scores toward the
//! baseline at a fixed hourly rate, credited lazily on access so no sweep
//! is needed for decay itself. Two independent ban tiers each fire at most
//! once per cool-down window, so an actor under continuous penalty yields
//! one ban command per tier rather than a stream of duplicates.

use std::collections::HashMap;
use std::net::IpAddr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use warden_common::ViolationKind;

#[derive(Debug, Clone)]
pub struct ReputationConfig {
    pub baseline: f64,
    pub success_bonus: f64,
    pub penalty_rate_limit: f64,
    pub penalty_invalid_handshake: f64,
    pub penalty_slow_connection: f64,
    pub penalty_malformed: f64,
    pub penalty_during_attack: f64,
    /// Points restored per elapsed hour, capped at the baseline.
    pub decay_per_hour: f64,
    /// Verified IPs never fall below this score.
    pub verified_floor: f64,
    pub short_ban_threshold: f64,
    pub long_ban_threshold: f64,
    pub short_ban_ms: u64,
    pub long_ban_ms: u64,
    pub short_ban_cooldown_ms: u64,
    pub long_ban_cooldown_ms: u64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            baseline: 50.0,
            success_bonus: 2.0,
            penalty_rate_limit: 10.0,
            penalty_invalid_handshake: 15.0,
            penalty_slow_connection: 10.0,
            penalty_malformed: 10.0,
            penalty_during_attack: 5.0,
            decay_per_hour: 5.0,
            verified_floor: 30.0,
            short_ban_threshold: 20.0,
            long_ban_threshold: 5.0,
            short_ban_ms: 60 * 60 * 1000,
            long_ban_ms: 24 * 60 * 60 * 1000,
            short_ban_cooldown_ms: 60 * 60 * 1000,
            long_ban_cooldown_ms: 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanTier {
    Short,
    Long,
}

/// A ban the engine decided to issue for an IP.
#[derive(Debug, Clone)]
pub struct BanDecision {
    pub tier: BanTier,
    pub duration_ms: u64,
    pub score: f64,
}

#[derive(Debug, Clone, Copy)]
struct IpRecord {
    score: f64,
    last_decay_ms: u64,
    verified: bool,
    last_short_ban_ms: Option<u64>,
    last_long_ban_ms: Option<u64>,
}

/// Serializable per-IP entry for bulk load/save.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReputationEntry {
    pub score: f64,
    pub verified: bool,
}

pub struct ReputationEngine {
    config: ReputationConfig,
    records: DashMap<IpAddr, IpRecord>,
}

impl ReputationEngine {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
        }
    }

    pub fn penalty_for(&self, kind: ViolationKind) -> f64 {
        match kind {
            ViolationKind::RateLimit => self.config.penalty_rate_limit,
            ViolationKind::InvalidHandshake => self.config.penalty_invalid_handshake,
            ViolationKind::SlowConnection => self.config.penalty_slow_connection,
            ViolationKind::MalformedMetadata => self.config.penalty_malformed,
            ViolationKind::ConnectedDuringAttack => self.config.penalty_during_attack,
        }
    }

    /// Apply a violation penalty. Returns a ban decision when the score
    /// crossed a tier threshold outside that tier's cool-down.
    pub fn penalize(
        &self,
        ip: IpAddr,
        kind: ViolationKind,
        points: Option<f64>,
        now_ms: u64,
    ) -> Option<BanDecision> {
        let penalty = points.unwrap_or_else(|| self.penalty_for(kind));
        self.apply_delta(ip, -penalty.abs(), now_ms)
    }

    /// Credit a successful connection.
    pub fn record_success(&self, ip: IpAddr, now_ms: u64) {
        self.apply_delta(ip, self.config.success_bonus, now_ms);
    }

    /// Mark an IP as verified (logged in); its score gains a floor.
    pub fn mark_verified(&self, ip: IpAddr, now_ms: u64) {
        let mut rec = self
            .records
            .entry(ip)
            .or_insert_with(|| self.fresh_record(now_ms));
        rec.verified = true;
        if rec.score < self.config.verified_floor {
            rec.score = self.config.verified_floor;
        }
    }

    pub fn is_verified(&self, ip: IpAddr) -> bool {
        self.records.get(&ip).map(|r| r.verified).unwrap_or(false)
    }

    /// Current score with decay credited; absent IPs sit at the baseline.
    pub fn score(&self, ip: IpAddr, now_ms: u64) -> f64 {
        match self.records.get_mut(&ip) {
            Some(mut rec) => {
                Self::credit_decay(&mut rec, &self.config, now_ms);
                rec.score
            }
            None => self.config.baseline,
        }
    }

    fn fresh_record(&self, now_ms: u64) -> IpRecord {
        IpRecord {
            score: self.config.baseline,
            last_decay_ms: now_ms,
            verified: false,
            last_short_ban_ms: None,
            last_long_ban_ms: None,
        }
    }

    fn apply_delta(&self, ip: IpAddr, delta: f64, now_ms: u64) -> Option<BanDecision> {
        let mut rec = self
            .records
            .entry(ip)
            .or_insert_with(|| self.fresh_record(now_ms));
        Self::credit_decay(&mut rec, &self.config, now_ms);

        let floor = if rec.verified {
            self.config.verified_floor
        } else {
            0.0
        };
        rec.score = (rec.score + delta).clamp(floor, 100.0);

        if delta >= 0.0 {
            return None;
        }
        self.check_ban(&mut rec, ip, now_ms)
    }

    fn check_ban(&self, rec: &mut IpRecord, ip: IpAddr, now_ms: u64) -> Option<BanDecision> {
        let cfg = &self.config;
        if rec.score <= cfg.long_ban_threshold {
            let eligible = rec
                .last_long_ban_ms
                .map(|t| now_ms.saturating_sub(t) >= cfg.long_ban_cooldown_ms)
                .unwrap_or(true);
            if eligible {
                rec.last_long_ban_ms = Some(now_ms);
                debug!(%ip, score = rec.score, "long auto-ban");
                return Some(BanDecision {
                    tier: BanTier::Long,
                    duration_ms: cfg.long_ban_ms,
                    score: rec.score,
                });
            }
        }
        if rec.score <= cfg.short_ban_threshold {
            let eligible = rec
                .last_short_ban_ms
                .map(|t| now_ms.saturating_sub(t) >= cfg.short_ban_cooldown_ms)
                .unwrap_or(true);
            if eligible {
                rec.last_short_ban_ms = Some(now_ms);
                debug!(%ip, score = rec.score, "short auto-ban");
                return Some(BanDecision {
                    tier: BanTier::Short,
                    duration_ms: cfg.short_ban_ms,
                    score: rec.score,
                });
            }
        }
        None
    }

    /// Credit decay in whole elapsed hours only. The sub-hour remainder is
    /// kept for the next credit, so closely spaced penalties see exact
    /// scores and tier-threshold crossings are not masked by fractional
    /// credits in between.
    fn credit_decay(rec: &mut IpRecord, cfg: &ReputationConfig, now_ms: u64) {
        if rec.score >= cfg.baseline {
            rec.last_decay_ms = now_ms;
            return;
        }
        let whole_hours = now_ms.saturating_sub(rec.last_decay_ms) / 3_600_000;
        if whole_hours > 0 {
            rec.score =
                (rec.score + cfg.decay_per_hour * whole_hours as f64).min(cfg.baseline);
            rec.last_decay_ms += whole_hours * 3_600_000;
        }
    }

    /// Evict fully recovered, non-verified entries to bound memory. Decay
    /// itself happens lazily on access; this sweep only removes entries
    /// that carry no information anymore.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let cfg = self.config.clone();
        let before = self.records.len();
        self.records.retain(|_, rec| {
            Self::credit_decay(rec, &cfg, now_ms);
            let ban_cooling = rec
                .last_short_ban_ms
                .map(|t| now_ms.saturating_sub(t) < cfg.short_ban_cooldown_ms)
                .unwrap_or(false)
                || rec
                    .last_long_ban_ms
                    .map(|t| now_ms.saturating_sub(t) < cfg.long_ban_cooldown_ms)
                    .unwrap_or(false);
            rec.verified || ban_cooling || rec.score < cfg.baseline
        });
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Worst-scored IPs for the dashboard snapshot.
    pub fn worst(&self, limit: usize) -> Vec<(IpAddr, f64)> {
        let mut entries: Vec<(IpAddr, f64)> = self
            .records
            .iter()
            .map(|e| (*e.key(), e.value().score))
            .collect();
        entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        entries.truncate(limit);
        entries
    }

    pub fn export(&self) -> HashMap<IpAddr, ReputationEntry> {
        self.records
            .iter()
            .map(|e| {
                (
                    *e.key(),
                    ReputationEntry {
                        score: e.value().score,
                        verified: e.value().verified,
                    },
                )
            })
            .collect()
    }

    pub fn import(&self, entries: &HashMap<IpAddr, ReputationEntry>, now_ms: u64) {
        for (ip, entry) in entries {
            self.records.insert(
                *ip,
                IpRecord {
                    score: entry.score.clamp(0.0, 100.0),
                    last_decay_ms: now_ms,
                    verified: entry.verified,
                    last_short_ban_ms: None,
                    last_long_ban_ms: None,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn engine() -> ReputationEngine {
        ReputationEngine::new(ReputationConfig::default())
    }

    #[test]
    fn test_score_starts_at_baseline() {
        let e = engine();
        assert_eq!(e.score(ip("1.2.3.4"), 0), 50.0);
    }

    #[test]
    fn test_score_clamped_to_range() {
        let e = engine();
        let a = ip("1.2.3.4");
        for _ in 0..50 {
            e.penalize(a, ViolationKind::InvalidHandshake, None, 0);
        }
        assert_eq!(e.score(a, 0), 0.0);
        for _ in 0..100 {
            e.record_success(a, 0);
        }
        assert_eq!(e.score(a, 0), 100.0);
    }

    #[test]
    fn test_verified_floor_holds_under_penalties() {
        let e = engine();
        let a = ip("1.2.3.4");
        e.mark_verified(a, 0);
        for _ in 0..50 {
            e.penalize(a, ViolationKind::InvalidHandshake, None, 0);
        }
        assert_eq!(e.score(a, 0), 30.0);
    }

    #[test]
    fn test_exactly_one_short_ban_for_consecutive_penalties() {
        let cfg = ReputationConfig {
            long_ban_threshold: 2.0,
            ..ReputationConfig::default()
        };
        let e = ReputationEngine::new(cfg);
        let a = ip("9.9.9.9");
        // 50 -> 35 -> 20 -> 5; threshold 20 crossed at the second penalty.
        let b1 = e.penalize(a, ViolationKind::InvalidHandshake, None, 1_000);
        let b2 = e.penalize(a, ViolationKind::InvalidHandshake, None, 2_000);
        let b3 = e.penalize(a, ViolationKind::InvalidHandshake, None, 3_000);
        assert!(b1.is_none());
        let ban = b2.expect("short ban at threshold crossing");
        assert_eq!(ban.tier, BanTier::Short);
        assert!(b3.is_none(), "cool-down suppresses the duplicate");
    }

    #[test]
    fn test_long_ban_tier_independent_of_short() {
        let e = engine();
        let a = ip("9.9.9.9");
        let mut bans = Vec::new();
        for i in 0..6 {
            if let Some(b) = e.penalize(a, ViolationKind::InvalidHandshake, None, 1_000 + i) {
                bans.push(b);
            }
        }
        let shorts = bans.iter().filter(|b| b.tier == BanTier::Short).count();
        let longs = bans.iter().filter(|b| b.tier == BanTier::Long).count();
        assert_eq!(shorts, 1);
        assert_eq!(longs, 1);
    }

    #[test]
    fn test_lazy_decay_restores_toward_baseline() {
        let e = engine();
        let a = ip("1.2.3.4");
        e.penalize(a, ViolationKind::RateLimit, None, 0); // 40
        // Two hours later: +10 restored.
        assert_eq!(e.score(a, 2 * 3_600_000), 50.0);
    }

    #[test]
    fn test_decay_credits_whole_hours_and_keeps_remainder() {
        let e = engine();
        let a = ip("1.2.3.4");
        e.penalize(a, ViolationKind::RateLimit, None, 0); // 40
        // Half an hour is not enough for any credit.
        assert_eq!(e.score(a, 30 * 60_000), 40.0);
        // The remainder was kept: one full hour after the penalty, +5.
        assert_eq!(e.score(a, 60 * 60_000), 45.0);
        assert_eq!(e.score(a, 90 * 60_000), 45.0);
        assert_eq!(e.score(a, 120 * 60_000), 50.0);
    }

    #[test]
    fn test_decay_never_exceeds_baseline() {
        let e = engine();
        let a = ip("1.2.3.4");
        e.penalize(a, ViolationKind::RateLimit, None, 0);
        assert_eq!(e.score(a, 1_000 * 3_600_000), 50.0);
    }

    #[test]
    fn test_custom_violation_points() {
        let e = engine();
        let a = ip("1.2.3.4");
        e.penalize(a, ViolationKind::RateLimit, Some(30.0), 0);
        assert_eq!(e.score(a, 0), 20.0);
    }

    #[test]
    fn test_sweep_evicts_recovered_entries() {
        let e = engine();
        let a = ip("1.2.3.4");
        let v = ip("5.6.7.8");
        e.penalize(a, ViolationKind::RateLimit, None, 0);
        e.mark_verified(v, 0);
        // Far in the future, a's score has recovered and cool-downs lapsed.
        let evicted = e.sweep(100 * 3_600_000);
        assert_eq!(evicted, 1);
        assert!(e.is_verified(v));
    }

    #[test]
    fn test_export_import_round_trip() {
        let e = engine();
        let a = ip("1.2.3.4");
        e.penalize(a, ViolationKind::InvalidHandshake, None, 0);
        e.mark_verified(a, 0);
        let exported = e.export();

        let restored = engine();
        restored.import(&exported, 0);
        assert_eq!(restored.score(a, 0), e.score(a, 0));
        assert!(restored.is_verified(a));
    }
}
