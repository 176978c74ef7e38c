//! Attack archetype classification.
//!
//! A pure, ordered decision list over one tick's traffic snapshot. The
//! precedence encodes "most specific signature wins": the numeric
//! multipliers are tunable configuration, the order is not.

use serde::{Deserialize, Serialize};

use crate::TickSnapshot;

/// Named attack archetypes, most specific first in the decision list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackArchetype {
    None,
    Pulsing,
    Amplification,
    PingFlood,
    Slowloris,
    Distributed,
    ApplicationLayer,
    Volumetric,
}

impl AttackArchetype {
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pulsing => "pulsing",
            Self::Amplification => "amplification",
            Self::PingFlood => "ping_flood",
            Self::Slowloris => "slowloris",
            Self::Distributed => "distributed",
            Self::ApplicationLayer => "application_layer",
            Self::Volumetric => "volumetric",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Variance above this multiple of base cps reads as pulsed intensity.
    pub pulse_variance_mult: f64,
    /// Average response payload size suggesting amplification abuse.
    pub amp_min_response_bytes: f64,
    /// Ping rate above this multiple of base cps (with moderate cps)
    /// suggests amplification probing.
    pub amp_ping_mult: f64,
    /// "Moderate" cps ceiling used by several signatures.
    pub moderate_cps_mult: f64,
    /// Ping rate above this multiple of base cps is a ping flood.
    pub ping_flood_mult: f64,
    /// Login rate below this (per second) counts as near-zero.
    pub login_floor: f64,
    /// Pending/total ratio above this is connection-slot exhaustion.
    pub slowloris_pending_ratio: f64,
    /// Distinct IPs in the window above this is a distributed pattern.
    pub distributed_min_ips: f64,
    /// Handshake completion above this with low logins is an
    /// application-layer attack riding real connections.
    pub app_layer_completion: f64,
    /// Very high cps multiple for the volumetric signature.
    pub volumetric_cps_mult: f64,
    /// Handshake completion below this with very high cps is volumetric.
    pub volumetric_completion: f64,
    /// Generic high-cps fallback multiple.
    pub fallback_cps_mult: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            pulse_variance_mult: 4.0,
            amp_min_response_bytes: 1200.0,
            amp_ping_mult: 2.0,
            moderate_cps_mult: 2.0,
            ping_flood_mult: 5.0,
            login_floor: 0.1,
            slowloris_pending_ratio: 0.5,
            distributed_min_ips: 30.0,
            app_layer_completion: 0.9,
            volumetric_cps_mult: 4.0,
            volumetric_completion: 0.5,
            fallback_cps_mult: 3.0,
        }
    }
}

/// Map a traffic snapshot to an attack archetype. First match wins.
pub fn classify(snap: &TickSnapshot, base_cps: f64, cfg: &ClassifierConfig) -> AttackArchetype {
    let base = base_cps.max(1.0);

    if snap.cps < base {
        return AttackArchetype::None;
    }

    if snap.cps_variance > cfg.pulse_variance_mult * base {
        return AttackArchetype::Pulsing;
    }

    if snap.avg_response_size > cfg.amp_min_response_bytes
        && snap.ping_rate > cfg.amp_ping_mult * base
        && snap.cps < cfg.moderate_cps_mult * base
    {
        return AttackArchetype::Amplification;
    }

    if snap.ping_rate > cfg.ping_flood_mult * base && snap.login_rate < cfg.login_floor {
        return AttackArchetype::PingFlood;
    }

    if snap.total_connections > 0.0
        && snap.pending_connections / snap.total_connections > cfg.slowloris_pending_ratio
        && snap.cps < cfg.moderate_cps_mult * base
    {
        return AttackArchetype::Slowloris;
    }

    if snap.unique_ips > cfg.distributed_min_ips && snap.cps < cfg.moderate_cps_mult * base {
        return AttackArchetype::Distributed;
    }

    if snap.cps < cfg.moderate_cps_mult * base
        && snap.login_rate < cfg.login_floor
        && snap.handshake_completion_rate > cfg.app_layer_completion
    {
        return AttackArchetype::ApplicationLayer;
    }

    if snap.cps >= cfg.volumetric_cps_mult * base
        && snap.handshake_completion_rate < cfg.volumetric_completion
    {
        return AttackArchetype::Volumetric;
    }

    if snap.cps >= cfg.fallback_cps_mult * base {
        return AttackArchetype::Volumetric;
    }

    AttackArchetype::None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap() -> TickSnapshot {
        TickSnapshot {
            cps: 10.0,
            pending_connections: 0.0,
            total_connections: 50.0,
            handshake_completion_rate: 0.95,
            login_rate: 5.0,
            ping_rate: 2.0,
            unique_ips: 8.0,
            avg_response_size: 300.0,
            cps_variance: 2.0,
        }
    }

    #[test]
    fn test_below_base_is_none() {
        let s = snap();
        assert_eq!(
            classify(&s, 100.0, &ClassifierConfig::default()),
            AttackArchetype::None
        );
    }

    #[test]
    fn test_pulsing_wins_over_later_signatures() {
        let mut s = snap();
        s.cps = 15.0;
        s.cps_variance = 100.0;
        s.ping_rate = 200.0; // would also match ping flood
        s.login_rate = 0.0;
        assert_eq!(
            classify(&s, 10.0, &ClassifierConfig::default()),
            AttackArchetype::Pulsing
        );
    }

    #[test]
    fn test_amplification() {
        let mut s = snap();
        s.cps = 15.0;
        s.avg_response_size = 4000.0;
        s.ping_rate = 30.0;
        assert_eq!(
            classify(&s, 10.0, &ClassifierConfig::default()),
            AttackArchetype::Amplification
        );
    }

    #[test]
    fn test_ping_flood() {
        let mut s = snap();
        s.cps = 25.0;
        s.ping_rate = 200.0;
        s.login_rate = 0.0;
        assert_eq!(
            classify(&s, 10.0, &ClassifierConfig::default()),
            AttackArchetype::PingFlood
        );
    }

    #[test]
    fn test_slowloris() {
        let mut s = snap();
        s.cps = 12.0;
        s.pending_connections = 40.0;
        s.total_connections = 60.0;
        assert_eq!(
            classify(&s, 10.0, &ClassifierConfig::default()),
            AttackArchetype::Slowloris
        );
    }

    #[test]
    fn test_distributed() {
        let mut s = snap();
        s.cps = 15.0;
        s.unique_ips = 500.0;
        assert_eq!(
            classify(&s, 10.0, &ClassifierConfig::default()),
            AttackArchetype::Distributed
        );
    }

    #[test]
    fn test_application_layer() {
        let mut s = snap();
        s.cps = 15.0;
        s.login_rate = 0.0;
        s.handshake_completion_rate = 0.98;
        assert_eq!(
            classify(&s, 10.0, &ClassifierConfig::default()),
            AttackArchetype::ApplicationLayer
        );
    }

    #[test]
    fn test_volumetric_low_completion() {
        let mut s = snap();
        s.cps = 100.0;
        s.handshake_completion_rate = 0.1;
        assert_eq!(
            classify(&s, 10.0, &ClassifierConfig::default()),
            AttackArchetype::Volumetric
        );
    }

    #[test]
    fn test_high_cps_fallback_is_volumetric() {
        let mut s = snap();
        s.cps = 50.0;
        s.handshake_completion_rate = 0.95;
        s.login_rate = 5.0;
        assert_eq!(
            classify(&s, 10.0, &ClassifierConfig::default()),
            AttackArchetype::Volumetric
        );
    }

    #[test]
    fn test_mildly_elevated_is_none() {
        let mut s = snap();
        s.cps = 15.0;
        assert_eq!(
            classify(&s, 10.0, &ClassifierConfig::default()),
            AttackArchetype::None
        );
    }
}
