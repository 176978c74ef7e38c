//! Hysteretic attack-level escalation.
//!
//! A target level is recomputed every tick from the connection rate as a
//! multiple of the learned base rate. The current level only changes after
//! the target has persisted for the escalation or de-escalation hold time;
//! any change of the pending target restarts its timer. Commits jump
//! directly to the pending target even when it is several steps away.
//!
//! The committed level is published through an atomically swapped reference
//! so admission-path reads never contend with the aggregator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::info;

use crate::AttackLevel;

#[derive(Debug, Clone)]
pub struct LevelConfig {
    /// Hold time before an escalation commits.
    pub hysteresis_up_ms: u64,
    /// Hold time before a de-escalation commits; longer to avoid flapping.
    pub hysteresis_down_ms: u64,
    /// Rate multiples of base at which each posture is implied. Lockdown
    /// sits well above Critical so a rate just past the Critical band does
    /// not tip straight into full lockdown.
    pub elevated_mult: f64,
    pub high_mult: f64,
    pub critical_mult: f64,
    pub lockdown_mult: f64,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            hysteresis_up_ms: 5_000,
            hysteresis_down_ms: 30_000,
            elevated_mult: 1.5,
            high_mult: 2.0,
            critical_mult: 3.0,
            lockdown_mult: 6.0,
        }
    }
}

/// The published posture read by the admission path.
#[derive(Debug, Clone, Copy)]
pub struct LevelState {
    pub level: AttackLevel,
    pub since_ms: u64,
}

struct Pending {
    target: AttackLevel,
    since_ms: u64,
}

/// Summary emitted when the level returns to `None`.
#[derive(Debug, Clone, Copy)]
pub struct AttackSummary {
    pub peak_level: AttackLevel,
    pub peak_cps: f64,
    pub duration_ms: u64,
}

/// A committed level change.
#[derive(Debug, Clone)]
pub struct LevelTransition {
    pub previous: AttackLevel,
    pub next: AttackLevel,
    pub observed_cps: f64,
    pub at_ms: u64,
    pub ended: Option<AttackSummary>,
}

pub struct LevelMachine {
    config: LevelConfig,
    current: ArcSwap<LevelState>,
    pending: Mutex<Option<Pending>>,
    /// Legacy boolean consumed by older integrations; true at or above
    /// `Elevated`. The burst tracker may also raise it directly.
    attack_mode: Arc<AtomicBool>,
    attack_started_ms: AtomicU64,
    peak_cps_bits: AtomicU64,
    peak_level: Mutex<AttackLevel>,
    transitions: AtomicU64,
}

impl LevelMachine {
    pub fn new(config: LevelConfig, attack_mode: Arc<AtomicBool>) -> Self {
        Self {
            config,
            current: ArcSwap::from_pointee(LevelState {
                level: AttackLevel::None,
                since_ms: 0,
            }),
            pending: Mutex::new(None),
            attack_mode,
            attack_started_ms: AtomicU64::new(0),
            peak_cps_bits: AtomicU64::new(0),
            peak_level: Mutex::new(AttackLevel::None),
            transitions: AtomicU64::new(0),
        }
    }

    /// Lock-free read of the committed level.
    pub fn current(&self) -> AttackLevel {
        self.current.load().level
    }

    pub fn current_state(&self) -> LevelState {
        **self.current.load()
    }

    pub fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Target level implied by a connection rate, as multiples of base.
    pub fn target_for(cps: f64, base_cps: f64, config: &LevelConfig) -> AttackLevel {
        let ratio = cps / base_cps.max(1.0);
        if ratio >= config.lockdown_mult {
            AttackLevel::Lockdown
        } else if ratio >= config.critical_mult {
            AttackLevel::Critical
        } else if ratio >= config.high_mult {
            AttackLevel::High
        } else if ratio >= config.elevated_mult {
            AttackLevel::Elevated
        } else {
            AttackLevel::None
        }
    }

    /// One tick of the state machine. Returns the committed transition, if
    /// any; side effects (alerting, persistence) belong to the caller.
    pub fn evaluate(&self, cps: f64, base_cps: f64, now_ms: u64) -> Option<LevelTransition> {
        let current = self.current();
        let target = Self::target_for(cps, base_cps, &self.config);

        if current > AttackLevel::None {
            self.track_peak(cps, current);
        }

        if target == current {
            *self.pending.lock() = None;
            return None;
        }

        let commit = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(p) if p.target == target => {
                    let hold = if target > current {
                        self.config.hysteresis_up_ms
                    } else {
                        self.config.hysteresis_down_ms
                    };
                    now_ms.saturating_sub(p.since_ms) >= hold
                }
                _ => {
                    // New pending target; the clock restarts.
                    *pending = Some(Pending {
                        target,
                        since_ms: now_ms,
                    });
                    false
                }
            }
        };

        if !commit {
            return None;
        }

        *self.pending.lock() = None;
        self.commit(current, target, cps, now_ms)
    }

    fn commit(
        &self,
        previous: AttackLevel,
        next: AttackLevel,
        cps: f64,
        now_ms: u64,
    ) -> Option<LevelTransition> {
        self.current.store(Arc::new(LevelState {
            level: next,
            since_ms: now_ms,
        }));
        self.attack_mode
            .store(next >= AttackLevel::Elevated, Ordering::Relaxed);
        self.transitions.fetch_add(1, Ordering::Relaxed);

        if previous == AttackLevel::None {
            self.attack_started_ms.store(now_ms, Ordering::Relaxed);
            self.peak_cps_bits.store(cps.to_bits(), Ordering::Relaxed);
            *self.peak_level.lock() = next;
        }

        let ended = if next == AttackLevel::None {
            let started = self.attack_started_ms.load(Ordering::Relaxed);
            Some(AttackSummary {
                peak_level: *self.peak_level.lock(),
                peak_cps: f64::from_bits(self.peak_cps_bits.load(Ordering::Relaxed)),
                duration_ms: now_ms.saturating_sub(started),
            })
        } else {
            None
        };

        info!(
            previous = previous.label(),
            next = next.label(),
            cps,
            "attack level changed"
        );

        Some(LevelTransition {
            previous,
            next,
            observed_cps: cps,
            at_ms: now_ms,
            ended,
        })
    }

    fn track_peak(&self, cps: f64, current: AttackLevel) {
        let bits = self.peak_cps_bits.load(Ordering::Relaxed);
        if cps > f64::from_bits(bits) {
            self.peak_cps_bits.store(cps.to_bits(), Ordering::Relaxed);
        }
        let mut peak = self.peak_level.lock();
        if current > *peak {
            *peak = current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(up: u64, down: u64) -> LevelMachine {
        LevelMachine::new(
            LevelConfig {
                hysteresis_up_ms: up,
                hysteresis_down_ms: down,
                ..LevelConfig::default()
            },
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn drive(m: &LevelMachine, cps: f64, base: f64, from_ms: u64, to_ms: u64) -> Vec<LevelTransition> {
        let mut out = Vec::new();
        let mut t = from_ms;
        while t <= to_ms {
            if let Some(tr) = m.evaluate(cps, base, t) {
                out.push(tr);
            }
            t += 1000;
        }
        out
    }

    #[test]
    fn test_target_thresholds() {
        let cfg = LevelConfig::default();
        assert_eq!(LevelMachine::target_for(9.0, 10.0, &cfg), AttackLevel::None);
        assert_eq!(
            LevelMachine::target_for(15.0, 10.0, &cfg),
            AttackLevel::Elevated
        );
        assert_eq!(LevelMachine::target_for(20.0, 10.0, &cfg), AttackLevel::High);
        assert_eq!(
            LevelMachine::target_for(30.0, 10.0, &cfg),
            AttackLevel::Critical
        );
        // A rate just past the Critical band stays Critical.
        assert_eq!(
            LevelMachine::target_for(55.0, 10.0, &cfg),
            AttackLevel::Critical
        );
        assert_eq!(
            LevelMachine::target_for(60.0, 10.0, &cfg),
            AttackLevel::Lockdown
        );
    }

    #[test]
    fn test_no_instant_escalation() {
        let m = machine(5_000, 30_000);
        assert!(m.evaluate(100.0, 10.0, 0).is_none());
        assert_eq!(m.current(), AttackLevel::None);
    }

    #[test]
    fn test_sustained_rate_reaches_implied_level() {
        let m = machine(5_000, 30_000);
        // 55 cps on base 10 implies Critical (>=3x), not Lockdown (<6x).
        let transitions = drive(&m, 55.0, 10.0, 0, 10_000);
        assert_eq!(m.current(), AttackLevel::Critical);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].next, AttackLevel::Critical);
    }

    #[test]
    fn test_commit_jumps_directly_to_target() {
        let m = machine(5_000, 30_000);
        let transitions = drive(&m, 500.0, 10.0, 0, 6_000);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].previous, AttackLevel::None);
        assert_eq!(transitions[0].next, AttackLevel::Lockdown);
    }

    #[test]
    fn test_noise_below_next_threshold_does_not_oscillate() {
        let m = machine(5_000, 30_000);
        drive(&m, 55.0, 10.0, 0, 10_000);
        assert_eq!(m.current(), AttackLevel::Critical);
        // Wobble between 3.1x and 4.5x base: still Critical, no flapping.
        let mut t = 11_000;
        for i in 0..60 {
            let cps = if i % 2 == 0 { 31.0 } else { 45.0 };
            assert!(m.evaluate(cps, 10.0, t).is_none());
            t += 1000;
        }
        assert_eq!(m.current(), AttackLevel::Critical);
    }

    #[test]
    fn test_deescalation_waits_for_down_hold() {
        let m = machine(5_000, 30_000);
        drive(&m, 500.0, 10.0, 0, 6_000);
        assert_eq!(m.current(), AttackLevel::Lockdown);
        // Rate collapses; the level must hold until hysteresis_down_ms.
        let transitions = drive(&m, 0.0, 10.0, 10_000, 39_000);
        assert!(transitions.is_empty());
        assert_eq!(m.current(), AttackLevel::Lockdown);
        let transitions = drive(&m, 0.0, 10.0, 40_000, 41_000);
        assert_eq!(transitions.len(), 1);
        assert_eq!(m.current(), AttackLevel::None);
        let summary = transitions[0].ended.expect("attack-ended summary");
        assert_eq!(summary.peak_level, AttackLevel::Lockdown);
    }

    #[test]
    fn test_pending_target_change_resets_timer() {
        let m = machine(5_000, 30_000);
        // Start escalating toward High.
        m.evaluate(25.0, 10.0, 0);
        m.evaluate(25.0, 10.0, 3_000);
        // Target changes to Critical before the hold elapses; timer restarts.
        m.evaluate(35.0, 10.0, 4_000);
        assert!(m.evaluate(35.0, 10.0, 8_000).is_none());
        let tr = m.evaluate(35.0, 10.0, 9_000).expect("commit after restart");
        assert_eq!(tr.next, AttackLevel::Critical);
    }

    #[test]
    fn test_legacy_attack_mode_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let m = LevelMachine::new(
            LevelConfig {
                hysteresis_up_ms: 1_000,
                hysteresis_down_ms: 2_000,
                ..LevelConfig::default()
            },
            flag.clone(),
        );
        drive(&m, 20.0, 10.0, 0, 2_000);
        assert!(flag.load(Ordering::Relaxed));
        drive(&m, 0.0, 10.0, 3_000, 7_000);
        assert!(!flag.load(Ordering::Relaxed));
    }
}
