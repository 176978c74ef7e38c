//! Short-horizon instantaneous anomaly scoring.
//!
//! Catches sudden spikes the long-horizon baseline would absorb slowly:
//! a z-score check over a short rolling window, slow-ramp detection against
//! a periodically refreshed reference point, and pulse detection for
//! attackers cycling intensity to sit under fixed thresholds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::ring::MetricsRing;
use crate::{AlertLevel, AnomalyAlert};

#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    /// Rolling window length in ticks (60-900 seconds at one tick/s).
    pub window_len: usize,
    /// Z-score above which the connection rate is anomalous.
    pub z_threshold: f64,
    /// Samples required before z-scores are trusted.
    pub min_samples: usize,
    /// Percentage growth per minute that counts as a slow ramp.
    pub ramp_percent_per_minute: f64,
    /// Minimum age of the ramp reference before it may refresh.
    pub ramp_refresh_ms: u64,
    /// Ticks examined for pulse detection.
    pub pulse_window: usize,
    /// Multiple of the window mean separating "high" from "low" ticks.
    pub pulse_high_ratio: f64,
    pub stddev_floor: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_len: 300,
            z_threshold: 3.0,
            min_samples: 10,
            ramp_percent_per_minute: 30.0,
            ramp_refresh_ms: 5 * 60 * 1000,
            pulse_window: 20,
            pulse_high_ratio: 1.5,
            stddev_floor: 1.0,
        }
    }
}

/// Reference point for ramp measurement; absent until the first sample.
struct RampState {
    base_value: f64,
    base_ms: u64,
}

pub struct ShortWindowDetector {
    config: AnomalyConfig,
    window: MetricsRing,
    recent: Mutex<VecDeque<f64>>,
    ramp: Mutex<Option<RampState>>,
    anomaly_active: AtomicBool,
    ramping: AtomicBool,
    pulsing: AtomicBool,
}

impl ShortWindowDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        let window = MetricsRing::new(config.window_len, config.stddev_floor);
        Self {
            window,
            recent: Mutex::new(VecDeque::with_capacity(config.pulse_window)),
            ramp: Mutex::new(None),
            anomaly_active: AtomicBool::new(false),
            ramping: AtomicBool::new(false),
            pulsing: AtomicBool::new(false),
            config,
        }
    }

    /// Feed one tick's connection rate; returns alerts raised on this tick.
    pub fn observe(&self, cps: f64, now_ms: u64) -> Vec<AnomalyAlert> {
        self.window.push(cps);
        {
            let mut recent = self.recent.lock();
            if recent.len() == self.config.pulse_window {
                recent.pop_front();
            }
            recent.push_back(cps);
        }

        let mut alerts = Vec::new();
        if let Some(alert) = self.check_zscore(cps, now_ms) {
            alerts.push(alert);
        }
        if let Some(alert) = self.check_ramp(cps, now_ms) {
            alerts.push(alert);
        }
        if let Some(alert) = self.check_pulse(cps, now_ms) {
            alerts.push(alert);
        }
        alerts
    }

    pub fn is_anomalous(&self) -> bool {
        self.anomaly_active.load(Ordering::Relaxed)
    }

    pub fn is_ramping(&self) -> bool {
        self.ramping.load(Ordering::Relaxed)
    }

    pub fn is_pulsing(&self) -> bool {
        self.pulsing.load(Ordering::Relaxed)
    }

    pub fn window_stats(&self) -> (f64, f64) {
        let stats = self.window.stats();
        (stats.mean, stats.stddev)
    }

    /// Z-score flag. No hysteresis here: the flag clears as soon as the
    /// score falls back under threshold; damping belongs to the level
    /// state machine.
    fn check_zscore(&self, cps: f64, now_ms: u64) -> Option<AnomalyAlert> {
        let stats = self.window.stats();
        if stats.len < self.config.min_samples {
            return None;
        }
        let z = (cps - stats.mean) / stats.stddev;
        if z > self.config.z_threshold {
            let was_active = self.anomaly_active.swap(true, Ordering::Relaxed);
            if !was_active {
                let level = if z > 2.0 * self.config.z_threshold {
                    AlertLevel::Critical
                } else if z > 1.5 * self.config.z_threshold {
                    AlertLevel::High
                } else {
                    AlertLevel::Elevated
                };
                return Some(AnomalyAlert {
                    level,
                    metric: "cps".to_string(),
                    z_score: z,
                    current: cps,
                    mean: stats.mean,
                    details: format!(
                        "connection rate {cps:.1}/s is {z:.1} stddevs above short-window mean {:.1}",
                        stats.mean
                    ),
                    at_ms: now_ms,
                });
            }
        } else {
            self.anomaly_active.store(false, Ordering::Relaxed);
        }
        None
    }

    /// Slow-ramp flag: percentage growth per minute against a reference
    /// point that refreshes every few minutes while traffic is calm, so
    /// genuine diurnal growth stops flagging once absorbed.
    fn check_ramp(&self, cps: f64, now_ms: u64) -> Option<AnomalyAlert> {
        let mut guard = self.ramp.lock();
        let Some(ramp) = guard.as_mut() else {
            *guard = Some(RampState {
                base_value: cps.max(1.0),
                base_ms: now_ms,
            });
            return None;
        };
        let elapsed_min = (now_ms.saturating_sub(ramp.base_ms)) as f64 / 60_000.0;
        if elapsed_min < 1.0 {
            return None;
        }
        let pct_per_min = ((cps - ramp.base_value) / ramp.base_value * 100.0) / elapsed_min;
        if pct_per_min >= self.config.ramp_percent_per_minute {
            let was = self.ramping.swap(true, Ordering::Relaxed);
            if !was {
                return Some(AnomalyAlert {
                    level: AlertLevel::Elevated,
                    metric: "cps_ramp".to_string(),
                    z_score: 0.0,
                    current: cps,
                    mean: ramp.base_value,
                    details: format!(
                        "connection rate ramping at {pct_per_min:.0}%/min from {:.1}/s",
                        ramp.base_value
                    ),
                    at_ms: now_ms,
                });
            }
        } else {
            self.ramping.store(false, Ordering::Relaxed);
            if now_ms.saturating_sub(ramp.base_ms) >= self.config.ramp_refresh_ms {
                ramp.base_value = cps.max(1.0);
                ramp.base_ms = now_ms;
            }
        }
        None
    }

    /// Pulse flag: counts high/low transitions over the last `pulse_window`
    /// ticks. Frequent oscillation around the mean indicates an attacker
    /// cycling intensity to evade threshold-only detectors.
    fn check_pulse(&self, _cps: f64, now_ms: u64) -> Option<AnomalyAlert> {
        let recent = self.recent.lock();
        if recent.len() < self.config.pulse_window {
            self.pulsing.store(false, Ordering::Relaxed);
            return None;
        }
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        if mean <= 0.0 {
            self.pulsing.store(false, Ordering::Relaxed);
            return None;
        }
        let threshold = mean * self.config.pulse_high_ratio;
        let mut transitions = 0usize;
        let mut prev_high: Option<bool> = None;
        for &v in recent.iter() {
            let high = v > threshold;
            if let Some(p) = prev_high {
                if p != high {
                    transitions += 1;
                }
            }
            prev_high = Some(high);
        }
        if transitions >= self.config.pulse_window / 3 {
            let was = self.pulsing.swap(true, Ordering::Relaxed);
            if !was {
                return Some(AnomalyAlert {
                    level: AlertLevel::High,
                    metric: "cps_pulse".to_string(),
                    z_score: 0.0,
                    current: transitions as f64,
                    mean,
                    details: format!(
                        "{transitions} intensity transitions over last {} ticks",
                        self.config.pulse_window
                    ),
                    at_ms: now_ms,
                });
            }
        } else {
            self.pulsing.store(false, Ordering::Relaxed);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ShortWindowDetector {
        ShortWindowDetector::new(AnomalyConfig {
            window_len: 60,
            z_threshold: 3.0,
            min_samples: 10,
            ramp_percent_per_minute: 30.0,
            ramp_refresh_ms: 5 * 60 * 1000,
            pulse_window: 20,
            pulse_high_ratio: 1.5,
            stddev_floor: 1.0,
        })
    }

    #[test]
    fn test_no_flag_before_min_samples() {
        let d = detector();
        for i in 0..5 {
            d.observe(10.0, i * 1000);
        }
        let alerts = d.observe(10_000.0, 6_000);
        assert!(alerts.iter().all(|a| a.metric != "cps"));
        assert!(!d.is_anomalous());
    }

    #[test]
    fn test_spike_raises_zscore_alert_once() {
        let d = detector();
        let mut now = 0u64;
        for i in 0..30 {
            d.observe(10.0 + (i % 3) as f64, now);
            now += 1000;
        }
        let first = d.observe(500.0, now);
        assert!(first.iter().any(|a| a.metric == "cps"));
        assert!(d.is_anomalous());
        // Sustained spike does not re-alert while the flag holds.
        let second = d.observe(500.0, now + 1000);
        assert!(second.iter().all(|a| a.metric != "cps"));
    }

    #[test]
    fn test_zscore_flag_clears_without_hysteresis() {
        let d = detector();
        let mut now = 0u64;
        for _ in 0..30 {
            d.observe(10.0, now);
            now += 1000;
        }
        d.observe(500.0, now);
        assert!(d.is_anomalous());
        d.observe(10.0, now + 1000);
        assert!(!d.is_anomalous());
    }

    #[test]
    fn test_slow_ramp_detected() {
        let d = detector();
        // Reference point at 10 cps.
        d.observe(10.0, 0);
        // Two minutes later traffic has tripled: +100%/min.
        let alerts = d.observe(30.0, 120_000);
        assert!(alerts.iter().any(|a| a.metric == "cps_ramp"));
        assert!(d.is_ramping());
    }

    #[test]
    fn test_ramp_reference_refreshes_when_calm() {
        let d = detector();
        d.observe(10.0, 0);
        // Calm for longer than the refresh interval.
        d.observe(11.0, 6 * 60 * 1000);
        assert!(!d.is_ramping());
        // Growth measured against the refreshed reference, not the original.
        let alerts = d.observe(12.0, 7 * 60 * 1000);
        assert!(alerts.iter().all(|a| a.metric != "cps_ramp"));
    }

    #[test]
    fn test_pulse_detection() {
        let d = detector();
        let mut now = 0u64;
        // Alternate hard between 5 and 100 cps: many high/low transitions.
        for i in 0..25 {
            let v = if i % 2 == 0 { 5.0 } else { 100.0 };
            d.observe(v, now);
            now += 1000;
        }
        assert!(d.is_pulsing());
    }

    #[test]
    fn test_steady_traffic_not_pulsing() {
        let d = detector();
        let mut now = 0u64;
        for _ in 0..25 {
            d.observe(50.0, now);
            now += 1000;
        }
        assert!(!d.is_pulsing());
    }
}
