//! Long-horizon learned traffic baseline.
//!
//! 168 time-of-week slots (day-of-week x hour) holding an exponentially
//! smoothed mean and an EMA of absolute deviation per tracked metric. The
//! deviation EMA stands in for a true stddev so updates stay O(1) without
//! storing history. Slots key off the local wall clock; DST shifts leave at
//! worst one hour of the week under-trained twice a year.

use chrono::{Datelike, Local, TimeZone, Timelike};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{TrafficSample, METRIC_COUNT};

pub const SLOT_COUNT: usize = 24 * 7;

/// Smoothed statistics for one metric in one time-of-week slot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MetricStats {
    pub mean: f64,
    pub stddev: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SlotProfile {
    pub samples: u64,
    pub last_updated_ms: u64,
    pub metrics: [MetricStats; METRIC_COUNT],
}

/// Serializable state for the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineSnapshot {
    pub slots: Vec<SlotProfile>,
}

pub struct WeeklyBaseline {
    slots: RwLock<Vec<SlotProfile>>,
    alpha: f64,
    stddev_floor: f64,
}

impl WeeklyBaseline {
    pub fn new(alpha: f64, stddev_floor: f64) -> Self {
        Self {
            slots: RwLock::new(vec![SlotProfile::default(); SLOT_COUNT]),
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            stddev_floor: stddev_floor.max(1.0),
        }
    }

    /// Time-of-week slot for a wall-clock timestamp.
    pub fn slot_for_ms(now_ms: u64) -> usize {
        let dt = Local
            .timestamp_millis_opt(now_ms as i64)
            .earliest()
            .unwrap_or_else(Local::now);
        let dow = dt.weekday().num_days_from_sunday() as usize;
        dow * 24 + dt.hour() as usize
    }

    /// Fold one tick's sample vector into the given slot.
    ///
    /// First sample seeds the mean directly and the deviation as 20% of the
    /// value; later samples apply exponential smoothing. The deviation never
    /// drops below the configured floor.
    pub fn update(&self, slot: usize, sample: &TrafficSample, now_ms: u64) {
        let mut slots = self.slots.write();
        let profile = &mut slots[slot % SLOT_COUNT];
        let values = sample.as_vector();
        if profile.samples == 0 {
            for (stats, &x) in profile.metrics.iter_mut().zip(values.iter()) {
                stats.mean = x;
                stats.stddev = (0.2 * x.abs()).max(self.stddev_floor);
            }
        } else {
            let a = self.alpha;
            for (stats, &x) in profile.metrics.iter_mut().zip(values.iter()) {
                stats.mean = a * x + (1.0 - a) * stats.mean;
                let deviation = (x - stats.mean).abs();
                stats.stddev = (a * deviation + (1.0 - a) * stats.stddev).max(self.stddev_floor);
            }
        }
        profile.samples += 1;
        profile.last_updated_ms = now_ms;
    }

    /// Whether a slot has enough history to gate anomaly decisions on.
    pub fn is_reliable(&self, slot: usize, min_samples: u64) -> bool {
        self.slots.read()[slot % SLOT_COUNT].samples >= min_samples
    }

    pub fn expected(&self, slot: usize, metric: usize) -> MetricStats {
        self.slots.read()[slot % SLOT_COUNT].metrics[metric % METRIC_COUNT]
    }

    pub fn samples(&self, slot: usize) -> u64 {
        self.slots.read()[slot % SLOT_COUNT].samples
    }

    /// Reinitialize all 168 slots.
    pub fn reset(&self) {
        let mut slots = self.slots.write();
        slots.iter_mut().for_each(|s| *s = SlotProfile::default());
    }

    pub fn export(&self) -> BaselineSnapshot {
        BaselineSnapshot {
            slots: self.slots.read().clone(),
        }
    }

    pub fn import(&self, snapshot: BaselineSnapshot) {
        if snapshot.slots.len() == SLOT_COUNT {
            *self.slots.write() = snapshot.slots;
        }
    }
}
