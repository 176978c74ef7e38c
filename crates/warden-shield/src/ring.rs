//! Fixed-capacity metrics ring buffer.
//!
//! O(1) insert, O(n) aggregates on read. Statistics reflect only the most
//! recent `capacity` samples; an empty ring reports zeroed statistics so
//! callers never divide by a missing window.

use parking_lot::RwLock;

/// Circular numeric buffer shared between the aggregator (single writer)
/// and any number of snapshot readers.
pub struct MetricsRing {
    inner: RwLock<RingInner>,
    stddev_floor: f64,
}

struct RingInner {
    buf: Vec<f64>,
    capacity: usize,
    head: usize,
    len: usize,
}

/// Aggregate view over the current window.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RingStats {
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
    pub len: usize,
}

impl MetricsRing {
    pub fn new(capacity: usize, stddev_floor: f64) -> Self {
        Self {
            inner: RwLock::new(RingInner {
                buf: vec![0.0; capacity.max(1)],
                capacity: capacity.max(1),
                head: 0,
                len: 0,
            }),
            stddev_floor,
        }
    }

    /// Overwrites the oldest slot once the ring is full.
    pub fn push(&self, value: f64) {
        let mut inner = self.inner.write();
        let head = inner.head;
        inner.buf[head] = value;
        inner.head = (head + 1) % inner.capacity;
        if inner.len < inner.capacity {
            inner.len += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mean(&self) -> f64 {
        self.stats().mean
    }

    /// Population standard deviation, floored to keep z-scores total.
    pub fn stddev(&self) -> f64 {
        self.stats().stddev
    }

    pub fn min(&self) -> f64 {
        self.stats().min
    }

    pub fn max(&self) -> f64 {
        self.stats().max
    }

    /// Mean, stddev, min, and max in one pass over the window.
    pub fn stats(&self) -> RingStats {
        let inner = self.inner.read();
        if inner.len == 0 {
            return RingStats::default();
        }
        let window = &inner.buf[..inner.len];
        let n = window.len() as f64;
        let mean = window.iter().sum::<f64>() / n;
        let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for &v in window {
            min = min.min(v);
            max = max.max(v);
        }
        RingStats {
            mean,
            stddev: variance.sqrt().max(self.stddev_floor),
            min,
            max,
            len: window.len(),
        }
    }

    /// Nearest-rank percentile over a sorted copy of the window.
    pub fn percentile(&self, p: f64) -> f64 {
        let inner = self.inner.read();
        if inner.len == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = inner.buf[..inner.len].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = (p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ring_is_neutral() {
        let ring = MetricsRing::new(8, 0.0);
        assert_eq!(ring.mean(), 0.0);
        assert_eq!(ring.stddev(), 0.0);
        assert_eq!(ring.percentile(0.99), 0.0);
    }

    #[test]
    fn test_overwrite_keeps_recent_window() {
        let ring = MetricsRing::new(4, 0.0);
        for v in [1.0, 2.0, 3.0, 4.0, 100.0, 100.0, 100.0, 100.0] {
            ring.push(v);
        }
        // Only the last four samples remain.
        assert_eq!(ring.mean(), 100.0);
        assert_eq!(ring.min(), 100.0);
        assert_eq!(ring.max(), 100.0);
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn test_stddev_floor_on_constant_input() {
        let ring = MetricsRing::new(16, 1.0);
        for _ in 0..16 {
            ring.push(42.0);
        }
        assert_eq!(ring.stddev(), 1.0);
    }

    #[test]
    fn test_percentile() {
        let ring = MetricsRing::new(10, 0.0);
        for v in 1..=10 {
            ring.push(v as f64);
        }
        assert_eq!(ring.percentile(0.0), 1.0);
        assert_eq!(ring.percentile(1.0), 10.0);
        assert_eq!(ring.percentile(0.5), 6.0);
    }

    #[test]
    fn test_partial_fill() {
        let ring = MetricsRing::new(100, 0.0);
        ring.push(10.0);
        ring.push(20.0);
        assert_eq!(ring.mean(), 15.0);
        assert_eq!(ring.len(), 2);
    }
}
