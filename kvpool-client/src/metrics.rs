//! # Pool Metrics
//!
//! Lightweight counters and a wait-time histogram describing how a pool is
//! used: how often callers had to block, how often they gave up, and how
//! many connections were opened, discarded, or closed.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events without
//!    touching the pool mutex.
//! 2. **Fixed Buckets**: Histogram buckets live in a contiguous array.
//! 3. **Plain Snapshots**: Readers get owned structs, never live atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default acquire-wait bucket boundaries in microseconds.
pub const DEFAULT_WAIT_BUCKETS_US: [u64; 10] = [
    10, 100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000,
];

/// Point-in-time copy of a pool's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Successful acquisitions.
    pub acquires: u64,
    /// Acquisitions that had to block on a saturated pool, whether they then
    /// succeeded, timed out, or saw shutdown.
    pub waits: u64,
    /// Acquisitions that gave up at their deadline.
    pub timeouts: u64,
    /// Failed attempts to open a new connection.
    pub connect_failures: u64,
    /// Connections opened over the pool's lifetime.
    pub opened: u64,
    /// Connections closed over the pool's lifetime.
    pub closed: u64,
    /// Connections discarded on release or checkout because they were dead.
    pub discarded: u64,
    /// Distribution of time spent blocked in `acquire`, one sample per wait.
    pub wait_latency: LatencySnapshot,
}

/// Snapshot of the wait-time histogram.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencySnapshot {
    /// Bucket boundaries in microseconds.
    pub bounds_us: Vec<u64>,
    /// Bucket counts, including the overflow bucket at the end.
    pub buckets: Vec<u64>,
    /// Total number of samples.
    pub samples: u64,
    /// Sum of waits in microseconds.
    pub sum_us: u64,
}

impl LatencySnapshot {
    /// Mean wait, or zero without samples.
    pub fn mean(&self) -> Duration {
        if self.samples == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.sum_us / self.samples)
        }
    }
}

/// Thread-safe metrics aggregator for one pool.
///
/// `Ordering::Relaxed` is enough: counters are independent and only need to
/// be eventually consistent.
pub struct PoolMetrics {
    acquires: AtomicU64,
    waits: AtomicU64,
    timeouts: AtomicU64,
    connect_failures: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    discarded: AtomicU64,
    wait_latency: LatencyHistogram,
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolMetrics {
    /// Creates a metrics aggregator with the default wait buckets.
    pub fn new() -> Self {
        PoolMetrics {
            acquires: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            opened: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            wait_latency: LatencyHistogram::new(DEFAULT_WAIT_BUCKETS_US.to_vec()),
        }
    }

    pub fn record_acquire(&self) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one blocked acquisition and how long it blocked.
    pub fn record_wait(&self, waited: Duration) {
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.wait_latency.record(waited);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_open(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters and histogram buckets.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            acquires: self.acquires.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            wait_latency: self.wait_latency.snapshot(),
        }
    }
}

/// Fixed-bucket latency histogram.
///
/// Bucket selection is a linear scan; the bound list is short and stays hot
/// in cache.
pub struct LatencyHistogram {
    bounds_us: Vec<u64>,
    buckets: Vec<AtomicU64>,
    sum_us: AtomicU64,
    samples: AtomicU64,
}

impl LatencyHistogram {
    /// Creates a histogram with explicit bucket boundaries (microseconds).
    ///
    /// **Input**: `bounds_us` sorted ascending.
    /// **Output**: histogram with `bounds_us.len() + 1` buckets (last is overflow).
    pub fn new(bounds_us: Vec<u64>) -> Self {
        let buckets = (0..=bounds_us.len()).map(|_| AtomicU64::new(0)).collect();
        LatencyHistogram {
            bounds_us,
            buckets,
            sum_us: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// Records one measurement.
    pub fn record(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(micros, Ordering::Relaxed);

        let idx = self
            .bounds_us
            .iter()
            .position(|&bound| micros <= bound)
            .unwrap_or(self.bounds_us.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of the histogram.
    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            bounds_us: self.bounds_us.clone(),
            buckets: self
                .buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
            samples: self.samples.load(Ordering::Relaxed),
            sum_us: self.sum_us.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_places_samples_in_buckets() {
        let hist = LatencyHistogram::new(vec![10, 100]);
        hist.record(Duration::from_micros(5));
        hist.record(Duration::from_micros(10));
        hist.record(Duration::from_micros(50));
        hist.record(Duration::from_millis(1));

        let snap = hist.snapshot();
        assert_eq!(snap.buckets, vec![2, 1, 1]);
        assert_eq!(snap.samples, 4);
        assert_eq!(snap.sum_us, 5 + 10 + 50 + 1_000);
    }

    #[test]
    fn waits_feed_histogram() {
        let metrics = PoolMetrics::new();
        metrics.record_acquire();
        metrics.record_wait(Duration::from_millis(2));
        metrics.record_timeout();

        let snap = metrics.snapshot();
        assert_eq!(snap.acquires, 1);
        assert_eq!(snap.waits, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.wait_latency.samples, 1);
        assert_eq!(snap.wait_latency.mean(), Duration::from_millis(2));
    }
}
