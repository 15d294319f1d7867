//! Pool Metrics
//!
//! Lightweight counters for the load/forward paths.
//!
//! # Design Goals:
//! - Lock-free atomic counters, safe to bump from any caller thread
//! - Zero allocation in hot paths
//! - Immutable snapshots for reporting

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters shared by every thread calling into one pool
pub struct PoolMetrics {
    // Instance startup
    pub instance_starts: AtomicU64,
    pub instance_start_time_ns: AtomicU64,

    // Model loading
    pub loads: AtomicU64,
    pub load_failures: AtomicU64,
    pub load_time_ns: AtomicU64,

    // Forward calls
    pub forwards: AtomicU64,
    pub forward_failures: AtomicU64,
    pub forward_time_ns: AtomicU64,

    // Time spent waiting for instance locks
    pub lock_wait_ns: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            instance_starts: AtomicU64::new(0),
            instance_start_time_ns: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            load_failures: AtomicU64::new(0),
            load_time_ns: AtomicU64::new(0),
            forwards: AtomicU64::new(0),
            forward_failures: AtomicU64::new(0),
            forward_time_ns: AtomicU64::new(0),
            lock_wait_ns: AtomicU64::new(0),
        })
    }

    pub fn record_instance_start(&self, duration: Duration) {
        self.instance_starts.fetch_add(1, Ordering::Relaxed);
        self.instance_start_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_load(&self, duration: Duration) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.load_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward(&self, duration: Duration) {
        self.forwards.fetch_add(1, Ordering::Relaxed);
        self.forward_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_forward_failure(&self) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_wait(&self, duration: Duration) {
        self.lock_wait_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            instance_starts: self.instance_starts.load(Ordering::Relaxed),
            avg_instance_start_ms: avg_duration_ms(&self.instance_starts, &self.instance_start_time_ns),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            avg_load_ms: avg_duration_ms(&self.loads, &self.load_time_ns),
            forwards: self.forwards.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            avg_forward_ms: avg_duration_ms(&self.forwards, &self.forward_time_ns),
            total_lock_wait_ms: self.lock_wait_ns.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

fn avg_duration_ms(count: &AtomicU64, total_ns: &AtomicU64) -> f64 {
    let count = count.load(Ordering::Relaxed);
    if count == 0 {
        return 0.0;
    }
    total_ns.load(Ordering::Relaxed) as f64 / count as f64 / 1_000_000.0
}

/// Point-in-time copy of [`PoolMetrics`]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub instance_starts: u64,
    pub avg_instance_start_ms: f64,
    pub loads: u64,
    pub load_failures: u64,
    pub avg_load_ms: f64,
    pub forwards: u64,
    pub forward_failures: u64,
    pub avg_forward_ms: f64,
    pub total_lock_wait_ms: f64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Instances started:  {} (avg {:.2} ms)", self.instance_starts, self.avg_instance_start_ms)?;
        writeln!(f, "Models loaded:      {} ({} failed, avg {:.2} ms)", self.loads, self.load_failures, self.avg_load_ms)?;
        writeln!(f, "Forward calls:      {} ({} failed, avg {:.3} ms)", self.forwards, self.forward_failures, self.avg_forward_ms)?;
        write!(f, "Lock wait (total):  {:.2} ms", self.total_lock_wait_ms)
    }
}

/// What a [`ScopedTimer`] records when dropped.
///
/// Loads and forwards are timed by the pool directly, since only successful
/// calls count toward their averages.
#[derive(Debug, Clone, Copy)]
pub enum TimerType {
    InstanceStart,
    LockWait,
}

/// Records elapsed time into [`PoolMetrics`] on drop
pub struct ScopedTimer<'a> {
    metrics: &'a PoolMetrics,
    timer_type: TimerType,
    start: Instant,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(metrics: &'a PoolMetrics, timer_type: TimerType) -> Self {
        Self {
            metrics,
            timer_type,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        match self.timer_type {
            TimerType::InstanceStart => self.metrics.record_instance_start(duration),
            TimerType::LockWait => self.metrics.record_lock_wait(duration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let metrics = PoolMetrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.loads, 0);
        assert_eq!(snapshot.forwards, 0);
        assert_eq!(snapshot.avg_forward_ms, 0.0);
    }

    #[test]
    fn test_averages() {
        let metrics = PoolMetrics::new();
        metrics.record_forward(Duration::from_millis(2));
        metrics.record_forward(Duration::from_millis(4));
        metrics.record_forward_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.forwards, 2);
        assert_eq!(snapshot.forward_failures, 1);
        assert!((snapshot.avg_forward_ms - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_scoped_timer_records_on_drop() {
        let metrics = PoolMetrics::new();
        {
            let _timer = ScopedTimer::new(&metrics, TimerType::InstanceStart);
            std::thread::sleep(Duration::from_millis(2));
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.instance_starts, 1);
        assert!(snapshot.avg_instance_start_ms >= 2.0);
        assert_eq!(snapshot.loads, 0);
    }
}
