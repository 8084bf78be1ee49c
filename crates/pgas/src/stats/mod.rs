//! Statistics - Per-Runtime Operation Counters
//!
//! Counters are attached to the runtime handle and updated with relaxed
//! atomics at every operation edge. Remote round-trip times additionally
//! feed a logarithmic histogram so the snapshot can report average and
//! tail latency.

pub mod histogram;

pub use histogram::Histogram;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Atomic counter block shared across threads of one runtime
#[derive(Debug, Default)]
pub struct RuntimeStats {
    local_reads: AtomicU64,
    local_writes: AtomicU64,
    remote_reads: AtomicU64,
    remote_writes: AtomicU64,
    atomics: AtomicU64,
    barriers: AtomicU64,
    bytes_transferred: AtomicU64,
    comm_failures: AtomicU64,
    latency: Histogram,
}

impl RuntimeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_local_read(&self) {
        self.local_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_write(&self) {
        self.local_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_read(&self, bytes: u64, latency: Duration) {
        self.remote_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        self.latency.record(latency.as_nanos() as u64);
    }

    pub fn record_remote_write(&self, bytes: u64, latency: Duration) {
        self.remote_writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        self.latency.record(latency.as_nanos() as u64);
    }

    pub fn record_atomic(&self) {
        self.atomics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_atomic(&self, latency: Duration) {
        self.atomics.fetch_add(1, Ordering::Relaxed);
        self.latency.record(latency.as_nanos() as u64);
    }

    pub fn record_barrier(&self) {
        self.barriers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_comm_failure(&self) {
        self.comm_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// The remote round-trip latency distribution
    pub fn latency_histogram(&self) -> &Histogram {
        &self.latency
    }

    /// Fold the counters into a reportable snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            local_reads: self.local_reads.load(Ordering::Relaxed),
            local_writes: self.local_writes.load(Ordering::Relaxed),
            remote_reads: self.remote_reads.load(Ordering::Relaxed),
            remote_writes: self.remote_writes.load(Ordering::Relaxed),
            atomics: self.atomics.load(Ordering::Relaxed),
            barriers: self.barriers.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            comm_failures: self.comm_failures.load(Ordering::Relaxed),
            avg_latency_us: self.latency.mean() as f64 / 1000.0,
            p50_latency_us: self.latency.p50() as f64 / 1000.0,
            p99_latency_us: self.latency.p99() as f64 / 1000.0,
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        self.local_reads.store(0, Ordering::Relaxed);
        self.local_writes.store(0, Ordering::Relaxed);
        self.remote_reads.store(0, Ordering::Relaxed);
        self.remote_writes.store(0, Ordering::Relaxed);
        self.atomics.store(0, Ordering::Relaxed);
        self.barriers.store(0, Ordering::Relaxed);
        self.bytes_transferred.store(0, Ordering::Relaxed);
        self.comm_failures.store(0, Ordering::Relaxed);
        self.latency.clear();
    }
}

/// Point-in-time view of the counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub local_reads: u64,
    pub local_writes: u64,
    pub remote_reads: u64,
    pub remote_writes: u64,
    pub atomics: u64,
    pub barriers: u64,
    pub bytes_transferred: u64,
    pub comm_failures: u64,
    pub avg_latency_us: f64,
    pub p50_latency_us: f64,
    pub p99_latency_us: f64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reads {}/{} writes {}/{} atomics {} barriers {} bytes {} failures {} avg latency {:.2} us",
            self.local_reads,
            self.remote_reads,
            self.local_writes,
            self.remote_writes,
            self.atomics,
            self.barriers,
            self.bytes_transferred,
            self.comm_failures,
            self.avg_latency_us
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RuntimeStats::new();
        stats.record_local_read();
        stats.record_local_write();
        stats.record_remote_read(64, Duration::from_micros(10));
        stats.record_remote_write(128, Duration::from_micros(30));
        stats.record_atomic();
        stats.record_barrier();

        let snap = stats.snapshot();
        assert_eq!(snap.local_reads, 1);
        assert_eq!(snap.local_writes, 1);
        assert_eq!(snap.remote_reads, 1);
        assert_eq!(snap.remote_writes, 1);
        assert_eq!(snap.atomics, 1);
        assert_eq!(snap.barriers, 1);
        assert_eq!(snap.bytes_transferred, 192);
        assert!((snap.avg_latency_us - 20.0).abs() < 0.01);
        assert!(snap.p99_latency_us >= snap.p50_latency_us);
    }

    #[test]
    fn test_reset() {
        let stats = RuntimeStats::new();
        stats.record_remote_read(64, Duration::from_micros(5));
        stats.record_comm_failure();
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.remote_reads, 0);
        assert_eq!(snap.bytes_transferred, 0);
        assert_eq!(snap.comm_failures, 0);
        assert_eq!(snap.avg_latency_us, 0.0);
    }

    #[test]
    fn test_no_latency_without_remote_ops() {
        let stats = RuntimeStats::new();
        stats.record_local_read();
        let snap = stats.snapshot();
        assert_eq!(snap.avg_latency_us, 0.0);
        assert_eq!(snap.p50_latency_us, 0.0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        let stats = Arc::new(RuntimeStats::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let stats = Arc::clone(&stats);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    stats.record_atomic();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().atomics, 4000);
    }
}
