use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const DEFAULT_MAX_SAMPLES: usize = 10_000;

/// Sliding-window reservoir of command latencies.
///
/// Keeps the most recent `max_samples` observations; percentile queries sort
/// a copy so recording stays cheap on the hot path.
#[derive(Debug)]
pub struct LatencySampler {
    max_samples: usize,
    samples: Mutex<VecDeque<f64>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl LatencySampler {
    pub fn new(max_samples: usize) -> Self {
        LatencySampler {
            max_samples,
            samples: Mutex::new(VecDeque::with_capacity(max_samples)),
        }
    }

    /// Records one latency observation, in microseconds.
    pub fn record(&self, latency: Duration) {
        let micros = latency.as_secs_f64() * 1_000_000.0;
        let mut samples = self.samples.lock();
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(micros);
    }

    pub fn percentiles(&self) -> Percentiles {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return Percentiles::default();
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        drop(samples);
        sorted.sort_by(|a, b| a.total_cmp(b));
        let at = |p: f64| sorted[(p * (sorted.len() - 1) as f64) as usize];
        Percentiles {
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

impl Default for LatencySampler {
    fn default() -> Self {
        LatencySampler::new(DEFAULT_MAX_SAMPLES)
    }
}

/// Point-in-time copy of every counter and gauge, shaped for the metrics
/// HTTP exposition.
#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    pub get_count: u64,
    pub put_count: u64,
    pub del_count: u64,
    pub batch_count: u64,
    pub eviction_count: u64,
    pub memory_bytes: u64,
    pub wal_bytes: u64,
    pub snapshot_duration_ms: u64,
    pub replication_lag: u64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

/// Lock-free counters and gauges shared by every component.
#[derive(Debug, Default)]
pub struct Metrics {
    get_count: AtomicU64,
    put_count: AtomicU64,
    del_count: AtomicU64,
    batch_count: AtomicU64,
    eviction_count: AtomicU64,
    memory_bytes: AtomicU64,
    wal_bytes: AtomicU64,
    snapshot_duration_ms: AtomicU64,
    replication_lag: AtomicU64,
    latency: LatencySampler,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_get(&self) {
        self.get_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.put_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_del(&self) {
        self.del_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batch_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.eviction_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, latency: Duration) {
        self.latency.record(latency);
    }

    pub fn set_memory_bytes(&self, bytes: u64) {
        self.memory_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn set_wal_bytes(&self, bytes: u64) {
        self.wal_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn set_snapshot_duration(&self, ms: u64) {
        self.snapshot_duration_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_replication_lag(&self, lag: u64) {
        self.replication_lag.store(lag, Ordering::Relaxed);
    }

    pub fn eviction_count(&self) -> u64 {
        self.eviction_count.load(Ordering::Relaxed)
    }

    pub fn replication_lag(&self) -> u64 {
        self.replication_lag.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let percentiles = self.latency.percentiles();
        MetricsSnapshot {
            get_count: self.get_count.load(Ordering::Relaxed),
            put_count: self.put_count.load(Ordering::Relaxed),
            del_count: self.del_count.load(Ordering::Relaxed),
            batch_count: self.batch_count.load(Ordering::Relaxed),
            eviction_count: self.eviction_count.load(Ordering::Relaxed),
            memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
            wal_bytes: self.wal_bytes.load(Ordering::Relaxed),
            snapshot_duration_ms: self.snapshot_duration_ms.load(Ordering::Relaxed),
            replication_lag: self.replication_lag.load(Ordering::Relaxed),
            p50_us: percentiles.p50,
            p95_us: percentiles.p95,
            p99_us: percentiles.p99,
        }
    }
}
