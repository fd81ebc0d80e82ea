//! Engine metrics
//!
//! Lock-free counters shared by the consumption loop and every partition
//! worker, plus a bounded latency sample for batch application. `export()`
//! yields a sorted map suitable for Prometheus-style exposition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub struct EngineMetrics {
    // Intake
    pub events_received: AtomicU64,
    pub events_accepted: AtomicU64,
    pub events_rejected: AtomicU64,
    pub source_errors: AtomicU64,

    // Partition workers
    pub events_replayed: AtomicU64,
    pub events_dropped_halted: AtomicU64,
    pub reconciliation_gaps: AtomicU64,

    // Batches
    pub batches_committed: AtomicU64,
    pub batches_dead: AtomicU64,
    pub batch_retries: AtomicU64,
    pub deltas_applied: AtomicU64,
    pub deltas_skipped: AtomicU64,
    pub batch_apply_us: Mutex<LatencyTracker>,

    // Failures outside the store
    pub checkpoint_failures: AtomicU64,
    pub log_failures: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_accepted: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            source_errors: AtomicU64::new(0),
            events_replayed: AtomicU64::new(0),
            events_dropped_halted: AtomicU64::new(0),
            reconciliation_gaps: AtomicU64::new(0),
            batches_committed: AtomicU64::new(0),
            batches_dead: AtomicU64::new(0),
            batch_retries: AtomicU64::new(0),
            deltas_applied: AtomicU64::new(0),
            deltas_skipped: AtomicU64::new(0),
            batch_apply_us: Mutex::new(LatencyTracker::new(1000)),
            checkpoint_failures: AtomicU64::new(0),
            log_failures: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one committed batch.
    pub fn record_commit(&self, applied: u64, skipped: u64, apply_us: u64) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.deltas_applied.fetch_add(applied, Ordering::Relaxed);
        self.deltas_skipped.fetch_add(skipped, Ordering::Relaxed);
        if let Ok(mut tracker) = self.batch_apply_us.lock() {
            tracker.record(apply_us);
        }
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters: [(&str, &AtomicU64); 14] = [
            ("events_received", &self.events_received),
            ("events_accepted", &self.events_accepted),
            ("events_rejected", &self.events_rejected),
            ("source_errors", &self.source_errors),
            ("events_replayed", &self.events_replayed),
            ("events_dropped_halted", &self.events_dropped_halted),
            ("reconciliation_gaps", &self.reconciliation_gaps),
            ("batches_committed", &self.batches_committed),
            ("batches_dead", &self.batches_dead),
            ("batch_retries", &self.batch_retries),
            ("deltas_applied", &self.deltas_applied),
            ("deltas_skipped", &self.deltas_skipped),
            ("checkpoint_failures", &self.checkpoint_failures),
            ("log_failures", &self.log_failures),
        ];
        let mut m: BTreeMap<String, u64> = counters
            .iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect();
        if let Ok(tracker) = self.batch_apply_us.lock() {
            m.insert("batch_apply_samples".to_string(), tracker.len() as u64);
            for p in [50, 99] {
                if let Some(v) = tracker.percentile(p) {
                    m.insert(format!("batch_apply_us_p{}", p), v);
                }
            }
        }
        m
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded window of latency samples.
pub struct LatencyTracker {
    samples: Vec<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Percentile (0-100) of the current window.
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_export() {
        let metrics = EngineMetrics::new();
        EngineMetrics::incr(&metrics.events_received);
        EngineMetrics::incr(&metrics.events_received);
        EngineMetrics::incr(&metrics.events_rejected);
        metrics.record_commit(5, 2, 120);

        let m = metrics.export();
        assert_eq!(m["events_received"], 2);
        assert_eq!(m["events_rejected"], 1);
        assert_eq!(m["batches_committed"], 1);
        assert_eq!(m["deltas_applied"], 5);
        assert_eq!(m["deltas_skipped"], 2);
        assert_eq!(m["batch_apply_samples"], 1);
        assert_eq!(m["batch_apply_us_p99"], 120);
    }

    #[test]
    fn test_latency_tracker_window() {
        let mut tracker = LatencyTracker::new(3);
        assert_eq!(tracker.percentile(50), None);
        for v in [10, 20, 30, 40] {
            tracker.record(v);
        }
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.percentile(0), Some(20));
        assert_eq!(tracker.percentile(100), Some(40));
    }
}
