//! Process-wide metrics registry.
//!
//! Counters, gauges, and histograms live behind one mutex and are injected
//! by value (via `Arc`) into each component. Best-effort paths (access
//! tracking, classification feedback, cache invalidation) count their
//! swallowed failures here instead of surfacing them.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A fixed-boundary histogram.
#[derive(Debug, Clone, Serialize)]
pub struct Histogram {
    pub boundaries: Vec<f64>,
    /// One bucket per boundary plus an overflow bucket
    pub counts: Vec<u64>,
    pub sum: f64,
    pub total: u64,
}

impl Histogram {
    fn new(boundaries: Vec<f64>) -> Self {
        let buckets = boundaries.len() + 1;
        Self {
            boundaries,
            counts: vec![0; buckets],
            sum: 0.0,
            total: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.boundaries.len());
        self.counts[idx] += 1;
        self.sum += value;
        self.total += 1;
    }

    /// Mean of observed values, or 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.sum / self.total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    histograms: HashMap<String, Histogram>,
}

/// Point-in-time snapshot of every metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, Histogram>,
}

/// Shared metrics registry.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<Mutex<Inner>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by 1.
    pub fn incr(&self, name: &str) {
        self.incr_by(name, 1);
    }

    /// Increment a counter by `delta`.
    pub fn incr_by(&self, name: &str, delta: u64) {
        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        *inner.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Set a gauge to an absolute value.
    pub fn gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        inner.gauges.insert(name.to_string(), value);
    }

    /// Record a histogram observation with default latency boundaries (ms).
    pub fn observe(&self, name: &str, value: f64) {
        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        inner
            .histograms
            .entry(name.to_string())
            .or_insert_with(|| {
                Histogram::new(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1_000.0, 5_000.0])
            })
            .observe(value);
    }

    /// Current value of a counter (0 if never incremented).
    pub fn counter(&self, name: &str) -> u64 {
        let inner = self.inner.lock().expect("metrics mutex poisoned");
        inner.counters.get(name).copied().unwrap_or(0)
    }

    /// Export everything.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().expect("metrics mutex poisoned");
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            histograms: inner.histograms.clone(),
        }
    }

    /// Clear every metric. Test hook.
    pub fn reset_for_tests(&self) {
        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        *inner = Inner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.incr("writes");
        metrics.incr_by("writes", 4);
        assert_eq!(metrics.counter("writes"), 5);
        assert_eq!(metrics.counter("missing"), 0);
    }

    #[test]
    fn test_histogram_buckets() {
        let metrics = Metrics::new();
        metrics.observe("latency_ms", 3.0);
        metrics.observe("latency_ms", 250.0);
        metrics.observe("latency_ms", 9_000.0);

        let snap = metrics.snapshot();
        let hist = snap.histograms.get("latency_ms").unwrap();
        assert_eq!(hist.total, 3);
        // 9000 lands in the overflow bucket
        assert_eq!(*hist.counts.last().unwrap(), 1);
        assert!((hist.mean() - 3084.333).abs() < 0.01);
    }

    #[test]
    fn test_reset() {
        let metrics = Metrics::new();
        metrics.incr("x");
        metrics.gauge("g", 1.5);
        metrics.reset_for_tests();
        assert_eq!(metrics.counter("x"), 0);
        assert!(metrics.snapshot().gauges.is_empty());
    }
}
