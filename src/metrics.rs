//! Runtime metrics for the aggregation stream.
//!
//! A [`MetricsCollector`] is a cheap-to-clone handle onto a shared registry of named
//! [`Metric`]s. The engine and the driver record into it; [`MetricsCollector::to_json`] and
//! [`MetricsCollector::snapshot`] read it back out.
//!
//! ```
//! use wordflow::metrics::{MetricsCollector, names};
//!
//! let m = MetricsCollector::new();
//! m.increment_counter(names::RECORDS_REJECTED, 1);
//! m.increment_counter(names::RECORDS_REJECTED, 2);
//! assert_eq!(m.counter(names::RECORDS_REJECTED), 3);
//! ```

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::{Value, json};

/// Names of the metrics recorded by this crate.
pub mod names {
    pub const RECORDS_PROCESSED: &str = "records_processed";
    pub const RECORDS_REJECTED: &str = "records_rejected";
    pub const TOKENS_COUNTED: &str = "tokens_counted";
    pub const BATCHES_PROCESSED: &str = "batches_processed";
    pub const DISTINCT_TOKENS: &str = "distinct_tokens";
    pub const BATCH_LATENCY_MS: &str = "batch_latency_ms";
    pub const CHECKPOINTS_WRITTEN: &str = "checkpoints_written";
    pub const CHECKPOINT_FAILURES: &str = "checkpoint_failures";
    pub const EMISSIONS: &str = "emissions";
    pub const EMIT_FAILURES: &str = "emit_failures";
}

/// A named, JSON-reportable measurement.
pub trait Metric: Send + Sync + Any {
    fn name(&self) -> &str;

    fn value(&self) -> Value;

    fn description(&self) -> Option<&str> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shared metric registry.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    metrics: BTreeMap<String, Box<dyn Metric>>,
    started: Instant,
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                metrics: BTreeMap::new(),
                started: Instant::now(),
            })),
        }
    }

    // Updates are single assignments, so a poisoned registry is still consistent.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a metric, replacing any metric with the same name.
    pub fn register(&self, metric: Box<dyn Metric>) {
        self.lock().metrics.insert(metric.name().to_string(), metric);
    }

    /// Add `by` to a counter, creating it at zero first if needed.
    pub fn increment_counter(&self, name: &str, by: u64) {
        let mut inner = self.lock();
        let metric = inner
            .metrics
            .entry(name.to_string())
            .or_insert_with(|| Box::new(CounterMetric::new(name)) as Box<dyn Metric>);
        if let Some(c) = metric.as_any_mut().downcast_mut::<CounterMetric>() {
            c.count = c.count.saturating_add(by);
        }
    }

    /// Current value of a counter, 0 when absent or not a counter.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.lock()
            .metrics
            .get(name)
            .and_then(|m| m.as_any().downcast_ref::<CounterMetric>())
            .map_or(0, |c| c.count)
    }

    /// Set a gauge, creating it if needed.
    pub fn set_gauge(&self, name: &str, value: f64) {
        let mut inner = self.lock();
        let metric = inner
            .metrics
            .entry(name.to_string())
            .or_insert_with(|| Box::new(GaugeMetric::new(name, value)) as Box<dyn Metric>);
        if let Some(g) = metric.as_any_mut().downcast_mut::<GaugeMetric>() {
            g.value = value;
        }
    }

    /// Record one observation into a histogram, creating it if needed.
    pub fn observe(&self, name: &str, value: f64) {
        let mut inner = self.lock();
        let metric = inner
            .metrics
            .entry(name.to_string())
            .or_insert_with(|| Box::new(HistogramMetric::new(name)) as Box<dyn Metric>);
        if let Some(h) = metric.as_any_mut().downcast_mut::<HistogramMetric>() {
            h.record(value);
        }
    }

    /// All metrics by name with their current values.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.lock()
            .metrics
            .iter()
            .map(|(name, m)| (name.clone(), m.value()))
            .collect()
    }

    /// All metrics with descriptions, plus `uptime_ms`.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let inner = self.lock();
        let mut out = serde_json::Map::new();
        for (name, m) in &inner.metrics {
            let mut obj = serde_json::Map::new();
            obj.insert("value".into(), m.value());
            if let Some(d) = m.description() {
                obj.insert("description".into(), json!(d));
            }
            out.insert(name.clone(), Value::Object(obj));
        }
        out.insert(
            "uptime_ms".into(),
            json!({ "value": inner.started.elapsed().as_millis() }),
        );
        Value::Object(out)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter.
pub struct CounterMetric {
    name: String,
    count: u64,
}

impl CounterMetric {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: 0,
        }
    }
}

impl Metric for CounterMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.count)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Last-written value.
pub struct GaugeMetric {
    name: String,
    value: f64,
    description: Option<String>,
}

impl GaugeMetric {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            description: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Metric for GaugeMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.value)
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Keeps the most recent observations and reports summary statistics over them.
pub struct HistogramMetric {
    name: String,
    values: VecDeque<f64>,
    total_count: u64,
}

impl HistogramMetric {
    /// Observations retained for percentiles; older ones are dropped.
    pub const WINDOW: usize = 1024;

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: VecDeque::with_capacity(Self::WINDOW),
            total_count: 0,
        }
    }

    pub fn record(&mut self, value: f64) {
        if self.values.len() == Self::WINDOW {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.total_count += 1;
    }
}

impl Metric for HistogramMetric {
    fn name(&self) -> &str {
        &self.name
    }

    #[allow(clippy::cast_precision_loss)]
    fn value(&self) -> Value {
        if self.values.is_empty() {
            return json!({ "count": 0 });
        }
        let mut sorted: Vec<f64> = self.values.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let pct = |p: usize| sorted[((n - 1) * p) / 100];
        json!({
            "count": self.total_count,
            "mean": sorted.iter().sum::<f64>() / n as f64,
            "min": sorted[0],
            "max": sorted[n - 1],
            "p50": pct(50),
            "p99": pct(99),
        })
    }

    fn description(&self) -> Option<&str> {
        Some("over the most recent observations")
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_registry() {
        let a = MetricsCollector::new();
        let b = a.clone();
        b.increment_counter("x", 4);
        assert_eq!(a.counter("x"), 4);
    }

    #[test]
    fn gauge_overwrites() {
        let m = MetricsCollector::new();
        m.set_gauge(names::DISTINCT_TOKENS, 3.0);
        m.set_gauge(names::DISTINCT_TOKENS, 5.0);
        assert_eq!(m.snapshot()[names::DISTINCT_TOKENS], json!(5.0));
    }

    #[test]
    fn histogram_summarises() {
        let m = MetricsCollector::new();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            m.observe(names::BATCH_LATENCY_MS, v);
        }
        let h = &m.snapshot()[names::BATCH_LATENCY_MS];
        assert_eq!(h["count"], json!(5));
        assert_eq!(h["mean"], json!(3.0));
        assert_eq!(h["p50"], json!(3.0));
    }

    #[test]
    fn histogram_window_keeps_the_newest_values() {
        let mut h = HistogramMetric::new("h");
        for i in 0..(3 * HistogramMetric::WINDOW) {
            h.record(i as f64);
        }
        assert_eq!(h.values.len(), HistogramMetric::WINDOW);
        assert_eq!(h.values.front().copied(), Some((2 * HistogramMetric::WINDOW) as f64));
        let v = h.value();
        assert_eq!(v["count"], json!(3 * HistogramMetric::WINDOW));
        assert_eq!(v["max"], json!((3 * HistogramMetric::WINDOW - 1) as f64));
    }

    #[test]
    fn counter_lookup_of_wrong_kind_is_zero() {
        let m = MetricsCollector::new();
        m.register(Box::new(GaugeMetric::new("g", 1.0).with_description("a gauge")));
        m.increment_counter("g", 1);
        assert_eq!(m.counter("g"), 0);
        assert_eq!(m.to_json()["g"]["description"], json!("a gauge"));
    }
}
