//! Tests for the metrics recorded while processing.

use serde_json::json;
use tempfile::TempDir;
use wordflow::engine::{Aggregator, EngineConfig};
use wordflow::metrics::{CounterMetric, GaugeMetric, HistogramMetric, Metric, MetricsCollector, names};
use wordflow::testing::records;

#[test]
fn test_histogram_metric_window() {
    let mut h = HistogramMetric::new("latency");
    for i in 0..(HistogramMetric::WINDOW + 10) {
        h.record(i as f64);
    }
    let v = h.value();
    assert_eq!(v["count"], json!(HistogramMetric::WINDOW + 10));
    assert_eq!(v["min"], json!(10.0));
}

#[test]
fn test_registered_metrics_report_descriptions() {
    let m = MetricsCollector::new();
    m.register(Box::new(CounterMetric::new("c")));
    m.register(Box::new(GaugeMetric::new("g", 1.5).with_description("a gauge")));
    let out = m.to_json();
    assert_eq!(out["c"]["value"], json!(0));
    assert_eq!(out["g"]["description"], json!("a gauge"));
    assert!(out["uptime_ms"]["value"].is_number());
}

#[test]
fn test_engine_shares_collector() {
    let tmp = TempDir::new().unwrap();
    let metrics = MetricsCollector::new();
    let mut engine = Aggregator::builder(EngineConfig::with_checkpoint_dir(tmp.path()))
        .metrics(metrics.clone())
        .initialize(Vec::new())
        .unwrap();
    engine.process_batch(&records(&["a b c", "a"]));
    engine.checkpoint().unwrap();

    assert_eq!(metrics.counter(names::RECORDS_PROCESSED), 2);
    assert_eq!(metrics.counter(names::TOKENS_COUNTED), 4);
    assert_eq!(metrics.counter(names::CHECKPOINTS_WRITTEN), 1);
    assert_eq!(metrics.snapshot()[names::DISTINCT_TOKENS], json!(3.0));
    assert_eq!(metrics.snapshot()[names::BATCH_LATENCY_MS]["count"], json!(1));
}
