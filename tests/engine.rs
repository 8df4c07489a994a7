//! Tests for the aggregation engine.

use std::collections::BTreeMap;

use tempfile::TempDir;
use wordflow::engine::{Aggregator, EngineConfig, ExecMode};
use wordflow::filter::FilterSpec;
use wordflow::metrics::names;
use wordflow::testing::{assert_counts, assert_monotone, records, sample_corpus, sample_corpus_counts};
use wordflow::{Record, Snapshot};

fn engine_in(dir: &TempDir, exec_mode: ExecMode) -> Aggregator {
    let config = EngineConfig {
        exec_mode,
        ..EngineConfig::with_checkpoint_dir(dir.path())
    };
    Aggregator::initialize(Vec::new(), config).unwrap()
}

#[test]
fn test_end_to_end_word_counts() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine_in(&tmp, ExecMode::Sequential);
    assert!(engine.snapshot().is_empty());

    let s1 = engine.process_batch(&records(&["hello world", "hello"]));
    assert_counts(&s1, &[("hello", 2), ("world", 1)]);

    let s2 = engine.process_batch(&records(&["world world"]));
    assert_counts(&s2, &[("hello", 2), ("world", 3)]);

    assert_counts(&FilterSpec::min_count(2).apply(&s2), &[("hello", 2), ("world", 3)]);
    assert_counts(&FilterSpec::min_count(3).apply(&s2), &[("world", 3)]);
    assert_eq!(s2.to_json().unwrap(), r#"[{"hello":2},{"world":3}]"#);
}

#[test]
fn test_counts_are_monotone_across_batches() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine_in(&tmp, ExecMode::Sequential);
    let mut previous = engine.snapshot();
    for batch in sample_corpus() {
        let next = engine.process_batch(&batch);
        assert_monotone(&previous, &next);
        assert_eq!(next.batch_id(), previous.batch_id() + 1);
        previous = next;
    }
    assert_eq!(previous.counts(), &sample_corpus_counts());
}

#[test]
fn test_parallel_matches_sequential_on_large_batch() {
    let tmp = TempDir::new().unwrap();
    let lines: Vec<String> = (0..5_000)
        .map(|i| format!("w{} w{} shared", i % 97, i % 13))
        .collect();
    let batch: Vec<Record> = lines.iter().map(|l| Record::from(l.as_str())).collect();

    let mut seq = engine_in(&tmp, ExecMode::Sequential);
    let mut par = engine_in(&tmp, ExecMode::Parallel { partitions: None });
    let a = seq.process_batch(&batch);
    let b = par.process_batch(&batch);
    assert_eq!(a, b);
    assert_eq!(b.get("shared"), Some(5_000));
}

#[test]
fn test_empty_batch_leaves_snapshot_unchanged() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine_in(&tmp, ExecMode::Sequential);
    let before = engine.process_batch(&records(&["a b a"]));
    let after = engine.process_batch(&[]);
    assert_eq!(before, after);
    assert_eq!(engine.last_stats().records, 0);
    assert_eq!(engine.metrics().counter(names::BATCHES_PROCESSED), 2);
}

#[test]
fn test_invalid_utf8_is_skipped_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let mut engine = engine_in(&tmp, ExecMode::Parallel { partitions: Some(2) });
    let mut batch = records(&["ok fine", "fine"]);
    batch.push(Record::new(vec![0xc3, 0x28]));
    let s = engine.process_batch(&batch);
    assert_counts(&s, &[("ok", 1), ("fine", 2)]);
    assert_eq!(engine.records_rejected(), 1);
    assert_eq!(engine.metrics().counter(names::RECORDS_REJECTED), 1);
    assert_eq!(engine.metrics().counter(names::TOKENS_COUNTED), 3);
}

#[test]
fn test_seed_counts_are_folded_into() {
    let tmp = TempDir::new().unwrap();
    let seed = [("hello".to_string(), 1), ("world".to_string(), 1)];
    let mut engine =
        Aggregator::initialize(seed, EngineConfig::with_checkpoint_dir(tmp.path())).unwrap();
    let s = engine.process_batch(&records(&["hello there"]));
    let expected: BTreeMap<String, u64> = [("hello", 2), ("there", 1), ("world", 1)]
        .into_iter()
        .map(|(w, c)| (w.to_string(), c))
        .collect();
    assert_eq!(s, Snapshot::from_pairs(0, expected));
}
