//! Tests for checkpointing and recovery.

use std::fs;

use tempfile::TempDir;
use wordflow::checkpoint::{CheckpointConfig, CheckpointPolicy, CheckpointStore};
use wordflow::engine::{Aggregator, EngineConfig, ExecMode, Restored};
use wordflow::testing::{records, records_at, sample_corpus};
use wordflow::{CheckpointError, RecordOrigin};

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        exec_mode: ExecMode::Sequential,
        checkpoint: CheckpointConfig {
            directory: dir.path().to_path_buf(),
            policy: CheckpointPolicy::EveryNBatches(1),
            stream_id: "words".into(),
            ..Default::default()
        },
    }
}

#[test]
fn test_restart_is_idempotent() {
    let corpus = sample_corpus();
    for split in 0..=corpus.len() {
        let uninterrupted_dir = TempDir::new().unwrap();
        let mut uninterrupted = Aggregator::initialize(Vec::new(), config(&uninterrupted_dir)).unwrap();
        for batch in &corpus {
            uninterrupted.process_batch(batch);
        }

        let dir = TempDir::new().unwrap();
        {
            let mut first = Aggregator::initialize(Vec::new(), config(&dir)).unwrap();
            for batch in &corpus[..split] {
                first.process_batch(batch);
            }
            first.checkpoint().unwrap();
        }
        let mut resumed = Aggregator::initialize(Vec::new(), config(&dir)).unwrap();
        for batch in &corpus[split..] {
            resumed.process_batch(batch);
        }

        assert_eq!(resumed.snapshot(), uninterrupted.snapshot(), "split at {split}");
        assert_eq!(resumed.batch_id(), uninterrupted.batch_id());
    }
}

#[test]
fn test_checkpoint_records_source_positions() {
    let dir = TempDir::new().unwrap();
    {
        let mut engine = Aggregator::initialize(Vec::new(), config(&dir)).unwrap();
        engine.process_batch(&records_at("lines", 0, &["a b", "c"]));
        engine.process_batch(&records_at("lines", 2, &["d"]));
        assert!(engine.maybe_checkpoint().unwrap());
    }
    let store = CheckpointStore::new(config(&dir).checkpoint).unwrap();
    let body = store.load_latest().unwrap().unwrap().body;
    assert_eq!(body.batch_id, 2);
    assert_eq!(body.records_processed, 3);
    assert_eq!(
        body.positions,
        vec![RecordOrigin {
            topic: "lines".into(),
            partition: 0,
            offset: 2
        }]
    );
}

#[test]
fn test_corrupt_checkpoint_is_fatal() {
    let dir = TempDir::new().unwrap();
    {
        let mut engine = Aggregator::initialize(Vec::new(), config(&dir)).unwrap();
        engine.process_batch(&records(&["hello world"]));
        engine.checkpoint().unwrap();
    }
    let path = dir.path().join("words.ckpt");
    let mut bytes = fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x5a;
    fs::write(&path, bytes).unwrap();

    let seed = vec![("hello".to_string(), 1)];
    let err = Aggregator::initialize(seed, config(&dir)).err().unwrap();
    assert!(err.downcast_ref::<CheckpointError>().unwrap().is_corrupt());
    assert!(format!("{err:#}").contains("words.ckpt"));
}

#[test]
fn test_truncated_checkpoint_is_fatal() {
    let dir = TempDir::new().unwrap();
    {
        let mut engine = Aggregator::initialize(Vec::new(), config(&dir)).unwrap();
        engine.process_batch(&records(&["hello world"]));
        engine.checkpoint().unwrap();
    }
    let path = dir.path().join("words.ckpt");
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 3]).unwrap();
    assert!(Aggregator::initialize(Vec::new(), config(&dir)).is_err());
}

#[test]
fn test_interrupted_write_keeps_previous_checkpoint() {
    let dir = TempDir::new().unwrap();
    {
        let mut engine = Aggregator::initialize(Vec::new(), config(&dir)).unwrap();
        engine.process_batch(&records(&["kept"]));
        engine.checkpoint().unwrap();
    }
    fs::write(dir.path().join("words.ckpt.tmp"), b"partial garbage").unwrap();

    let engine = Aggregator::initialize(Vec::new(), config(&dir)).unwrap();
    assert_eq!(engine.restored(), Restored::Checkpoint { batch_id: 1 });
    assert_eq!(engine.snapshot().get("kept"), Some(1));
    assert!(!dir.path().join("words.ckpt.tmp").exists());
}

#[test]
fn test_disabled_checkpointing_starts_from_seed_every_time() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(&dir);
    cfg.checkpoint.enabled = false;
    {
        let mut engine = Aggregator::initialize(Vec::new(), cfg.clone()).unwrap();
        engine.process_batch(&records(&["x"]));
        engine.checkpoint().unwrap();
        assert!(engine.checkpoint_path().is_none());
    }
    let engine = Aggregator::initialize(Vec::new(), cfg).unwrap();
    assert_eq!(engine.restored(), Restored::Seed);
    assert!(engine.snapshot().is_empty());
}
