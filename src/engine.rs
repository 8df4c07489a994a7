//! The aggregation engine: micro-batch in, full snapshot out.
//!
//! [`Aggregator`] owns the [`StateStore`] and the [`CheckpointStore`]. Because both
//! [`Aggregator::process_batch`] and [`Aggregator::checkpoint`] take `&mut self`, a checkpoint can
//! only ever observe state at a batch boundary.
//!
//! ```no_run
//! use wordflow::engine::{Aggregator, EngineConfig};
//! use wordflow::Record;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut engine = Aggregator::initialize(Vec::new(), EngineConfig::default())?;
//! let snapshot = engine.process_batch(&[Record::from("hello world"), Record::from("hello")]);
//! assert_eq!(snapshot.get("hello"), Some(2));
//! engine.checkpoint()?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{
    CheckpointBody, CheckpointConfig, CheckpointStore, FORMAT_VERSION, current_timestamp_ms,
};
use crate::errors::TokenizeError;
use crate::metrics::{MetricsCollector, names};
use crate::record::{Record, RecordOrigin};
use crate::snapshot::Snapshot;
use crate::state::{RunningSum, StateStore, UpdateFn};
use crate::tokenizer::{Tokenizer, WhitespaceTokenizer};

/// How a batch is tokenized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    Sequential,
    /// Tokenize partitions of the batch on the rayon pool, then merge the partial counts.
    /// `None` picks `2 * num_cpus`.
    Parallel { partitions: Option<usize> },
}

impl Default for ExecMode {
    fn default() -> Self {
        Self::Parallel { partitions: None }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub exec_mode: ExecMode,
    pub checkpoint: CheckpointConfig,
}

impl EngineConfig {
    /// Default engine checkpointing into `dir`.
    pub fn with_checkpoint_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            checkpoint: CheckpointConfig {
                directory: dir.as_ref().to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Where the engine's initial state came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Restored {
    Seed,
    Checkpoint { batch_id: u64 },
}

/// Per-batch bookkeeping of the most recent [`Aggregator::process_batch`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub batch_id: u64,
    pub records: usize,
    pub rejected: usize,
    pub tokens: u64,
    pub new_words: usize,
}

/// A record the tokenizer refused, as reported in [`Aggregator::last_rejections`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub record: String,
    pub error: TokenizeError,
}

/// Builder for [`Aggregator`] when the defaults (whitespace tokenizer, running sum) don't fit.
pub struct AggregatorBuilder {
    config: EngineConfig,
    tokenizer: Arc<dyn Tokenizer>,
    update: Arc<dyn UpdateFn>,
    metrics: MetricsCollector,
}

impl AggregatorBuilder {
    #[must_use]
    pub fn tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    #[must_use]
    pub fn update_fn(mut self, update: impl UpdateFn + 'static) -> Self {
        self.update = Arc::new(update);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    /// Restore from the latest checkpoint, or start from `seed` when there is none.
    ///
    /// # Errors
    /// Fails when the checkpoint directory cannot be prepared or read, and with
    /// [`CheckpointError::Corrupt`](crate::errors::CheckpointError::Corrupt) when a checkpoint
    /// exists but cannot be decoded. The seed is never used as a fallback for a bad checkpoint.
    pub fn initialize(self, seed: impl IntoIterator<Item = (String, u64)>) -> Result<Aggregator> {
        let checkpoints = CheckpointStore::new(self.config.checkpoint.clone())?;
        let loaded = checkpoints
            .load_latest()
            .with_context(|| format!("restore aggregation state from {}", checkpoints.path().display()))?;

        let mut engine = Aggregator {
            state: StateStore::new(),
            tokenizer: self.tokenizer,
            update: self.update,
            checkpoints,
            exec_mode: self.config.exec_mode,
            metrics: self.metrics,
            batch_id: 0,
            last_checkpointed: None,
            records_processed: 0,
            records_rejected: 0,
            positions: BTreeMap::new(),
            restored: Restored::Seed,
            last_stats: BatchStats::default(),
            last_rejections: Vec::new(),
        };

        match loaded {
            Some(ckpt) => {
                let body = ckpt.body;
                log::info!(
                    "restored {} words at batch {} from {}",
                    body.counts.len(),
                    body.batch_id,
                    engine.checkpoints.path().display()
                );
                engine.state = StateStore::from_counts(body.counts);
                engine.batch_id = body.batch_id;
                engine.last_checkpointed = Some(body.batch_id);
                engine.records_processed = body.records_processed;
                engine.records_rejected = body.records_rejected;
                engine.positions = body
                    .positions
                    .into_iter()
                    .map(|p| ((p.topic, p.partition), p.offset))
                    .collect();
                engine.restored = Restored::Checkpoint {
                    batch_id: body.batch_id,
                };
            }
            None => {
                engine.state = StateStore::from_counts(seed);
                log::info!("no checkpoint found; starting from {} seed words", engine.state.len());
            }
        }
        engine
            .metrics
            .set_gauge(names::DISTINCT_TOKENS, engine.state.len() as f64);
        Ok(engine)
    }
}

/// Continuous word-frequency aggregator.
pub struct Aggregator {
    state: StateStore,
    tokenizer: Arc<dyn Tokenizer>,
    update: Arc<dyn UpdateFn>,
    checkpoints: CheckpointStore,
    exec_mode: ExecMode,
    metrics: MetricsCollector,
    batch_id: u64,
    last_checkpointed: Option<u64>,
    records_processed: u64,
    records_rejected: u64,
    positions: BTreeMap<(String, i32), i64>,
    restored: Restored,
    last_stats: BatchStats,
    last_rejections: Vec<Rejection>,
}

impl Aggregator {
    #[must_use]
    pub fn builder(config: EngineConfig) -> AggregatorBuilder {
        AggregatorBuilder {
            config,
            tokenizer: Arc::new(WhitespaceTokenizer::default()),
            update: Arc::new(RunningSum),
            metrics: MetricsCollector::new(),
        }
    }

    /// Restore from the checkpoint in `config`, or start from `seed`.
    ///
    /// # Errors
    /// See [`AggregatorBuilder::initialize`].
    pub fn initialize(
        seed: impl IntoIterator<Item = (String, u64)>,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::builder(config).initialize(seed)
    }

    /// Tokenize every record and fold the occurrences into the state.
    ///
    /// Records the tokenizer rejects are skipped, logged and counted under
    /// `records_rejected`. An empty batch still advances the batch id and returns the unchanged
    /// snapshot.
    pub fn process_batch(&mut self, records: &[Record]) -> Snapshot {
        let started = Instant::now();
        let tally = match self.exec_mode {
            ExecMode::Sequential => tally_seq(self.tokenizer.as_ref(), records),
            ExecMode::Parallel { partitions } => {
                let parts = partitions.unwrap_or_else(|| 2 * num_cpus::get().max(2));
                tally_par(self.tokenizer.as_ref(), records, parts)
            }
        };

        self.batch_id += 1;
        let new_words = self.state.apply(tally.counts, self.update.as_ref());
        for (key, offset) in tally.positions {
            let slot = self.positions.entry(key).or_insert(offset);
            *slot = (*slot).max(offset);
        }

        for r in &tally.rejected {
            log::warn!("skipping record {}: {}", r.record, r.error);
        }
        let rejected = tally.rejected.len();
        let accepted = records.len() - rejected;
        self.records_processed += accepted as u64;
        self.records_rejected += rejected as u64;

        self.last_stats = BatchStats {
            batch_id: self.batch_id,
            records: records.len(),
            rejected,
            tokens: tally.tokens,
            new_words,
        };
        self.last_rejections = tally.rejected;

        self.metrics.increment_counter(names::BATCHES_PROCESSED, 1);
        self.metrics
            .increment_counter(names::RECORDS_PROCESSED, accepted as u64);
        self.metrics
            .increment_counter(names::RECORDS_REJECTED, rejected as u64);
        self.metrics
            .increment_counter(names::TOKENS_COUNTED, tally.tokens);
        self.metrics
            .set_gauge(names::DISTINCT_TOKENS, self.state.len() as f64);
        self.metrics.observe(
            names::BATCH_LATENCY_MS,
            started.elapsed().as_secs_f64() * 1000.0,
        );

        self.state.snapshot(self.batch_id)
    }

    /// Durably persist the current state, replacing the previous checkpoint.
    ///
    /// No-op when checkpointing is disabled or the current batch is already checkpointed.
    ///
    /// # Errors
    /// Returns an error if the checkpoint cannot be written; the previous one stays intact.
    pub fn checkpoint(&mut self) -> Result<()> {
        if !self.checkpoints.is_enabled() || self.last_checkpointed == Some(self.batch_id) {
            return Ok(());
        }
        let body = CheckpointBody {
            format_version: FORMAT_VERSION,
            stream_id: self.checkpoints.config().stream_id.clone(),
            batch_id: self.batch_id,
            timestamp: current_timestamp_ms(),
            records_processed: self.records_processed,
            records_rejected: self.records_rejected,
            counts: self.state.counts().clone(),
            positions: self.positions(),
        };
        match self.checkpoints.save(body) {
            Ok(_) => {
                self.last_checkpointed = Some(self.batch_id);
                self.metrics.increment_counter(names::CHECKPOINTS_WRITTEN, 1);
                Ok(())
            }
            Err(e) => {
                self.metrics.increment_counter(names::CHECKPOINT_FAILURES, 1);
                Err(e.context(format!("checkpoint after batch {}", self.batch_id)))
            }
        }
    }

    /// Checkpoint if the configured policy asks for it after the latest batch.
    ///
    /// Returns whether a checkpoint was written.
    ///
    /// # Errors
    /// See [`Aggregator::checkpoint`].
    pub fn maybe_checkpoint(&mut self) -> Result<bool> {
        if self.last_checkpointed == Some(self.batch_id)
            || !self.checkpoints.should_checkpoint(self.batch_id)
        {
            return Ok(false);
        }
        self.checkpoint()?;
        Ok(true)
    }

    /// Clear all counts and delete the checkpoint.
    ///
    /// # Errors
    /// Returns an error if the checkpoint file cannot be removed.
    pub fn reset(&mut self) -> Result<()> {
        self.checkpoints.clear()?;
        self.state.clear();
        self.positions.clear();
        self.records_processed = 0;
        self.records_rejected = 0;
        self.last_checkpointed = None;
        self.metrics.set_gauge(names::DISTINCT_TOKENS, 0.0);
        log::info!("aggregation state reset at batch {}", self.batch_id);
        Ok(())
    }

    /// Snapshot of the state after the latest batch.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot(self.batch_id)
    }

    #[must_use]
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    /// Batches folded in since the last durable checkpoint. These are the ones a crash would
    /// replay.
    #[must_use]
    pub fn uncheckpointed_batches(&self) -> u64 {
        self.batch_id - self.last_checkpointed.unwrap_or(0)
    }

    #[must_use]
    pub fn restored(&self) -> Restored {
        self.restored
    }

    #[must_use]
    pub fn last_stats(&self) -> &BatchStats {
        &self.last_stats
    }

    #[must_use]
    pub fn last_rejections(&self) -> &[Rejection] {
        &self.last_rejections
    }

    #[must_use]
    pub fn records_processed(&self) -> u64 {
        self.records_processed
    }

    #[must_use]
    pub fn records_rejected(&self) -> u64 {
        self.records_rejected
    }

    /// Highest processed offset per source partition, for records that carry an origin.
    #[must_use]
    pub fn positions(&self) -> Vec<RecordOrigin> {
        self.positions
            .iter()
            .map(|((topic, partition), offset)| RecordOrigin {
                topic: topic.clone(),
                partition: *partition,
                offset: *offset,
            })
            .collect()
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    #[must_use]
    pub fn tokenizer_name(&self) -> &'static str {
        self.tokenizer.name()
    }

    #[must_use]
    pub fn checkpoint_path(&self) -> Option<std::path::PathBuf> {
        self.checkpoints.is_enabled().then(|| self.checkpoints.path())
    }
}

/* ===================== batch tallying ===================== */

#[derive(Default)]
struct Tally {
    counts: HashMap<String, u64>,
    tokens: u64,
    positions: HashMap<(String, i32), i64>,
    rejected: Vec<Rejection>,
}

impl Tally {
    fn add(&mut self, tokenizer: &dyn Tokenizer, record: &Record) {
        match tokenizer.tokenize_record(record) {
            Ok(tokens) => {
                self.tokens += tokens.len() as u64;
                for t in tokens {
                    *self.counts.entry(t).or_insert(0) += 1;
                }
            }
            Err(error) => self.rejected.push(Rejection {
                record: record.describe(),
                error,
            }),
        }
        // Rejected records still advance the position; replaying them would fail again.
        if let Some(o) = &record.origin {
            let slot = self
                .positions
                .entry((o.topic.clone(), o.partition))
                .or_insert(o.offset);
            *slot = (*slot).max(o.offset);
        }
    }

    fn merge(mut self, other: Tally) -> Tally {
        for (word, n) in other.counts {
            *self.counts.entry(word).or_insert(0) += n;
        }
        for (key, offset) in other.positions {
            let slot = self.positions.entry(key).or_insert(offset);
            *slot = (*slot).max(offset);
        }
        self.tokens += other.tokens;
        self.rejected.extend(other.rejected);
        self
    }
}

fn tally_seq(tokenizer: &dyn Tokenizer, records: &[Record]) -> Tally {
    let mut tally = Tally::default();
    for r in records {
        tally.add(tokenizer, r);
    }
    tally
}

#[cfg(feature = "parallel")]
fn tally_par(tokenizer: &dyn Tokenizer, records: &[Record], partitions: usize) -> Tally {
    use rayon::prelude::*;
    if records.len() < 2 {
        return tally_seq(tokenizer, records);
    }
    let chunk = records.len().div_ceil(partitions.max(1)).max(1);
    records
        .par_chunks(chunk)
        .map(|part| tally_seq(tokenizer, part))
        .reduce(Tally::default, Tally::merge)
}

#[cfg(not(feature = "parallel"))]
fn tally_par(tokenizer: &dyn Tokenizer, records: &[Record], _partitions: usize) -> Tally {
    tally_seq(tokenizer, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CheckpointError;
    use crate::tokenizer::AnalyzerTokenizer;
    use tempfile::TempDir;

    fn cfg(dir: &TempDir, exec_mode: ExecMode) -> EngineConfig {
        EngineConfig {
            exec_mode,
            ..EngineConfig::with_checkpoint_dir(dir.path())
        }
    }

    fn batch(lines: &[&str]) -> Vec<Record> {
        lines.iter().map(|l| Record::from(*l)).collect()
    }

    #[test]
    fn seed_is_used_without_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let seed = vec![("hello".to_string(), 1), ("world".to_string(), 1)];
        let mut e = Aggregator::initialize(seed, cfg(&tmp, ExecMode::Sequential)).unwrap();
        assert_eq!(e.restored(), Restored::Seed);
        let s = e.process_batch(&batch(&["hello"]));
        assert_eq!(s.get("hello"), Some(2));
        assert_eq!(s.get("world"), Some(1));
    }

    #[test]
    fn parallel_and_sequential_agree() {
        let tmp = TempDir::new().unwrap();
        let lines: Vec<String> = (0..200).map(|i| format!("w{} common w{}", i % 7, i % 3)).collect();
        let records: Vec<Record> = lines.iter().map(|l| Record::from(l.as_str())).collect();

        let mut seq = Aggregator::initialize(Vec::new(), cfg(&tmp, ExecMode::Sequential)).unwrap();
        let mut par = Aggregator::initialize(
            Vec::new(),
            cfg(&tmp, ExecMode::Parallel { partitions: Some(5) }),
        )
        .unwrap();
        assert_eq!(seq.process_batch(&records), par.process_batch(&records));
        assert_eq!(par.last_stats().tokens, 600);
    }

    #[test]
    fn bad_records_are_skipped_and_counted() {
        let tmp = TempDir::new().unwrap();
        let mut e = Aggregator::initialize(Vec::new(), cfg(&tmp, ExecMode::Sequential)).unwrap();
        let records = vec![
            Record::from("good words"),
            Record::new(vec![0xff, 0xfe]).with_origin("lines", 0, 7),
            Record::from("more words"),
        ];
        let s = e.process_batch(&records);
        assert_eq!(s.get("words"), Some(2));
        assert_eq!(e.last_stats().rejected, 1);
        assert_eq!(e.records_rejected(), 1);
        assert_eq!(e.records_processed(), 2);
        assert_eq!(e.last_rejections()[0].record, "lines[0]@7");
        assert_eq!(e.metrics().counter(names::RECORDS_REJECTED), 1);
    }

    #[test]
    fn empty_batch_advances_batch_id_only() {
        let tmp = TempDir::new().unwrap();
        let mut e = Aggregator::initialize(Vec::new(), cfg(&tmp, ExecMode::Sequential)).unwrap();
        let first = e.process_batch(&batch(&["a b"]));
        let second = e.process_batch(&[]);
        assert_eq!(first, second);
        assert_eq!(second.batch_id(), 2);
        assert!(first.shares_state_with(&second));
    }

    #[test]
    fn checkpoint_roundtrip_restores_counts_and_positions() {
        let tmp = TempDir::new().unwrap();
        {
            let mut e = Aggregator::initialize(Vec::new(), cfg(&tmp, ExecMode::Sequential)).unwrap();
            e.process_batch(&[
                Record::from("x y").with_origin("t", 0, 10),
                Record::from("x").with_origin("t", 0, 11),
                Record::from("z").with_origin("t", 1, 3),
            ]);
            e.checkpoint().unwrap();
            assert_eq!(e.uncheckpointed_batches(), 0);
        }
        let e = Aggregator::initialize(
            vec![("ignored".to_string(), 99)],
            cfg(&tmp, ExecMode::Sequential),
        )
        .unwrap();
        assert_eq!(e.restored(), Restored::Checkpoint { batch_id: 1 });
        assert_eq!(e.snapshot().get("x"), Some(2));
        assert_eq!(e.snapshot().get("ignored"), None);
        assert_eq!(
            e.positions(),
            vec![
                RecordOrigin { topic: "t".into(), partition: 0, offset: 11 },
                RecordOrigin { topic: "t".into(), partition: 1, offset: 3 },
            ]
        );
    }

    #[test]
    fn corrupt_checkpoint_fails_initialize() {
        let tmp = TempDir::new().unwrap();
        let config = cfg(&tmp, ExecMode::Sequential);
        let path = tmp.path().join(format!("{}.ckpt", config.checkpoint.stream_id));
        std::fs::write(&path, b"definitely not a checkpoint").unwrap();

        let err = Aggregator::initialize(Vec::new(), config).err().unwrap();
        let kind = err.downcast_ref::<CheckpointError>().unwrap();
        assert!(kind.is_corrupt());
    }

    #[test]
    fn maybe_checkpoint_follows_policy() {
        let tmp = TempDir::new().unwrap();
        let mut config = cfg(&tmp, ExecMode::Sequential);
        config.checkpoint.policy = crate::checkpoint::CheckpointPolicy::EveryNBatches(2);
        let mut e = Aggregator::initialize(Vec::new(), config).unwrap();
        e.process_batch(&batch(&["a"]));
        assert!(!e.maybe_checkpoint().unwrap());
        e.process_batch(&batch(&["a"]));
        assert!(e.maybe_checkpoint().unwrap());
        assert!(!e.maybe_checkpoint().unwrap());
        assert_eq!(e.metrics().counter(names::CHECKPOINTS_WRITTEN), 1);
    }

    #[test]
    fn reset_clears_state_and_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let mut e = Aggregator::initialize(Vec::new(), cfg(&tmp, ExecMode::Sequential)).unwrap();
        e.process_batch(&batch(&["a"]));
        e.checkpoint().unwrap();
        e.reset().unwrap();
        assert!(e.snapshot().is_empty());
        assert!(!e.checkpoint_path().unwrap().exists());
    }

    #[test]
    fn custom_tokenizer_and_update_fn() {
        let tmp = TempDir::new().unwrap();
        let mut e = Aggregator::builder(cfg(&tmp, ExecMode::Sequential))
            .tokenizer(Arc::new(AnalyzerTokenizer::english().unwrap()))
            .update_fn(|prior: Option<u64>, n: u64| prior.unwrap_or(0) + 10 * n)
            .initialize(Vec::new())
            .unwrap();
        let s = e.process_batch(&batch(&["The cat and the hat."]));
        assert_eq!(s.get("cat"), Some(10));
        assert_eq!(s.get("the"), None);
        assert_eq!(e.tokenizer_name(), "analyzer");
    }
}
