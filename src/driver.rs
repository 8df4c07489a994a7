//! Fixed-tick scheduling of the aggregator.
//!
//! The driver owns the [`Aggregator`] and the emitter. Records arrive on a bounded channel and
//! are buffered; on every tick the buffer becomes one batch, the resulting snapshot is filtered
//! and emitted, and the checkpoint policy is consulted. Ticks fire whether or not records arrived,
//! so an idle stream still emits its unchanged snapshot.
//!
//! When the source closes or `shutdown` resolves, the records already buffered are processed as a
//! final batch and a final checkpoint is attempted.
//!
//! Acknowledged positions never pass a record the source has handed out but the driver has not
//! yet processed; see [`InFlight`].

use std::future::Future;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::config::DriverConfig;
use crate::emit::Emitter;
use crate::engine::Aggregator;
use crate::filter::FilterSpec;
use crate::metrics::names;
use crate::record::Record;
use crate::snapshot::Snapshot;
use crate::source::{Acknowledger, InFlight, NoAck};

/// What a finished [`StreamDriver::run`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriverReport {
    /// Batches processed, including the final one.
    pub batches: u64,
    pub records: u64,
    pub emissions: u64,
    pub emit_failures: u64,
    /// Ticks where nothing changed and `emit_unchanged` was off.
    pub skipped_emissions: u64,
    pub checkpoints: u64,
    pub checkpoint_failures: u64,
    /// Whether the shutdown checkpoint was written.
    pub final_checkpoint: bool,
    pub last_batch_id: u64,
}

/// Ends a run.
enum Stop {
    SourceClosed,
    Shutdown,
}

pub struct StreamDriver {
    engine: Aggregator,
    emitter: Box<dyn Emitter>,
    filter: FilterSpec,
    config: DriverConfig,
    ack: Box<dyn Acknowledger>,
    in_flight: InFlight,
    last_state: Option<Snapshot>,
    report: DriverReport,
}

impl StreamDriver {
    /// # Errors
    /// Returns an error if `config` is invalid (zero tick interval or zero buffer sizes).
    pub fn new(engine: Aggregator, emitter: impl Emitter + 'static, config: DriverConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            emitter: Box::new(emitter),
            filter: FilterSpec::default(),
            config,
            ack: Box::new(NoAck),
            in_flight: InFlight::new(),
            last_state: None,
            report: DriverReport::default(),
        })
    }

    #[must_use]
    pub fn filter(mut self, filter: FilterSpec) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn acknowledger(mut self, ack: impl Acknowledger + 'static) -> Self {
        self.ack = Box::new(ack);
        self
    }

    /// Share the in-flight ledger of the source feeding this driver.
    #[must_use]
    pub fn in_flight(mut self, in_flight: InFlight) -> Self {
        self.in_flight = in_flight;
        self
    }

    #[must_use]
    pub fn engine(&self) -> &Aggregator {
        &self.engine
    }

    /// Hand the engine back, e.g. to inspect or reset it after a run.
    #[must_use]
    pub fn into_engine(self) -> Aggregator {
        self.engine
    }

    /// Run until every sender of `rx` is dropped.
    pub async fn run_until_closed(&mut self, rx: mpsc::Receiver<Record>) -> DriverReport {
        self.run(rx, std::future::pending()).await
    }

    /// Run until the source closes or `shutdown` resolves, whichever comes first.
    pub async fn run(
        &mut self,
        mut rx: mpsc::Receiver<Record>,
        shutdown: impl Future<Output = ()>,
    ) -> DriverReport {
        let period = self.config.tick_interval();
        let max_batch = self.config.max_batch_records.max(1);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer: Vec<Record> = Vec::new();
        tokio::pin!(shutdown);

        log::info!(
            "driver started: tick={}ms max_batch={} tokenizer={}",
            period.as_millis(),
            max_batch,
            self.engine.tokenizer_name()
        );

        let stop = loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break Stop::Shutdown,
                _ = ticker.tick() => {
                    let batch = std::mem::take(&mut buffer);
                    self.tick(&batch);
                }
                rec = rx.recv(), if buffer.len() < max_batch => match rec {
                    Some(r) => buffer.push(r),
                    None => break Stop::SourceClosed,
                },
            }
        };

        if let Stop::Shutdown = stop {
            log::info!("shutdown requested; draining buffered records");
            while buffer.len() < max_batch {
                match rx.try_recv() {
                    Ok(r) => buffer.push(r),
                    Err(_) => break,
                }
            }
        } else {
            log::info!("source closed");
        }
        self.finish(&buffer);
        self.report.clone()
    }

    fn tick(&mut self, batch: &[Record]) {
        let snapshot = self.process(batch);
        self.emit(snapshot);
        match self.engine.maybe_checkpoint() {
            Ok(true) => {
                self.report.checkpoints += 1;
                self.acknowledge();
            }
            Ok(false) => {}
            Err(e) => {
                self.report.checkpoint_failures += 1;
                log::error!("{e:#}; retrying at the next checkpoint interval");
            }
        }
    }

    fn process(&mut self, batch: &[Record]) -> Snapshot {
        let snapshot = self.engine.process_batch(batch);
        self.in_flight.finish(batch.iter().filter_map(|r| r.origin.as_ref()));
        self.report.batches += 1;
        self.report.records += batch.len() as u64;
        self.report.last_batch_id = snapshot.batch_id();
        snapshot
    }

    fn emit(&mut self, snapshot: Snapshot) {
        let unchanged = self
            .last_state
            .as_ref()
            .is_some_and(|prev| prev.shares_state_with(&snapshot));
        if unchanged && !self.config.emit_unchanged {
            self.report.skipped_emissions += 1;
            return;
        }
        let out = self.filter.apply(&snapshot);
        match self.emitter.publish(&out) {
            Ok(()) => {
                self.report.emissions += 1;
                self.engine.metrics().increment_counter(names::EMISSIONS, 1);
            }
            Err(e) => {
                self.report.emit_failures += 1;
                self.engine.metrics().increment_counter(names::EMIT_FAILURES, 1);
                log::warn!(
                    "emit of batch {} via '{}' failed: {e}",
                    out.batch_id(),
                    self.emitter.name()
                );
            }
        }
        self.last_state = Some(snapshot);
    }

    fn acknowledge(&mut self) {
        let positions = self.in_flight.settle(self.engine.positions());
        if let Err(e) = self.ack.acknowledge(&positions) {
            log::warn!("acknowledging source positions failed: {e:#}");
        }
    }

    fn finish(&mut self, buffer: &[Record]) {
        if !buffer.is_empty() {
            let snapshot = self.process(buffer);
            self.emit(snapshot);
        }
        match self.engine.checkpoint() {
            Ok(()) => {
                self.report.final_checkpoint = self.engine.checkpoint_path().is_some();
                if self.report.final_checkpoint {
                    self.acknowledge();
                    log::info!("final checkpoint at batch {}", self.engine.batch_id());
                }
            }
            Err(e) => {
                self.report.checkpoint_failures += 1;
                log::error!("final checkpoint failed: {e:#}");
            }
        }
        if let Err(e) = self.emitter.flush() {
            log::warn!("flushing emitter '{}' failed: {e}", self.emitter.name());
        }
        log::info!("stream metrics: {}", self.engine.metrics().to_json());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::MemoryEmitter;
    use crate::engine::{EngineConfig, ExecMode};
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> Aggregator {
        let config = EngineConfig {
            exec_mode: ExecMode::Sequential,
            ..EngineConfig::with_checkpoint_dir(dir.path())
        };
        Aggregator::initialize(Vec::new(), config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn idle_ticks_still_emit() {
        let tmp = TempDir::new().unwrap();
        let mem = MemoryEmitter::new();
        let mut driver = StreamDriver::new(engine(&tmp), mem.clone(), DriverConfig::default()).unwrap();
        let (_tx, rx) = mpsc::channel::<Record>(4);

        let report = driver
            .run(rx, tokio::time::sleep(Duration::from_millis(3500)))
            .await;
        assert_eq!(report.emissions, 3);
        assert_eq!(report.batches, 3);
        assert!(mem.published().iter().all(Snapshot::is_empty));
        assert!(report.final_checkpoint);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_emissions_can_be_skipped() {
        let tmp = TempDir::new().unwrap();
        let mem = MemoryEmitter::new();
        let config = DriverConfig {
            emit_unchanged: false,
            ..Default::default()
        };
        let mut driver = StreamDriver::new(engine(&tmp), mem.clone(), config).unwrap();
        let (_tx, rx) = mpsc::channel::<Record>(4);

        let report = driver
            .run(rx, tokio::time::sleep(Duration::from_millis(3500)))
            .await;
        assert_eq!(report.emissions, 1);
        assert_eq!(report.skipped_emissions, 2);
    }

    #[test]
    fn zero_tick_interval_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = DriverConfig {
            tick_interval_ms: 0,
            ..Default::default()
        };
        let err = StreamDriver::new(engine(&tmp), MemoryEmitter::new(), config)
            .err()
            .unwrap();
        assert!(err.to_string().contains("tick"), "{err}");
    }
}
