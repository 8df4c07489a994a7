//! # wordflow
//!
//! A continuous, stateful word-frequency aggregator.
//!
//! Text records stream in from a source, are grouped into fixed-interval micro-batches,
//! tokenized, and folded into a cumulative word → count state. After every batch the full state
//! is filtered and published as a JSON array of single-key objects. The state is checkpointed to
//! disk so a restart resumes where the last checkpoint left off.
//!
//! ## Pieces
//!
//! - [`tokenizer`] turns text into tokens ([`WhitespaceTokenizer`], [`AnalyzerTokenizer`]).
//! - [`engine::Aggregator`] owns the [`state::StateStore`], processes batches and writes
//!   checkpoints through [`checkpoint::CheckpointStore`].
//! - [`filter`] trims a [`Snapshot`] by minimum count, exclusions and top-K.
//! - [`emit`] publishes snapshots (console, JSON lines, channels, Kafka).
//! - [`source`] feeds records into the driver (lines, Kafka).
//! - [`driver::StreamDriver`] runs the fixed-tick loop.
//!
//! ## Quick start
//!
//! ```no_run
//! use wordflow::config::DriverConfig;
//! use wordflow::driver::StreamDriver;
//! use wordflow::emit::ConsoleEmitter;
//! use wordflow::engine::{Aggregator, EngineConfig};
//! use wordflow::source::spawn_stdin;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = Aggregator::initialize(Vec::new(), EngineConfig::default())?;
//! let (tx, rx) = tokio::sync::mpsc::channel(1024);
//! let _reader = spawn_stdin(tx);
//! let mut driver = StreamDriver::new(engine, ConsoleEmitter::stdout(), DriverConfig::default())?;
//! let report = driver.run(rx, async { tokio::signal::ctrl_c().await.ok(); }).await;
//! println!("processed {} records", report.records);
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery
//!
//! A checkpoint always reflects whole batches. Batches processed after the last checkpoint are
//! lost on a crash and replayed by sources that support it, so counts are at-least-once: a
//! replayed batch may be counted twice. Counts never decrease except through
//! [`engine::Aggregator::reset`].
//!
//! ## Features
//!
//! - `parallel` (default): tokenize large batches on the rayon pool.
//! - `kafka`: Kafka source and emitter, plus the `kafka-wordcount` binary.

pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod emit;
pub mod engine;
pub mod errors;
pub mod filter;
pub mod metrics;
pub mod record;
pub mod snapshot;
pub mod source;
pub mod state;
pub mod testing;
pub mod tokenizer;

pub use checkpoint::{CheckpointConfig, CheckpointPolicy};
pub use config::{DriverConfig, StreamConfig};
pub use driver::{DriverReport, StreamDriver};
pub use emit::{ConsoleEmitter, Emitter, FanoutEmitter, JsonlEmitter, MemoryEmitter};
pub use engine::{Aggregator, EngineConfig, ExecMode};
pub use errors::{CheckpointError, EmitError, TokenizeError};
pub use filter::FilterSpec;
pub use metrics::MetricsCollector;
pub use record::{Record, RecordOrigin};
pub use snapshot::Snapshot;
pub use source::{Acknowledger, InFlight};
pub use state::{RunningSum, StateStore, UpdateFn};
pub use tokenizer::{AnalyzerTokenizer, Tokenizer, TokenizerSpec, WhitespaceTokenizer};
