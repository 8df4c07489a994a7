//! Kafka word count.
//!
//! Consumes text from one or more topics, keeps running word counts, and publishes the full
//! counts once per tick to an output topic (mirrored to stdout).
//!
//! ```text
//! kafka-wordcount <BROKERS> <GROUP> <TOPICS> <THREADS> [OPTIONS]
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use wordflow::config::{StreamConfig, parse_seed_entry};
use wordflow::emit::kafka::{DEFAULT_OUTPUT_TOPIC, KafkaEmitter};
use wordflow::emit::{ConsoleEmitter, FanoutEmitter};
use wordflow::engine::{Aggregator, ExecMode};
use wordflow::source::kafka::{KafkaSource, KafkaSourceConfig};
use wordflow::{CheckpointPolicy, StreamDriver};

#[derive(Parser, Debug)]
#[command(name = "kafka-wordcount", version, about = "Streaming word count over Kafka topics")]
struct Cli {
    /// Kafka bootstrap servers, e.g. localhost:9092
    brokers: String,

    /// Consumer group id
    group: String,

    /// Comma-separated topics to consume
    topics: String,

    /// Receive tasks, one group consumer each
    threads: usize,

    /// JSON stream configuration; command-line options override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Micro-batch length in milliseconds
    #[arg(long, value_name = "MS")]
    tick_ms: Option<u64>,

    /// Directory for the checkpoint file
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Checkpoint after every N ticks (0 = only on shutdown)
    #[arg(long, value_name = "N")]
    checkpoint_every: Option<u64>,

    /// Do not checkpoint at all
    #[arg(long, conflicts_with_all = ["checkpoint_dir", "checkpoint_every"])]
    no_checkpoint: bool,

    /// Only emit words seen at least this often
    #[arg(long, value_name = "N")]
    min_count: Option<u64>,

    /// Words never emitted (repeatable, or comma separated)
    #[arg(long, value_name = "WORD", value_delimiter = ',')]
    exclude: Vec<String>,

    /// Emit only the N most frequent words
    #[arg(long, value_name = "N")]
    top_k: Option<usize>,

    /// Initial count used when there is no checkpoint (repeatable)
    #[arg(long, value_name = "WORD=COUNT", value_parser = parse_seed_entry)]
    seed: Vec<(String, u64)>,

    /// Topic the counts are published to
    #[arg(long, default_value = DEFAULT_OUTPUT_TOPIC)]
    output_topic: String,

    /// Entries shown per tick on stdout
    #[arg(long, default_value_t = 10)]
    console_entries: usize,

    /// Tokenize batches on a single thread
    #[arg(long)]
    sequential: bool,
}

impl Cli {
    fn stream_config(&self) -> Result<StreamConfig> {
        let mut cfg = match &self.config {
            Some(path) => StreamConfig::from_json_file(path)?,
            None => StreamConfig::default(),
        };
        if let Some(ms) = self.tick_ms {
            cfg.driver.tick_interval_ms = ms;
        }
        if let Some(dir) = &self.checkpoint_dir {
            cfg.engine.checkpoint.directory.clone_from(dir);
        }
        if let Some(n) = self.checkpoint_every {
            cfg.engine.checkpoint.policy = CheckpointPolicy::EveryNBatches(n);
        }
        if self.no_checkpoint {
            cfg.engine.checkpoint.enabled = false;
        }
        if let Some(n) = self.min_count {
            cfg.filter.min_count = n;
        }
        cfg.filter
            .excluded
            .extend(self.exclude.iter().map(|w| w.trim().to_lowercase()));
        if self.top_k.is_some() {
            cfg.filter.top_k = self.top_k;
        }
        if self.sequential {
            cfg.engine.exec_mode = ExecMode::Sequential;
        }
        cfg.seed.extend(self.seed.iter().cloned());
        cfg.validate()?;
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    let cfg = cli.stream_config()?;
    let seed: BTreeMap<String, u64> = cfg.seed.clone();

    log::info!("kafka-wordcount starting");
    log::info!("   brokers: {}", cli.brokers);
    log::info!("   group: {} topics: {} threads: {}", cli.group, cli.topics, cli.threads);
    log::info!("   output topic: {}", cli.output_topic);

    let tokenizer = cfg.tokenizer.build().context("build tokenizer")?;
    let engine = Aggregator::builder(cfg.engine.clone())
        .tokenizer(tokenizer)
        .initialize(seed)?;

    let source = KafkaSource::connect(KafkaSourceConfig::new(
        &cli.brokers,
        &cli.group,
        &cli.topics,
        cli.threads,
    ))?;
    let emitter = FanoutEmitter::new()
        .with(KafkaEmitter::new(&cli.brokers, cli.output_topic.clone())?)
        .with(ConsoleEmitter::stdout().max_entries(cli.console_entries));

    let (tx, rx) = mpsc::channel(cfg.driver.channel_capacity);
    let receivers = source.spawn(&tx);
    drop(tx);

    let mut driver = StreamDriver::new(engine, emitter, cfg.driver.clone())?
        .filter(cfg.filter.clone())
        .acknowledger(source.acknowledger())
        .in_flight(source.in_flight());
    let report = driver
        .run(rx, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await;

    for handle in receivers {
        handle.abort();
    }
    log::info!(
        "stopped after {} batches, {} records, {} emissions ({} failed)",
        report.batches,
        report.records,
        report.emissions,
        report.emit_failures
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn missing_positionals_are_rejected() {
        let err = Cli::try_parse_from(["kafka-wordcount", "b", "g"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn threads_must_be_a_number() {
        let err = Cli::try_parse_from(["kafka-wordcount", "b", "g", "t", "many"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn positionals_in_original_order() {
        let cli = Cli::try_parse_from(["kafka-wordcount", "localhost:9092", "grp", "a,b", "2"]).unwrap();
        assert_eq!(cli.brokers, "localhost:9092");
        assert_eq!(cli.group, "grp");
        assert_eq!(cli.topics, "a,b");
        assert_eq!(cli.threads, 2);
        assert_eq!(cli.output_topic, DEFAULT_OUTPUT_TOPIC);
    }

    #[test]
    fn options_override_the_stream_config() {
        let cli = Cli::try_parse_from([
            "kafka-wordcount",
            "localhost:9092",
            "grp",
            "words",
            "1",
            "--tick-ms",
            "250",
            "--checkpoint-every",
            "3",
            "--min-count",
            "2",
            "--exclude",
            "The,a",
            "--seed",
            "hello=1",
            "--sequential",
        ])
        .unwrap();
        let cfg = cli.stream_config().unwrap();
        assert_eq!(cfg.driver.tick_interval_ms, 250);
        assert_eq!(cfg.engine.checkpoint.policy, CheckpointPolicy::EveryNBatches(3));
        assert_eq!(cfg.filter.min_count, 2);
        assert!(cfg.filter.excluded.contains("the") && cfg.filter.excluded.contains("a"));
        assert_eq!(cfg.seed.get("hello"), Some(&1));
        assert_eq!(cfg.engine.exec_mode, ExecMode::Sequential);
    }

    #[test]
    fn bad_seed_and_zero_tick_are_rejected() {
        let err = Cli::try_parse_from(["kafka-wordcount", "b", "g", "t", "1", "--seed", "hello"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);

        let cli = Cli::try_parse_from(["kafka-wordcount", "b", "g", "t", "1", "--tick-ms", "0"]).unwrap();
        assert!(cli.stream_config().is_err());
    }

    #[test]
    fn no_checkpoint_conflicts_with_checkpoint_options() {
        let err = Cli::try_parse_from(["kafka-wordcount", "b", "g", "t", "1", "--no-checkpoint", "--checkpoint-every", "2"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }
}
