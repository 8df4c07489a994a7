//! Word count over stdin, one record per line.
//!
//! ```text
//! cat book.txt | cargo run --example stdin_wordcount -- [config.json]
//! ```
//!
//! Prints the counts every tick and appends each snapshot to `wordstats.jsonl`. Stops at EOF or
//! ctrl-c, writing a final checkpoint either way.

use anyhow::Result;
use tokio::sync::mpsc;

use wordflow::config::StreamConfig;
use wordflow::emit::{ConsoleEmitter, FanoutEmitter, JsonlEmitter};
use wordflow::engine::Aggregator;
use wordflow::source::spawn_stdin;
use wordflow::StreamDriver;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cfg = match std::env::args().nth(1) {
        Some(path) => StreamConfig::from_json_file(path)?,
        None => StreamConfig::default(),
    };

    let engine = Aggregator::builder(cfg.engine.clone())
        .tokenizer(cfg.tokenizer.build()?)
        .initialize(cfg.seed.clone())?;
    let emitter = FanoutEmitter::new()
        .with(ConsoleEmitter::stdout())
        .with(JsonlEmitter::append("wordstats.jsonl")?);

    let (tx, rx) = mpsc::channel(cfg.driver.channel_capacity);
    let reader = spawn_stdin(tx);

    let mut driver = StreamDriver::new(engine, emitter, cfg.driver.clone())?.filter(cfg.filter);
    let report = driver
        .run(rx, async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await;
    reader.abort();

    println!(
        "{} records in {} batches; {} distinct words",
        report.records,
        report.batches,
        driver.engine().snapshot().len()
    );
    Ok(())
}
