//! Stream configuration.
//!
//! Every struct has a `Default` and is `#[serde(default)]`, so a JSON file only needs the
//! fields it changes:
//!
//! ```
//! use wordflow::config::StreamConfig;
//!
//! let cfg: StreamConfig = serde_json::from_str(r#"{
//!     "driver": { "tick_interval_ms": 250 },
//!     "filter": { "min_count": 2, "excluded": ["the"] }
//! }"#).unwrap();
//! assert_eq!(cfg.driver.tick_interval().as_millis(), 250);
//! assert!(cfg.engine.checkpoint.enabled);
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::filter::FilterSpec;
use crate::tokenizer::TokenizerSpec;

/// Tick cadence and buffering of the [`StreamDriver`](crate::driver::StreamDriver).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Length of one micro-batch.
    pub tick_interval_ms: u64,
    /// Capacity of the record channel between sources and the driver.
    pub channel_capacity: usize,
    /// Records buffered per tick before the driver stops pulling from the channel.
    pub max_batch_records: usize,
    /// Emit on ticks where nothing changed.
    pub emit_unchanged: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            channel_capacity: 10_000,
            max_batch_records: 100_000,
            emit_unchanged: true,
        }
    }
}

impl DriverConfig {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// # Errors
    /// Fails on a zero tick interval or zero-sized buffers.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be positive");
        }
        if self.channel_capacity == 0 || self.max_batch_records == 0 {
            bail!("channel_capacity and max_batch_records must be positive");
        }
        Ok(())
    }
}

/// Everything needed to run one aggregation stream.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub engine: EngineConfig,
    pub driver: DriverConfig,
    pub filter: FilterSpec,
    pub tokenizer: TokenizerSpec,
    /// Initial counts used when no checkpoint exists.
    pub seed: BTreeMap<String, u64>,
}

impl StreamConfig {
    /// Load from a JSON file.
    ///
    /// # Errors
    /// Fails if the file cannot be read, is not valid JSON for this struct, or does not validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(cfg)
    }

    /// # Errors
    /// Fails if any section is invalid.
    pub fn validate(&self) -> Result<()> {
        self.driver.validate()
    }
}

/// Parse a `word=count` seed entry.
///
/// # Errors
/// Fails when the `=` is missing, the word is empty, or the count is not a `u64`.
pub fn parse_seed_entry(s: &str) -> Result<(String, u64)> {
    let (word, count) = s
        .split_once('=')
        .with_context(|| format!("seed entry '{s}' is not word=count"))?;
    let word = word.trim();
    if word.is_empty() {
        bail!("seed entry '{s}' has an empty word");
    }
    let count = count
        .trim()
        .parse()
        .with_context(|| format!("seed entry '{s}' has a bad count"))?;
    Ok((word.to_string(), count))
}
