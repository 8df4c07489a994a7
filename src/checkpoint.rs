//! Durable checkpoints of the word-count state.
//!
//! One checkpoint file per stream lives in the configured directory and is replaced atomically:
//! the new state is written to a temporary sibling, synced to disk, then renamed over the old
//! file. A crash mid-write leaves the previous checkpoint untouched; the orphaned temporary file
//! is removed on the next start.
//!
//! # Format
//!
//! `MAGIC` followed by a postcard-encoded [`CheckpointState`]. The state carries a SHA-256
//! checksum over the postcard encoding of its [`CheckpointBody`]; any decode failure or checksum
//! mismatch is reported as [`CheckpointError::Corrupt`].
//!
//! ```no_run
//! use wordflow::checkpoint::{CheckpointConfig, CheckpointPolicy, CheckpointStore};
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = CheckpointStore::new(CheckpointConfig {
//!     directory: "./checkpoints".into(),
//!     policy: CheckpointPolicy::EveryNBatches(5),
//!     ..Default::default()
//! })?;
//! if let Some(state) = store.load_latest()? {
//!     println!("resuming after batch {}", state.body.batch_id);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fs::{File, create_dir_all, remove_file, rename};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::CheckpointError;
use crate::record::RecordOrigin;

/// File header identifying a wordflow checkpoint.
pub const MAGIC: &[u8; 4] = b"WFCK";

/// Version of [`CheckpointBody`] written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Configuration for checkpoint behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Enable or disable checkpointing.
    pub enabled: bool,
    /// Directory holding the checkpoint file.
    pub directory: PathBuf,
    /// When the driver asks the engine to checkpoint.
    pub policy: CheckpointPolicy,
    /// Names the checkpoint file, so several streams can share a directory.
    pub stream_id: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("./wordflow_checkpoints"),
            policy: CheckpointPolicy::EveryNBatches(10),
            stream_id: "wordcount".to_string(),
        }
    }
}

/// Policy for deciding after which batches a checkpoint is written.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    /// After every N-th batch. `0` means only on shutdown.
    EveryNBatches(u64),
    /// When at least N seconds passed since the previous checkpoint.
    TimeInterval(u64),
    /// Whichever of the two fires first.
    Hybrid { batches: u64, interval_secs: u64 },
}

/// What a checkpoint records about the stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointBody {
    pub format_version: u32,
    pub stream_id: String,
    /// Last batch folded into `counts`.
    pub batch_id: u64,
    /// Milliseconds since the epoch at write time.
    pub timestamp: u64,
    pub records_processed: u64,
    pub records_rejected: u64,
    pub counts: BTreeMap<String, u64>,
    /// Highest processed offset per source partition.
    pub positions: Vec<RecordOrigin>,
}

/// A checkpoint as stored on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointState {
    pub body: CheckpointBody,
    /// Hex SHA-256 of the postcard-encoded body.
    pub checksum: String,
}

impl CheckpointState {
    /// Seal a body with its checksum.
    ///
    /// # Errors
    /// Fails if the body cannot be encoded.
    pub fn seal(body: CheckpointBody) -> Result<Self> {
        let encoded = postcard::to_allocvec(&body).context("encode checkpoint body")?;
        Ok(Self {
            checksum: compute_checksum(&encoded),
            body,
        })
    }

    fn verify(&self) -> std::result::Result<(), String> {
        if self.body.format_version != FORMAT_VERSION {
            return Err(format!(
                "unsupported format version {} (expected {FORMAT_VERSION})",
                self.body.format_version
            ));
        }
        let encoded = postcard::to_allocvec(&self.body).map_err(|e| e.to_string())?;
        if compute_checksum(&encoded) != self.checksum {
            return Err("checksum mismatch".to_string());
        }
        Ok(())
    }
}

/// Writes, finds and loads the checkpoint of one stream.
#[derive(Debug)]
pub struct CheckpointStore {
    config: CheckpointConfig,
    last_checkpoint_time: Option<SystemTime>,
}

impl CheckpointStore {
    /// Create a store, making sure the directory exists when checkpointing is enabled.
    ///
    /// # Errors
    /// Returns an error if the checkpoint directory cannot be created.
    pub fn new(config: CheckpointConfig) -> Result<Self> {
        if config.enabled {
            create_dir_all(&config.directory).with_context(|| {
                format!("create checkpoint directory {}", config.directory.display())
            })?;
        }
        Ok(Self {
            config,
            last_checkpoint_time: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Final location of the checkpoint file.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.config
            .directory
            .join(format!("{}.ckpt", self.config.stream_id))
    }

    fn temp_path(&self) -> PathBuf {
        self.config
            .directory
            .join(format!("{}.ckpt.tmp", self.config.stream_id))
    }

    /// Whether the batch that just completed should be followed by a checkpoint.
    #[must_use]
    pub fn should_checkpoint(&self, batch_id: u64) -> bool {
        if !self.config.enabled {
            return false;
        }
        let by_batches = |n: u64| n > 0 && batch_id > 0 && batch_id.is_multiple_of(n);
        let by_time = |secs: u64| {
            self.last_checkpoint_time.is_none_or(|last| {
                SystemTime::now()
                    .duration_since(last)
                    .is_ok_and(|elapsed| elapsed >= Duration::from_secs(secs))
            })
        };
        match self.config.policy {
            CheckpointPolicy::EveryNBatches(n) => by_batches(n),
            CheckpointPolicy::TimeInterval(secs) => by_time(secs),
            CheckpointPolicy::Hybrid {
                batches,
                interval_secs,
            } => by_batches(batches) || by_time(interval_secs),
        }
    }

    /// Durably replace the checkpoint with `body`.
    ///
    /// # Errors
    /// Returns an error if encoding, writing, syncing or renaming fails. The previous
    /// checkpoint stays valid in every failure case.
    pub fn save(&mut self, body: CheckpointBody) -> Result<PathBuf> {
        let state = CheckpointState::seal(body)?;
        let mut bytes = MAGIC.to_vec();
        bytes.extend(postcard::to_allocvec(&state).context("encode checkpoint")?);

        let tmp = self.temp_path();
        let path = self.path();
        {
            let mut file = File::create(&tmp).map_err(|e| CheckpointError::io(&tmp, e))?;
            file.write_all(&bytes)
                .map_err(|e| CheckpointError::io(&tmp, e))?;
            file.sync_all().map_err(|e| CheckpointError::io(&tmp, e))?;
        }
        rename(&tmp, &path).map_err(|e| CheckpointError::io(&path, e))?;
        sync_dir(&self.config.directory);

        self.last_checkpoint_time = Some(SystemTime::now());
        log::debug!(
            "checkpoint batch={} words={} -> {}",
            state.body.batch_id,
            state.body.counts.len(),
            path.display()
        );
        Ok(path)
    }

    /// Load the current checkpoint, if one exists.
    ///
    /// A leftover temporary file from an interrupted write is deleted first.
    ///
    /// # Errors
    /// [`CheckpointError::Corrupt`] if the file exists but cannot be decoded or verified;
    /// [`CheckpointError::Io`] if it cannot be read.
    pub fn load_latest(&self) -> Result<Option<CheckpointState>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let tmp = self.temp_path();
        if tmp.exists() {
            log::warn!("removing incomplete checkpoint {}", tmp.display());
            remove_file(&tmp).map_err(|e| CheckpointError::io(&tmp, e))?;
        }
        let path = self.path();
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CheckpointError::io(&path, e).into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| CheckpointError::io(&path, e))?;
        Ok(Some(decode(&path, &bytes)?))
    }

    /// Delete the checkpoint (full reset).
    ///
    /// # Errors
    /// Returns an error if an existing file cannot be removed.
    pub fn clear(&mut self) -> Result<()> {
        for p in [self.path(), self.temp_path()] {
            match remove_file(&p) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(CheckpointError::io(&p, e).into()),
            }
        }
        self.last_checkpoint_time = None;
        Ok(())
    }
}

fn decode(path: &Path, bytes: &[u8]) -> std::result::Result<CheckpointState, CheckpointError> {
    let payload = bytes
        .strip_prefix(MAGIC.as_slice())
        .ok_or_else(|| CheckpointError::corrupt(path, "missing checkpoint header"))?;
    let state: CheckpointState = postcard::from_bytes(payload)
        .map_err(|e| CheckpointError::corrupt(path, format!("decode failed: {e}")))?;
    state
        .verify()
        .map_err(|reason| CheckpointError::corrupt(path, reason))?;
    Ok(state)
}

// Persist the rename itself. Not every platform can open a directory for syncing.
fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        d.sync_all().ok();
    }
}

/// Compute SHA-256 checksum of data as lowercase hex.
#[must_use]
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Get current timestamp in milliseconds since epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
