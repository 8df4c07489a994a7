//! Typed failure kinds.
//!
//! Public operations return [`anyhow::Result`]; the errors below sit at the root of the
//! chain so callers can tell them apart with `err.downcast_ref::<CheckpointError>()`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures reading or writing aggregation checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A checkpoint file exists but cannot be decoded or fails its integrity check.
    ///
    /// This is fatal at startup: treating it as "no checkpoint" would restart the counts from
    /// the seed and under-count every word seen so far.
    #[error("checkpoint {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("checkpoint I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CheckpointError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for [`CheckpointError::Corrupt`].
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

/// A record that could not be turned into tokens. The engine skips it and counts it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenizeError {
    #[error("payload is not valid UTF-8 (first bad byte at {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },

    #[error("record rejected by tokenizer: {0}")]
    Rejected(String),
}

/// Failures handing a snapshot to an outbound channel.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("emitter I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("outbound channel is full")]
    ChannelFull,

    #[error("outbound channel is closed")]
    ChannelClosed,

    #[error("broker rejected snapshot: {0}")]
    Broker(String),

    #[error("{failed} of {total} emitters failed; first error: {first}")]
    Partial {
        failed: usize,
        total: usize,
        first: Box<EmitError>,
    },
}
