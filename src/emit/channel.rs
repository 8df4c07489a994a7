use tokio::sync::mpsc::{self, error::TrySendError};

use crate::emit::Emitter;
use crate::errors::EmitError;
use crate::snapshot::Snapshot;

/// Pushes encoded snapshots into a bounded tokio channel without waiting.
///
/// A full channel is reported as [`EmitError::ChannelFull`] and that snapshot is dropped; the
/// next tick carries a newer one anyway.
pub struct ChannelEmitter {
    tx: mpsc::Sender<String>,
}

impl ChannelEmitter {
    #[must_use]
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Emitter plus the receiving end of a fresh channel holding up to `capacity` payloads.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl Emitter for ChannelEmitter {
    fn publish(&mut self, snapshot: &Snapshot) -> Result<(), EmitError> {
        let payload = snapshot.to_json()?;
        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => EmitError::ChannelFull,
            TrySendError::Closed(_) => EmitError::ChannelClosed,
        })
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}
