//! Outbound channels for snapshots.
//!
//! Every emitter receives the same wire payload, a JSON array of single-key objects ordered by
//! word (see [`Snapshot::to_json`]). Emitters must return promptly: the driver calls them on the
//! tick path and only logs failures.

mod channel;
mod console;
#[cfg(feature = "kafka")]
pub mod kafka;
mod jsonl;

use std::sync::{Arc, Mutex, PoisonError};

use crate::errors::EmitError;
use crate::snapshot::Snapshot;

pub use channel::ChannelEmitter;
pub use console::ConsoleEmitter;
pub use jsonl::JsonlEmitter;

/// Hands snapshots to an outbound channel.
pub trait Emitter: Send {
    /// Publish one snapshot.
    ///
    /// # Errors
    /// Returns an [`EmitError`] if the snapshot could not be delivered. The caller logs it and
    /// carries on with the next tick.
    fn publish(&mut self, snapshot: &Snapshot) -> Result<(), EmitError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Deliver anything still buffered. Called once at shutdown.
    ///
    /// # Errors
    /// Returns an [`EmitError`] if buffered output cannot be delivered.
    fn flush(&mut self) -> Result<(), EmitError> {
        Ok(())
    }
}

impl<E: Emitter + ?Sized> Emitter for Box<E> {
    fn publish(&mut self, snapshot: &Snapshot) -> Result<(), EmitError> {
        (**self).publish(snapshot)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn flush(&mut self) -> Result<(), EmitError> {
        (**self).flush()
    }
}

/// Keeps every published snapshot in memory. Clones share the same buffer.
#[derive(Clone, Debug, Default)]
pub struct MemoryEmitter {
    published: Arc<Mutex<Vec<Snapshot>>>,
}

impl MemoryEmitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, oldest first.
    #[must_use]
    pub fn published(&self) -> Vec<Snapshot> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn last(&self) -> Option<Snapshot> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Emitter for MemoryEmitter {
    fn publish(&mut self, snapshot: &Snapshot) -> Result<(), EmitError> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(snapshot.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Publishes to several emitters in order.
///
/// A failing emitter does not stop the others; the combined result reports how many failed.
#[derive(Default)]
pub struct FanoutEmitter {
    targets: Vec<Box<dyn Emitter>>,
}

impl FanoutEmitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, emitter: impl Emitter + 'static) -> Self {
        self.targets.push(Box::new(emitter));
        self
    }

    pub fn push(&mut self, emitter: Box<dyn Emitter>) {
        self.targets.push(emitter);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn each(
        &mut self,
        mut op: impl FnMut(&mut dyn Emitter) -> Result<(), EmitError>,
    ) -> Result<(), EmitError> {
        let total = self.targets.len();
        let mut failed = 0;
        let mut first = None;
        for target in &mut self.targets {
            if let Err(e) = op(target.as_mut()) {
                log::warn!("emitter '{}' failed: {e}", target.name());
                failed += 1;
                first.get_or_insert(e);
            }
        }
        match first {
            None => Ok(()),
            Some(first) => Err(EmitError::Partial {
                failed,
                total,
                first: Box::new(first),
            }),
        }
    }
}

impl Emitter for FanoutEmitter {
    fn publish(&mut self, snapshot: &Snapshot) -> Result<(), EmitError> {
        self.each(|e| e.publish(snapshot))
    }

    fn name(&self) -> &'static str {
        "fanout"
    }

    fn flush(&mut self) -> Result<(), EmitError> {
        self.each(|e| e.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl Emitter for Broken {
        fn publish(&mut self, _: &Snapshot) -> Result<(), EmitError> {
            Err(EmitError::Broker("down".into()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[test]
    fn memory_clones_share_buffer() {
        let mem = MemoryEmitter::new();
        let mut writer = mem.clone();
        writer.publish(&Snapshot::from_pairs(1, [("a", 1)])).unwrap();
        assert_eq!(mem.len(), 1);
        assert_eq!(mem.last().unwrap().get("a"), Some(1));
    }

    #[test]
    fn fanout_keeps_going_after_a_failure() {
        let mem = MemoryEmitter::new();
        let mut fan = FanoutEmitter::new().with(Broken).with(mem.clone());
        let err = fan.publish(&Snapshot::from_pairs(1, [("a", 1)])).unwrap_err();
        assert!(matches!(err, EmitError::Partial { failed: 1, total: 2, .. }));
        assert_eq!(mem.len(), 1);
    }

    #[test]
    fn empty_fanout_is_ok() {
        let mut fan = FanoutEmitter::new();
        assert!(fan.is_empty());
        fan.publish(&Snapshot::from_pairs::<_, String>(0, [])).unwrap();
    }
}
