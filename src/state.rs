//! The word-count state store and the fold that updates it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::snapshot::Snapshot;

/// Folds one batch's occurrences of a word into its prior count.
///
/// Called once per distinct word per batch, with `prior == None` the first time a word is seen.
/// Any `Fn(Option<u64>, u64) -> u64` closure is an `UpdateFn`.
pub trait UpdateFn: Send + Sync {
    fn update(&self, prior: Option<u64>, occurrences: u64) -> u64;
}

impl<F> UpdateFn for F
where
    F: Fn(Option<u64>, u64) -> u64 + Send + Sync,
{
    fn update(&self, prior: Option<u64>, occurrences: u64) -> u64 {
        self(prior, occurrences)
    }
}

/// `prior + occurrences`, saturating at `u64::MAX`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunningSum;

impl UpdateFn for RunningSum {
    fn update(&self, prior: Option<u64>, occurrences: u64) -> u64 {
        prior.unwrap_or(0).saturating_add(occurrences)
    }
}

/// Word → count mapping, exclusively owned by the aggregator.
///
/// The map lives behind an `Arc` so snapshots are free to take; [`StateStore::apply`] copies it
/// on write only if an older snapshot is still holding the previous version.
#[derive(Clone, Debug, Default)]
pub struct StateStore {
    counts: Arc<BTreeMap<String, u64>>,
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing mapping (seed or restored checkpoint).
    pub fn from_counts(counts: impl IntoIterator<Item = (String, u64)>) -> Self {
        Self {
            counts: Arc::new(counts.into_iter().collect()),
        }
    }

    /// Fold a whole batch of per-word occurrences into the state in one step.
    ///
    /// Returns the number of words seen for the first time.
    pub fn apply(&mut self, deltas: HashMap<String, u64>, update: &dyn UpdateFn) -> usize {
        if deltas.is_empty() {
            return 0;
        }
        let counts = Arc::make_mut(&mut self.counts);
        let mut created = 0;
        for (word, n) in deltas {
            match counts.get_mut(&word) {
                Some(c) => *c = update.update(Some(*c), n),
                None => {
                    created += 1;
                    counts.insert(word, update.update(None, n));
                }
            }
        }
        created
    }

    #[must_use]
    pub fn get(&self, word: &str) -> Option<u64> {
        self.counts.get(word).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    #[must_use]
    pub fn snapshot(&self, batch_id: u64) -> Snapshot {
        Snapshot::new(batch_id, Arc::clone(&self.counts))
    }

    #[must_use]
    pub fn counts(&self) -> &BTreeMap<String, u64> {
        &self.counts
    }

    /// Drop every count. The only operation that lowers a count.
    pub fn clear(&mut self) {
        self.counts = Arc::new(BTreeMap::new());
    }
}
