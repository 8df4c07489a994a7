//! Immutable point-in-time views of the word counts.
//!
//! A [`Snapshot`] shares its map with the state store through an `Arc`; taking one is O(1) and
//! the store only copies the map when it is next mutated while a snapshot is still alive.
//!
//! On the wire a snapshot is a JSON array of single-key objects, ordered by word:
//!
//! ```
//! use wordflow::snapshot::Snapshot;
//!
//! let s = Snapshot::from_pairs(7, [("world", 7), ("hello", 3)]);
//! assert_eq!(s.to_json().unwrap(), r#"[{"hello":3},{"world":7}]"#);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// Word → cumulative count at the end of one micro-batch.
#[derive(Clone, Debug)]
pub struct Snapshot {
    batch_id: u64,
    counts: Arc<BTreeMap<String, u64>>,
}

impl Snapshot {
    pub(crate) fn new(batch_id: u64, counts: Arc<BTreeMap<String, u64>>) -> Self {
        Self { batch_id, counts }
    }

    /// Build a snapshot from loose pairs. Later duplicates overwrite earlier ones.
    pub fn from_pairs<I, K>(batch_id: u64, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        let counts = pairs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Self::new(batch_id, Arc::new(counts))
    }

    /// Id of the batch that produced this snapshot (0 before any batch).
    #[must_use]
    pub fn batch_id(&self) -> u64 {
        self.batch_id
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

    /// Entries in word order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    #[must_use]
    pub fn counts(&self) -> &BTreeMap<String, u64> {
        &self.counts
    }

    /// Sum of all counts.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.values().fold(0u64, |a, v| a.saturating_add(*v))
    }

    /// True when both snapshots point at the very same map allocation.
    ///
    /// Cheap "nothing changed" test between consecutive snapshots of the same store.
    #[must_use]
    pub fn shares_state_with(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.counts, &other.counts)
    }

    /// Keep the entries matching `keep`, preserving the batch id.
    #[must_use]
    pub fn retain(&self, mut keep: impl FnMut(&str, u64) -> bool) -> Snapshot {
        let counts = self
            .counts
            .iter()
            .filter(|(k, v)| keep(k, **v))
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        Snapshot::new(self.batch_id, Arc::new(counts))
    }

    /// Encode as `[{"word": count}, ...]`.
    ///
    /// # Errors
    /// Propagates serializer errors.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode the wire format back into a map. Object order in the array is irrelevant.
    ///
    /// # Errors
    /// Fails if `json` is not an array of objects with unsigned integer values.
    pub fn decode_counts(json: &str) -> serde_json::Result<BTreeMap<String, u64>> {
        let entries: Vec<BTreeMap<String, u64>> = serde_json::from_str(json)?;
        Ok(entries.into_iter().flatten().collect())
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.counts == other.counts
    }
}

impl Eq for Snapshot {}

struct SingleEntry<'a>(&'a str, u64);

impl Serialize for SingleEntry<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.0, &self.1)?;
        map.end()
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.counts.len()))?;
        for (word, count) in self.iter() {
            seq.serialize_element(&SingleEntry(word, count))?;
        }
        seq.end()
    }
}
