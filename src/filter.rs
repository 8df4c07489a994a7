//! Post-aggregation filtering of snapshots.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use serde::{Deserialize, Serialize};

use crate::snapshot::Snapshot;

/// Keep entries with `count >= min_count` whose word is not in `excluded`.
///
/// Pure: the input snapshot is left untouched and the batch id is carried over.
///
/// ```
/// use std::collections::HashSet;
/// use wordflow::filter::apply;
/// use wordflow::snapshot::Snapshot;
///
/// let s = Snapshot::from_pairs(4, [("the", 9), ("cat", 5), ("hat", 1)]);
/// let excluded: HashSet<String> = ["the".to_string()].into();
/// let kept = apply(&s, 5, &excluded);
/// assert_eq!(kept.to_json().unwrap(), r#"[{"cat":5}]"#);
/// ```
#[must_use]
pub fn apply<S: std::hash::BuildHasher>(
    snapshot: &Snapshot,
    min_count: u64,
    excluded: &HashSet<String, S>,
) -> Snapshot {
    if min_count == 0 && excluded.is_empty() {
        return snapshot.clone();
    }
    snapshot.retain(|word, count| count >= min_count && !excluded.contains(word))
}

/// The `k` most frequent entries. Ties go to the alphabetically smaller word.
#[must_use]
pub fn top_k(snapshot: &Snapshot, k: usize) -> Snapshot {
    if snapshot.len() <= k {
        return snapshot.clone();
    }
    // Min-heap of size <= k; the root is the weakest entry kept so far.
    let mut heap: BinaryHeap<Reverse<(u64, Reverse<&str>)>> = BinaryHeap::with_capacity(k + 1);
    for (word, count) in snapshot.iter() {
        heap.push(Reverse((count, Reverse(word))));
        if heap.len() > k {
            heap.pop();
        }
    }
    let keep: HashSet<&str> = heap.into_iter().map(|Reverse((_, Reverse(w)))| w).collect();
    snapshot.retain(|word, _| keep.contains(word))
}

/// Filter settings applied to every snapshot before it is emitted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    pub min_count: u64,
    pub excluded: HashSet<String>,
    /// Keep only the most frequent words after the other filters.
    pub top_k: Option<usize>,
}

impl FilterSpec {
    #[must_use]
    pub fn min_count(min_count: u64) -> Self {
        Self {
            min_count,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn exclude<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded.extend(words.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self.min_count == 0 && self.excluded.is_empty() && self.top_k.is_none()
    }

    #[must_use]
    pub fn apply(&self, snapshot: &Snapshot) -> Snapshot {
        let kept = apply(snapshot, self.min_count, &self.excluded);
        match self.top_k {
            Some(k) => top_k(&kept, k),
            None => kept,
        }
    }
}
