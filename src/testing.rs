//! Fixtures and assertions for testing word-count streams.
//!
//! ```
//! use wordflow::engine::{Aggregator, EngineConfig, ExecMode};
//! use wordflow::testing::{assert_counts, records};
//!
//! let dir = tempfile::TempDir::new().unwrap();
//! let config = EngineConfig {
//!     exec_mode: ExecMode::Sequential,
//!     ..EngineConfig::with_checkpoint_dir(dir.path())
//! };
//! let mut engine = Aggregator::initialize(Vec::new(), config).unwrap();
//! let snapshot = engine.process_batch(&records(&["hello world", "hello"]));
//! assert_counts(&snapshot, &[("hello", 2), ("world", 1)]);
//! ```

use std::collections::BTreeMap;

use crate::record::Record;
use crate::snapshot::Snapshot;

/// One record per line.
#[must_use]
pub fn records(lines: &[&str]) -> Vec<Record> {
    lines.iter().map(|l| Record::from(*l)).collect()
}

/// One record per line, tagged with `topic`, partition 0 and consecutive offsets from `first`.
#[must_use]
pub fn records_at(topic: &str, first: i64, lines: &[&str]) -> Vec<Record> {
    lines
        .iter()
        .zip(first..)
        .map(|(l, offset)| Record::from(*l).with_origin(topic, 0, offset))
        .collect()
}

/// A few batches of short English text with a known total.
///
/// The counts of the whole corpus are in [`sample_corpus_counts`].
#[must_use]
pub fn sample_corpus() -> Vec<Vec<Record>> {
    vec![
        records(&["the quick brown fox", "jumps over the lazy dog"]),
        records(&["The dog barks", "the fox runs"]),
        Vec::new(),
        records(&["quick quick QUICK"]),
    ]
}

/// Whitespace-tokenized counts of all of [`sample_corpus`].
#[must_use]
pub fn sample_corpus_counts() -> BTreeMap<String, u64> {
    [
        ("barks", 1),
        ("brown", 1),
        ("dog", 2),
        ("fox", 2),
        ("jumps", 1),
        ("lazy", 1),
        ("over", 1),
        ("quick", 4),
        ("runs", 1),
        ("the", 4),
    ]
    .into_iter()
    .map(|(w, c)| (w.to_string(), c))
    .collect()
}

/// Assert the snapshot holds exactly `expected`.
///
/// # Panics
///
/// Panics listing missing, unexpected and mismatched words.
pub fn assert_counts(snapshot: &Snapshot, expected: &[(&str, u64)]) {
    let expected: BTreeMap<&str, u64> = expected.iter().copied().collect();
    let actual: BTreeMap<&str, u64> = snapshot.iter().collect();
    if actual == expected {
        return;
    }
    let missing: Vec<_> = expected
        .keys()
        .filter(|k| !actual.contains_key(*k))
        .collect();
    let unexpected: Vec<_> = actual
        .keys()
        .filter(|k| !expected.contains_key(*k))
        .collect();
    let wrong: Vec<_> = expected
        .iter()
        .filter_map(|(k, e)| actual.get(k).filter(|a| *a != e).map(|a| (k, *e, *a)))
        .collect();
    panic!(
        "snapshot of batch {} differs:\n  missing: {missing:?}\n  unexpected: {unexpected:?}\n  (word, expected, actual): {wrong:?}",
        snapshot.batch_id()
    );
}

/// Assert no word's count went down from `before` to `after`.
///
/// # Panics
///
/// Panics on the first word that disappeared or decreased.
pub fn assert_monotone(before: &Snapshot, after: &Snapshot) {
    for (word, old) in before.iter() {
        match after.get(word) {
            Some(new) => assert!(
                new >= old,
                "count of '{word}' fell from {old} to {new} between batch {} and {}",
                before.batch_id(),
                after.batch_id()
            ),
            None => panic!(
                "'{word}' disappeared between batch {} and {}",
                before.batch_id(),
                after.batch_id()
            ),
        }
    }
}
