//! Ingestion sources.
//!
//! A source runs as one or more tokio tasks pushing [`Record`]s into the bounded channel the
//! driver drains. When the channel is full, sources wait; that is the only backpressure there is.
//! A source signals end-of-stream by dropping its sender.

#[cfg(feature = "kafka")]
pub mod kafka;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::record::{Record, RecordOrigin};

/// Told about source positions once they are covered by a durable checkpoint.
///
/// Sources that can replay (Kafka) commit these so that a restart resumes right after the last
/// checkpoint. Anything processed after that point is replayed, which is what makes delivery
/// at-least-once.
pub trait Acknowledger: Send {
    /// # Errors
    /// Returns an error if the positions could not be committed; the driver logs it and retries
    /// after the next checkpoint.
    fn acknowledge(&mut self, positions: &[RecordOrigin]) -> Result<()>;
}

/// Acknowledger for sources that cannot replay.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAck;

impl Acknowledger for NoAck {
    fn acknowledge(&mut self, _positions: &[RecordOrigin]) -> Result<()> {
        Ok(())
    }
}

type PartitionKey = (String, i32);

/// Offsets a source has handed out that no processed batch covers yet.
///
/// A source registers each record with [`InFlight::begin`] as soon as it receives it, before the
/// record can be reordered against others on the way to the driver. The driver marks records
/// done once they are folded into the state, and passes every acknowledgement through
/// [`InFlight::settle`], so a committed position never skips a record that is still pending.
#[derive(Clone, Debug, Default)]
pub struct InFlight {
    pending: Arc<Mutex<HashMap<PartitionKey, BTreeMap<i64, usize>>>>,
}

impl InFlight {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PartitionKey, BTreeMap<i64, usize>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(&self, origin: &RecordOrigin) {
        *self
            .lock()
            .entry((origin.topic.clone(), origin.partition))
            .or_default()
            .entry(origin.offset)
            .or_insert(0) += 1;
    }

    pub fn finish<'a>(&self, origins: impl IntoIterator<Item = &'a RecordOrigin>) {
        let mut pending = self.lock();
        for origin in origins {
            let key = (origin.topic.clone(), origin.partition);
            let Some(offsets) = pending.get_mut(&key) else {
                continue;
            };
            if let Some(n) = offsets.get_mut(&origin.offset) {
                *n -= 1;
                if *n == 0 {
                    offsets.remove(&origin.offset);
                }
            }
            if offsets.is_empty() {
                pending.remove(&key);
            }
        }
    }

    /// Records begun and not yet finished.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().values().flat_map(BTreeMap::values).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Hold every position back to just before the oldest offset still pending on its partition.
    #[must_use]
    pub fn settle(&self, mut positions: Vec<RecordOrigin>) -> Vec<RecordOrigin> {
        let pending = self.lock();
        for p in &mut positions {
            let oldest = pending
                .get(&(p.topic.clone(), p.partition))
                .and_then(|offsets| offsets.keys().next().copied());
            if let Some(oldest) = oldest
                && oldest <= p.offset
            {
                p.offset = oldest - 1;
            }
        }
        positions
    }
}

/// Push every line of `reader` as one record, tagging it with `topic` and its line number.
///
/// Ends when the reader hits EOF or the receiver goes away. Returns the number of lines sent.
pub fn spawn_lines<R>(reader: R, topic: impl Into<String>, tx: mpsc::Sender<Record>) -> JoinHandle<Result<u64>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let topic = topic.into();
    tokio::spawn(async move {
        let mut lines = reader.lines();
        let mut sent: u64 = 0;
        while let Some(line) = lines.next_line().await? {
            let record = Record::from(line).with_origin(topic.as_str(), 0, i64::try_from(sent)?);
            if tx.send(record).await.is_err() {
                log::debug!("line source '{topic}': receiver closed after {sent} lines");
                break;
            }
            sent += 1;
        }
        log::info!("line source '{topic}' finished after {sent} lines");
        Ok(sent)
    })
}

/// Read records from stdin, one per line.
pub fn spawn_stdin(tx: mpsc::Sender<Record>) -> JoinHandle<Result<u64>> {
    spawn_lines(tokio::io::BufReader::new(tokio::io::stdin()), "stdin", tx)
}

/// Push a fixed set of records, then close.
pub fn spawn_iter<I>(records: I, tx: mpsc::Sender<Record>) -> JoinHandle<Result<u64>>
where
    I: IntoIterator<Item = Record>,
    I::IntoIter: Send + 'static,
{
    let records = records.into_iter();
    tokio::spawn(async move {
        let mut sent = 0;
        for r in records {
            if tx.send(r).await.is_err() {
                break;
            }
            sent += 1;
        }
        Ok(sent)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_become_records_with_positions() {
        let (tx, mut rx) = mpsc::channel(8);
        let input: &[u8] = b"hello world\nhello\n";
        let handle = spawn_lines(input, "t", tx);
        assert_eq!(handle.await.unwrap().unwrap(), 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.text().unwrap(), "hello world");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.origin.unwrap().offset, 1);
        assert!(rx.recv().await.is_none());
    }

    fn at(offset: i64) -> RecordOrigin {
        RecordOrigin {
            topic: "t".to_string(),
            partition: 0,
            offset,
        }
    }

    #[test]
    fn settle_stops_before_the_oldest_pending_offset() {
        let ledger = InFlight::new();
        for o in 4..=6 {
            ledger.begin(&at(o));
        }
        ledger.finish([&at(4), &at(6)]);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.settle(vec![at(6)])[0].offset, 4);

        ledger.finish([&at(5)]);
        assert!(ledger.is_empty());
        assert_eq!(ledger.settle(vec![at(6)])[0].offset, 6);
    }

    #[test]
    fn settle_leaves_other_partitions_alone() {
        let ledger = InFlight::new();
        ledger.begin(&RecordOrigin {
            partition: 1,
            ..at(2)
        });
        assert_eq!(ledger.settle(vec![at(9)])[0].offset, 9);
        assert_eq!(ledger.settle(vec![RecordOrigin { partition: 1, ..at(9) }])[0].offset, 1);
    }

    #[tokio::test]
    async fn closed_receiver_stops_the_source() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let n = spawn_iter(vec![Record::from("a"), Record::from("b")], tx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
