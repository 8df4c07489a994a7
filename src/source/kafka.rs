//! Kafka ingestion, behind the `kafka` feature.

use std::sync::Arc;

use anyhow::{Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::record::{Record, RecordOrigin};
use crate::source::{Acknowledger, InFlight};

/// Connection settings for [`KafkaSource`].
#[derive(Clone, Debug)]
pub struct KafkaSourceConfig {
    pub brokers: String,
    pub group_id: String,
    pub topics: Vec<String>,
    /// Receive tasks, each with its own group member consumer.
    pub threads: usize,
    /// Where a group without committed offsets starts.
    pub auto_offset_reset: String,
}

impl KafkaSourceConfig {
    /// Config from the four command-line values. `topics` is comma separated.
    #[must_use]
    pub fn new(brokers: &str, group_id: &str, topics: &str, threads: usize) -> Self {
        Self {
            brokers: brokers.to_string(),
            group_id: group_id.to_string(),
            topics: topics
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
            threads: threads.max(1),
            auto_offset_reset: "latest".to_string(),
        }
    }
}

/// One group consumer per receive task, all subscribed to every configured topic.
///
/// The group assigns each partition to a single consumer, so every partition is read in order by
/// one task. Offsets are never committed automatically; they are committed through the
/// [`KafkaAcknowledger`] only once a checkpoint covers them.
pub struct KafkaSource {
    consumers: Vec<Arc<StreamConsumer>>,
    config: KafkaSourceConfig,
    in_flight: InFlight,
}

fn group_member(config: &KafkaSourceConfig, worker: usize) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("group.id", &config.group_id)
        .set("client.id", format!("{}-{worker}", config.group_id))
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", &config.auto_offset_reset)
        .create()
        .with_context(|| format!("create Kafka consumer for {}", config.brokers))?;
    let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
    consumer
        .subscribe(&topics)
        .with_context(|| format!("subscribe to {}", config.topics.join(",")))?;
    Ok(consumer)
}

impl KafkaSource {
    /// Create the consumers and subscribe them.
    ///
    /// # Errors
    /// Returns an error if no topic is given, or a consumer cannot be created or subscribed.
    pub fn connect(config: KafkaSourceConfig) -> Result<Self> {
        anyhow::ensure!(!config.topics.is_empty(), "no topics to consume");
        let consumers = (0..config.threads)
            .map(|worker| group_member(&config, worker).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        log::info!(
            "consuming {} as group '{}' from {} with {} receive task(s)",
            config.topics.join(","),
            config.group_id,
            config.brokers,
            config.threads
        );
        Ok(Self {
            consumers,
            config,
            in_flight: InFlight::new(),
        })
    }

    /// Acknowledger committing processed offsets for this source's group.
    #[must_use]
    pub fn acknowledger(&self) -> KafkaAcknowledger {
        KafkaAcknowledger {
            consumers: self.consumers.clone(),
        }
    }

    /// Ledger of received records; hand it to the driver.
    #[must_use]
    pub fn in_flight(&self) -> InFlight {
        self.in_flight.clone()
    }

    /// Start one receive task per consumer. Each ends when `tx` is closed.
    #[must_use]
    pub fn spawn(&self, tx: &mpsc::Sender<Record>) -> Vec<JoinHandle<Result<u64>>> {
        self.consumers
            .iter()
            .enumerate()
            .map(|(worker, consumer)| {
                let consumer = Arc::clone(consumer);
                let tx = tx.clone();
                let in_flight = self.in_flight.clone();
                tokio::spawn(async move { receive_loop(worker, &consumer, &tx, &in_flight).await })
            })
            .collect()
    }
}

async fn receive_loop(
    worker: usize,
    consumer: &StreamConsumer,
    tx: &mpsc::Sender<Record>,
    in_flight: &InFlight,
) -> Result<u64> {
    let mut received: u64 = 0;
    loop {
        let msg = tokio::select! {
            () = tx.closed() => break,
            msg = consumer.recv() => msg,
        };
        let record = match msg {
            Ok(m) => Record::new(m.payload().unwrap_or_default()).with_origin(
                m.topic(),
                m.partition(),
                m.offset(),
            ),
            Err(e) => {
                log::warn!("kafka receive task {worker}: {e}");
                continue;
            }
        };
        let origin = record.origin.clone();
        if let Some(o) = &origin {
            in_flight.begin(o);
        }
        if tx.send(record).await.is_err() {
            in_flight.finish(origin.iter());
            break;
        }
        received += 1;
    }
    log::debug!("kafka receive task {worker} stopped after {received} messages");
    Ok(received)
}

/// Commits `offset + 1` for every checkpointed position.
///
/// Each offset goes through the consumer currently assigned its partition. Positions of
/// partitions no consumer holds any more are skipped; their new owner resumes from the last
/// commit.
pub struct KafkaAcknowledger {
    consumers: Vec<Arc<StreamConsumer>>,
}

impl Acknowledger for KafkaAcknowledger {
    fn acknowledge(&mut self, positions: &[RecordOrigin]) -> Result<()> {
        if positions.is_empty() {
            return Ok(());
        }
        let mut committed = 0;
        for consumer in &self.consumers {
            let assigned = consumer.assignment().context("read partition assignment")?;
            let mut tpl = TopicPartitionList::new();
            for p in positions
                .iter()
                .filter(|p| assigned.find_partition(&p.topic, p.partition).is_some())
            {
                tpl.add_partition_offset(&p.topic, p.partition, Offset::Offset(p.offset + 1))
                    .with_context(|| format!("offset for {}[{}]", p.topic, p.partition))?;
            }
            if tpl.count() == 0 {
                continue;
            }
            committed += tpl.count();
            consumer
                .commit(&tpl, CommitMode::Async)
                .context("commit consumer offsets")?;
        }
        log::debug!("committed offsets for {committed} of {} partition(s)", positions.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_split_and_trimmed() {
        let c = KafkaSourceConfig::new("localhost:9092", "g", "a, b,,c", 0);
        assert_eq!(c.topics, vec!["a", "b", "c"]);
        assert_eq!(c.threads, 1);
    }

    #[tokio::test]
    async fn every_receive_task_gets_its_own_consumer() {
        let source = KafkaSource::connect(KafkaSourceConfig::new("127.0.0.1:1", "g", "a,b", 3)).unwrap();
        assert_eq!(source.consumers.len(), 3);
        assert!(source.in_flight().is_empty());
    }

    #[test]
    fn connect_needs_a_topic() {
        assert!(KafkaSource::connect(KafkaSourceConfig::new("127.0.0.1:1", "g", " , ", 1)).is_err());
    }
}
