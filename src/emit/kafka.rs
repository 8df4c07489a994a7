//! Kafka emitter, behind the `kafka` feature.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::util::Timeout;

use crate::emit::Emitter;
use crate::errors::EmitError;
use crate::snapshot::Snapshot;

/// Topic snapshots are published to unless configured otherwise.
pub const DEFAULT_OUTPUT_TOPIC: &str = "wordStats";

/// Counts deliveries the broker never confirmed.
#[derive(Default)]
struct DeliveryReports {
    failed: AtomicU64,
}

impl ClientContext for DeliveryReports {}

impl ProducerContext for DeliveryReports {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        if let Err((e, _)) = result {
            log::warn!("snapshot delivery failed: {e}");
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Publishes each snapshot as one message on a topic.
///
/// One producer is created up front and reused for every tick. `publish` only enqueues the
/// message and serves pending delivery reports, so a slow or unreachable broker never stalls the
/// tick. Failed deliveries surface as an error from the next `publish` or `flush`. Only `flush`,
/// called on shutdown, waits for delivery, at most `flush_timeout`.
pub struct KafkaEmitter {
    producer: BaseProducer<DeliveryReports>,
    topic: String,
    flush_timeout: Duration,
}

impl KafkaEmitter {
    /// Connect a producer to `brokers`.
    ///
    /// # Errors
    /// Returns an error if the producer cannot be created from the configuration.
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create_with_context(DeliveryReports::default())
            .with_context(|| format!("create Kafka producer for {brokers}"))?;
        Ok(Self {
            producer,
            topic: topic.into(),
            flush_timeout: Duration::from_secs(2),
        })
    }

    #[must_use]
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn take_failures(&self) -> Result<(), EmitError> {
        match self.producer.context().failed.swap(0, Ordering::Relaxed) {
            0 => Ok(()),
            n => Err(EmitError::Broker(format!("{n} snapshot(s) to '{}' were not delivered", self.topic))),
        }
    }
}

impl Emitter for KafkaEmitter {
    fn publish(&mut self, snapshot: &Snapshot) -> Result<(), EmitError> {
        let payload = snapshot.to_json()?;
        self.producer
            .send(BaseRecord::<(), str>::to(&self.topic).payload(payload.as_str()))
            .map_err(|(e, _)| EmitError::Broker(e.to_string()))?;
        self.producer.poll(Duration::ZERO);
        self.take_failures()
    }

    fn name(&self) -> &'static str {
        "kafka"
    }

    fn flush(&mut self) -> Result<(), EmitError> {
        self.producer
            .flush(Timeout::After(self.flush_timeout))
            .map_err(|e| EmitError::Broker(e.to_string()))?;
        self.take_failures()
    }
}
