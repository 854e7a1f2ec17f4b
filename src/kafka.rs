//! # librdkafka producer adapter
//!
//! Implements [`KafkaSink`] on top of rdkafka's `BaseProducer`. Delivery
//! callbacks run on the polling thread; each callback carries the boxed
//! message envelope as its opaque and lands the completed delivery in a side
//! queue, which `poll` drains back to the pipeline. That reproduces the
//! single-threaded contract the checkpoint arithmetic depends on: delivery
//! handling only happens inside the application's poll call.

use crate::error::{BridgeError, Result};
use crate::sink::{Delivery, KafkaSink, MessageEnvelope, ProduceError};
use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, Producer, ProducerContext};
use rdkafka::types::RDKafkaErrorCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Producer context that collects completed deliveries for the next poll.
struct DeliveryCollector {
    completed: Arc<Mutex<Vec<Delivery>>>,
}

impl ClientContext for DeliveryCollector {}

impl ProducerContext for DeliveryCollector {
    type DeliveryOpaque = Box<MessageEnvelope>;

    fn delivery(
        &self,
        delivery_result: &rdkafka::producer::DeliveryResult<'_>,
        envelope: Self::DeliveryOpaque,
    ) {
        let delivery = match delivery_result {
            Ok(message) => Delivery {
                envelope: *envelope,
                topic: message.topic().to_string(),
                error: None,
            },
            Err((err, message)) => Delivery {
                envelope: *envelope,
                topic: message.topic().to_string(),
                error: Some(err.to_string()),
            },
        };
        self.completed.lock().push(delivery);
    }
}

/// [`KafkaSink`] backed by librdkafka.
pub struct RdKafkaSink {
    producer: BaseProducer<DeliveryCollector>,
    completed: Arc<Mutex<Vec<Delivery>>>,
}

impl RdKafkaSink {
    /// Create a producer connected to `brokers`.
    ///
    /// `kafka_config` and `topic_config` are raw librdkafka properties
    /// passed straight through; topic properties become the default topic
    /// configuration. The partitioner is pinned to `consistent_random`:
    /// identical keys map to identical partitions (which log compaction of
    /// tombstones depends on), while unkeyed messages are spread randomly.
    pub fn new(
        brokers: &str,
        kafka_config: &[(String, String)],
        topic_config: &[(String, String)],
    ) -> Result<Self> {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", brokers);
        config.set("partitioner", "consistent_random");

        for (property, value) in kafka_config.iter().chain(topic_config.iter()) {
            config.set(property, value);
        }

        let completed = Arc::new(Mutex::new(Vec::new()));
        let context = DeliveryCollector {
            completed: Arc::clone(&completed),
        };

        let producer: BaseProducer<DeliveryCollector> = config
            .create_with_context(context)
            .map_err(|e| BridgeError::kafka(format!("could not create Kafka producer: {}", e)))?;

        info!(brokers, "created Kafka producer");
        Ok(Self {
            producer,
            completed,
        })
    }
}

impl KafkaSink for RdKafkaSink {
    fn create_topic(&mut self, _name: &str) -> Result<()> {
        // librdkafka materializes topic handles on first produce, with the
        // default topic configuration applied at producer creation.
        Ok(())
    }

    fn produce(
        &mut self,
        topic: &str,
        key: Option<&[u8]>,
        value: Option<Vec<u8>>,
        envelope: MessageEnvelope,
    ) -> std::result::Result<(), ProduceError> {
        let mut record: BaseRecord<'_, [u8], [u8], Box<MessageEnvelope>> =
            BaseRecord::with_opaque_to(topic, Box::new(envelope));
        if let Some(key) = key {
            record = record.key(key);
        }
        if let Some(payload) = value.as_deref() {
            record = record.payload(payload);
        }

        // The record borrows the value buffer; librdkafka copies it during
        // send, so the buffer can be handed back on queue-full.
        let send_error = match self.producer.send(record) {
            Ok(()) => None,
            Err((err, _record)) => Some(err),
        };

        match send_error {
            None => Ok(()),
            Some(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)) => {
                Err(ProduceError::QueueFull { value })
            }
            Some(err) => Err(ProduceError::Fatal(BridgeError::kafka(format!(
                "failed to produce to topic {}: {}",
                topic, err
            )))),
        }
    }

    fn poll(&mut self, timeout: Duration) -> Vec<Delivery> {
        self.producer.poll(timeout);
        std::mem::take(&mut *self.completed.lock())
    }

    fn flush(&mut self, timeout: Duration) -> Result<()> {
        self.producer
            .flush(timeout)
            .map_err(|e| BridgeError::kafka(format!("flush failed: {}", e)))
    }
}
