//! # Kafka driver interface
//!
//! The producer pipeline talks to the Kafka client library through the
//! [`KafkaSink`] trait: enqueue a message carrying an opaque envelope, poll
//! the driver so network progress happens and completed deliveries come
//! back, and flush on shutdown. The real adapter lives in [`crate::kafka`];
//! [`MockSink`] is an in-memory driver for tests.

use crate::error::{BridgeError, Result};
use std::collections::VecDeque;
use std::time::Duration;

/// Per-message bookkeeping carried through the driver and handed back by the
/// delivery callback.
///
/// The transaction is referenced as `(slot, xid)` rather than a pointer:
/// ring slots are reused, so an acknowledgement is validated against the
/// slot's current xid before any counter is touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Ring slot of the owning transaction
    pub slot: usize,
    /// xid the slot held when the message was enqueued
    pub xid: u32,
    /// WAL position of the row event
    pub wal_pos: u64,
    /// Relation the row belongs to
    pub relid: u32,
}

/// Completed delivery reported by the driver.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: MessageEnvelope,
    pub topic: String,
    /// Driver error string for a failed delivery, `None` on success
    pub error: Option<String>,
}

/// Why an enqueue attempt did not take the message.
#[derive(Debug)]
pub enum ProduceError {
    /// The driver's buffer is full; the caller should apply backpressure
    /// and retry. The untouched value buffer is handed back for the retry.
    QueueFull { value: Option<Vec<u8>> },
    /// Any other driver error. The message is dropped.
    Fatal(BridgeError),
}

/// Operations the producer pipeline needs from a Kafka client library.
pub trait KafkaSink {
    /// Make a topic available for producing, applying the shared topic
    /// configuration.
    fn create_topic(&mut self, name: &str) -> Result<()>;

    /// Enqueue one message. The key is copied by the driver; the value
    /// buffer is owned by the driver until the delivery completes. The
    /// partition is chosen by the driver's partitioner: stable for
    /// identical keys, random for null keys.
    fn produce(
        &mut self,
        topic: &str,
        key: Option<&[u8]>,
        value: Option<Vec<u8>>,
        envelope: MessageEnvelope,
    ) -> std::result::Result<(), ProduceError>;

    /// Let the driver make progress for up to `timeout`, returning every
    /// delivery that completed meanwhile. Delivery callbacks run only
    /// inside this call, which keeps them serialized with ingest.
    fn poll(&mut self, timeout: Duration) -> Vec<Delivery>;

    /// Drain outstanding messages, waiting at most `timeout`.
    fn flush(&mut self, timeout: Duration) -> Result<()>;
}

/// A record accepted by the [`MockSink`], kept for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

/// In-memory Kafka driver for tests.
///
/// Messages sit in an in-flight queue until the test acknowledges them (or
/// fails them); acknowledged messages are reported by the next `poll`. A
/// bounded queue capacity makes the queue-full backpressure path testable,
/// and `auto_ack` mode acknowledges one message per poll so backpressure
/// loops drain on their own.
pub struct MockSink {
    capacity: usize,
    auto_ack: bool,
    in_flight: VecDeque<(MessageEnvelope, String)>,
    completed: VecDeque<Delivery>,
    /// Every record accepted by `produce`, in order.
    pub produced: Vec<ProducedRecord>,
    /// Topics created through `create_topic`, in order.
    pub topics: Vec<String>,
    /// Error string to attach to the next acknowledgement.
    fail_next: Option<String>,
    flushed: bool,
}

impl MockSink {
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// A sink whose produce queue holds at most `capacity` unacknowledged
    /// messages.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            auto_ack: false,
            in_flight: VecDeque::new(),
            completed: VecDeque::new(),
            produced: Vec::new(),
            topics: Vec::new(),
            fail_next: None,
            flushed: false,
        }
    }

    /// Acknowledge one message per `poll` call.
    pub fn set_auto_ack(&mut self, auto_ack: bool) {
        self.auto_ack = auto_ack;
    }

    /// Report the next acknowledged message as failed with `reason`.
    pub fn fail_next_delivery(&mut self, reason: impl Into<String>) {
        self.fail_next = Some(reason.into());
    }

    /// Acknowledge the oldest in-flight message.
    pub fn ack_next(&mut self) -> bool {
        match self.in_flight.pop_front() {
            Some((envelope, topic)) => {
                let error = self.fail_next.take();
                self.completed.push_back(Delivery {
                    envelope,
                    topic,
                    error,
                });
                true
            }
            None => false,
        }
    }

    /// Acknowledge everything currently in flight.
    pub fn ack_all(&mut self) {
        while self.ack_next() {}
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn was_flushed(&self) -> bool {
        self.flushed
    }
}

impl Default for MockSink {
    fn default() -> Self {
        Self::new()
    }
}

impl KafkaSink for MockSink {
    fn create_topic(&mut self, name: &str) -> Result<()> {
        if !self.topics.iter().any(|t| t == name) {
            self.topics.push(name.to_string());
        }
        Ok(())
    }

    fn produce(
        &mut self,
        topic: &str,
        key: Option<&[u8]>,
        value: Option<Vec<u8>>,
        envelope: MessageEnvelope,
    ) -> std::result::Result<(), ProduceError> {
        if self.in_flight.len() >= self.capacity {
            return Err(ProduceError::QueueFull { value });
        }
        self.produced.push(ProducedRecord {
            topic: topic.to_string(),
            key: key.map(<[u8]>::to_vec),
            value,
        });
        self.in_flight.push_back((envelope, topic.to_string()));
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) -> Vec<Delivery> {
        if self.auto_ack {
            self.ack_next();
        }
        self.completed.drain(..).collect()
    }

    fn flush(&mut self, _timeout: Duration) -> Result<()> {
        self.flushed = true;
        self.ack_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(slot: usize) -> MessageEnvelope {
        MessageEnvelope {
            slot,
            xid: 1,
            wal_pos: 0x10,
            relid: 42,
        }
    }

    #[test]
    fn test_mock_sink_queue_full() {
        let mut sink = MockSink::with_capacity(1);
        sink.produce("t", None, Some(b"a".to_vec()), envelope(0))
            .unwrap();
        match sink.produce("t", None, Some(b"b".to_vec()), envelope(0)) {
            // The value buffer comes back for the retry.
            Err(ProduceError::QueueFull { value }) => assert_eq!(value, Some(b"b".to_vec())),
            _ => panic!("expected QueueFull"),
        }

        // Ack frees a slot.
        sink.ack_next();
        sink.produce("t", None, Some(b"b".to_vec()), envelope(0))
            .unwrap();
    }

    #[test]
    fn test_mock_sink_deliveries_via_poll() {
        let mut sink = MockSink::new();
        sink.produce("t", Some(b"k"), Some(b"v".to_vec()), envelope(3))
            .unwrap();
        assert!(sink.poll(Duration::ZERO).is_empty());

        sink.ack_next();
        let deliveries = sink.poll(Duration::ZERO);
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].envelope.slot, 3);
        assert!(deliveries[0].error.is_none());
    }

    #[test]
    fn test_mock_sink_failed_delivery() {
        let mut sink = MockSink::new();
        sink.produce("t", None, None, envelope(0)).unwrap();
        sink.fail_next_delivery("broker went away");
        sink.ack_next();

        let deliveries = sink.poll(Duration::ZERO);
        assert_eq!(
            deliveries[0].error.as_deref(),
            Some("broker went away")
        );
    }

    #[test]
    fn test_mock_sink_auto_ack() {
        let mut sink = MockSink::new();
        sink.set_auto_ack(true);
        sink.produce("t", None, None, envelope(0)).unwrap();
        sink.produce("t", None, None, envelope(0)).unwrap();

        assert_eq!(sink.poll(Duration::ZERO).len(), 1);
        assert_eq!(sink.poll(Duration::ZERO).len(), 1);
        assert_eq!(sink.poll(Duration::ZERO).len(), 0);
    }
}
