//! # Producer pipeline
//!
//! The ingest dispatcher, enqueue path, checkpoint engine, backpressure
//! loop, and delivery handling, wired around the transaction ring. One
//! event-loop thread owns all of this state: the frame reader's callbacks,
//! the Kafka driver's delivery reports, and the checkpoint walk are all
//! serialized through `poll`, which is what makes the plain counter
//! arithmetic sound.
//!
//! ## Data flow
//!
//! ```text
//! frame reader ──▶ dispatcher ──▶ (ring, mapper, encoder) ──▶ Kafka enqueue
//! Kafka driver ──▶ delivery ──▶ ring ──▶ checkpoint ──▶ stream fsync-LSN
//! ```

use crate::config::ErrorPolicy;
use crate::encoder::Encoder;
use crate::error::{BridgeError, Result};
use crate::mapper::TableMapper;
use crate::process::Shutdown;
use crate::replication::frame::decode_frame;
use crate::replication::{
    format_lsn, FrameHandler, Incoming, ReplicationLink, StreamState, SyncStatus,
};
use crate::sink::{Delivery, KafkaSink, MessageEnvelope, ProduceError};
use crate::transaction::{TransactionRing, MAX_IN_FLIGHT_TRANSACTIONS, SNAPSHOT_XID};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one backpressure iteration lets the Kafka driver work.
pub const KAFKA_POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Bounded drain of the producer queue on shutdown.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The producer pipeline.
pub struct Producer<S: KafkaSink, L: ReplicationLink> {
    encoder: Encoder,
    policy: ErrorPolicy,
    ring: TransactionRing,
    mapper: TableMapper,
    sink: S,
    link: L,
    stream: StreamState,
    shutdown: Shutdown,
}

impl<S: KafkaSink + Send, L: ReplicationLink> Producer<S, L> {
    pub fn new(
        encoder: Encoder,
        policy: ErrorPolicy,
        mapper: TableMapper,
        sink: S,
        link: L,
        stream: StreamState,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            encoder,
            policy,
            ring: TransactionRing::new(MAX_IN_FLIGHT_TRANSACTIONS),
            mapper,
            sink,
            link,
            stream,
            shutdown,
        }
    }

    /// Replace the default ring capacity. Intended for tests that exercise
    /// backpressure without queueing a thousand transactions.
    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring = TransactionRing::new(capacity);
        self
    }

    pub fn stream(&self) -> &StreamState {
        &self.stream
    }

    pub fn ring(&self) -> &TransactionRing {
        &self.ring
    }

    pub fn mapper(&self) -> &TableMapper {
        &self.mapper
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Main event loop: alternate between the replication connection and
    /// the Kafka driver until shutdown or end of stream.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_inner().await;
        match result {
            Err(BridgeError::Shutdown) => Ok(()),
            other => other,
        }
    }

    async fn run_inner(&mut self) -> Result<()> {
        while !self.shutdown.is_shutdown() {
            if self.shutdown.take_reload() {
                info!("reload requested; table metadata refreshes on the next schema frame");
            }

            match self.link.recv().await? {
                Incoming::XLogData { wal_pos: _, data } => {
                    let messages = match decode_frame(data) {
                        Ok(messages) => messages,
                        Err(e) => {
                            self.on_error(BridgeError::frame(e.to_string()))?;
                            continue;
                        }
                    };
                    for message in messages {
                        if let Err(e) = message.dispatch(self).await {
                            self.on_error(e)?;
                        }
                    }
                }
                Incoming::Keepalive {
                    wal_end,
                    reply_requested,
                } => match self.on_keepalive(wal_end) {
                    SyncStatus::Ready => {
                        self.link.send_standby_status(self.stream.fsync_lsn).await?;
                    }
                    SyncStatus::SyncPending => {
                        if reply_requested {
                            self.link.send_standby_status(self.stream.fsync_lsn).await?;
                        }
                    }
                },
                Incoming::Idle => {
                    // Keep the server advancing WAL retention while the
                    // stream is quiet.
                    self.link.send_standby_status(self.stream.fsync_lsn).await?;
                }
                Incoming::Closed => {
                    info!("replication stream ended");
                    break;
                }
            }

            self.pump_deliveries(Duration::ZERO)?;
        }

        Ok(())
    }

    /// Poll the Kafka driver and handle every delivery that completed.
    pub fn pump_deliveries(&mut self, timeout: Duration) -> Result<()> {
        for delivery in self.sink.poll(timeout) {
            self.on_delivery(delivery)?;
        }
        Ok(())
    }

    /// Handle one completed delivery: route failures through the error
    /// policy, settle the owning transaction's pending count, and try to
    /// advance the checkpoint.
    pub fn on_delivery(&mut self, delivery: Delivery) -> Result<()> {
        if let Some(reason) = delivery.error {
            // In log mode the failure is swallowed and the message still
            // counts as settled. That is deliberate data loss the operator
            // opted into.
            self.handle_transient(BridgeError::delivery(delivery.topic, reason))?;
        }

        let envelope = delivery.envelope;
        if !self.ring.contains(envelope.slot) {
            // The transaction was already checkpointed (possible after a
            // swallowed failure in log mode); nothing to settle.
            warn!(
                xid = envelope.xid,
                slot = envelope.slot,
                "stale delivery ack ignored"
            );
            return Ok(());
        }

        match self.ring.get_mut(envelope.slot) {
            Some(entry) if entry.xid == envelope.xid => {
                if entry.pending_events == 0 {
                    return Err(BridgeError::invariant(format!(
                        "delivery ack for xid {} with no pending events",
                        envelope.xid
                    )));
                }
                entry.pending_events -= 1;
            }
            _ => {
                // Slot reused by a newer transaction; nothing to settle.
                warn!(
                    xid = envelope.xid,
                    slot = envelope.slot,
                    "stale delivery ack ignored"
                );
                return Ok(());
            }
        }

        self.advance_checkpoint();
        Ok(())
    }

    /// Checkpoint engine: walk the ring from the tail while the oldest
    /// transaction is fully acknowledged and committed, advancing the
    /// stream's fsync-LSN in commit order.
    fn advance_checkpoint(&mut self) {
        while !self.ring.is_empty() {
            let entry = *self.ring.tail();
            if !entry.is_closed() {
                break;
            }
            // The snapshot transaction is "closed" before its commit frame
            // arrives, but while it is still filling from the stream the
            // tail must not move past it.
            if entry.xid == SNAPSHOT_XID && entry.commit_lsn == 0 {
                break;
            }

            if self.stream.fsync_lsn > entry.commit_lsn {
                warn!(
                    "commits not in WAL order! checkpoint LSN is {}, commit LSN is {}",
                    format_lsn(self.stream.fsync_lsn),
                    format_lsn(entry.commit_lsn)
                );
            } else if self.stream.fsync_lsn < entry.commit_lsn {
                debug!(
                    "checkpointing {} events for xid {}, WAL position {}",
                    entry.received_events,
                    entry.xid,
                    format_lsn(entry.commit_lsn)
                );
            }

            // Monotonic: an out-of-order commit never moves the restart
            // position backwards.
            self.stream.fsync_lsn = self.stream.fsync_lsn.max(entry.commit_lsn);

            if entry.xid == SNAPSHOT_XID && entry.commit_lsn > 0 {
                // The initial snapshot is durable in Kafka.
                self.stream.taking_snapshot = false;
            }

            self.ring.advance_tail();
        }
    }

    /// One backpressure iteration: let the Kafka driver drain for a while,
    /// notice shutdown requests, and keep the replication connection alive.
    /// Callers loop on this until their blocking condition clears.
    async fn backpressure(&mut self) -> Result<()> {
        self.pump_deliveries(KAFKA_POLL_TIMEOUT)?;

        if self.shutdown.is_shutdown() {
            info!("shutdown requested during backpressure");
            return Err(BridgeError::Shutdown);
        }

        self.link
            .send_standby_status(self.stream.fsync_lsn)
            .await
            .map_err(|e| {
                BridgeError::replication(format!(
                    "while sending standby status update for keepalive: {}",
                    e
                ))
            })
    }

    /// Enqueue one message to Kafka on behalf of the head transaction.
    async fn send_kafka_msg(
        &mut self,
        wal_pos: u64,
        relid: u32,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<()> {
        let slot = self.ring.head_slot();
        let xid = self.ring.head().xid;
        self.ring.head_mut().received_events += 1;
        self.ring.head_mut().pending_events += 1;

        let envelope = MessageEnvelope {
            slot,
            xid,
            wal_pos,
            relid,
        };

        let table = match self.mapper.lookup(relid) {
            Some(table) => table.clone(),
            None => {
                self.ring.head_mut().received_events -= 1;
                self.ring.head_mut().pending_events -= 1;
                return Err(BridgeError::invariant(format!(
                    "relid {} has no registered schema",
                    relid
                )));
            }
        };

        let (encoded_key, encoded_value) = match self.encode_pair(&table, key, value) {
            Ok(pair) => pair,
            Err(e) => {
                self.ring.head_mut().received_events -= 1;
                self.ring.head_mut().pending_events -= 1;
                return Err(e);
            }
        };

        // If data from Postgres is coming in faster than we can send it on
        // to Kafka, block until the producer's queue has drained a bit.
        let mut pending_value = encoded_value;
        loop {
            match self.sink.produce(
                &table.topic,
                encoded_key.as_deref(),
                pending_value.take(),
                envelope,
            ) {
                Ok(()) => break,
                Err(ProduceError::QueueFull { value }) => {
                    debug!("Kafka producer queue is full, applying backpressure");
                    pending_value = value;
                    self.backpressure().await?;
                }
                Err(ProduceError::Fatal(e)) => {
                    // The message never reached the driver, so it must not
                    // be counted as awaiting acknowledgement.
                    self.ring.head_mut().pending_events -= 1;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn encode_pair(
        &self,
        table: &crate::mapper::TableMetadata,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        let encoded_key = self.encoder.encode_key(table, key)?;
        let encoded_value = self.encoder.encode_value(table, value)?;
        Ok((encoded_key, encoded_value))
    }

    /// Route a transient error through the configured policy; fatal errors
    /// pass straight through.
    fn handle_transient(&mut self, err: BridgeError) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }
        match self.policy {
            ErrorPolicy::Log => {
                error!("{}", err);
                Ok(())
            }
            ErrorPolicy::Exit => Err(err),
        }
    }

    /// Shutdown half of the lifecycle: drop the slot if a snapshot was cut
    /// short, then drain the producer queue within a bounded timeout.
    pub async fn shutdown(&mut self, status: i32) {
        if self.stream.taking_snapshot && status != 0 {
            info!("dropping replication slot since the snapshot did not complete successfully");
            let slot_name = self.stream.slot_name.clone();
            if let Err(e) = self.link.drop_slot(&slot_name).await {
                // Logged but never masks the original exit status.
                error!("failed to drop replication slot: {}", e);
            }
        }

        if let Err(e) = self.sink.flush(SHUTDOWN_DRAIN_TIMEOUT) {
            warn!("Kafka drain on shutdown incomplete: {}", e);
        }
    }
}

#[async_trait]
impl<S: KafkaSink + Send, L: ReplicationLink> FrameHandler for Producer<S, L> {
    async fn on_begin_txn(&mut self, _wal_pos: u64, xid: u32) -> Result<()> {
        if xid == SNAPSHOT_XID {
            if !(self.ring.tail_slot() == 0 && self.ring.is_empty()) {
                return Err(BridgeError::invariant(
                    "expected snapshot to be the first transaction",
                ));
            }
            info!(
                "created replication slot \"{}\", capturing consistent snapshot \"{}\"",
                self.stream.slot_name,
                self.stream.snapshot_name.as_deref().unwrap_or("")
            );
        }

        // A full ring means too many transactions are waiting on Kafka;
        // block the ingest path until one of them closes.
        while self.ring.is_full() {
            debug!("too many transactions in flight, applying backpressure");
            self.backpressure().await?;
        }

        self.ring.begin(xid);
        Ok(())
    }

    async fn on_commit_txn(&mut self, wal_pos: u64, xid: u32) -> Result<()> {
        if xid == SNAPSHOT_XID {
            info!(
                "snapshot complete, streaming changes from {}",
                format_lsn(wal_pos)
            );
        }

        let head = self.ring.head_mut();
        if head.xid != xid {
            return Err(BridgeError::invariant(format!(
                "mismatched begin/commit events (xid {} in flight, xid {} committed)",
                head.xid, xid
            )));
        }

        head.commit_lsn = wal_pos;
        self.advance_checkpoint();
        Ok(())
    }

    async fn on_table_schema(
        &mut self,
        _wal_pos: u64,
        relid: u32,
        key_schema_json: Option<&str>,
        row_schema_json: &str,
    ) -> Result<()> {
        let result = async {
            let topic = self.mapper.derive_topic(row_schema_json)?;
            self.sink.create_topic(&topic)?;
            self.mapper
                .update(relid, topic, key_schema_json, row_schema_json)
                .await?;
            Ok::<_, BridgeError>(())
        }
        .await;

        // A mapper failure cannot safely abort from inside the callback;
        // it is reported and the relation stays unmapped, which turns into
        // a fatal unknown-relid if a row event for it arrives.
        if let Err(e) = result {
            error!(relid, "failed to update table metadata: {}", e);
        }
        Ok(())
    }

    async fn on_insert_row(
        &mut self,
        wal_pos: u64,
        relid: u32,
        key: Option<&[u8]>,
        new_row: &[u8],
    ) -> Result<()> {
        self.send_kafka_msg(wal_pos, relid, key, Some(new_row))
            .await
    }

    async fn on_update_row(
        &mut self,
        wal_pos: u64,
        relid: u32,
        key: Option<&[u8]>,
        _old_row: Option<&[u8]>,
        new_row: &[u8],
    ) -> Result<()> {
        self.send_kafka_msg(wal_pos, relid, key, Some(new_row))
            .await
    }

    async fn on_delete_row(
        &mut self,
        wal_pos: u64,
        relid: u32,
        key: Option<&[u8]>,
        _old_row: Option<&[u8]>,
    ) -> Result<()> {
        match key {
            // Tombstone: same key, null value, so log compaction can
            // collect the row.
            Some(key) => self.send_kafka_msg(wal_pos, relid, Some(key), None).await,
            // Delete on an unkeyed table cannot be represented.
            None => Ok(()),
        }
    }

    fn on_keepalive(&mut self, wal_pos: u64) -> SyncStatus {
        if self.ring.is_empty() {
            // Everything received is durable; the keepalive position is
            // safe to acknowledge.
            self.stream.fsync_lsn = self.stream.fsync_lsn.max(wal_pos);
            SyncStatus::Ready
        } else {
            SyncStatus::SyncPending
        }
    }

    fn on_error(&mut self, err: BridgeError) -> Result<()> {
        self.handle_transient(err)
    }
}
