//! # Replication stream interface
//!
//! The upstream side of the bridge: the state of the logical replication
//! stream, the transport operations the pipeline needs from it
//! ([`ReplicationLink`]), and the typed callback surface the frame reader
//! dispatches into ([`FrameHandler`]).

pub mod client;
pub mod frame;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Format an LSN the way the server does: high/low 32 bits in hex.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// Mutable state of the replication stream, observed and updated by the
/// pipeline.
#[derive(Debug, Clone)]
pub struct StreamState {
    /// Replication slot the stream is attached to
    pub slot_name: String,
    /// Logical decoding output plugin the slot was created with
    pub output_plugin: String,
    /// Name of the exported consistent snapshot, if one was taken
    pub snapshot_name: Option<String>,
    /// WAL position streaming started from
    pub start_lsn: u64,
    /// WAL position up to which data has been durably written to Kafka.
    /// Reported to the server on keepalives; becomes the restart position
    /// after a crash.
    pub fsync_lsn: u64,
    /// Whether the initial snapshot is still being consumed
    pub taking_snapshot: bool,
    /// Whether the slot was created by this session (vs. already existing)
    pub slot_created: bool,
    /// Operator asked to skip the initial snapshot on a fresh slot
    pub skip_snapshot: bool,
}

impl StreamState {
    pub fn new(slot_name: impl Into<String>) -> Self {
        Self {
            slot_name: slot_name.into(),
            output_plugin: crate::config::OUTPUT_PLUGIN.to_string(),
            snapshot_name: None,
            start_lsn: 0,
            fsync_lsn: 0,
            taking_snapshot: false,
            slot_created: false,
            skip_snapshot: false,
        }
    }
}

/// One protocol message received from the replication connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A WAL data frame carrying encoded change messages
    XLogData { wal_pos: u64, data: Bytes },
    /// Server keepalive; `reply_requested` means the server wants a standby
    /// status update promptly
    Keepalive { wal_end: u64, reply_requested: bool },
    /// Nothing arrived within the poll interval
    Idle,
    /// The server ended the stream
    Closed,
}

/// What the keepalive callback tells the frame reader about flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Everything received has been durably written; the reported LSN may
    /// advance to the keepalive position.
    Ready,
    /// Transactions are still awaiting commit or broker acknowledgement;
    /// the client-side LSN must not advance past them.
    SyncPending,
}

/// Transport operations the pipeline needs from the replication connection.
#[async_trait]
pub trait ReplicationLink: Send {
    /// Wait for the next protocol message, returning [`Incoming::Idle`]
    /// after the internal poll interval so the caller can make progress
    /// elsewhere.
    async fn recv(&mut self) -> Result<Incoming>;

    /// Send a standby status update reporting `fsync_lsn` as durably
    /// processed.
    async fn send_standby_status(&mut self, fsync_lsn: u64) -> Result<()>;

    /// Drop the replication slot. Used only when an in-progress initial
    /// snapshot fails, so the snapshot is retried cleanly on the next run.
    async fn drop_slot(&mut self, slot_name: &str) -> Result<()>;
}

/// Typed callbacks the frame reader dispatches into. All methods run on the
/// event-loop thread.
#[async_trait]
pub trait FrameHandler {
    async fn on_begin_txn(&mut self, wal_pos: u64, xid: u32) -> Result<()>;

    async fn on_commit_txn(&mut self, wal_pos: u64, xid: u32) -> Result<()>;

    async fn on_table_schema(
        &mut self,
        wal_pos: u64,
        relid: u32,
        key_schema_json: Option<&str>,
        row_schema_json: &str,
    ) -> Result<()>;

    async fn on_insert_row(
        &mut self,
        wal_pos: u64,
        relid: u32,
        key: Option<&[u8]>,
        new_row: &[u8],
    ) -> Result<()>;

    async fn on_update_row(
        &mut self,
        wal_pos: u64,
        relid: u32,
        key: Option<&[u8]>,
        old_row: Option<&[u8]>,
        new_row: &[u8],
    ) -> Result<()>;

    async fn on_delete_row(
        &mut self,
        wal_pos: u64,
        relid: u32,
        key: Option<&[u8]>,
        old_row: Option<&[u8]>,
    ) -> Result<()>;

    /// Return [`SyncStatus::Ready`] if the keepalive position may be
    /// acknowledged, [`SyncStatus::SyncPending`] while transactions are
    /// still in flight.
    fn on_keepalive(&mut self, wal_pos: u64) -> SyncStatus;

    /// Route a frame-reader client error through the error policy.
    fn on_error(&mut self, err: crate::error::BridgeError) -> Result<()>;
}

/// Scripted replication link for tests: hands out a fixed sequence of
/// messages and records every standby status update it is asked to send.
pub struct MockLink {
    incoming: std::collections::VecDeque<Incoming>,
    /// fsync LSNs reported via `send_standby_status`, in order.
    pub status_updates: Vec<u64>,
    /// Slots dropped via `drop_slot`.
    pub dropped_slots: Vec<String>,
}

impl MockLink {
    pub fn new(incoming: Vec<Incoming>) -> Self {
        Self {
            incoming: incoming.into(),
            status_updates: Vec::new(),
            dropped_slots: Vec::new(),
        }
    }
}

#[async_trait]
impl ReplicationLink for MockLink {
    async fn recv(&mut self) -> Result<Incoming> {
        Ok(self.incoming.pop_front().unwrap_or(Incoming::Closed))
    }

    async fn send_standby_status(&mut self, fsync_lsn: u64) -> Result<()> {
        self.status_updates.push(fsync_lsn);
        Ok(())
    }

    async fn drop_slot(&mut self, slot_name: &str) -> Result<()> {
        self.dropped_slots.push(slot_name.to_string());
        Ok(())
    }
}
