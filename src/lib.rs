//! # bottledwater - PostgreSQL to Kafka change-data-capture bridge
//!
//! Attaches to a PostgreSQL logical-replication stream, consumes a
//! consistent initial snapshot followed by row-level change events, and
//! publishes each change to a Kafka topic derived from the table name.
//!
//! ## Guarantees
//!
//! - No row change is lost across process restarts: the server-side WAL
//!   retention only advances past changes Kafka has durably acknowledged.
//! - At-least-once delivery: messages may be duplicated after a restart,
//!   never dropped (except in the operator-opted `--on-error=log` mode).
//! - Per-key ordering: all updates to the same row land on the same
//!   partition, which log compaction of tombstones depends on.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   frames    ┌────────────────┐  enqueue  ┌───────────┐
//! │ PostgreSQL ├────────────▶│    Producer    ├──────────▶│   Kafka   │
//! │  walsender │             │ ring · mapper  │           │  brokers  │
//! └─────▲──────┘             │    encoder     │◀──────────┴───────────┘
//!       │      fsync-LSN     └───────┬────────┘  delivery acks
//!       └────────────────────────────┘
//!              standby status        checkpoint engine
//! ```
//!
//! The event loop is single-threaded: frame callbacks, delivery reports,
//! and the checkpoint walk are serialized through the driver's poll call.

pub mod config;
pub mod encoder;
pub mod error;
pub mod kafka;
pub mod mapper;
pub mod process;
pub mod producer;
pub mod registry;
pub mod replication;
pub mod sink;
pub mod transaction;

pub use config::{Cli, ErrorPolicy, OutputFormat};
pub use encoder::Encoder;
pub use error::{BridgeError, Result};
pub use kafka::RdKafkaSink;
pub use mapper::{TableMapper, TableMetadata};
pub use process::{PidFile, Shutdown};
pub use producer::Producer;
pub use registry::{HttpSchemaRegistry, NullRegistry, SchemaRegistry};
pub use replication::client::PgReplicationLink;
pub use replication::{
    FrameHandler, Incoming, MockLink, ReplicationLink, StreamState, SyncStatus,
};
pub use sink::{Delivery, KafkaSink, MessageEnvelope, MockSink, ProduceError};
pub use transaction::{TransactionEntry, TransactionRing, MAX_IN_FLIGHT_TRANSACTIONS, SNAPSHOT_XID};
