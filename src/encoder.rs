//! # Message encoders
//!
//! Serializes the (key, value) byte pairs delivered by the frame reader into
//! the on-wire form expected by downstream consumers.
//!
//! Two interchangeable variants:
//!
//! - **Avro**: prepends the Confluent wire-format header (magic byte `0x00`
//!   followed by the big-endian 4-byte schema id assigned by the registry)
//!   to the Avro-binary bytes.
//! - **JSON**: passes the raw JSON bytes through untouched.
//!
//! A missing key is preserved as a missing key (unkeyed tables); a missing
//! value is preserved as a null value body (tombstone semantics).

use crate::config::OutputFormat;
use crate::error::{BridgeError, Result};
use crate::mapper::TableMetadata;

/// Leading byte of the Confluent wire format.
pub const WIRE_FORMAT_MAGIC: u8 = 0x00;

/// Length of the wire-format header: magic byte plus big-endian schema id.
pub const WIRE_FORMAT_HEADER_LEN: usize = 5;

/// Encoder for outbound Kafka message keys and values.
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    format: OutputFormat,
}

impl Encoder {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Encode the message key for a table.
    pub fn encode_key(
        &self,
        table: &TableMetadata,
        key: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        match (self.format, key) {
            (_, None) => Ok(None),
            (OutputFormat::Json, Some(bytes)) => Ok(Some(bytes.to_vec())),
            (OutputFormat::Avro, Some(bytes)) => {
                let schema_id = table.key_schema_id.ok_or_else(|| {
                    BridgeError::encoding(&table.topic, "no registered key schema for keyed row")
                })?;
                Ok(Some(frame_avro(schema_id, bytes)))
            }
        }
    }

    /// Encode the message value for a table.
    pub fn encode_value(
        &self,
        table: &TableMetadata,
        value: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        match (self.format, value) {
            (_, None) => Ok(None),
            (OutputFormat::Json, Some(bytes)) => Ok(Some(bytes.to_vec())),
            (OutputFormat::Avro, Some(bytes)) => {
                let schema_id = table.row_schema_id.ok_or_else(|| {
                    BridgeError::encoding(&table.topic, "no registered row schema")
                })?;
                Ok(Some(frame_avro(schema_id, bytes)))
            }
        }
    }
}

/// Prepend the 5-byte wire-format header to an Avro-binary body.
pub fn frame_avro(schema_id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(WIRE_FORMAT_HEADER_LEN + body.len());
    out.push(WIRE_FORMAT_MAGIC);
    out.extend_from_slice(&schema_id.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Split a wire-format message back into its schema id and Avro body.
pub fn decode_avro_frame(buf: &[u8]) -> Result<(u32, &[u8])> {
    if buf.len() < WIRE_FORMAT_HEADER_LEN {
        return Err(BridgeError::encoding(
            "<frame>",
            format!("wire-format message too short: {} bytes", buf.len()),
        ));
    }
    if buf[0] != WIRE_FORMAT_MAGIC {
        return Err(BridgeError::encoding(
            "<frame>",
            format!("bad wire-format magic byte: 0x{:02x}", buf[0]),
        ));
    }
    let schema_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    Ok((schema_id, &buf[WIRE_FORMAT_HEADER_LEN..]))
}
