//! Change-frame codec
//!
//! Decodes the change frames carried inside XLogData messages into typed
//! messages for the ingest dispatcher. Each frame holds one or more tagged
//! messages: big-endian fixed-width fields, length-prefixed blobs, and a
//! presence byte in front of optional blobs. [`FrameBuilder`] is the
//! matching encoder and doubles as the reference implementation of the
//! layout for tests.

use super::FrameHandler;
use crate::error::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame decoding errors
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("invalid message tag: 0x{0:02x}")]
    InvalidTag(u8),
    #[error("blob too large: {0} bytes")]
    BlobTooLarge(u32),
    #[error("UTF8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Upper bound on a single blob, to fail fast on corrupt length prefixes.
const MAX_BLOB_LEN: u32 = 64 * 1024 * 1024;

/// One decoded change message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameMessage {
    Begin {
        wal_pos: u64,
        xid: u32,
    },
    Commit {
        wal_pos: u64,
        xid: u32,
    },
    TableSchema {
        wal_pos: u64,
        relid: u32,
        key_schema: Option<String>,
        row_schema: String,
    },
    Insert {
        wal_pos: u64,
        relid: u32,
        key: Option<Bytes>,
        new_row: Bytes,
    },
    Update {
        wal_pos: u64,
        relid: u32,
        key: Option<Bytes>,
        old_row: Option<Bytes>,
        new_row: Bytes,
    },
    Delete {
        wal_pos: u64,
        relid: u32,
        key: Option<Bytes>,
        old_row: Option<Bytes>,
    },
}

impl FrameMessage {
    /// Dispatch this message into the matching handler callback.
    pub async fn dispatch<H: FrameHandler + Send>(self, handler: &mut H) -> Result<()> {
        match self {
            FrameMessage::Begin { wal_pos, xid } => handler.on_begin_txn(wal_pos, xid).await,
            FrameMessage::Commit { wal_pos, xid } => handler.on_commit_txn(wal_pos, xid).await,
            FrameMessage::TableSchema {
                wal_pos,
                relid,
                key_schema,
                row_schema,
            } => {
                handler
                    .on_table_schema(wal_pos, relid, key_schema.as_deref(), &row_schema)
                    .await
            }
            FrameMessage::Insert {
                wal_pos,
                relid,
                key,
                new_row,
            } => {
                handler
                    .on_insert_row(wal_pos, relid, key.as_deref(), &new_row)
                    .await
            }
            FrameMessage::Update {
                wal_pos,
                relid,
                key,
                old_row,
                new_row,
            } => {
                handler
                    .on_update_row(wal_pos, relid, key.as_deref(), old_row.as_deref(), &new_row)
                    .await
            }
            FrameMessage::Delete {
                wal_pos,
                relid,
                key,
                old_row,
            } => {
                handler
                    .on_delete_row(wal_pos, relid, key.as_deref(), old_row.as_deref())
                    .await
            }
        }
    }
}

/// Decode every message in one frame.
pub fn decode_frame(mut data: Bytes) -> std::result::Result<Vec<FrameMessage>, FrameError> {
    let mut messages = Vec::new();
    while data.has_remaining() {
        messages.push(decode_message(&mut data)?);
    }
    Ok(messages)
}

fn decode_message(buf: &mut Bytes) -> std::result::Result<FrameMessage, FrameError> {
    let tag = get_u8(buf)?;
    let wal_pos = get_u64(buf)?;

    match tag {
        b'B' => Ok(FrameMessage::Begin {
            wal_pos,
            xid: get_u32(buf)?,
        }),
        b'C' => Ok(FrameMessage::Commit {
            wal_pos,
            xid: get_u32(buf)?,
        }),
        b'S' => {
            let relid = get_u32(buf)?;
            let key_schema = match get_optional_blob(buf)? {
                Some(bytes) => Some(String::from_utf8(bytes.to_vec())?),
                None => None,
            };
            let row_schema = String::from_utf8(get_blob(buf)?.to_vec())?;
            Ok(FrameMessage::TableSchema {
                wal_pos,
                relid,
                key_schema,
                row_schema,
            })
        }
        b'I' => {
            let relid = get_u32(buf)?;
            let key = get_optional_blob(buf)?;
            let new_row = get_blob(buf)?;
            Ok(FrameMessage::Insert {
                wal_pos,
                relid,
                key,
                new_row,
            })
        }
        b'U' => {
            let relid = get_u32(buf)?;
            let key = get_optional_blob(buf)?;
            let old_row = get_optional_blob(buf)?;
            let new_row = get_blob(buf)?;
            Ok(FrameMessage::Update {
                wal_pos,
                relid,
                key,
                old_row,
                new_row,
            })
        }
        b'D' => {
            let relid = get_u32(buf)?;
            let key = get_optional_blob(buf)?;
            let old_row = get_optional_blob(buf)?;
            Ok(FrameMessage::Delete {
                wal_pos,
                relid,
                key,
                old_row,
            })
        }
        t => Err(FrameError::InvalidTag(t)),
    }
}

fn get_u8(buf: &mut Bytes) -> std::result::Result<u8, FrameError> {
    if buf.remaining() < 1 {
        return Err(FrameError::NotEnoughData);
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> std::result::Result<u32, FrameError> {
    if buf.remaining() < 4 {
        return Err(FrameError::NotEnoughData);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> std::result::Result<u64, FrameError> {
    if buf.remaining() < 8 {
        return Err(FrameError::NotEnoughData);
    }
    Ok(buf.get_u64())
}

fn get_blob(buf: &mut Bytes) -> std::result::Result<Bytes, FrameError> {
    let len = get_u32(buf)?;
    if len > MAX_BLOB_LEN {
        return Err(FrameError::BlobTooLarge(len));
    }
    if buf.remaining() < len as usize {
        return Err(FrameError::NotEnoughData);
    }
    Ok(buf.copy_to_bytes(len as usize))
}

fn get_optional_blob(buf: &mut Bytes) -> std::result::Result<Option<Bytes>, FrameError> {
    match get_u8(buf)? {
        0 => Ok(None),
        _ => Ok(Some(get_blob(buf)?)),
    }
}

/// Reference encoder for change frames.
#[derive(Default)]
pub struct FrameBuilder {
    buf: BytesMut,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(mut self, wal_pos: u64, xid: u32) -> Self {
        self.buf.put_u8(b'B');
        self.buf.put_u64(wal_pos);
        self.buf.put_u32(xid);
        self
    }

    pub fn commit(mut self, wal_pos: u64, xid: u32) -> Self {
        self.buf.put_u8(b'C');
        self.buf.put_u64(wal_pos);
        self.buf.put_u32(xid);
        self
    }

    pub fn table_schema(
        mut self,
        wal_pos: u64,
        relid: u32,
        key_schema: Option<&str>,
        row_schema: &str,
    ) -> Self {
        self.buf.put_u8(b'S');
        self.buf.put_u64(wal_pos);
        self.buf.put_u32(relid);
        self.put_optional_blob(key_schema.map(str::as_bytes));
        self.put_blob(row_schema.as_bytes());
        self
    }

    pub fn insert(mut self, wal_pos: u64, relid: u32, key: Option<&[u8]>, new_row: &[u8]) -> Self {
        self.buf.put_u8(b'I');
        self.buf.put_u64(wal_pos);
        self.buf.put_u32(relid);
        self.put_optional_blob(key);
        self.put_blob(new_row);
        self
    }

    pub fn update(
        mut self,
        wal_pos: u64,
        relid: u32,
        key: Option<&[u8]>,
        old_row: Option<&[u8]>,
        new_row: &[u8],
    ) -> Self {
        self.buf.put_u8(b'U');
        self.buf.put_u64(wal_pos);
        self.buf.put_u32(relid);
        self.put_optional_blob(key);
        self.put_optional_blob(old_row);
        self.put_blob(new_row);
        self
    }

    pub fn delete(
        mut self,
        wal_pos: u64,
        relid: u32,
        key: Option<&[u8]>,
        old_row: Option<&[u8]>,
    ) -> Self {
        self.buf.put_u8(b'D');
        self.buf.put_u64(wal_pos);
        self.buf.put_u32(relid);
        self.put_optional_blob(key);
        self.put_optional_blob(old_row);
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    fn put_blob(&mut self, bytes: &[u8]) {
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    fn put_optional_blob(&mut self, bytes: Option<&[u8]>) {
        match bytes {
            Some(bytes) => {
                self.buf.put_u8(1);
                self.put_blob(bytes);
            }
            None => self.buf.put_u8(0),
        }
    }
}
