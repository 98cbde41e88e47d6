//! Keys, values and the payload codecs that carry them.
//!
//! Key list layout, repeated per key:
//!
//! ```text
//! +-----------+-----------+-----------+
//! | table     | key len   | key bytes |
//! | 8 bytes LE| 3 bytes LE| variable  |
//! +-----------+-----------+-----------+
//! ```
//!
//! Pair list layout, repeated per pair:
//!
//! ```text
//! +-----------+-----------+-----------+-----------+-----------+
//! | table     | key len   | value len | key bytes | value     |
//! | 8 bytes LE| 3 bytes LE| 3 bytes LE| variable  | variable  |
//! +-----------+-----------+-----------+-----------+-----------+
//! ```
//!
//! Presence and sequence numbers are not part of the payload; they travel in
//! the message body tags.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Reserved sequence number, never assigned to a stored value.
pub const SEQNUM_INF: u64 = u64::MAX;

const TABLE_SIZE: usize = 8;
const LEN_SIZE: usize = 3;
const MAX_FIELD_LEN: usize = (1 << 24) - 1;

/// A key within a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Key {
    pub table: u64,
    pub key: Bytes,
}

impl Key {
    pub fn new(table: u64, key: impl Into<Bytes>) -> Self {
        Self {
            table,
            key: key.into(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},0x{}", self.table, hex::encode(&self.key))
    }
}

/// A stored value as seen by the client.
///
/// An absent value still carries the sequence number of its key, so a
/// caller can commit over a key it has only read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Value {
    pub present: bool,
    pub seqnum: u64,
    pub data: Bytes,
}

impl Value {
    /// A present value to be committed over `seqnum`.
    pub fn present(seqnum: u64, data: impl Into<Bytes>) -> Self {
        Self {
            present: true,
            seqnum,
            data: data.into(),
        }
    }

    /// A deletion (or read of a missing key) at `seqnum`.
    pub fn absent(seqnum: u64) -> Self {
        Self {
            present: false,
            seqnum,
            data: Bytes::new(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.present {
            write!(
                f,
                "present=1,seqnum={},0x{}",
                self.seqnum,
                hex::encode(&self.data)
            )
        } else {
            write!(f, "present=0,seqnum={}", self.seqnum)
        }
    }
}

fn put_len(dst: &mut BytesMut, len: usize) -> Result<(), ProtocolError> {
    if len > MAX_FIELD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            size: len,
            max: MAX_FIELD_LEN,
        });
    }
    dst.put_uint_le(len as u64, LEN_SIZE);
    Ok(())
}

fn get_len(src: &mut Bytes) -> Result<usize, ProtocolError> {
    if src.remaining() < LEN_SIZE {
        return Err(ProtocolError::Truncated {
            needed: LEN_SIZE,
            available: src.remaining(),
        });
    }
    Ok(src.get_uint_le(LEN_SIZE) as usize)
}

fn get_table(src: &mut Bytes) -> Result<u64, ProtocolError> {
    if src.remaining() < TABLE_SIZE {
        return Err(ProtocolError::Truncated {
            needed: TABLE_SIZE,
            available: src.remaining(),
        });
    }
    Ok(src.get_u64_le())
}

fn take(src: &mut Bytes, len: usize) -> Result<Bytes, ProtocolError> {
    if src.remaining() < len {
        return Err(ProtocolError::Truncated {
            needed: len,
            available: src.remaining(),
        });
    }
    Ok(src.split_to(len))
}

/// Appends a key list to `dst`. On error `dst` is restored.
pub fn encode_keys(dst: &mut BytesMut, keys: &[Key]) -> Result<(), ProtocolError> {
    let start = dst.len();
    for key in keys {
        dst.put_u64_le(key.table);
        if let Err(e) = put_len(dst, key.key.len()) {
            dst.truncate(start);
            return Err(e);
        }
        dst.put_slice(&key.key);
    }
    Ok(())
}

/// Parses a key list. Keys share the payload's allocation.
pub fn decode_keys(payload: &Bytes) -> Result<Vec<Key>, ProtocolError> {
    let mut src = payload.clone();
    let mut keys = Vec::new();
    while src.has_remaining() {
        let table = get_table(&mut src)?;
        let len = get_len(&mut src)?;
        let key = take(&mut src, len)?;
        keys.push(Key { table, key });
    }
    Ok(keys)
}

/// Appends a pair list to `dst`. Only value bytes are written; presence and
/// sequence numbers go in the message body. On error `dst` is restored.
pub fn encode_pairs(dst: &mut BytesMut, keys: &[Key], values: &[Value]) -> Result<(), ProtocolError> {
    if keys.len() != values.len() {
        return Err(ProtocolError::InvalidArgument("key and value counts differ"));
    }

    let start = dst.len();
    for (key, value) in keys.iter().zip(values) {
        dst.put_u64_le(key.table);
        let lens = put_len(dst, key.key.len()).and_then(|_| put_len(dst, value.data.len()));
        if let Err(e) = lens {
            dst.truncate(start);
            return Err(e);
        }
        dst.put_slice(&key.key);
        dst.put_slice(&value.data);
    }
    Ok(())
}

/// Parses a pair list.
///
/// Returned values are marked absent with sequence number 0; the caller fills
/// both in from the message body.
pub fn decode_pairs(payload: &Bytes) -> Result<(Vec<Key>, Vec<Value>), ProtocolError> {
    let mut src = payload.clone();
    let mut keys = Vec::new();
    let mut values = Vec::new();
    while src.has_remaining() {
        let table = get_table(&mut src)?;
        let klen = get_len(&mut src)?;
        let vlen = get_len(&mut src)?;
        let key = take(&mut src, klen)?;
        let data = take(&mut src, vlen)?;
        keys.push(Key { table, key });
        values.push(Value {
            present: false,
            seqnum: 0,
            data,
        });
    }
    Ok((keys, values))
}

/// Encoded size of a pair list without building it.
pub fn pairs_encoded_len(keys: &[Key], values: &[Value]) -> usize {
    keys.iter()
        .zip(values)
        .map(|(k, v)| TABLE_SIZE + 2 * LEN_SIZE + k.key.len() + v.data.len())
        .sum()
}
