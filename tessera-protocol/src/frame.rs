//! Binary envelope shared by every protocol family.
//!
//! Frame layout (all integers little-endian):
//!
//! ```text
//! +-------+--------+---------+---------+
//! | magic | length | buffers | blobs   |
//! | 2     | 3      | 1       | 1       |
//! +-------+--------+---------+---------+------------------------+
//! | tagged buffers, in order                                    |
//! +-------------------------------------------------------------+
//! | per non-empty blob: index (1) | length (3) | bytes          |
//! +-------------------------------------------------------------+
//! | end-of-message magic 0x69e1 (2)                             |
//! +-------------------------------------------------------------+
//! ```
//!
//! `length` covers the whole frame including the header. The first tagged
//! buffer is the routing header and must carry [`TAG_CLIENT_ID`] and
//! [`TAG_REQUEST_ID`].

use crate::error::ProtocolError;
use crate::tagged::{bit, TaggedBuffer};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Trailing magic closing every frame.
pub const EOM_MAGIC: u16 = 0x69e1;

/// Size of the fixed envelope header (2+3+1+1 = 7).
pub const ENVELOPE_HEADER_SIZE: usize = 7;

/// Size of the envelope trailer.
pub const ENVELOPE_TRAILER_SIZE: usize = 2;

/// Largest frame the 3-byte length field can describe.
pub const MAX_FRAME_SIZE: usize = (1 << 24) - 1;

/// Blob indices are one byte on the wire.
pub const MAX_BLOBS: usize = 256;

const BLOB_RECORD_HEADER: usize = 4;

// Routing header tags, common to all protocol families.
pub const TAG_CLIENT_ID: u8 = 0;
pub const TAG_REQUEST_ID: u8 = 1;
/// Remaining time budget granted to the server, in microseconds.
pub const TAG_ALLOWANCE: u8 = 2;
pub const TAG_SERVICE_TIME: u8 = 3;
/// Congestion signal set by the server.
pub const TAG_ECN: u8 = 4;

const ROUTING_MASK: u64 = bit(TAG_CLIENT_ID) | bit(TAG_REQUEST_ID);

/// Routing information extracted by [`consumable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Total length of the frame in bytes.
    pub len: usize,
    pub request_id: u64,
    pub client_id: u64,
}

/// Result of pre-scanning a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumable {
    /// Not enough bytes buffered yet.
    Incomplete,
    /// A complete frame sits at the front of the buffer.
    Ready(FrameInfo),
    /// The stream cannot be realigned; the connection must be dropped.
    Corrupt,
}

fn put_u24_le(dst: &mut [u8], value: usize) {
    dst[0] = value as u8;
    dst[1] = (value >> 8) as u8;
    dst[2] = (value >> 16) as u8;
}

fn get_u24_le(src: &mut &[u8]) -> usize {
    let value = src[0] as usize | (src[1] as usize) << 8 | (src[2] as usize) << 16;
    src.advance(3);
    value
}

/// Appends one frame to `dst` and returns its length.
///
/// Empty blobs are skipped; a blob's position in `blobs` is its wire index.
/// On error nothing is appended.
pub fn serialize(
    dst: &mut BytesMut,
    magic: u16,
    buffers: &[&TaggedBuffer],
    blobs: &[&[u8]],
) -> Result<usize, ProtocolError> {
    if buffers.len() > u8::MAX as usize {
        return Err(ProtocolError::InvalidArgument("too many tagged buffers"));
    }
    if blobs.len() > MAX_BLOBS {
        return Err(ProtocolError::TooManyBlobs {
            index: blobs.len() - 1,
            max: MAX_BLOBS - 1,
        });
    }

    let start = dst.len();
    dst.put_u16_le(magic);
    dst.put_slice(&[0; 3]); // length, patched below
    dst.put_u8(buffers.len() as u8);
    dst.put_u8(0); // blob count, patched below

    for buffer in buffers {
        buffer.encode(dst);
    }

    let mut non_empty = 0usize;
    for (index, blob) in blobs.iter().enumerate() {
        if blob.is_empty() {
            continue;
        }
        if non_empty == u8::MAX as usize {
            dst.truncate(start);
            return Err(ProtocolError::TooManyBlobs {
                index,
                max: u8::MAX as usize - 1,
            });
        }
        if blob.len() > MAX_FRAME_SIZE {
            dst.truncate(start);
            return Err(ProtocolError::FrameTooLarge {
                size: blob.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        dst.put_u8(index as u8);
        let mut len = [0; 3];
        put_u24_le(&mut len, blob.len());
        dst.put_slice(&len);
        dst.put_slice(blob);
        non_empty += 1;
    }

    dst.put_u16_le(EOM_MAGIC);

    let len = dst.len() - start;
    if len > MAX_FRAME_SIZE {
        dst.truncate(start);
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    put_u24_le(&mut dst[start + 2..start + 5], len);
    dst[start + 6] = non_empty as u8;

    Ok(len)
}

/// Parses a complete frame into `buffers` and `blobs`.
///
/// `buffers.len()` must match the frame's buffer count exactly; `blobs` is
/// the capacity for blob slots, all of which are cleared before the frame's
/// blobs are filled in. Blob bytes share `frame`'s allocation. Nothing is
/// modified unless the whole frame validates.
pub fn deserialize(
    frame: &Bytes,
    magic: u16,
    buffers: &mut [&mut TaggedBuffer],
    blobs: &mut [Bytes],
) -> Result<(), ProtocolError> {
    let mut src: &[u8] = frame;

    if src.len() < ENVELOPE_HEADER_SIZE + ENVELOPE_TRAILER_SIZE {
        return Err(ProtocolError::Truncated {
            needed: ENVELOPE_HEADER_SIZE + ENVELOPE_TRAILER_SIZE,
            available: src.len(),
        });
    }

    let actual_magic = src.get_u16_le();
    if actual_magic != magic {
        return Err(ProtocolError::InvalidMagic {
            expected: magic,
            actual: actual_magic,
        });
    }

    let declared = get_u24_le(&mut src);
    if declared != frame.len() {
        return Err(ProtocolError::Malformed("length mismatch"));
    }

    let buffer_count = src.get_u8() as usize;
    if buffer_count != buffers.len() {
        return Err(ProtocolError::Malformed("unexpected tagged buffer count"));
    }

    let blob_count = src.get_u8() as usize;
    if blob_count > blobs.len() {
        return Err(ProtocolError::Malformed("too many blobs"));
    }

    let mut scratch = vec![TaggedBuffer::new(); buffer_count];
    for buffer in scratch.iter_mut() {
        buffer.decode(&mut src)?;
    }

    let mut slices = Vec::with_capacity(blob_count);
    for _ in 0..blob_count {
        if src.len() < BLOB_RECORD_HEADER {
            return Err(ProtocolError::Malformed("truncated blob record"));
        }
        let index = src.get_u8() as usize;
        if index >= blobs.len() {
            return Err(ProtocolError::Malformed("blob index out of range"));
        }
        let len = get_u24_le(&mut src);
        if src.len() < len {
            return Err(ProtocolError::Malformed("blob exceeds frame"));
        }
        let offset = frame.len() - src.len();
        slices.push((index, offset, len));
        src.advance(len);
    }

    if src.len() != ENVELOPE_TRAILER_SIZE {
        return Err(ProtocolError::Malformed("bad frame trailer"));
    }
    if src.get_u16_le() != EOM_MAGIC {
        return Err(ProtocolError::Malformed("bad end-of-message magic"));
    }

    for (target, decoded) in buffers.iter_mut().zip(scratch) {
        **target = decoded;
    }
    for slot in blobs.iter_mut() {
        *slot = Bytes::new();
    }
    for (index, offset, len) in slices {
        blobs[index] = frame.slice(offset..offset + len);
    }

    Ok(())
}

/// Checks whether `buf` starts with a complete frame without parsing blobs.
///
/// Only the envelope header and the routing header buffer are inspected.
pub fn consumable(buf: &[u8], magic: u16) -> Consumable {
    if buf.len() < 5 {
        return Consumable::Incomplete;
    }

    let mut src = buf;
    if src.get_u16_le() != magic {
        return Consumable::Corrupt;
    }

    let len = get_u24_le(&mut src);
    if len < ENVELOPE_HEADER_SIZE + ENVELOPE_TRAILER_SIZE {
        return Consumable::Corrupt;
    }
    if len > buf.len() {
        return Consumable::Incomplete;
    }

    let frame = &buf[..len];
    if frame[5] == 0 {
        return Consumable::Corrupt;
    }

    let mut header_src = &frame[ENVELOPE_HEADER_SIZE..];
    let mut header = TaggedBuffer::new();
    if header.decode(&mut header_src).is_err() || !header.has_all(ROUTING_MASK) {
        return Consumable::Corrupt;
    }

    Consumable::Ready(FrameInfo {
        len,
        request_id: header.get_or(TAG_REQUEST_ID, 0),
        client_id: header.get_or(TAG_CLIENT_ID, 0),
    })
}
