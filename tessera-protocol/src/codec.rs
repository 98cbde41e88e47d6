//! Incremental frame extraction from a byte stream.

use crate::error::ProtocolError;
use crate::frame::{consumable, Consumable, FrameInfo};
use bytes::{Bytes, BytesMut};

/// Default initial receive buffer capacity (8 KiB).
pub const DEFAULT_DECODER_CAPACITY: usize = 8 * 1024;

/// Splits complete frames off the front of a growing receive buffer.
pub struct FrameDecoder {
    magic: u16,
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new(magic: u16) -> Self {
        Self::with_capacity(magic, DEFAULT_DECODER_CAPACITY)
    }

    pub fn with_capacity(magic: u16, capacity: usize) -> Self {
        Self {
            magic,
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Direct access for socket reads (`AsyncReadExt::read_buf`).
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Attempts to split the next complete frame off the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed and
    /// [`ProtocolError::CorruptStream`] when the buffer can no longer be
    /// trusted to be frame-aligned.
    pub fn next_frame(&mut self) -> Result<Option<(FrameInfo, Bytes)>, ProtocolError> {
        match consumable(&self.buffer, self.magic) {
            Consumable::Incomplete => Ok(None),
            Consumable::Corrupt => Err(ProtocolError::CorruptStream),
            Consumable::Ready(info) => {
                let frame = self.buffer.split_to(info.len).freeze();
                Ok(Some((info, frame)))
            }
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
