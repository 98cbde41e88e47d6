//! Sparse map from small integer tags to 64-bit values.
//!
//! Wire layout:
//!
//! ```text
//! +-----------+----------------------------------------------+
//! | mask      | value of each set bit, ascending tag order   |
//! | 8 bytes LE| 8 bytes LE each                              |
//! +-----------+----------------------------------------------+
//! ```
//!
//! Bit 63 of the mask is reserved and never set.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut};
use std::fmt;

/// Number of usable tags (`0..=62`).
pub const TAG_CAPACITY: u8 = 63;

const MASK_SIZE: usize = 8;
const VALUE_SIZE: usize = 8;
const RESERVED_BIT: u64 = 1 << 63;

/// Mask bit for `tag`.
pub const fn bit(tag: u8) -> u64 {
    1 << tag
}

/// Fixed-capacity tagged field buffer.
#[derive(Clone)]
pub struct TaggedBuffer {
    mask: u64,
    values: [u64; TAG_CAPACITY as usize],
}

impl TaggedBuffer {
    pub fn new() -> Self {
        Self {
            mask: 0,
            values: [0; TAG_CAPACITY as usize],
        }
    }

    /// Clears all tags. Values are left in place but become unreadable.
    pub fn reset(&mut self) {
        self.mask = 0;
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn len(&self) -> usize {
        self.mask.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Returns whether `tag` is present. Tags outside the tag space are never present.
    pub fn has(&self, tag: u8) -> bool {
        tag < TAG_CAPACITY && self.mask & bit(tag) != 0
    }

    /// Returns whether every bit of `mask` is present.
    pub fn has_all(&self, mask: u64) -> bool {
        self.mask & mask == mask
    }

    pub fn get(&self, tag: u8) -> Result<u64, ProtocolError> {
        if !self.has(tag) {
            return Err(ProtocolError::MissingTag(tag));
        }
        Ok(self.values[tag as usize])
    }

    pub fn get_or(&self, tag: u8, default: u64) -> u64 {
        if self.has(tag) {
            self.values[tag as usize]
        } else {
            default
        }
    }

    /// Sets `tag` to `value`.
    ///
    /// # Panics
    ///
    /// Panics if `tag` is outside the tag space or already present.
    pub fn put(&mut self, tag: u8, value: u64) {
        assert!(tag < TAG_CAPACITY, "tag {} out of range", tag);
        assert!(!self.has(tag), "tag {} already set", tag);
        self.values[tag as usize] = value;
        self.mask |= bit(tag);
    }

    /// Iterates present `(tag, value)` pairs in ascending tag order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, u64)> + '_ {
        (0..TAG_CAPACITY)
            .filter(move |&tag| self.mask & bit(tag) != 0)
            .map(move |tag| (tag, self.values[tag as usize]))
    }

    /// Size of the serialized form in bytes.
    pub fn encoded_len(&self) -> usize {
        MASK_SIZE + VALUE_SIZE * self.len()
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u64_le(self.mask);
        for (_, value) in self.iter() {
            dst.put_u64_le(value);
        }
    }

    /// Decodes from the front of `src`, advancing it past the consumed bytes.
    ///
    /// On error `self` is left unchanged; `src` may have been partially consumed.
    pub fn decode(&mut self, src: &mut &[u8]) -> Result<(), ProtocolError> {
        if src.remaining() < MASK_SIZE {
            return Err(ProtocolError::Truncated {
                needed: MASK_SIZE,
                available: src.remaining(),
            });
        }
        let mask = src.get_u64_le();
        if mask & RESERVED_BIT != 0 {
            return Err(ProtocolError::Malformed("reserved tag bit set"));
        }

        let needed = VALUE_SIZE * mask.count_ones() as usize;
        if src.remaining() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                available: src.remaining(),
            });
        }

        for tag in 0..TAG_CAPACITY {
            if mask & bit(tag) != 0 {
                self.values[tag as usize] = src.get_u64_le();
            }
        }
        self.mask = mask;
        Ok(())
    }
}

impl Default for TaggedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TaggedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.mask == other.mask && self.iter().eq(other.iter())
    }
}

impl Eq for TaggedBuffer {}

impl fmt::Debug for TaggedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_put_get() {
        let mut buf = TaggedBuffer::new();
        buf.put(0, 11);
        buf.put(62, 99);

        assert_eq!(buf.get(0).unwrap(), 11);
        assert_eq!(buf.get(62).unwrap(), 99);
        assert!(matches!(buf.get(5), Err(ProtocolError::MissingTag(5))));
        assert_eq!(buf.get_or(5, 7), 7);
        assert_eq!(buf.len(), 2);
        assert!(buf.has_all(bit(0) | bit(62)));
        assert!(!buf.has_all(bit(0) | bit(1)));
    }

    #[test]
    #[should_panic(expected = "already set")]
    fn test_duplicate_put_panics() {
        let mut buf = TaggedBuffer::new();
        buf.put(3, 1);
        buf.put(3, 2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_reserved_tag_panics() {
        let mut buf = TaggedBuffer::new();
        buf.put(63, 1);
    }

    #[test]
    fn test_reset_allows_reuse() {
        let mut buf = TaggedBuffer::new();
        buf.put(4, 1);
        buf.reset();
        assert!(buf.is_empty());
        assert!(!buf.has(4));
        buf.put(4, 2);
        assert_eq!(buf.get(4).unwrap(), 2);
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = TaggedBuffer::new();
        buf.put(2, 0x0102);
        buf.put(0, 0xaa);

        let mut out = Vec::new();
        buf.encode(&mut out);

        assert_eq!(out.len(), buf.encoded_len());
        assert_eq!(&out[0..8], &0b101u64.to_le_bytes());
        // Tag 0 precedes tag 2 regardless of insertion order.
        assert_eq!(&out[8..16], &0xaau64.to_le_bytes());
        assert_eq!(&out[16..24], &0x0102u64.to_le_bytes());
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf = TaggedBuffer::new();
        buf.put(1, 1);
        buf.put(9, 2);
        let mut out = Vec::new();
        buf.encode(&mut out);

        for cut in 0..out.len() {
            let mut target = TaggedBuffer::new();
            target.put(40, 4);
            let mut src = &out[..cut];
            assert!(target.decode(&mut src).is_err(), "cut={}", cut);
            // Target untouched on failure.
            assert_eq!(target.get(40).unwrap(), 4);
            assert_eq!(target.len(), 1);
        }
    }

    #[test]
    fn test_decode_rejects_reserved_bit() {
        let raw = (1u64 << 63).to_le_bytes();
        let mut src = &raw[..];
        let mut target = TaggedBuffer::new();
        assert!(matches!(
            target.decode(&mut src),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let mut buf = TaggedBuffer::new();
        buf.put(3, 33);
        let mut out = Vec::new();
        buf.encode(&mut out);
        out.extend_from_slice(b"tail");

        let mut src = &out[..];
        let mut target = TaggedBuffer::new();
        target.decode(&mut src).unwrap();
        assert_eq!(src, b"tail");
        assert_eq!(target, buf);
    }

    proptest! {
        #[test]
        fn prop_roundtrip(entries in proptest::collection::btree_map(0u8..63, any::<u64>(), 0..63)) {
            let mut buf = TaggedBuffer::new();
            for (&tag, &value) in &entries {
                buf.put(tag, value);
            }

            let mut out = Vec::new();
            buf.encode(&mut out);
            prop_assert_eq!(out.len(), buf.encoded_len());

            let mut decoded = TaggedBuffer::new();
            let mut src = &out[..];
            decoded.decode(&mut src).unwrap();

            prop_assert!(src.is_empty());
            prop_assert_eq!(&decoded, &buf);
            for (&tag, &value) in &entries {
                prop_assert_eq!(decoded.get(tag).unwrap(), value);
            }
        }
    }
}
