//! 128-bit CRC and checksummed blobs.
//!
//! The CRC runs over the polynomial `x^128 + x^7 + x^2 + x + 1`, consuming
//! input eight bytes at a time (little-endian) with a bytewise tail. There is
//! no implicit seed: every user supplies its own starting value, so the
//! checksum of an empty input equals the seed.

use crate::error::ProtocolError;
use bytes::Bytes;
use std::fmt;

/// A 128-bit CRC value, stored as two 64-bit halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Crc128 {
    lo: u64,
    hi: u64,
}

impl Crc128 {
    pub const fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    pub fn lo(&self) -> u64 {
        self.lo
    }

    pub fn hi(&self) -> u64 {
        self.hi
    }

    /// Folds `data` into the checksum.
    pub fn update(self, data: &[u8]) -> Self {
        let mut state = self.as_u128();

        let mut words = data.chunks_exact(8);
        for word in &mut words {
            let word = u64::from_le_bytes(word.try_into().expect("chunk of 8"));
            state = fold(state, word, 64);
        }
        for &byte in words.remainder() {
            state = fold(state, byte as u64, 8);
        }

        Self::from_u128(state)
    }

    fn as_u128(self) -> u128 {
        (self.hi as u128) << 64 | self.lo as u128
    }

    fn from_u128(v: u128) -> Self {
        Self {
            lo: v as u64,
            hi: (v >> 64) as u64,
        }
    }
}

/// Shifts `bits` bits of `payload` through the register and reduces.
fn fold(state: u128, payload: u64, bits: u32) -> u128 {
    let state = state ^ ((payload as u128) << 64);
    let spill = state << (128 - bits);
    (state >> bits) ^ spill ^ (spill >> 1) ^ (spill >> 2) ^ (spill >> 7)
}

impl fmt::Display for Crc128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "crc128({:#x},{:#x})", self.lo, self.hi)
    }
}

/// A binary attachment together with its checksum.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob {
    data: Bytes,
    crc: Crc128,
}

impl Blob {
    /// An empty blob; its checksum is the seed itself.
    pub fn empty(seed: Crc128) -> Self {
        Self {
            data: Bytes::new(),
            crc: seed,
        }
    }

    /// Computes the checksum of `data` starting from `seed`.
    pub fn seal(data: Bytes, seed: Crc128) -> Self {
        let crc = seed.update(&data);
        Self { data, crc }
    }

    /// Wraps received data and the checksum that travelled with it.
    pub fn from_parts(data: Bytes, crc: Crc128) -> Self {
        Self { data, crc }
    }

    /// Recomputes the checksum from `seed` and compares it to the stored one.
    pub fn verify(&self, seed: Crc128) -> Result<(), ProtocolError> {
        let actual = seed.update(&self.data);
        if actual != self.crc {
            return Err(ProtocolError::ChecksumMismatch {
                expected: self.crc,
                actual,
            });
        }
        Ok(())
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn crc(&self) -> Crc128 {
        self.crc
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
