//! Protocol error types and remote outcome codes.

use crate::checksum::Crc128;
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid magic: expected {expected:#06x}, got {actual:#06x}")]
    InvalidMagic { expected: u16, actual: u16 },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("too many blobs: index {index} (max {max})")]
    TooManyBlobs { index: usize, max: usize },

    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error("corrupt byte stream")]
    CorruptStream,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: Crc128, actual: Crc128 },

    #[error("missing tag {0}")]
    MissingTag(u8),

    #[error("unknown outcome code: {0}")]
    UnknownOutcome(u64),

    #[error("invalid iterate hint bits: {0:#x}")]
    InvalidHint(u64),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl ProtocolError {
    /// Returns whether this error means received bytes cannot be trusted.
    ///
    /// Encoding-side errors (oversized payloads, bad arguments) are the
    /// caller's fault and return `false`.
    pub fn is_malformed(&self) -> bool {
        !matches!(
            self,
            ProtocolError::FrameTooLarge { .. }
                | ProtocolError::TooManyBlobs { .. }
                | ProtocolError::PayloadTooLarge { .. }
                | ProtocolError::InvalidArgument(_)
        )
    }
}

/// Outcome codes returned by a replica in the `OUTCOME` body tag.
///
/// These values are part of the wire contract and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Outcome {
    Ok = 0,
    Timeout = 1,
    Inval = 2,
    Stale = 3,
    NoNext = 4,
    Eio = 5,
}

impl Outcome {
    /// Decodes a wire outcome code.
    pub fn from_code(code: u64) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(Outcome::Ok),
            1 => Ok(Outcome::Timeout),
            2 => Ok(Outcome::Inval),
            3 => Ok(Outcome::Stale),
            4 => Ok(Outcome::NoNext),
            5 => Ok(Outcome::Eio),
            other => Err(ProtocolError::UnknownOutcome(other)),
        }
    }

    pub fn code(self) -> u64 {
        self as u64
    }

    pub fn is_ok(self) -> bool {
        self == Outcome::Ok
    }

    /// Returns whether a request failing with this outcome may be retried.
    pub fn is_retryable(self) -> bool {
        self == Outcome::Eio
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Ok => write!(f, "OK"),
            Outcome::Timeout => write!(f, "TIMEOUT"),
            Outcome::Inval => write!(f, "INVAL"),
            Outcome::Stale => write!(f, "STALE"),
            Outcome::NoNext => write!(f, "NONEXT"),
            Outcome::Eio => write!(f, "EIO"),
        }
    }
}
