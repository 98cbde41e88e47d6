//! # tessera-protocol
//!
//! Wire protocol implementation for the tessera key-value store.
//!
//! This crate provides:
//! - CRC128 checksums, the shard-hint SipHash variant and 64-bit mixing
//! - Tagged field buffers
//! - The length-delimited, magic-guarded envelope and its receive-buffer codec
//! - Key-value messages and their payload codecs

pub mod checksum;
pub mod codec;
pub mod error;
pub mod frame;
pub mod hash;
pub mod message;
pub mod record;
pub mod tagged;

pub use checksum::{Blob, Crc128};
pub use codec::FrameDecoder;
pub use error::{Outcome, ProtocolError};
pub use frame::{consumable, Consumable, FrameInfo, EOM_MAGIC, MAX_FRAME_SIZE};
pub use hash::{mix, siphash, unmix, SipKey, DEFAULT_SIP_KEY};
pub use message::{
    IterateHint, Kind, KvMessage, MAX_COMMIT_SIZE, MAX_PAIRS, MAX_PAIR_SIZE, PAYLOAD_CRC_SEED,
    PORT_OFFSET, SERIALIZE_SIZE, WIRE_MAGIC,
};
pub use record::{Key, Value, SEQNUM_INF};
pub use tagged::TaggedBuffer;
