//! Key-value protocol messages.
//!
//! A message is the routing header, a body of tagged fields and at most one
//! payload blob guarded by a CRC128 carried in the body.

use crate::checksum::{Blob, Crc128};
use crate::error::{Outcome, ProtocolError};
use crate::frame::{self, TAG_ALLOWANCE, TAG_CLIENT_ID, TAG_REQUEST_ID};
use crate::record::{encode_keys, encode_pairs, pairs_encoded_len, Key, Value};
use crate::tagged::TaggedBuffer;
use bytes::{Bytes, BytesMut};

/// Leading magic of key-value protocol frames.
pub const WIRE_MAGIC: u16 = 0x143e;

/// Offset from a replica's nominal port to its key-value service port.
pub const PORT_OFFSET: u16 = 8;

/// Maximum number of keys in a single request.
pub const MAX_PAIRS: usize = 8;

/// Maximum size of a single key/value pair (15 KiB).
pub const MAX_PAIR_SIZE: usize = 15 * 1024;

/// Maximum payload size of a commit.
pub const MAX_COMMIT_SIZE: usize = 2 * MAX_PAIR_SIZE;

/// Upper bound on a serialized message.
pub const SERIALIZE_SIZE: usize = 1024 + MAX_PAIRS * MAX_PAIR_SIZE;

/// Seed for payload checksums.
pub const PAYLOAD_CRC_SEED: Crc128 = Crc128::new(0xe8a8918ad6ebdce4, 0x60457c9dceee5eff);

/// Body tags.
pub mod tag {
    pub const KIND: u8 = 0;
    pub const NPAIRS: u8 = 1;
    /// Low half of the payload CRC; the high half follows at `PAYLOAD_CRC + 1`.
    pub const PAYLOAD_CRC: u8 = 2;
    pub const OUTCOME: u8 = 4;
    pub const PRESENT: u8 = 5;
    pub const ITERATE_HINT: u8 = 6;
    /// Sequence number of pair `i` is at `SEQNUM + i`.
    pub const SEQNUM: u8 = 7;
}

/// Operation carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Kind {
    Get = 1,
    Commit = 2,
    Confirm = 3,
    Iterate = 4,
}

impl Kind {
    /// Decodes a wire kind. Requests and responses share the same codes.
    pub fn from_code(code: u64) -> Result<Self, ProtocolError> {
        match code {
            1 => Ok(Kind::Get),
            2 => Ok(Kind::Commit),
            3 => Ok(Kind::Confirm),
            4 => Ok(Kind::Iterate),
            _ => Err(ProtocolError::Malformed("unknown message kind")),
        }
    }

    pub fn code(self) -> u64 {
        self as u64
    }
}

/// Iteration direction and projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterateHint(u64);

impl IterateHint {
    /// Walk towards smaller keys.
    pub const BACKWARD: u64 = 1 << 0;
    /// Return values along with keys.
    pub const VALUE: u64 = 1 << 1;
    /// Return sequence numbers of the returned values.
    pub const SEQNUM: u64 = 1 << 2;
    pub const ALL: u64 = Self::VALUE | Self::SEQNUM;

    const VALID_MASK: u64 = Self::BACKWARD | Self::ALL;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_backward(mut self) -> Self {
        self.0 |= Self::BACKWARD;
        self
    }

    pub fn with_value(mut self) -> Self {
        self.0 |= Self::VALUE;
        self
    }

    pub fn with_seqnum(mut self) -> Self {
        self.0 |= Self::SEQNUM;
        self
    }

    pub fn is_backward(&self) -> bool {
        self.0 & Self::BACKWARD != 0
    }

    pub fn has_value(&self) -> bool {
        self.0 & Self::VALUE != 0
    }

    pub fn has_seqnum(&self) -> bool {
        self.0 & Self::SEQNUM != 0
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_MASK != 0 {
            return Err(ProtocolError::InvalidHint(bits));
        }
        Ok(Self(bits))
    }
}

fn check_key_count(n: usize) -> Result<(), ProtocolError> {
    if n == 0 {
        return Err(ProtocolError::InvalidArgument("empty key list"));
    }
    if n > MAX_PAIRS {
        return Err(ProtocolError::InvalidArgument("too many keys"));
    }
    Ok(())
}

/// A reusable key-value protocol message.
#[derive(Debug, Clone)]
pub struct KvMessage {
    header: TaggedBuffer,
    body: TaggedBuffer,
    payload: Blob,
    scratch: BytesMut,
}

impl KvMessage {
    pub fn new() -> Self {
        Self {
            header: TaggedBuffer::new(),
            body: TaggedBuffer::new(),
            payload: Blob::empty(PAYLOAD_CRC_SEED),
            scratch: BytesMut::new(),
        }
    }

    /// Starts a new message of `kind` carrying `data` as its payload.
    ///
    /// Used for requests and for the responses a replica sends back.
    pub fn reset(&mut self, kind: Kind, npairs: usize, data: Bytes) {
        self.header.reset();
        self.body.reset();
        self.body.put(tag::KIND, kind.code());
        self.body.put(tag::NPAIRS, npairs as u64);

        self.payload = Blob::seal(data, PAYLOAD_CRC_SEED);
        if !self.payload.is_empty() {
            let crc = self.payload.crc();
            self.body.put(tag::PAYLOAD_CRC, crc.lo());
            self.body.put(tag::PAYLOAD_CRC + 1, crc.hi());
        }
    }

    /// Replaces the routing header. May be called again for every attempt.
    pub fn put_header(&mut self, request_id: u64, client_id: u64, allowance_us: u64) {
        self.header.reset();
        self.header.put(TAG_CLIENT_ID, client_id);
        self.header.put(TAG_REQUEST_ID, request_id);
        self.header.put(TAG_ALLOWANCE, allowance_us);
    }

    pub fn header(&self) -> &TaggedBuffer {
        &self.header
    }

    pub fn body(&self) -> &TaggedBuffer {
        &self.body
    }

    /// Sets a body tag. Panics if the tag is already set.
    pub fn put(&mut self, tag: u8, value: u64) {
        self.body.put(tag, value);
    }

    pub fn get(&self, tag: u8) -> Result<u64, ProtocolError> {
        self.body.get(tag)
    }

    pub fn kind(&self) -> Result<Kind, ProtocolError> {
        Kind::from_code(self.body.get(tag::KIND)?)
    }

    pub fn npairs(&self) -> Result<usize, ProtocolError> {
        Ok(self.body.get(tag::NPAIRS)? as usize)
    }

    pub fn outcome(&self) -> Result<Outcome, ProtocolError> {
        Outcome::from_code(self.body.get(tag::OUTCOME)?)
    }

    pub fn seqnum(&self, i: usize) -> Result<u64, ProtocolError> {
        let tag = tag::SEQNUM as usize + i;
        if tag >= crate::tagged::TAG_CAPACITY as usize {
            return Err(ProtocolError::Malformed("pair index out of range"));
        }
        self.body.get(tag as u8)
    }

    /// Present bits of the pairs; absent tag means none present.
    pub fn present_mask(&self) -> u64 {
        self.body.get_or(tag::PRESENT, 0)
    }

    pub fn iterate_hint(&self) -> Result<IterateHint, ProtocolError> {
        IterateHint::from_bits(self.body.get(tag::ITERATE_HINT)?)
    }

    pub fn payload(&self) -> &Blob {
        &self.payload
    }

    /// Appends the framed message to `dst` and returns its length.
    pub fn serialize(&self, dst: &mut BytesMut) -> Result<usize, ProtocolError> {
        frame::serialize(
            dst,
            WIRE_MAGIC,
            &[&self.header, &self.body],
            &[self.payload.data()],
        )
    }

    /// Replaces this message with the one in `frame`.
    ///
    /// A non-empty payload must match the CRC in the body. On error the
    /// message is unchanged.
    pub fn deserialize(&mut self, frame: &Bytes) -> Result<(), ProtocolError> {
        let mut header = TaggedBuffer::new();
        let mut body = TaggedBuffer::new();
        let mut blobs = [Bytes::new()];
        frame::deserialize(frame, WIRE_MAGIC, &mut [&mut header, &mut body], &mut blobs)?;

        let [data] = blobs;
        let payload = if data.is_empty() {
            Blob::empty(PAYLOAD_CRC_SEED)
        } else {
            let crc = Crc128::new(
                body.get(tag::PAYLOAD_CRC)?,
                body.get(tag::PAYLOAD_CRC + 1)?,
            );
            let blob = Blob::from_parts(data, crc);
            blob.verify(PAYLOAD_CRC_SEED)?;
            blob
        };

        self.header = header;
        self.body = body;
        self.payload = payload;
        Ok(())
    }

    fn encode_payload<F>(&mut self, encode: F) -> Result<Bytes, ProtocolError>
    where
        F: FnOnce(&mut BytesMut) -> Result<(), ProtocolError>,
    {
        self.scratch.clear();
        encode(&mut self.scratch)?;
        Ok(self.scratch.split().freeze())
    }

    /// Builds a GET of `keys`.
    pub fn prepare_get(&mut self, keys: &[Key]) -> Result<(), ProtocolError> {
        check_key_count(keys.len())?;
        let data = self.encode_payload(|dst| encode_keys(dst, keys))?;
        self.reset(Kind::Get, keys.len(), data);
        Ok(())
    }

    /// Builds a COMMIT of `values` over `keys`, each conditional on its
    /// sequence number.
    pub fn prepare_commit(&mut self, keys: &[Key], values: &[Value]) -> Result<(), ProtocolError> {
        check_key_count(keys.len())?;
        if keys.len() != values.len() {
            return Err(ProtocolError::InvalidArgument("key and value counts differ"));
        }
        let size = pairs_encoded_len(keys, values);
        if size > MAX_COMMIT_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                max: MAX_COMMIT_SIZE,
            });
        }

        let data = self.encode_payload(|dst| encode_pairs(dst, keys, values))?;
        self.reset(Kind::Commit, keys.len(), data);

        let mut present = 0u64;
        for (i, value) in values.iter().enumerate() {
            self.body.put(tag::SEQNUM + i as u8, value.seqnum);
            if value.present {
                present |= 1 << i;
            }
        }
        self.body.put(tag::PRESENT, present);
        Ok(())
    }

    /// Builds a CONFIRM asserting that each key is still at its sequence number.
    pub fn prepare_confirm(&mut self, keys: &[Key], values: &[Value]) -> Result<(), ProtocolError> {
        check_key_count(keys.len())?;
        if keys.len() != values.len() {
            return Err(ProtocolError::InvalidArgument("key and value counts differ"));
        }

        let data = self.encode_payload(|dst| encode_keys(dst, keys))?;
        self.reset(Kind::Confirm, keys.len(), data);
        for (i, value) in values.iter().enumerate() {
            self.body.put(tag::SEQNUM + i as u8, value.seqnum);
        }
        Ok(())
    }

    /// Builds an ITERATE of up to `count` pairs starting after `cursor`.
    pub fn prepare_iterate(
        &mut self,
        cursor: &Key,
        count: usize,
        hint: IterateHint,
    ) -> Result<(), ProtocolError> {
        check_key_count(count)?;
        let data = self.encode_payload(|dst| encode_keys(dst, std::slice::from_ref(cursor)))?;
        self.reset(Kind::Iterate, count, data);
        self.body.put(tag::ITERATE_HINT, hint.bits());
        Ok(())
    }
}

impl Default for KvMessage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{decode_keys, decode_pairs};
    use proptest::prelude::*;

    fn keys(n: usize) -> Vec<Key> {
        (0..n)
            .map(|i| Key::new(i as u64, format!("key-{}", i).into_bytes()))
            .collect()
    }

    fn roundtrip(msg: &KvMessage) -> KvMessage {
        let mut out = BytesMut::new();
        msg.serialize(&mut out).unwrap();
        let mut decoded = KvMessage::new();
        decoded.deserialize(&out.freeze()).unwrap();
        decoded
    }

    #[test]
    fn test_get_message() {
        let mut msg = KvMessage::new();
        msg.prepare_get(&keys(3)).unwrap();
        msg.put_header(11, 22, 900);

        let decoded = roundtrip(&msg);
        assert_eq!(decoded.kind().unwrap(), Kind::Get);
        assert_eq!(decoded.npairs().unwrap(), 3);
        assert_eq!(decoded.header().get(TAG_REQUEST_ID).unwrap(), 11);
        assert_eq!(decoded.header().get(TAG_CLIENT_ID).unwrap(), 22);
        assert_eq!(decoded.header().get(TAG_ALLOWANCE).unwrap(), 900);
        assert_eq!(decode_keys(decoded.payload().data()).unwrap(), keys(3));
    }

    #[test]
    fn test_commit_message() {
        let values = vec![Value::present(0, &b"v0"[..]), Value::absent(4)];
        let mut msg = KvMessage::new();
        msg.prepare_commit(&keys(2), &values).unwrap();
        msg.put_header(1, 2, 0);

        let decoded = roundtrip(&msg);
        assert_eq!(decoded.kind().unwrap(), Kind::Commit);
        assert_eq!(decoded.present_mask(), 0b01);
        assert_eq!(decoded.seqnum(0).unwrap(), 0);
        assert_eq!(decoded.seqnum(1).unwrap(), 4);

        let (k, v) = decode_pairs(decoded.payload().data()).unwrap();
        assert_eq!(k, keys(2));
        assert_eq!(&v[0].data[..], b"v0");
    }

    #[test]
    fn test_confirm_and_iterate_messages() {
        let mut msg = KvMessage::new();
        msg.prepare_confirm(&keys(1), &[Value::absent(9)]).unwrap();
        msg.put_header(1, 1, 0);
        let decoded = roundtrip(&msg);
        assert_eq!(decoded.kind().unwrap(), Kind::Confirm);
        assert_eq!(decoded.seqnum(0).unwrap(), 9);

        let hint = IterateHint::new().with_backward().with_value();
        msg.prepare_iterate(&Key::new(3, &b"cur"[..]), 5, hint).unwrap();
        msg.put_header(2, 1, 0);
        let decoded = roundtrip(&msg);
        assert_eq!(decoded.kind().unwrap(), Kind::Iterate);
        assert_eq!(decoded.npairs().unwrap(), 5);
        assert_eq!(decoded.iterate_hint().unwrap(), hint);
    }

    #[test]
    fn test_put_header_repeatable() {
        let mut msg = KvMessage::new();
        msg.prepare_get(&keys(1)).unwrap();
        msg.put_header(1, 7, 10);
        msg.put_header(2, 7, 5);
        assert_eq!(msg.header().get(TAG_REQUEST_ID).unwrap(), 2);
        assert_eq!(msg.header().len(), 3);
    }

    #[test]
    fn test_argument_checks() {
        let mut msg = KvMessage::new();
        assert!(matches!(
            msg.prepare_get(&[]),
            Err(ProtocolError::InvalidArgument(_))
        ));
        assert!(matches!(
            msg.prepare_get(&keys(MAX_PAIRS + 1)),
            Err(ProtocolError::InvalidArgument(_))
        ));
        assert!(matches!(
            msg.prepare_commit(&keys(2), &[Value::absent(0)]),
            Err(ProtocolError::InvalidArgument(_))
        ));

        let big = vec![
            Value::present(0, vec![0u8; MAX_PAIR_SIZE]),
            Value::present(0, vec![0u8; MAX_PAIR_SIZE]),
        ];
        let err = msg.prepare_commit(&keys(2), &big).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
        assert!(!err.is_malformed());
    }

    #[test]
    fn test_corrupt_payload_rejected() {
        let mut msg = KvMessage::new();
        msg.prepare_get(&keys(2)).unwrap();
        msg.put_header(1, 1, 0);
        let mut out = BytesMut::new();
        msg.serialize(&mut out).unwrap();
        // Last payload byte sits just before the trailer.
        let at = out.len() - 3;
        out[at] ^= 0x55;

        let mut target = KvMessage::new();
        target.reset(Kind::Get, 1, Bytes::new());
        let result = target.deserialize(&out.freeze());
        assert!(matches!(result, Err(ProtocolError::ChecksumMismatch { .. })));
        // Unchanged on failure.
        assert_eq!(target.npairs().unwrap(), 1);
    }

    #[test]
    fn test_empty_payload_has_no_crc_tags() {
        let mut msg = KvMessage::new();
        msg.reset(Kind::Get, 0, Bytes::new());
        assert!(!msg.body().has(tag::PAYLOAD_CRC));
        msg.put(tag::OUTCOME, Outcome::NoNext.code());
        msg.put_header(3, 3, 0);

        let decoded = roundtrip(&msg);
        assert_eq!(decoded.kind().unwrap(), Kind::Get);
        assert_eq!(decoded.get(tag::KIND).unwrap(), 1);
        assert!(Kind::from_code(0x101).is_err());
        assert!(decoded.payload().is_empty());
        assert_eq!(decoded.outcome().unwrap(), Outcome::NoNext);
    }

    #[test]
    fn test_iterate_hint_bits() {
        assert_eq!(IterateHint::new().with_value().with_seqnum().bits(), IterateHint::ALL);
        assert!(IterateHint::from_bits(0x08).is_err());
        let hint = IterateHint::from_bits(IterateHint::BACKWARD).unwrap();
        assert!(hint.is_backward());
        assert!(!hint.has_value());
    }

    proptest! {
        #[test]
        fn prop_commit_roundtrip(
            pairs in proptest::collection::vec(
                (any::<u64>(), proptest::collection::vec(any::<u8>(), 0..32),
                 any::<bool>(), any::<u64>(), proptest::collection::vec(any::<u8>(), 0..256)),
                1..=MAX_PAIRS,
            ),
            request_id in any::<u64>(),
            client_id in any::<u64>(),
        ) {
            let keys: Vec<Key> = pairs.iter().map(|p| Key::new(p.0, p.1.clone())).collect();
            let values: Vec<Value> = pairs
                .iter()
                .map(|p| Value { present: p.2, seqnum: p.3, data: Bytes::from(p.4.clone()) })
                .collect();

            let mut msg = KvMessage::new();
            msg.prepare_commit(&keys, &values).unwrap();
            msg.put_header(request_id, client_id, 0);
            let decoded = roundtrip(&msg);

            prop_assert_eq!(decoded.header(), msg.header());
            prop_assert_eq!(decoded.body(), msg.body());
            prop_assert_eq!(decoded.payload(), msg.payload());
            for (i, value) in values.iter().enumerate() {
                prop_assert_eq!(decoded.seqnum(i).unwrap(), value.seqnum);
                prop_assert_eq!(decoded.present_mask() & (1 << i) != 0, value.present);
            }
        }
    }
}
