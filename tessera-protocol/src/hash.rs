//! Keyed hashing and 64-bit mixing used for shard hints.
//!
//! [`siphash`] follows the SipHash-2-4 message schedule but combines lanes
//! with XOR where the reference algorithm adds. Its outputs therefore differ
//! from standard SipHash and it must not be swapped for a library
//! implementation without changing every hint the fleet computes.

/// 128-bit key for [`siphash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SipKey(pub [u64; 2]);

/// Key used for shard-hint derivation.
pub const DEFAULT_SIP_KEY: SipKey = SipKey([0x967af6cfdf9eee0d, 0x65d44548a2b4df17]);

#[inline]
fn sip_round(v: &mut [u64; 4]) {
    v[0] ^= v[1];
    v[1] = v[1].rotate_left(13);
    v[1] ^= v[0];
    v[0] = v[0].rotate_left(32);
    v[2] ^= v[3];
    v[3] = v[3].rotate_left(16);
    v[3] ^= v[2];
    v[0] ^= v[3];
    v[3] = v[3].rotate_left(21);
    v[3] ^= v[0];
    v[2] ^= v[1];
    v[1] = v[1].rotate_left(17);
    v[1] ^= v[2];
    v[2] = v[2].rotate_left(32);
}

/// Hashes `data` under `key`.
pub fn siphash(data: &[u8], key: SipKey) -> u64 {
    let SipKey([k0, k1]) = key;
    let mut v = [
        0x736f6d6570736575 ^ k0,
        0x646f72616e646f6d ^ k1,
        0x6c7967656e657261 ^ k0,
        0x7465646279746573 ^ k1,
    ];

    let mut words = data.chunks_exact(8);
    for word in &mut words {
        let m = u64::from_le_bytes(word.try_into().expect("chunk of 8"));
        v[3] ^= m;
        sip_round(&mut v);
        sip_round(&mut v);
        v[0] ^= m;
    }

    let mut last = (data.len() as u64) << 56;
    for (i, &byte) in words.remainder().iter().enumerate() {
        last |= (byte as u64) << (8 * i);
    }

    v[3] ^= last;
    sip_round(&mut v);
    sip_round(&mut v);
    v[0] ^= last;

    v[2] ^= 0xff;
    for _ in 0..4 {
        sip_round(&mut v);
    }

    v[0] ^ v[1] ^ v[2] ^ v[3]
}

const FNV_OFFSET: u64 = 14695981039346656037;
const FNV_PRIME: u64 = 1099511628211;
/// Multiplicative inverse of `FNV_PRIME` modulo 2^64.
const FNV_PRIME_INVERSE: u64 = 14886173955864302971;

/// Bijective scatter of a 64-bit value; inverted by [`unmix`].
pub fn mix(x: u64) -> u64 {
    let mut x = x.wrapping_add(FNV_OFFSET);
    x = x.wrapping_mul(FNV_PRIME);
    x ^= x >> 24;
    x = x.wrapping_mul(FNV_PRIME);
    x ^= x >> 14;
    x = x.wrapping_mul(FNV_PRIME);
    x ^= x >> 28;
    x
}

/// Inverts `x ^= x >> shift`.
fn unxorshift(x: u64, shift: u32) -> u64 {
    let mut t = x;
    let mut covered = shift;
    while covered < 64 {
        t = x ^ (t >> shift);
        covered += shift;
    }
    t
}

/// Inverse of [`mix`].
pub fn unmix(x: u64) -> u64 {
    let mut x = unxorshift(x, 28);
    x = x.wrapping_mul(FNV_PRIME_INVERSE);
    x = unxorshift(x, 14);
    x = x.wrapping_mul(FNV_PRIME_INVERSE);
    x = unxorshift(x, 24);
    x = x.wrapping_mul(FNV_PRIME_INVERSE);
    x.wrapping_sub(FNV_OFFSET)
}
