//! Runner and prediction identifiers.
//!
//! Both encodings use the Crockford base32 alphabet in lowercase. Runner IDs
//! are short random handles; prediction IDs pack a byte-permuted UUIDv7.

use rand::RngCore;
use uuid::Uuid;

const ALPHABET: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";

/// Destination byte order for prediction IDs: the UUIDv7 bytes are emitted
/// as groups {12..15, 4..7, 0..3, 8..11} before encoding.
const UUID_PERMUTATION: [usize; 16] = [12, 13, 14, 15, 4, 5, 6, 7, 0, 1, 2, 3, 8, 9, 10, 11];

/// Generate an 8-character runner ID from 40 random bits.
///
/// The first character is never `0` (replaced with `a`) so IDs are safe to
/// use where a leading digit is awkward (process names, hostnames).
pub fn runner_id() -> String {
    let mut bytes = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut bytes);

    let mut id = encode_base32(&bytes);
    if id.starts_with('0') {
        id.replace_range(0..1, "a");
    }
    id
}

/// Generate a 26-character prediction ID from a permuted UUIDv7.
pub fn prediction_id() -> String {
    let uuid = Uuid::now_v7();
    let src = uuid.as_bytes();

    let mut permuted = [0u8; 16];
    for (dst, &idx) in permuted.iter_mut().zip(UUID_PERMUTATION.iter()) {
        *dst = src[idx];
    }
    encode_base32(&permuted)
}

/// Unpadded big-endian base32 over the Crockford alphabet.
fn encode_base32(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}
