//! Variable-length integer packing.
//!
//! ```text
//! first byte:  [extend:1][sign:1][value:6]
//! next bytes:  [extend:1][value:7]          (at most four, the last carries 4 bits)
//! ```
//!
//! Negative numbers are stored as their bitwise complement with the sign bit
//! set, so small magnitudes of either sign pack into a single byte.

use byteorder::{ByteOrder, LittleEndian};

use super::CompressionError;

/// Longest encoding of a 32-bit value.
pub const MAX_BYTES_PACKED: usize = 5;

const EXTEND: u8 = 0x80;
const SIGN: u8 = 0x40;

const MASKS: [u32; 4] = [0x7f, 0x7f, 0x7f, 0x0f];
const SHIFTS: [u32; 4] = [6, 6 + 7, 6 + 7 + 7, 6 + 7 + 7 + 7];

/// Append the packed form of `value` to `out`.
pub fn pack(out: &mut Vec<u8>, value: i32) {
    let mut byte = 0u8;
    let mut magnitude = value;
    if magnitude < 0 {
        byte |= SIGN;
        magnitude = !magnitude;
    }

    let mut rest = magnitude as u32;
    byte |= (rest & 0x3f) as u8;
    rest >>= 6;
    while rest != 0 {
        out.push(byte | EXTEND);
        byte = (rest & 0x7f) as u8;
        rest >>= 7;
    }
    out.push(byte);
}

/// Number of bytes [`pack`] emits for `value`.
pub fn packed_len(value: i32) -> usize {
    let magnitude = if value < 0 { !value } else { value } as u32;
    let mut len = 1;
    let mut rest = magnitude >> 6;
    while rest != 0 {
        len += 1;
        rest >>= 7;
    }
    len
}

/// Decode one value from the front of `src`.
///
/// Returns the value and the number of bytes consumed.
pub fn unpack(src: &[u8]) -> Result<(i32, usize), CompressionError> {
    let mut current = *src.first().ok_or(CompressionError::Truncated)?;
    let negative = current & SIGN != 0;
    let mut value = (current & 0x3f) as u32;
    let mut pos = 0;

    for (mask, shift) in MASKS.iter().zip(SHIFTS) {
        if current & EXTEND == 0 {
            break;
        }
        pos += 1;
        current = *src.get(pos).ok_or(CompressionError::Truncated)?;
        value |= (current as u32 & mask) << shift;
    }

    let value = value as i32;
    Ok((if negative { !value } else { value }, pos + 1))
}

/// Pack every little-endian 32-bit word of `src`.
pub fn compress(src: &[u8]) -> Result<Vec<u8>, CompressionError> {
    if src.len() % 4 != 0 {
        return Err(CompressionError::Unaligned(src.len()));
    }

    let mut out = Vec::with_capacity(src.len());
    for word in src.chunks_exact(4) {
        pack(&mut out, LittleEndian::read_i32(word));
    }
    Ok(out)
}

/// Unpack a stream of varints into little-endian words, refusing to produce
/// more than `limit` bytes.
pub fn decompress(src: &[u8], limit: usize) -> Result<Vec<u8>, CompressionError> {
    let mut out = Vec::with_capacity(src.len().min(limit));
    let mut pos = 0;
    while pos < src.len() {
        if out.len() + 4 > limit {
            return Err(CompressionError::OutputOverflow { limit });
        }
        let (value, used) = unpack(&src[pos..])?;
        let mut word = [0u8; 4];
        LittleEndian::write_i32(&mut word, value);
        out.extend_from_slice(&word);
        pos += used;
    }
    Ok(out)
}
