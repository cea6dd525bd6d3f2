//! Order-preserving variable-length encoding for unsigned 64-bit integers.
//!
//! Every persisted integer key and value goes through this codec. Encoded
//! values compare byte-lexicographically in the same order as the integers
//! they encode, and the leading byte alone determines the encoded length.
//!
//! | Range              | Bytes | Leading byte            |
//! |--------------------|-------|-------------------------|
//! | `0..=240`          | 1     | the value               |
//! | `241..=2287`       | 2     | `241 + ((v - 240) >> 8)` |
//! | `2288..=67823`     | 3     | `249`                   |
//! | `67824..`          | 4-9   | `247 + n`, `n` BE bytes |

use crate::error::{Result, StoreError};

/// Longest possible encoding.
pub const MAX_LEN: usize = 9;

const ONE_BYTE_MAX: u64 = 240;
const TWO_BYTE_MAX: u64 = 2287;
const THREE_BYTE_MAX: u64 = 67823;
const THREE_BYTE_LEAD: u8 = 249;

/// Number of bytes `value` encodes to.
pub fn encoded_len(value: u64) -> usize {
    if value <= ONE_BYTE_MAX {
        1
    } else if value <= TWO_BYTE_MAX {
        2
    } else if value <= THREE_BYTE_MAX {
        3
    } else {
        1 + significant_bytes(value)
    }
}

fn significant_bytes(value: u64) -> usize {
    8 - (value.leading_zeros() as usize / 8)
}

/// Append the encoding of `value` to `out`.
pub fn encode_into(value: u64, out: &mut Vec<u8>) {
    if value <= ONE_BYTE_MAX {
        out.push(value as u8);
    } else if value <= TWO_BYTE_MAX {
        let v = value - ONE_BYTE_MAX;
        out.push(241 + (v >> 8) as u8);
        out.push((v & 0xFF) as u8);
    } else if value <= THREE_BYTE_MAX {
        let v = value - (TWO_BYTE_MAX + 1);
        out.push(THREE_BYTE_LEAD);
        out.push((v >> 8) as u8);
        out.push((v & 0xFF) as u8);
    } else {
        let n = significant_bytes(value);
        out.push(247 + n as u8);
        out.extend_from_slice(&value.to_be_bytes()[8 - n..]);
    }
}

/// Encode `value` into a fresh buffer.
pub fn encode(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(value));
    encode_into(value, &mut out);
    out
}

/// Encode a possibly out-of-range integer, rejecting negatives and values above `u64::MAX`.
pub fn try_encode(value: i128) -> Result<Vec<u8>> {
    if value < 0 {
        return Err(StoreError::InvalidInput(format!(
            "cannot encode negative value {}",
            value
        )));
    }
    let value = u64::try_from(value)
        .map_err(|_| StoreError::Overflow(format!("{} exceeds 2^64-1", value)))?;
    Ok(encode(value))
}

/// Decode one value from the front of `buf`, returning it with the bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(u64, usize)> {
    let lead = *buf
        .first()
        .ok_or_else(|| StoreError::InvalidEncoding("empty buffer".into()))?;

    let need = match lead {
        0..=240 => return Ok((lead as u64, 1)),
        241..=248 => 2,
        THREE_BYTE_LEAD => 3,
        _ => 1 + (lead - 247) as usize,
    };
    if buf.len() < need {
        return Err(StoreError::InvalidEncoding(format!(
            "need {} bytes, have {}",
            need,
            buf.len()
        )));
    }

    let value = match lead {
        241..=248 => ONE_BYTE_MAX + (((lead - 241) as u64) << 8) + buf[1] as u64,
        THREE_BYTE_LEAD => TWO_BYTE_MAX + 1 + ((buf[1] as u64) << 8) + buf[2] as u64,
        _ => buf[1..need]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64),
    };
    Ok((value, need))
}

/// Decode a buffer that must hold exactly one encoded value.
pub fn decode_exact(buf: &[u8]) -> Result<u64> {
    let (value, used) = decode(buf)?;
    if used != buf.len() {
        return Err(StoreError::InvalidEncoding(format!(
            "{} trailing bytes",
            buf.len() - used
        )));
    }
    Ok(value)
}

/// Decode two consecutive values, as used by composite keys.
pub fn decode_pair(buf: &[u8]) -> Result<(u64, u64)> {
    let (first, used) = decode(buf)?;
    let second = decode_exact(&buf[used..])?;
    Ok((first, second))
}

/// Encode two values back to back.
pub fn encode_pair(first: u64, second: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(first) + encoded_len(second));
    encode_into(first, &mut out);
    encode_into(second, &mut out);
    out
}
