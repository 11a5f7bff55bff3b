//! Multi-byte integer ("remaining length") encoding.
//!
//! Values are written least significant group first, seven bits per byte,
//! with bit 7 set on every byte except the last. At most four bytes are
//! allowed, which caps the value at 268,435,455.

use heapless::Vec;

use crate::network::application::mqtt::error::Error;

/// Largest value representable in four digits.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Maximum number of digits.
pub const MAX_DIGITS: usize = 4;

/// Encode `value`.
pub fn encode(mut value: usize) -> Result<Vec<u8, MAX_DIGITS>, Error> {
    if value > MAX_REMAINING_LENGTH {
        return Err(Error::MalformedLength);
    }
    let mut digits = Vec::new();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        // Cannot overflow: the range check above bounds the digit count.
        digits.push(byte).map_err(|_| Error::MalformedLength)?;
        if value == 0 {
            break;
        }
    }
    Ok(digits)
}

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len(value: usize) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Decode a value from the start of `bytes`.
///
/// Returns `Ok(None)` when `bytes` ends before the final digit, and
/// `Ok(Some((value, digits_consumed)))` otherwise. A continuation bit on
/// the fourth digit is a framing error.
pub fn decode(bytes: &[u8]) -> Result<Option<(usize, usize)>, Error> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, &byte) in bytes.iter().enumerate() {
        if i == MAX_DIGITS {
            return Err(Error::MalformedLength);
        }
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if bytes.len() >= MAX_DIGITS {
        return Err(Error::MalformedLength);
    }
    Ok(None)
}
