//! Length-prefixed MQTT strings and binary fields.
//!
//! Rust strings are already well-formed UTF-8, so surrogate code points and
//! overlong sequences can only show up in bytes read off the wire, where
//! `str::from_utf8` rejects them. On top of that MQTT forbids Unicode
//! noncharacters, which are checked here in both directions.

use crate::network::application::mqtt::error::Error;

/// Longest string or binary field a two-byte length prefix allows.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

fn is_noncharacter(c: char) -> bool {
    let cp = c as u32;
    (0xFDD0..=0xFDEF).contains(&cp) || (cp & 0xFFFE) == 0xFFFE
}

/// Check that `s` is a legal MQTT string.
pub fn validate(s: &str) -> Result<(), Error> {
    if let Some(c) = s.chars().find(|&c| is_noncharacter(c)) {
        return Err(Error::InvalidArgument(format!(
            "string contains noncharacter U+{:04X}",
            c as u32
        )));
    }
    Ok(())
}

/// Append `s` with its length prefix.
pub fn encode_string(buf: &mut Vec<u8>, s: &str) -> Result<(), Error> {
    validate(s)?;
    encode_binary(buf, s.as_bytes())
}

/// Append `data` with its length prefix.
pub fn encode_binary(buf: &mut Vec<u8>, data: &[u8]) -> Result<(), Error> {
    if data.len() > MAX_FIELD_LEN {
        return Err(Error::InvalidArgument(format!(
            "field of {} bytes exceeds {MAX_FIELD_LEN}",
            data.len()
        )));
    }
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
    Ok(())
}

/// Read a length-prefixed field; returns the field and the bytes consumed.
pub fn decode_binary(data: &[u8]) -> Result<(&[u8], usize), Error> {
    if data.len() < 2 {
        return Err(Error::MalformedPacket("truncated length prefix"));
    }
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let field = data
        .get(2..2 + len)
        .ok_or(Error::MalformedPacket("field runs past end of packet"))?;
    Ok((field, 2 + len))
}

/// Read a length-prefixed string; returns the string and the bytes consumed.
pub fn decode_string(data: &[u8]) -> Result<(String, usize), Error> {
    let (bytes, used) = decode_binary(data)?;
    let s = core::str::from_utf8(bytes)
        .map_err(|e| Error::InvalidArgument(format!("invalid UTF-8: {e}")))?;
    validate(s)?;
    Ok((s.to_string(), used))
}
