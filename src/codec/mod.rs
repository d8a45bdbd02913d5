//! MQTT Packet Codec
//!
//! Provides encoding and decoding for MQTT v3.1.1 packets. The codec is
//! bidirectional: the client encodes CONNECT/PUBLISH/SUBSCRIBE and decodes
//! CONNACK/SUBACK, but every packet type round-trips so tests can play the
//! broker side of a connection.

mod decode;
mod encode;

#[cfg(test)]
mod tests;

pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Largest value a four-byte remaining-length varint can carry
/// (268,435,455 bytes, ~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default maximum packet size accepted from the server (1 MB)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Decode a remaining-length varint from the front of `buf`.
///
/// Each byte contributes seven low-order bits, least significant group
/// first; the high bit marks continuation. At most four bytes are legal.
/// Returns the value and how many bytes it occupied.
#[inline]
pub fn read_varint(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value: u32 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    // Ran out of input mid-varint
    Err(DecodeError::InsufficientData)
}

/// Append `value` to `buf` as a remaining-length varint.
/// Returns how many bytes were written (1-4).
#[inline]
pub fn write_varint(buf: &mut BytesMut, value: u32) -> Result<usize, EncodeError> {
    if value as usize > MAX_REMAINING_LENGTH {
        return Err(EncodeError::PacketTooLarge);
    }
    let mut rest = value;
    let mut written = 0;
    loop {
        let mut group = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest != 0 {
            group |= 0x80;
        }
        buf.put_u8(group);
        written += 1;
        if rest == 0 {
            return Ok(written);
        }
    }
}

/// Split a two-byte-length-prefixed field off the front of `buf`.
/// Returns the field and the total bytes consumed including the prefix.
#[inline]
fn split_prefixed(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    let [hi, lo, rest @ ..] = buf else {
        return Err(DecodeError::InsufficientData);
    };
    let len = usize::from(u16::from_be_bytes([*hi, *lo]));
    match rest.get(..len) {
        Some(field) => Ok((field, 2 + len)),
        None => Err(DecodeError::InsufficientData),
    }
}

/// Decode a length-prefixed UTF-8 string, enforcing the MQTT ban on NUL
#[inline]
pub fn read_utf8(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (raw, consumed) = split_prefixed(buf)?;
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    if text.bytes().any(|b| b == 0) {
        return Err(DecodeError::MalformedPacket("NUL in UTF-8 string"));
    }
    Ok((text, consumed))
}

/// Decode a length-prefixed byte field
#[inline]
pub fn read_blob(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    split_prefixed(buf)
}

/// Append a length-prefixed byte field
#[inline]
pub fn write_blob(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Append a length-prefixed UTF-8 string
#[inline]
pub fn write_utf8(buf: &mut BytesMut, text: &str) -> Result<(), EncodeError> {
    write_blob(buf, text.as_bytes())
}
