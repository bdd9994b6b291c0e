//! Little-endian, length-prefixed primitives shared by the record and
//! envelope encodings.
//!
//! Strings and byte strings are written as a `u32` length followed by the raw
//! bytes. Readers check the remaining length before every fixed-size read so a
//! truncated frame surfaces as [`CodecError::Truncated`] instead of a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::CodecError;

/// Fails with [`CodecError::Truncated`] unless `needed` bytes remain.
///
/// # Errors
/// Returns an error if the buffer holds fewer than `needed` bytes.
pub fn ensure(buf: &impl Buf, needed: usize, context: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            context,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Writes a length-prefixed UTF-8 string.
#[allow(clippy::cast_possible_truncation)] // Sizes bounded by limits.
pub fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// Writes a length-prefixed byte string.
#[allow(clippy::cast_possible_truncation)] // Sizes bounded by limits.
pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

/// Reads a single byte.
///
/// # Errors
/// Returns an error if the buffer is empty.
pub fn get_u8(buf: &mut impl Buf, context: &'static str) -> Result<u8, CodecError> {
    ensure(buf, 1, context)?;
    Ok(buf.get_u8())
}

/// Reads a little-endian `u32`.
///
/// # Errors
/// Returns an error if fewer than four bytes remain.
pub fn get_u32(buf: &mut impl Buf, context: &'static str) -> Result<u32, CodecError> {
    ensure(buf, 4, context)?;
    Ok(buf.get_u32_le())
}

/// Reads a length-prefixed byte string.
///
/// # Errors
/// Returns an error if the length prefix or the bytes are truncated.
pub fn get_bytes(buf: &mut impl Buf, context: &'static str) -> Result<Bytes, CodecError> {
    let len = get_u32(buf, context)? as usize;
    ensure(buf, len, context)?;
    Ok(buf.copy_to_bytes(len))
}

/// Reads a length-prefixed UTF-8 string.
///
/// # Errors
/// Returns an error if the bytes are truncated or not valid UTF-8.
pub fn get_str(buf: &mut impl Buf, context: &'static str) -> Result<String, CodecError> {
    let raw = get_bytes(buf, context)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 { context })
}
