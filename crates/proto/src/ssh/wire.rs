//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Every message codec in this crate is built from these primitives:
//!
//! ```text
//! uint32     4 bytes, big-endian
//! boolean    1 byte, 0 = false, anything else = true
//! string     uint32 length + bytes
//! mpint      string holding a two's complement big-endian integer
//! name-list  string holding comma-separated ASCII names
//! ```
//!
//! Readers take the whole message and a cursor offset. Any read past the end
//! of the message fails with [`SkiffError::MalformedPacket`].

use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

/// Writes an SSH `string` from UTF-8 text.
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_bytes(buf, s.as_bytes());
}

/// Writes an SSH `string` from raw bytes.
pub fn write_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Writes an SSH `boolean`.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes an SSH `name-list`.
pub fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    write_string(buf, &names.join(","));
}

/// Writes an unsigned big-endian magnitude as an SSH `mpint`.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    buf.put_slice(&encode_mpint(magnitude));
}

/// Encodes an unsigned big-endian magnitude as an SSH `mpint`.
///
/// Leading zero bytes are stripped, and a zero byte is prepended when the
/// high bit is set so the value stays positive. Zero encodes as an empty
/// string.
///
/// # Example
///
/// ```rust
/// use skiff_proto::ssh::wire::encode_mpint;
///
/// assert_eq!(encode_mpint(&[0x00, 0x7f]), vec![0, 0, 0, 1, 0x7f]);
/// assert_eq!(encode_mpint(&[0x80]), vec![0, 0, 0, 2, 0x00, 0x80]);
/// assert_eq!(encode_mpint(&[0, 0]), vec![0, 0, 0, 0]);
/// ```
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    if trimmed.is_empty() {
        return vec![0, 0, 0, 0];
    }

    let needs_padding = trimmed[0] & 0x80 != 0;
    let length = trimmed.len() + usize::from(needs_padding);

    let mut out = Vec::with_capacity(4 + length);
    out.extend_from_slice(&(length as u32).to_be_bytes());
    if needs_padding {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Reads one byte.
pub fn read_u8(data: &[u8], offset: &mut usize) -> SkiffResult<u8> {
    let byte = *data.get(*offset).ok_or_else(|| {
        SkiffError::MalformedPacket(format!("Cannot read byte at offset {}", offset))
    })?;
    *offset += 1;
    Ok(byte)
}

/// Reads an SSH `boolean`.
pub fn read_bool(data: &[u8], offset: &mut usize) -> SkiffResult<bool> {
    Ok(read_u8(data, offset)? != 0)
}

/// Reads an SSH `uint32`.
pub fn read_u32(data: &[u8], offset: &mut usize) -> SkiffResult<u32> {
    let end = offset.checked_add(4).filter(|&end| end <= data.len());
    let end = end.ok_or_else(|| {
        SkiffError::MalformedPacket(format!("Cannot read u32 at offset {}", offset))
    })?;

    let value = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset = end;

    Ok(value)
}

/// Reads an SSH `string` as a borrowed slice.
pub fn read_slice<'a>(data: &'a [u8], offset: &mut usize) -> SkiffResult<&'a [u8]> {
    let length = read_u32(data, offset)? as usize;

    let end = offset
        .checked_add(length)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| {
            SkiffError::MalformedPacket(format!(
                "Data truncated: expected {} bytes at offset {}",
                length, offset
            ))
        })?;

    let bytes = &data[*offset..end];
    *offset = end;

    Ok(bytes)
}

/// Reads an SSH `string` as owned bytes.
pub fn read_bytes(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<u8>> {
    read_slice(data, offset).map(<[u8]>::to_vec)
}

/// Reads an SSH `string` as UTF-8 text.
pub fn read_string(data: &[u8], offset: &mut usize) -> SkiffResult<String> {
    let bytes = read_bytes(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| SkiffError::MalformedPacket("String contains invalid UTF-8".to_string()))
}

/// Reads an SSH `name-list`.
pub fn read_name_list(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<String>> {
    let list = read_string(data, offset)?;
    if list.is_empty() {
        Ok(vec![])
    } else {
        Ok(list.split(',').map(String::from).collect())
    }
}

/// Reads an SSH `mpint` and returns its unsigned magnitude.
///
/// Negative values are rejected since no key exchange value may be negative.
pub fn read_mpint(data: &[u8], offset: &mut usize) -> SkiffResult<Vec<u8>> {
    let raw = read_slice(data, offset)?;
    if raw.first().is_some_and(|b| b & 0x80 != 0) {
        return Err(SkiffError::MalformedPacket(
            "Negative mpint where a positive value is required".to_string(),
        ));
    }
    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
    Ok(raw[start..].to_vec())
}

/// Checks that a message starts with the expected message number.
pub fn expect_message(data: &[u8], expected: u8, name: &str) -> SkiffResult<()> {
    match data.first() {
        None => Err(SkiffError::MalformedPacket(format!("{} message is empty", name))),
        Some(&b) if b == expected => Ok(()),
        Some(&b) => Err(SkiffError::Protocol(format!(
            "Invalid message type: expected {} ({}), got {}",
            expected, name, b
        ))),
    }
}
