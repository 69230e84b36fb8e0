//! SSH data type representations (RFC 4251 Section 5).
//!
//! Every message codec in this crate encodes into a [`BytesMut`] and decodes
//! from a byte slice with an explicit `offset` cursor. Reads are bounds
//! checked and fail with [`SshError::Protocol`] on truncated input.
//!
//! | Type        | Encoding                                       |
//! |-------------|------------------------------------------------|
//! | `boolean`   | one byte, 0 = false                            |
//! | `uint32`    | four bytes, big-endian                         |
//! | `uint64`    | eight bytes, big-endian                        |
//! | `string`    | uint32 length followed by the bytes            |
//! | `mpint`     | string holding a two's complement integer      |
//! | `name-list` | string holding comma-separated ASCII names     |

use bytes::{BufMut, BytesMut};
use sshwire_platform::{SshError, SshResult};

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

/// Writes a `name-list`.
pub fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    write_string(buf, &names.join(","));
}

/// Writes an unsigned big-endian integer as an SSH `mpint`.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    write_bytes(buf, &encode_mpint(magnitude));
}

/// Encodes an unsigned big-endian integer as the body of an SSH `mpint`.
///
/// Leading zero bytes are stripped and a single zero byte is prepended
/// when the high bit is set, so the value stays positive.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(trimmed.len() + 1);
    if trimmed[0] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

fn ensure(data: &[u8], offset: usize, needed: usize, what: &str) -> SshResult<()> {
    if offset.checked_add(needed).map_or(true, |end| end > data.len()) {
        return Err(SshError::Protocol(format!(
            "Cannot read {} at offset {}",
            what, offset
        )));
    }
    Ok(())
}

/// Reads a single byte.
pub fn read_u8(data: &[u8], offset: &mut usize) -> SshResult<u8> {
    ensure(data, *offset, 1, "byte")?;
    let value = data[*offset];
    *offset += 1;
    Ok(value)
}

/// Reads an SSH `boolean` (any non-zero byte is true).
pub fn read_bool(data: &[u8], offset: &mut usize) -> SshResult<bool> {
    Ok(read_u8(data, offset)? != 0)
}

/// Reads a big-endian `uint32`.
pub fn read_u32(data: &[u8], offset: &mut usize) -> SshResult<u32> {
    ensure(data, *offset, 4, "u32")?;
    let value = u32::from_be_bytes([
        data[*offset],
        data[*offset + 1],
        data[*offset + 2],
        data[*offset + 3],
    ]);
    *offset += 4;
    Ok(value)
}

/// Reads a big-endian `uint64`.
pub fn read_u64(data: &[u8], offset: &mut usize) -> SshResult<u64> {
    ensure(data, *offset, 8, "u64")?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(raw))
}

/// Borrows the body of an SSH `string` without copying.
pub fn read_slice<'a>(data: &'a [u8], offset: &mut usize) -> SshResult<&'a [u8]> {
    let length = read_u32(data, offset)? as usize;
    if offset.checked_add(length).map_or(true, |end| end > data.len()) {
        return Err(SshError::Protocol(format!(
            "Data truncated: expected {} bytes at offset {}",
            length, offset
        )));
    }
    let slice = &data[*offset..*offset + length];
    *offset += length;
    Ok(slice)
}

/// Reads an SSH `string` as raw bytes.
pub fn read_bytes(data: &[u8], offset: &mut usize) -> SshResult<Vec<u8>> {
    read_slice(data, offset).map(<[u8]>::to_vec)
}

/// Reads an SSH `string` that must be valid UTF-8.
pub fn read_string(data: &[u8], offset: &mut usize) -> SshResult<String> {
    let bytes = read_bytes(data, offset)?;
    String::from_utf8(bytes)
        .map_err(|_| SshError::Protocol("String contains invalid UTF-8".to_string()))
}

/// Reads a `name-list`. An empty list decodes to an empty vector.
pub fn read_name_list(data: &[u8], offset: &mut usize) -> SshResult<Vec<String>> {
    let raw = read_slice(data, offset)?;
    let list = std::str::from_utf8(raw)
        .map_err(|_| SshError::Protocol("Name-list contains invalid UTF-8".to_string()))?;

    if list.is_empty() {
        Ok(vec![])
    } else {
        Ok(list.split(',').map(String::from).collect())
    }
}

/// Reads an SSH `mpint` and returns its unsigned magnitude without the sign
/// byte. Negative values are rejected.
pub fn read_mpint(data: &[u8], offset: &mut usize) -> SshResult<Vec<u8>> {
    let raw = read_slice(data, offset)?;
    if raw.first().map_or(false, |b| b & 0x80 != 0) {
        return Err(SshError::Protocol("Negative mpint".to_string()));
    }
    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
    Ok(raw[start..].to_vec())
}

/// Left-pads a big-endian magnitude to `len` bytes.
///
/// Returns `None` if the value does not fit.
pub fn pad_be(magnitude: &[u8], len: usize) -> Option<Vec<u8>> {
    if magnitude.len() > len {
        return None;
    }
    let mut out = vec![0u8; len - magnitude.len()];
    out.extend_from_slice(magnitude);
    Some(out)
}
