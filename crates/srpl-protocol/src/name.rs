//! Uncompressed DNS wire-format names, as carried in the Hostname TLV.

use bytes::{BufMut, BytesMut};

use crate::{ProtocolError, Result};

/// Longest label allowed in a DNS name.
pub const MAX_LABEL_LENGTH: usize = 63;

/// Longest encoded DNS name, including the terminating zero label.
pub const MAX_NAME_LENGTH: usize = 255;

/// Append `name` as length-prefixed labels followed by the root label.
/// A trailing dot is optional; empty interior labels are rejected.
pub fn append_name(buf: &mut BytesMut, name: &str) -> Result<()> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    let mut encoded = BytesMut::with_capacity(trimmed.len() + 2);

    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
                return Err(ProtocolError::InvalidName(name.to_string()));
            }
            encoded.put_u8(label.len() as u8);
            encoded.extend_from_slice(label.as_bytes());
        }
    }
    encoded.put_u8(0);

    if encoded.len() > MAX_NAME_LENGTH {
        return Err(ProtocolError::InvalidName(name.to_string()));
    }
    buf.extend_from_slice(&encoded);
    Ok(())
}

/// Read a name starting at `offset` that must end at or before `end`.
/// Returns the dotted name (always with a trailing dot) and the offset just
/// past the root label. Compression pointers are not allowed.
pub fn read_name(buf: &[u8], offset: usize, end: usize) -> Result<(String, usize)> {
    let end = end.min(buf.len());
    let mut name = String::new();
    let mut pos = offset;

    loop {
        let len = *buf
            .get(pos)
            .filter(|_| pos < end)
            .ok_or_else(|| ProtocolError::InvalidName("truncated".into()))?
            as usize;
        pos += 1;

        if len == 0 {
            break;
        }
        if len > MAX_LABEL_LENGTH {
            // 0xc0 prefix is a compression pointer, 0x40/0x80 are reserved.
            return Err(ProtocolError::InvalidName(format!(
                "label length byte {len:#04x}"
            )));
        }
        let label = buf
            .get(pos..pos + len)
            .filter(|_| pos + len <= end)
            .ok_or_else(|| ProtocolError::InvalidName("truncated label".into()))?;
        let label = std::str::from_utf8(label)
            .map_err(|_| ProtocolError::InvalidName("label is not utf-8".into()))?;
        name.push_str(label);
        name.push('.');
        pos += len;

        if pos - offset > MAX_NAME_LENGTH {
            return Err(ProtocolError::InvalidName("name too long".into()));
        }
    }

    if name.is_empty() {
        name.push('.');
    }
    Ok((name, pos))
}
