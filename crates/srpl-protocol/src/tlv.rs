//! TLV codec.
//!
//! Each TLV is a 2-byte type, a 2-byte length and `length` value bytes,
//! all big-endian. Every read from a peer-supplied buffer goes through
//! `Tlv::read_from`, which bounds-checks the whole TLV before any field
//! inside it is trusted.

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::{ProtocolError, Result, MAX_MESSAGE_SIZE};

/// Size of the fixed TLV header (type + length).
pub const TLV_HEADER_SIZE: usize = 4;

/// A DSO TLV type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TlvType(pub u16);

impl TlvType {
    // -- DSO common types --
    pub const RESERVED: Self = Self(0x0000);
    pub const KEEP_ALIVE: Self = Self(0x0001);
    pub const RETRY_DELAY: Self = Self(0x0002);
    pub const ENCRYPTION_PADDING: Self = Self(0x0003);

    // -- SRPL primary types --
    pub const SESSION: Self = Self(0xf90c);
    pub const SEND_CANDIDATES: Self = Self(0xf90d);
    pub const CANDIDATE: Self = Self(0xf90e);
    pub const HOST: Self = Self(0xf90f);

    // -- SRPL secondary types --
    pub const CANDIDATE_YES: Self = Self(0xf911);
    pub const CANDIDATE_NO: Self = Self(0xf912);
    pub const CONFLICT: Self = Self(0xf913);
    pub const HOSTNAME: Self = Self(0xf914);
    pub const HOST_MESSAGE: Self = Self(0xf915);
    pub const TIME_OFFSET: Self = Self(0xf916);
    pub const KEY_ID: Self = Self(0xf917);

    /// Every type this implementation understands.
    pub const KNOWN: [Self; 15] = [
        Self::RESERVED,
        Self::KEEP_ALIVE,
        Self::RETRY_DELAY,
        Self::ENCRYPTION_PADDING,
        Self::SESSION,
        Self::SEND_CANDIDATES,
        Self::CANDIDATE,
        Self::HOST,
        Self::CANDIDATE_YES,
        Self::CANDIDATE_NO,
        Self::CONFLICT,
        Self::HOSTNAME,
        Self::HOST_MESSAGE,
        Self::TIME_OFFSET,
        Self::KEY_ID,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::RESERVED => "Reserved",
            Self::KEEP_ALIVE => "KeepAlive",
            Self::RETRY_DELAY => "RetryDelay",
            Self::ENCRYPTION_PADDING => "EncryptionPadding",
            Self::SESSION => "Session",
            Self::SEND_CANDIDATES => "SendCandidates",
            Self::CANDIDATE => "Candidate",
            Self::HOST => "Host",
            Self::CANDIDATE_YES => "CandidateYes",
            Self::CANDIDATE_NO => "CandidateNo",
            Self::CONFLICT => "Conflict",
            Self::HOSTNAME => "Hostname",
            Self::HOST_MESSAGE => "HostMessage",
            Self::TIME_OFFSET => "TimeOffset",
            Self::KEY_ID => "KeyId",
            _ => "Unknown",
        }
    }

    /// True for types a receiver must silently skip when they trail the
    /// primary TLV: padding and anything this implementation does not know.
    pub fn is_unrecognized_or_padding(self) -> bool {
        self == Self::ENCRYPTION_PADDING || !Self::KNOWN.contains(&self)
    }

    /// Primary TLVs that open an SRPL request or response.
    pub fn is_srpl_primary(self) -> bool {
        matches!(
            self,
            Self::SESSION | Self::SEND_CANDIDATES | Self::CANDIDATE | Self::HOST
        )
    }
}

impl fmt::Display for TlvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#06x})", self.name(), self.0)
    }
}

/// A TLV header read from (or destined for) a message buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv {
    pub tlv_type: TlvType,
    pub length: u16,
}

impl Tlv {
    pub fn new(tlv_type: TlvType, length: u16) -> Self {
        Self { tlv_type, length }
    }

    /// Read the TLV header at `offset` and validate that the whole TLV lies
    /// inside `buf` and inside the 16-bit message range.
    pub fn read_from(buf: &[u8], offset: usize) -> Result<Self> {
        let header = offset
            .checked_add(TLV_HEADER_SIZE)
            .and_then(|end| buf.get(offset..end))
            .ok_or(ProtocolError::Truncated { offset })?;

        let tlv = Self {
            tlv_type: TlvType(u16::from_be_bytes([header[0], header[1]])),
            length: u16::from_be_bytes([header[2], header[3]]),
        };

        let end = offset + tlv.size();
        if end > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::LengthOverflow { offset });
        }
        if end > buf.len() {
            return Err(ProtocolError::Truncated { offset });
        }
        Ok(tlv)
    }

    /// Header plus value size.
    pub fn size(&self) -> usize {
        TLV_HEADER_SIZE + self.length as usize
    }

    /// The value bytes of this TLV, which was read at `offset` in `buf`.
    pub fn value<'a>(&self, buf: &'a [u8], offset: usize) -> Result<&'a [u8]> {
        buf.get(offset + TLV_HEADER_SIZE..offset + self.size())
            .ok_or(ProtocolError::Truncated { offset })
    }

    fn write_header(&self, buf: &mut BytesMut) {
        buf.put_u16(self.tlv_type.0);
        buf.put_u16(self.length);
    }
}

/// Append a TLV with the given value.
pub fn append_tlv(buf: &mut BytesMut, tlv_type: TlvType, value: &[u8]) -> Result<()> {
    let length = u16::try_from(value.len()).map_err(|_| ProtocolError::MessageTooLarge {
        size: value.len(),
        max: u16::MAX as usize,
    })?;
    check_room(buf, TLV_HEADER_SIZE + value.len())?;
    Tlv::new(tlv_type, length).write_header(buf);
    buf.extend_from_slice(value);
    Ok(())
}

/// Append a zero-length TLV (SRPL primaries carry no value).
pub fn append_empty_tlv(buf: &mut BytesMut, tlv_type: TlvType) -> Result<()> {
    append_tlv(buf, tlv_type, &[])
}

/// Append a TLV whose value is a single big-endian u32.
pub fn append_uint32_tlv(buf: &mut BytesMut, tlv_type: TlvType, value: u32) -> Result<()> {
    append_tlv(buf, tlv_type, &value.to_be_bytes())
}

/// Overwrite four bytes at `offset` with a big-endian u32.
pub fn write_uint32_value(buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let slot = offset
        .checked_add(4)
        .and_then(|end| buf.get_mut(offset..end))
        .ok_or(ProtocolError::Truncated { offset })?;
    slot.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Read a big-endian u32 starting at `offset`.
pub fn read_uint32_value(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes = offset
        .checked_add(4)
        .and_then(|end| buf.get(offset..end))
        .ok_or(ProtocolError::Truncated { offset })?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a TLV at `offset` whose value must be exactly one u32.
pub fn read_uint32_tlv(buf: &[u8], offset: usize) -> Result<(Tlv, u32)> {
    let tlv = Tlv::read_from(buf, offset)?;
    if tlv.length != 4 {
        return Err(ProtocolError::BadLength {
            tlv: tlv.tlv_type,
            length: tlv.length,
        });
    }
    Ok((tlv, read_uint32_value(buf, offset + TLV_HEADER_SIZE)?))
}

/// Append a TLV header with a placeholder length and return its offset.
/// The value is appended afterwards and the length fixed with
/// `update_tlv_length_in_message`.
pub fn begin_tlv(buf: &mut BytesMut, tlv_type: TlvType) -> Result<usize> {
    check_room(buf, TLV_HEADER_SIZE)?;
    let offset = buf.len();
    Tlv::new(tlv_type, 0).write_header(buf);
    Ok(offset)
}

/// Rewrite the length of the TLV at `offset` so it spans to the end of `buf`.
pub fn update_tlv_length_in_message(buf: &mut BytesMut, offset: usize) -> Result<()> {
    let value_start = offset + TLV_HEADER_SIZE;
    if buf.len() < value_start {
        return Err(ProtocolError::Truncated { offset });
    }
    let length = buf.len() - value_start;
    let length = u16::try_from(length).map_err(|_| ProtocolError::MessageTooLarge {
        size: length,
        max: u16::MAX as usize,
    })?;
    buf[offset + 2..value_start].copy_from_slice(&length.to_be_bytes());
    Ok(())
}

fn check_room(buf: &BytesMut, extra: usize) -> Result<()> {
    let size = buf.len() + extra;
    if size > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}
