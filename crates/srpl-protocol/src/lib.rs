//! SRPL Protocol -- TLV codec, DSO framing, message types, discovery records.
//!
//! SRPL rides on a DSO-style TCP stream: 2-byte big-endian frame length,
//! 12-byte DNS header (opcode DSO), then a sequence of TLVs. The first TLV
//! is the primary TLV and names the message; everything after it is
//! secondary and skippable unless the message defines it.

pub mod codec;
pub mod dataset_id;
pub mod messages;
pub mod name;
pub mod params;
pub mod peer_id;
pub mod tlv;
pub mod txt;

pub use codec::{DsoHeader, Frame, FrameCodec, MessageId, RequestTracker};
pub use dataset_id::DatasetId;
pub use messages::{CandidateRequest, CandidateVerdict, HostMessage, HostRequest, SessionTlv};
pub use params::{ProtocolParams, CURRENT_PARAMS, DEFAULT_DOMAIN, SRPL_V1};
pub use peer_id::PeerId;
pub use tlv::{Tlv, TlvType};
pub use txt::{PartnerInfo, PartnerTxt, TxtError};

/// DNS header size that precedes every TLV sequence.
pub const DNS_HEADER_SIZE: usize = 12;

/// Largest DSO message: the frame length prefix is a u16.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated tlv at offset {offset}")]
    Truncated { offset: usize },
    #[error("tlv at offset {offset} overflows the 16-bit message range")]
    LengthOverflow { offset: usize },
    #[error("empty message: no primary tlv")]
    Empty,
    #[error("unexpected primary tlv: expected {expected}, found {found}")]
    UnexpectedPrimary { expected: TlvType, found: TlvType },
    #[error("unrecognized primary tlv {0}")]
    UnrecognizedPrimary(TlvType),
    #[error("unexpected secondary tlv {0}")]
    UnexpectedTlv(TlvType),
    #[error("duplicate tlv {0}")]
    DuplicateTlv(TlvType),
    #[error("missing tlv {0}")]
    MissingTlv(TlvType),
    #[error("bad length {length} for tlv {tlv}")]
    BadLength { tlv: TlvType, length: u16 },
    #[error("invalid dns name: {0}")]
    InvalidName(String),
    #[error("invalid dns header: {0}")]
    InvalidHeader(String),
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
