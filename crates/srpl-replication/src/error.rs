use srpl_protocol::{PeerId, ProtocolError, TlvType};

use crate::session::Phase;
use crate::transport::TransportError;

/// API misuse reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SrplError {
    #[error("operation not allowed in state {0}")]
    InvalidState(&'static str),
    #[error("invalid domain {0:?}")]
    InvalidDomain(String),
}

/// A fatal session error. Never leaves the session: it is logged, the link
/// is aborted and the session drops back to `ToSync`.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("malformed message: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{tlv} not allowed in phase {phase}")]
    UnexpectedTlv { tlv: TlvType, phase: Phase },
    #[error("response {response} does not answer request {request}")]
    ResponseMismatch { request: TlvType, response: TlvType },
    #[error("unidirectional message {0}")]
    Unidirectional(TlvType),
    #[error("partner returned rcode {0}")]
    ResponseCode(u8),
    #[error("peer id conflict: {0}")]
    IdConflict(PeerId),
    #[error("partner with smaller id {0} connected to us")]
    SmallerId(PeerId),
    #[error("partner id changed from {expected} to {found}")]
    IdMismatch { expected: PeerId, found: PeerId },
    #[error("partner did not send its peer id")]
    MissingPeerId,
    #[error("partner did not assign an id")]
    MissingAssignment,
    #[error("unsolicited id assignment {0}")]
    UnsolicitedAssignment(PeerId),
    #[error("host response with no host request outstanding")]
    NothingOutstanding,
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}
