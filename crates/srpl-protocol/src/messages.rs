//! SRPL message bodies.
//!
//! Every message opens with its primary TLV. The secondary TLVs a message
//! defines follow in any order, each at most once; unrecognized and padding
//! TLVs are skipped; any other known TLV is a protocol error. Parsing must
//! land exactly on the end of the message.

use bytes::{Bytes, BytesMut};

use crate::name::{append_name, read_name};
use crate::peer_id::PeerId;
use crate::tlv::{
    append_empty_tlv, append_uint32_tlv, begin_tlv, read_uint32_tlv, read_uint32_value,
    update_tlv_length_in_message, write_uint32_value, Tlv, TlvType, TLV_HEADER_SIZE,
};
use crate::{ProtocolError, Result, DNS_HEADER_SIZE};

/// Fixed fields of a HostMessage value: rx-time offset, lease, key lease.
pub const HOST_MESSAGE_FIXED_SIZE: usize = 12;

/// Read the primary TLV of a message.
pub fn primary_tlv(message: &[u8]) -> Result<Tlv> {
    if message.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Tlv::read_from(message, 0)
}

fn expect_primary(message: &[u8], expected: TlvType) -> Result<Tlv> {
    let tlv = primary_tlv(message)?;
    if tlv.tlv_type != expected {
        return Err(ProtocolError::UnexpectedPrimary {
            expected,
            found: tlv.tlv_type,
        });
    }
    Ok(tlv)
}

fn expect_empty_primary(message: &[u8], expected: TlvType) -> Result<usize> {
    let tlv = expect_primary(message, expected)?;
    if tlv.length != 0 {
        return Err(ProtocolError::BadLength {
            tlv: tlv.tlv_type,
            length: tlv.length,
        });
    }
    Ok(tlv.size())
}

/// Walk the secondary TLVs from `offset` to the end of `message`, handing
/// each one the caller knows to `on_tlv`. `on_tlv` returns false for types
/// it does not define; those are skipped if unrecognized, rejected otherwise.
fn for_each_secondary(
    message: &[u8],
    mut offset: usize,
    mut on_tlv: impl FnMut(Tlv, usize) -> Result<bool>,
) -> Result<()> {
    while offset < message.len() {
        let tlv = Tlv::read_from(message, offset)?;
        if !on_tlv(tlv, offset)? && !tlv.tlv_type.is_unrecognized_or_padding() {
            return Err(ProtocolError::UnexpectedTlv(tlv.tlv_type));
        }
        offset += tlv.size();
    }
    Ok(())
}

fn set_once<T>(slot: &mut Option<T>, tlv: TlvType, value: T) -> Result<()> {
    if slot.is_some() {
        return Err(ProtocolError::DuplicateTlv(tlv));
    }
    *slot = Some(value);
    Ok(())
}

/// Encode a message that is just an empty primary TLV: SendCandidates
/// request and response, Host response.
pub fn encode_empty(primary: TlvType) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(TLV_HEADER_SIZE);
    append_empty_tlv(&mut buf, primary)?;
    Ok(buf)
}

/// Parse a message that must be an empty primary TLV, possibly followed by
/// skippable TLVs.
pub fn parse_empty(message: &[u8], expected: TlvType) -> Result<()> {
    let offset = expect_empty_primary(message, expected)?;
    for_each_secondary(message, offset, |_, _| Ok(false))
}

// ============================================================================
// Session
// ============================================================================

/// Session TLV: the sender's id, plus in a response the id assigned to the
/// requester when it asked without one.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SessionTlv {
    pub peer_id: PeerId,
    pub assigned_id: PeerId,
}

impl SessionTlv {
    pub fn encode(&self) -> Result<BytesMut> {
        let mut value = Vec::with_capacity(8);
        if let Some(id) = self.peer_id.get() {
            value.extend_from_slice(&id.to_be_bytes());
            if let Some(assigned) = self.assigned_id.get() {
                value.extend_from_slice(&assigned.to_be_bytes());
            }
        }
        let mut buf = BytesMut::with_capacity(TLV_HEADER_SIZE + value.len());
        crate::tlv::append_tlv(&mut buf, TlvType::SESSION, &value)?;
        Ok(buf)
    }

    pub fn parse(message: &[u8]) -> Result<Self> {
        let tlv = expect_primary(message, TlvType::SESSION)?;
        let value = tlv.value(message, 0)?;
        let session = match tlv.length {
            0 => Self::default(),
            4 => Self {
                peer_id: PeerId::new(read_uint32_value(value, 0)?),
                assigned_id: PeerId::none(),
            },
            8 => Self {
                peer_id: PeerId::new(read_uint32_value(value, 0)?),
                assigned_id: PeerId::new(read_uint32_value(value, 4)?),
            },
            length => {
                return Err(ProtocolError::BadLength {
                    tlv: TlvType::SESSION,
                    length,
                })
            }
        };
        for_each_secondary(message, tlv.size(), |_, _| Ok(false))?;
        Ok(session)
    }
}

// ============================================================================
// Candidate
// ============================================================================

/// Candidate request: one host offered during the candidate walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRequest {
    pub hostname: String,
    /// Seconds since the host's last update, at send time.
    pub time_offset: u32,
    pub key_id: u32,
}

impl CandidateRequest {
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        append_empty_tlv(&mut buf, TlvType::CANDIDATE)?;
        let name_offset = begin_tlv(&mut buf, TlvType::HOSTNAME)?;
        append_name(&mut buf, &self.hostname)?;
        update_tlv_length_in_message(&mut buf, name_offset)?;
        append_uint32_tlv(&mut buf, TlvType::TIME_OFFSET, self.time_offset)?;
        append_uint32_tlv(&mut buf, TlvType::KEY_ID, self.key_id)?;
        Ok(buf)
    }

    pub fn parse(message: &[u8]) -> Result<Self> {
        let offset = expect_empty_primary(message, TlvType::CANDIDATE)?;
        let mut hostname = None;
        let mut time_offset = None;
        let mut key_id = None;

        for_each_secondary(message, offset, |tlv, at| {
            match tlv.tlv_type {
                TlvType::HOSTNAME => {
                    let end = at + tlv.size();
                    let (name, next) = read_name(message, at + TLV_HEADER_SIZE, end)?;
                    if next != end {
                        return Err(ProtocolError::BadLength {
                            tlv: tlv.tlv_type,
                            length: tlv.length,
                        });
                    }
                    set_once(&mut hostname, tlv.tlv_type, name)?;
                }
                TlvType::TIME_OFFSET => {
                    set_once(&mut time_offset, tlv.tlv_type, read_uint32_tlv(message, at)?.1)?
                }
                TlvType::KEY_ID => {
                    set_once(&mut key_id, tlv.tlv_type, read_uint32_tlv(message, at)?.1)?
                }
                _ => return Ok(false),
            }
            Ok(true)
        })?;

        Ok(Self {
            hostname: hostname.ok_or(ProtocolError::MissingTlv(TlvType::HOSTNAME))?,
            time_offset: time_offset.ok_or(ProtocolError::MissingTlv(TlvType::TIME_OFFSET))?,
            key_id: key_id.ok_or(ProtocolError::MissingTlv(TlvType::KEY_ID))?,
        })
    }
}

/// The receiver's answer to a Candidate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateVerdict {
    /// Unknown or stale here: send the host.
    Yes,
    /// Already in sync: skip it.
    No,
    /// Known here under a different key: send the host.
    Conflict,
}

impl CandidateVerdict {
    pub fn tlv_type(self) -> TlvType {
        match self {
            Self::Yes => TlvType::CANDIDATE_YES,
            Self::No => TlvType::CANDIDATE_NO,
            Self::Conflict => TlvType::CONFLICT,
        }
    }

    fn from_tlv_type(tlv_type: TlvType) -> Option<Self> {
        match tlv_type {
            TlvType::CANDIDATE_YES => Some(Self::Yes),
            TlvType::CANDIDATE_NO => Some(Self::No),
            TlvType::CONFLICT => Some(Self::Conflict),
            _ => None,
        }
    }

    /// Whether the walker must follow up with a Host request.
    pub fn wants_host(self) -> bool {
        !matches!(self, Self::No)
    }

    pub fn encode_response(self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(2 * TLV_HEADER_SIZE);
        append_empty_tlv(&mut buf, TlvType::CANDIDATE)?;
        append_empty_tlv(&mut buf, self.tlv_type())?;
        Ok(buf)
    }

    pub fn parse_response(message: &[u8]) -> Result<Self> {
        let offset = expect_empty_primary(message, TlvType::CANDIDATE)?;
        let mut verdict = None;

        for_each_secondary(message, offset, |tlv, _| {
            let Some(found) = Self::from_tlv_type(tlv.tlv_type) else {
                return Ok(false);
            };
            if tlv.length != 0 {
                return Err(ProtocolError::BadLength {
                    tlv: tlv.tlv_type,
                    length: tlv.length,
                });
            }
            set_once(&mut verdict, TlvType::CANDIDATE_YES, found)?;
            Ok(true)
        })?;

        verdict.ok_or(ProtocolError::MissingTlv(TlvType::CANDIDATE_YES))
    }
}

impl std::fmt::Display for CandidateVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tlv_type().name())
    }
}

// ============================================================================
// Host
// ============================================================================

/// One retained registry update carried in a Host request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMessage {
    /// Seconds since the sender received this update.
    pub rx_time_offset: u32,
    pub granted_lease: u32,
    pub granted_key_lease: u32,
    /// The raw update message.
    pub data: Bytes,
}

/// Host request: the full retained state of one host, oldest update first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostRequest {
    pub messages: Vec<HostMessage>,
}

impl HostRequest {
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        append_empty_tlv(&mut buf, TlvType::HOST)?;
        for message in &self.messages {
            let offset = begin_tlv(&mut buf, TlvType::HOST_MESSAGE)?;
            let fixed = offset + TLV_HEADER_SIZE;
            buf.resize(fixed + HOST_MESSAGE_FIXED_SIZE, 0);
            write_uint32_value(&mut buf, fixed, message.rx_time_offset)?;
            write_uint32_value(&mut buf, fixed + 4, message.granted_lease)?;
            write_uint32_value(&mut buf, fixed + 8, message.granted_key_lease)?;
            buf.extend_from_slice(&message.data);
            update_tlv_length_in_message(&mut buf, offset)?;
        }
        Ok(buf)
    }

    /// Parse and validate every TLV before the caller applies anything.
    /// Hostname and KeyId may ride along and are ignored.
    pub fn parse(message: &[u8]) -> Result<Self> {
        let offset = expect_empty_primary(message, TlvType::HOST)?;
        let mut messages = Vec::new();

        for_each_secondary(message, offset, |tlv, at| {
            match tlv.tlv_type {
                TlvType::HOST_MESSAGE => {
                    if (tlv.length as usize) <= HOST_MESSAGE_FIXED_SIZE + DNS_HEADER_SIZE {
                        return Err(ProtocolError::BadLength {
                            tlv: tlv.tlv_type,
                            length: tlv.length,
                        });
                    }
                    let value = tlv.value(message, at)?;
                    messages.push(HostMessage {
                        rx_time_offset: read_uint32_value(value, 0)?,
                        granted_lease: read_uint32_value(value, 4)?,
                        granted_key_lease: read_uint32_value(value, 8)?,
                        data: Bytes::copy_from_slice(&value[HOST_MESSAGE_FIXED_SIZE..]),
                    });
                }
                TlvType::HOSTNAME | TlvType::KEY_ID => {}
                _ => return Ok(false),
            }
            Ok(true)
        })?;

        Ok(Self { messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::append_tlv;

    fn update_bytes(tag: u8) -> Bytes {
        Bytes::from(vec![tag; DNS_HEADER_SIZE + 8])
    }

    #[test]
    fn test_primary_tlv_of_empty_message() {
        assert!(matches!(primary_tlv(&[]), Err(ProtocolError::Empty)));
    }

    #[test]
    fn test_empty_messages() {
        let buf = encode_empty(TlvType::SEND_CANDIDATES).unwrap();
        parse_empty(&buf, TlvType::SEND_CANDIDATES).unwrap();
        assert!(matches!(
            parse_empty(&buf, TlvType::HOST),
            Err(ProtocolError::UnexpectedPrimary { .. })
        ));
    }

    #[test]
    fn test_empty_primary_with_value_rejected() {
        let mut buf = BytesMut::new();
        append_tlv(&mut buf, TlvType::SEND_CANDIDATES, &[1]).unwrap();
        assert!(matches!(
            parse_empty(&buf, TlvType::SEND_CANDIDATES),
            Err(ProtocolError::BadLength { length: 1, .. })
        ));
    }

    #[test]
    fn test_trailing_padding_skipped_known_rejected() {
        let mut buf = encode_empty(TlvType::HOST).unwrap();
        append_tlv(&mut buf, TlvType::ENCRYPTION_PADDING, &[0; 6]).unwrap();
        append_tlv(&mut buf, TlvType(0xfa00), &[1, 2]).unwrap();
        parse_empty(&buf, TlvType::HOST).unwrap();

        append_uint32_tlv(&mut buf, TlvType::TIME_OFFSET, 3).unwrap();
        assert!(matches!(
            parse_empty(&buf, TlvType::HOST),
            Err(ProtocolError::UnexpectedTlv(TlvType::TIME_OFFSET))
        ));
    }

    #[test]
    fn test_truncated_trailer_rejected() {
        let mut buf = encode_empty(TlvType::SEND_CANDIDATES).unwrap();
        buf.extend_from_slice(&[0x00, 0x03, 0x00]);
        assert!(parse_empty(&buf, TlvType::SEND_CANDIDATES).is_err());
    }

    #[test]
    fn test_session_tlv_forms() {
        for session in [
            SessionTlv::default(),
            SessionTlv {
                peer_id: PeerId::new(5),
                assigned_id: PeerId::none(),
            },
            SessionTlv {
                peer_id: PeerId::new(5),
                assigned_id: PeerId::new(8),
            },
        ] {
            let buf = session.encode().unwrap();
            let parsed = SessionTlv::parse(&buf).unwrap();
            assert_eq!(parsed.peer_id.get(), session.peer_id.get());
            assert_eq!(parsed.assigned_id.get(), session.assigned_id.get());
        }
    }

    #[test]
    fn test_session_tlv_bad_length() {
        let mut buf = BytesMut::new();
        append_tlv(&mut buf, TlvType::SESSION, &[0, 0, 0, 1, 2]).unwrap();
        assert!(matches!(
            SessionTlv::parse(&buf),
            Err(ProtocolError::BadLength { length: 5, .. })
        ));
    }

    #[test]
    fn test_candidate_request() {
        let request = CandidateRequest {
            hostname: "printer.default.service.arpa.".into(),
            time_offset: 12,
            key_id: 0xabcd_0123,
        };
        let buf = request.encode().unwrap();
        assert_eq!(primary_tlv(&buf).unwrap().tlv_type, TlvType::CANDIDATE);
        assert_eq!(CandidateRequest::parse(&buf).unwrap(), request);
    }

    #[test]
    fn test_candidate_request_missing_key_id() {
        let mut buf = BytesMut::new();
        append_empty_tlv(&mut buf, TlvType::CANDIDATE).unwrap();
        let at = begin_tlv(&mut buf, TlvType::HOSTNAME).unwrap();
        append_name(&mut buf, "foo.").unwrap();
        update_tlv_length_in_message(&mut buf, at).unwrap();
        append_uint32_tlv(&mut buf, TlvType::TIME_OFFSET, 1).unwrap();
        assert!(matches!(
            CandidateRequest::parse(&buf),
            Err(ProtocolError::MissingTlv(TlvType::KEY_ID))
        ));
    }

    #[test]
    fn test_candidate_request_duplicate_time_offset() {
        let mut buf = CandidateRequest {
            hostname: "foo.".into(),
            time_offset: 1,
            key_id: 2,
        }
        .encode()
        .unwrap();
        append_uint32_tlv(&mut buf, TlvType::TIME_OFFSET, 9).unwrap();
        assert!(matches!(
            CandidateRequest::parse(&buf),
            Err(ProtocolError::DuplicateTlv(TlvType::TIME_OFFSET))
        ));
    }

    #[test]
    fn test_hostname_length_must_match_name() {
        let mut buf = BytesMut::new();
        append_empty_tlv(&mut buf, TlvType::CANDIDATE).unwrap();
        // Name "foo." followed by a stray byte inside the same TLV.
        append_tlv(&mut buf, TlvType::HOSTNAME, b"\x03foo\x00\x07").unwrap();
        append_uint32_tlv(&mut buf, TlvType::TIME_OFFSET, 1).unwrap();
        append_uint32_tlv(&mut buf, TlvType::KEY_ID, 1).unwrap();
        assert!(matches!(
            CandidateRequest::parse(&buf),
            Err(ProtocolError::BadLength { .. })
        ));
    }

    #[test]
    fn test_candidate_verdicts() {
        for verdict in [
            CandidateVerdict::Yes,
            CandidateVerdict::No,
            CandidateVerdict::Conflict,
        ] {
            let buf = verdict.encode_response().unwrap();
            assert_eq!(CandidateVerdict::parse_response(&buf).unwrap(), verdict);
        }
        assert!(CandidateVerdict::Conflict.wants_host());
        assert!(!CandidateVerdict::No.wants_host());
    }

    #[test]
    fn test_candidate_response_needs_exactly_one_verdict() {
        let bare = encode_empty(TlvType::CANDIDATE).unwrap();
        assert!(matches!(
            CandidateVerdict::parse_response(&bare),
            Err(ProtocolError::MissingTlv(_))
        ));

        let mut two = CandidateVerdict::Yes.encode_response().unwrap();
        append_empty_tlv(&mut two, TlvType::CANDIDATE_NO).unwrap();
        assert!(matches!(
            CandidateVerdict::parse_response(&two),
            Err(ProtocolError::DuplicateTlv(_))
        ));
    }

    #[test]
    fn test_host_request() {
        let request = HostRequest {
            messages: vec![
                HostMessage {
                    rx_time_offset: 30,
                    granted_lease: 7200,
                    granted_key_lease: 1_209_600,
                    data: update_bytes(1),
                },
                HostMessage {
                    rx_time_offset: 2,
                    granted_lease: 3600,
                    granted_key_lease: 86_400,
                    data: update_bytes(2),
                },
            ],
        };
        let buf = request.encode().unwrap();
        assert_eq!(HostRequest::parse(&buf).unwrap(), request);
    }

    #[test]
    fn test_host_request_ignores_hostname_and_key_id() {
        let mut buf = HostRequest::default().encode().unwrap();
        append_uint32_tlv(&mut buf, TlvType::KEY_ID, 7).unwrap();
        let parsed = HostRequest::parse(&buf).unwrap();
        assert!(parsed.messages.is_empty());
    }

    #[test]
    fn test_host_message_too_short_rejected() {
        let mut buf = encode_empty(TlvType::HOST).unwrap();
        append_tlv(
            &mut buf,
            TlvType::HOST_MESSAGE,
            &[0u8; HOST_MESSAGE_FIXED_SIZE + DNS_HEADER_SIZE],
        )
        .unwrap();
        assert!(matches!(
            HostRequest::parse(&buf),
            Err(ProtocolError::BadLength { .. })
        ));
    }
}
