//! DSO framing for TCP streams.
//!
//! Wire format: 2-byte big-endian length prefix, 12-byte DNS header with
//! opcode DSO, then the TLV sequence. Request/response correlation is by
//! the header's message id; id 0 marks a unidirectional message.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::tlv::TlvType;
use crate::{ProtocolError, DNS_HEADER_SIZE, MAX_MESSAGE_SIZE};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 2;

/// DNS opcode for DNS Stateful Operations.
pub const DSO_OPCODE: u8 = 6;

const QR_FLAG: u16 = 0x8000;
const OPCODE_SHIFT: u16 = 11;
const OPCODE_MASK: u16 = 0x7800;
const RCODE_MASK: u16 = 0x000f;

pub const RCODE_SUCCESS: u8 = 0;
pub const RCODE_FORMAT_ERROR: u8 = 1;
pub const RCODE_SERVER_FAILURE: u8 = 2;
/// DSO type not implemented (RFC 8490).
pub const RCODE_DSO_TYPE_NOT_IMPLEMENTED: u8 = 11;

/// DNS message id used to correlate a response with its request.
pub type MessageId = u16;

/// The DNS header of a DSO message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DsoHeader {
    pub message_id: MessageId,
    pub is_response: bool,
    pub rcode: u8,
}

impl DsoHeader {
    pub fn request(message_id: MessageId) -> Self {
        Self {
            message_id,
            is_response: false,
            rcode: RCODE_SUCCESS,
        }
    }

    pub fn response(message_id: MessageId, rcode: u8) -> Self {
        Self {
            message_id,
            is_response: true,
            rcode,
        }
    }

    pub fn unidirectional() -> Self {
        Self::request(0)
    }

    pub fn is_unidirectional(&self) -> bool {
        !self.is_response && self.message_id == 0
    }

    pub fn is_success(&self) -> bool {
        self.rcode == RCODE_SUCCESS
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let mut flags = (DSO_OPCODE as u16) << OPCODE_SHIFT | (self.rcode as u16 & RCODE_MASK);
        if self.is_response {
            flags |= QR_FLAG;
        }
        dst.put_u16(self.message_id);
        dst.put_u16(flags);
        // QDCOUNT, ANCOUNT, NSCOUNT, ARCOUNT are always zero in DSO.
        dst.put_bytes(0, 8);
    }

    pub fn parse(src: &[u8]) -> Result<Self, ProtocolError> {
        let header = src
            .get(..DNS_HEADER_SIZE)
            .ok_or_else(|| ProtocolError::InvalidHeader("short header".into()))?;

        let message_id = u16::from_be_bytes([header[0], header[1]]);
        let flags = u16::from_be_bytes([header[2], header[3]]);
        let opcode = ((flags & OPCODE_MASK) >> OPCODE_SHIFT) as u8;
        if opcode != DSO_OPCODE {
            return Err(ProtocolError::InvalidHeader(format!("opcode {opcode}")));
        }
        if header[4..].iter().any(|b| *b != 0) {
            return Err(ProtocolError::InvalidHeader("non-zero counts".into()));
        }

        Ok(Self {
            message_id,
            is_response: flags & QR_FLAG != 0,
            rcode: (flags & RCODE_MASK) as u8,
        })
    }
}

/// One DSO message: header plus TLV body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: DsoHeader,
    pub body: Bytes,
}

/// Codec for framing DSO messages over a byte stream.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u16::from_be_bytes([src[0], src[1]]) as usize;
        if length < DNS_HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader(format!(
                "frame of {length} bytes is shorter than a dns header"
            )));
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let mut message = src.split_to(length);
        let header = DsoHeader::parse(&message)?;
        message.advance(DNS_HEADER_SIZE);

        Ok(Some(Frame {
            header,
            body: message.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = DNS_HEADER_SIZE + item.body.len();
        if length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + length);
        dst.put_u16(length as u16);
        item.header.encode(dst);
        dst.extend_from_slice(&item.body);
        Ok(())
    }
}

/// Outstanding requests on one connection, keyed by message id, remembering
/// the primary TLV each request carried.
#[derive(Debug, Default)]
pub struct RequestTracker {
    next_id: MessageId,
    outstanding: HashMap<MessageId, TlvType>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh non-zero message id for a request.
    pub fn register(&mut self, primary: TlvType) -> MessageId {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.outstanding.contains_key(&self.next_id) {
                break;
            }
        }
        self.outstanding.insert(self.next_id, primary);
        self.next_id
    }

    /// Resolve a response id to the primary TLV of its request.
    pub fn complete(&mut self, message_id: MessageId) -> Option<TlvType> {
        self.outstanding.remove(&message_id)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(id: MessageId) -> Frame {
        Frame {
            header: DsoHeader::request(id),
            body: Bytes::from_static(&[0xf9, 0x0d, 0x00, 0x00]),
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(sample_frame(42), &mut buf).unwrap();

        assert_eq!(buf.len(), 2 + 12 + 4);
        assert_eq!(&buf[..2], &[0, 16]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample_frame(42));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_response_header_flags() {
        let mut buf = BytesMut::new();
        DsoHeader::response(7, RCODE_DSO_TYPE_NOT_IMPLEMENTED).encode(&mut buf);
        assert_eq!(&buf[..4], &[0x00, 0x07, 0xb0, 0x0b]);

        let header = DsoHeader::parse(&buf).unwrap();
        assert!(header.is_response);
        assert!(!header.is_success());
        assert_eq!(header.message_id, 7);
    }

    #[test]
    fn test_partial_message() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(sample_frame(1), &mut buf).unwrap();

        let half = buf.len() / 2;
        let mut partial = buf.split_to(half);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_multiple_messages() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        for id in 1..=5 {
            codec.encode(sample_frame(id), &mut buf).unwrap();
        }
        for id in 1..=5 {
            let frame = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.header.message_id, id);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_non_dso_opcode_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(12);
        buf.put_u16(1);
        buf.put_u16(0); // opcode QUERY
        buf.put_bytes(0, 8);
        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_short_frame_rejected() {
        let mut buf = BytesMut::from(&[0x00, 0x04, 1, 2, 3, 4][..]);
        assert!(FrameCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_body_rejected() {
        let frame = Frame {
            header: DsoHeader::unidirectional(),
            body: Bytes::from(vec![0u8; MAX_MESSAGE_SIZE]),
        };
        assert!(FrameCodec.encode(frame, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_request_tracker_skips_zero_and_outstanding() {
        let mut tracker = RequestTracker::new();
        tracker.next_id = u16::MAX - 1;
        let a = tracker.register(TlvType::SESSION);
        let b = tracker.register(TlvType::CANDIDATE);
        assert_eq!(a, u16::MAX);
        assert_eq!(b, 1);

        assert_eq!(tracker.complete(a), Some(TlvType::SESSION));
        assert_eq!(tracker.complete(a), None);
        assert_eq!(tracker.outstanding(), 1);
    }
}
