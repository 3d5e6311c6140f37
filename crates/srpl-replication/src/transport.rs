//! Collaborator interfaces: the DSO-style transport and service discovery.
//!
//! Both are driven synchronously from the controller. Implementations queue
//! the work and report outcomes back as events (`Srpl::handle_connected`,
//! `Srpl::handle_browse_result`, ...), never by calling into the controller
//! from inside one of these methods.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use srpl_protocol::MessageId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no connection to {0}")]
    NotConnected(SocketAddr),
    #[error("connection to {0} is closing")]
    Closing(SocketAddr),
    #[error("message too large: {0} bytes")]
    TooLarge(usize),
}

/// How to tear a link down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectMode {
    /// Flush queued messages, then close.
    Graceful,
    /// Drop the connection immediately.
    Abort,
}

/// Why a link is being torn down, for the peer and the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Shutdown,
    PartnerRemoved,
    ProtocolError,
    Superseded,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Shutdown => "shutdown",
            Self::PartnerRemoved => "partner removed",
            Self::ProtocolError => "protocol error",
            Self::Superseded => "superseded",
        })
    }
}

/// A reliable, ordered request/response transport keyed by partner address.
///
/// Outcomes are reported back through the controller: `handle_connected`
/// once a `connect` succeeds, `handle_disconnected` when a link drops or a
/// connect fails, and `handle_request`/`handle_response` for traffic.
/// `disconnect` initiated locally is not reported back.
pub trait Transport: Send {
    fn connect(&mut self, peer: SocketAddr);

    fn disconnect(&mut self, peer: SocketAddr, mode: DisconnectMode, reason: DisconnectReason);

    /// Send a request; the returned id correlates the response.
    fn send_request(&mut self, peer: SocketAddr, message: Bytes) -> Result<MessageId, TransportError>;

    fn send_response(
        &mut self,
        peer: SocketAddr,
        message: Bytes,
        response_id: MessageId,
    ) -> Result<(), TransportError>;

    /// Long-lived links are exempt from the idle timeout.
    fn set_long_lived(&mut self, peer: SocketAddr, long_lived: bool);

    fn start_listening(&mut self);

    fn stop_listening(&mut self);
}

/// Service discovery for the replication endpoint. Browse results come back
/// through `Srpl::handle_browse_result`.
pub trait Discovery: Send {
    fn browse(&mut self, enable: bool);

    /// Advertise this node with the given TXT record.
    fn register_service(&mut self, txt: &[u8]);

    fn unregister_service(&mut self);
}
