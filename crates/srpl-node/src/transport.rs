//! TCP transport -- one task per link, each owning a
//! `Framed<TcpStream, FrameCodec>`.
//!
//! The controller and the dispatch loop hold clones of the same
//! `TcpTransport`. Link tasks never touch the shared state: they report
//! through `NodeEvent`s tagged with the link generation, and the dispatch
//! loop resolves them here (`link_up`, `link_down`, `receive`), so events
//! from a link that has since been replaced are dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use srpl_protocol::messages::primary_tlv;
use srpl_protocol::{
    DsoHeader, Frame, FrameCodec, MessageId, RequestTracker, TlvType, DNS_HEADER_SIZE,
    MAX_MESSAGE_SIZE,
};
use srpl_replication::{DisconnectMode, DisconnectReason, Transport, TransportError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::Framed;

use crate::node::{EventSender, NodeEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An inbound frame, resolved against the link's outstanding requests.
#[derive(Debug)]
pub enum Delivery {
    Request { id: MessageId, body: Bytes },
    Response {
        header: DsoHeader,
        body: Bytes,
        request_tlv: TlvType,
    },
    Unidirectional { body: Bytes },
    /// The frame broke the link; the controller must see a disconnect.
    LinkLost,
}

enum LinkCommand {
    Send(Frame),
    Close(DisconnectMode),
}

struct Link {
    generation: u64,
    connected: bool,
    commands: mpsc::UnboundedSender<LinkCommand>,
    long_lived: watch::Sender<bool>,
    tracker: RequestTracker,
}

struct Inner {
    links: HashMap<SocketAddr, Link>,
    next_generation: u64,
    listening: bool,
}

#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Mutex<Inner>>,
    events: EventSender,
    idle_timeout: Duration,
}

impl TcpTransport {
    pub fn new(events: EventSender, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                links: HashMap::new(),
                next_generation: 0,
                listening: false,
            })),
            events,
            idle_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_listening(&self) -> bool {
        self.lock().listening
    }

    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    /// Take over an accepted inbound stream. Any older link to the same
    /// address is dropped.
    pub fn adopt(&self, peer: SocketAddr, stream: TcpStream) {
        let (link, commands, long_lived, generation) = self.new_link(true);
        self.lock().links.insert(peer, link);
        tracing::debug!(%peer, generation, "transport: inbound link adopted");
        tokio::spawn(run_link(
            peer,
            generation,
            Some(stream),
            commands,
            long_lived,
            self.idle_timeout,
            self.events.clone(),
        ));
    }

    /// An outbound connect finished. False if the link has been replaced.
    pub fn link_up(&self, peer: SocketAddr, generation: u64) -> bool {
        let mut inner = self.lock();
        match inner.links.get_mut(&peer) {
            Some(link) if link.generation == generation => {
                link.connected = true;
                true
            }
            _ => false,
        }
    }

    /// A link task ended. False if the link was closed locally or replaced.
    pub fn link_down(&self, peer: SocketAddr, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner
            .links
            .get(&peer)
            .is_some_and(|link| link.generation == generation)
        {
            inner.links.remove(&peer);
            return true;
        }
        false
    }

    /// Classify a frame read by a link task. `None` for frames from a stale
    /// link.
    pub fn receive(&self, peer: SocketAddr, generation: u64, frame: Frame) -> Option<Delivery> {
        let mut inner = self.lock();
        let link = inner
            .links
            .get_mut(&peer)
            .filter(|link| link.generation == generation)?;
        let Frame { header, body } = frame;

        if header.is_response {
            if let Some(request_tlv) = link.tracker.complete(header.message_id) {
                return Some(Delivery::Response {
                    header,
                    body,
                    request_tlv,
                });
            }
            tracing::warn!(%peer, id = header.message_id, "transport: response to unknown request");
            if let Some(link) = inner.links.remove(&peer) {
                let _ = link.commands.send(LinkCommand::Close(DisconnectMode::Abort));
            }
            return Some(Delivery::LinkLost);
        }
        if header.is_unidirectional() {
            return Some(Delivery::Unidirectional { body });
        }
        Some(Delivery::Request {
            id: header.message_id,
            body,
        })
    }

    fn new_link(
        &self,
        connected: bool,
    ) -> (
        Link,
        mpsc::UnboundedReceiver<LinkCommand>,
        watch::Receiver<bool>,
        u64,
    ) {
        let mut inner = self.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (long_lived_tx, long_lived_rx) = watch::channel(false);
        let link = Link {
            generation,
            connected,
            commands: commands_tx,
            long_lived: long_lived_tx,
            tracker: RequestTracker::new(),
        };
        (link, commands_rx, long_lived_rx, generation)
    }

    fn send_frame(&mut self, peer: SocketAddr, frame: Frame) -> Result<(), TransportError> {
        let inner = self.lock();
        let link = inner
            .links
            .get(&peer)
            .filter(|link| link.connected)
            .ok_or(TransportError::NotConnected(peer))?;
        link.commands
            .send(LinkCommand::Send(frame))
            .map_err(|_| TransportError::Closing(peer))
    }
}

fn check_size(body: &Bytes) -> Result<(), TransportError> {
    let size = DNS_HEADER_SIZE + body.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(TransportError::TooLarge(size));
    }
    Ok(())
}

impl Transport for TcpTransport {
    fn connect(&mut self, peer: SocketAddr) {
        let (link, commands, long_lived, generation) = self.new_link(false);
        if self.lock().links.insert(peer, link).is_some() {
            tracing::debug!(%peer, "transport: replacing existing link");
        }
        tracing::debug!(%peer, generation, "transport: connecting");
        tokio::spawn(run_link(
            peer,
            generation,
            None,
            commands,
            long_lived,
            self.idle_timeout,
            self.events.clone(),
        ));
    }

    fn disconnect(&mut self, peer: SocketAddr, mode: DisconnectMode, reason: DisconnectReason) {
        if let Some(link) = self.lock().links.remove(&peer) {
            tracing::debug!(%peer, ?mode, %reason, "transport: closing link");
            let _ = link.commands.send(LinkCommand::Close(mode));
        }
    }

    fn send_request(&mut self, peer: SocketAddr, message: Bytes) -> Result<MessageId, TransportError> {
        check_size(&message)?;
        let primary = primary_tlv(&message)
            .map(|tlv| tlv.tlv_type)
            .unwrap_or(TlvType::RESERVED);
        let id = {
            let mut inner = self.lock();
            let link = inner
                .links
                .get_mut(&peer)
                .filter(|link| link.connected)
                .ok_or(TransportError::NotConnected(peer))?;
            link.tracker.register(primary)
        };
        self.send_frame(
            peer,
            Frame {
                header: DsoHeader::request(id),
                body: message,
            },
        )?;
        Ok(id)
    }

    fn send_response(
        &mut self,
        peer: SocketAddr,
        message: Bytes,
        response_id: MessageId,
    ) -> Result<(), TransportError> {
        check_size(&message)?;
        self.send_frame(
            peer,
            Frame {
                header: DsoHeader::response(response_id, srpl_protocol::codec::RCODE_SUCCESS),
                body: message,
            },
        )
    }

    fn set_long_lived(&mut self, peer: SocketAddr, long_lived: bool) {
        if let Some(link) = self.lock().links.get(&peer) {
            link.long_lived.send_replace(long_lived);
        }
    }

    fn start_listening(&mut self) {
        self.lock().listening = true;
    }

    fn stop_listening(&mut self) {
        self.lock().listening = false;
    }
}

// ============================================================================
// Accept loop
// ============================================================================

/// Hand every inbound connection to the dispatch loop, which decides
/// whether the controller takes it.
pub async fn run_accept_loop(
    listener: TcpListener,
    events: EventSender,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "transport: inbound connection");
                    if events.send(NodeEvent::Accepted { peer, stream }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("transport: accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.recv() => {
                tracing::debug!("transport: accept loop shutting down");
                break;
            }
        }
    }
}

// ============================================================================
// Link task
// ============================================================================

async fn run_link(
    peer: SocketAddr,
    generation: u64,
    stream: Option<TcpStream>,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    mut long_lived: watch::Receiver<bool>,
    idle_timeout: Duration,
    events: EventSender,
) {
    let stream = match stream {
        Some(stream) => stream,
        None => match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer)).await {
            Ok(Ok(stream)) => {
                if events.send(NodeEvent::LinkUp { peer, generation }).await.is_err() {
                    return;
                }
                stream
            }
            Ok(Err(e)) => {
                tracing::debug!(%peer, "transport: connect failed: {e}");
                let _ = events.send(NodeEvent::LinkDown { peer, generation }).await;
                return;
            }
            Err(_) => {
                tracing::debug!(%peer, "transport: connect timed out");
                let _ = events.send(NodeEvent::LinkDown { peer, generation }).await;
                return;
            }
        },
    };
    let _ = stream.set_nodelay(true);

    let mut framed = Framed::new(stream, FrameCodec);
    let mut last_activity = Instant::now();

    loop {
        let idle = !*long_lived.borrow();
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Send(frame)) => {
                    if let Err(e) = framed.send(frame).await {
                        tracing::debug!(%peer, "transport: write failed: {e}");
                        break;
                    }
                }
                Some(LinkCommand::Close(DisconnectMode::Graceful)) => {
                    let _ = framed.close().await;
                    break;
                }
                Some(LinkCommand::Close(DisconnectMode::Abort)) | None => break,
            },
            frame = framed.next() => match frame {
                Some(Ok(frame)) => {
                    last_activity = Instant::now();
                    if events
                        .send(NodeEvent::Frame { peer, generation, frame })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(%peer, "transport: read failed: {e}");
                    break;
                }
                None => {
                    tracing::debug!(%peer, "transport: closed by partner");
                    break;
                }
            },
            changed = long_lived.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(last_activity + idle_timeout), if idle => {
                tracing::debug!(%peer, "transport: idle timeout");
                break;
            }
        }
    }

    let _ = events.send(NodeEvent::LinkDown { peer, generation }).await;
}
