//! Per-partner session: connection bring-up, the two-way candidate walk,
//! and routine forwarding of local updates.
//!
//! Phases run `ToSync -> EstablishingSession -> SyncCandidatesFromPartner
//! <-> SendCandidatesToPartner -> RoutineOperation`. The client (connection
//! initiator) pulls the server's hosts first, then the server pulls the
//! client's. Any fatal error drops the session back to `ToSync` and arms a
//! reconnect deadline.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rand::rngs::StdRng;
use rand::Rng;
use srpl_protocol::messages::{
    self, CandidateRequest, CandidateVerdict, HostMessage, HostRequest, SessionTlv,
};
use srpl_protocol::params::rounded_seconds;
use srpl_protocol::{DsoHeader, MessageId, PeerId, ProtocolError, TlvType};
use srpl_registry::{HostId, Registry, UpdateMessage};

use crate::backoff::ReconnectBackoff;
use crate::error::SessionError;
use crate::transport::{DisconnectMode, DisconnectReason, Transport};
use crate::SrplConfig;

type Result<T> = std::result::Result<T, SessionError>;

/// Protocol phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ToSync,
    EstablishingSession,
    SyncCandidatesFromPartner,
    SendCandidatesToPartner,
    RoutineOperation,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::ToSync => "to-sync",
            Phase::EstablishingSession => "establishing-session",
            Phase::SyncCandidatesFromPartner => "sync-candidates-from-partner",
            Phase::SendCandidatesToPartner => "send-candidates-to-partner",
            Phase::RoutineOperation => "routine-operation",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which end opened the transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    Disconnected,
    Connecting,
    Connected,
}

/// How the controller learned about the partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Discovered,
    Inbound,
}

/// Where the candidate walk stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Start (or restart) from the registry's current first host.
    Head,
    /// The host most recently offered, or about to be offered.
    At(HostId),
    /// Every host has been offered.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CandidateWalk {
    /// The partner's SendCandidates request, answered when the walk ends.
    request_id: MessageId,
    cursor: Cursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseState {
    ToSync,
    EstablishingSession,
    SyncCandidatesFromPartner {
        /// We answered a candidate with Yes or Conflict; a Host is due.
        expect_host_request: bool,
    },
    SendCandidatesToPartner {
        /// `None` until the partner's SendCandidates request arrives.
        walk: Option<CandidateWalk>,
    },
    RoutineOperation,
}

impl PhaseState {
    fn phase(&self) -> Phase {
        match self {
            PhaseState::ToSync => Phase::ToSync,
            PhaseState::EstablishingSession => Phase::EstablishingSession,
            PhaseState::SyncCandidatesFromPartner { .. } => Phase::SyncCandidatesFromPartner,
            PhaseState::SendCandidatesToPartner { .. } => Phase::SendCandidatesToPartner,
            PhaseState::RoutineOperation => Phase::RoutineOperation,
        }
    }
}

/// What a session saw of another session, for id checks.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PartnerView {
    pub peer_id: PeerId,
    /// Connected and past `ToSync`.
    pub active: bool,
}

/// Things a session tells the controller after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    RoutineStarted,
    Errored,
    PeerIdAcquired,
}

/// Everything outside the session a handler may touch.
pub(crate) struct SessionContext<'a> {
    pub own_id: &'a mut PeerId,
    /// Every other session's partner.
    pub partners: &'a [PartnerView],
    pub registry: &'a mut dyn Registry,
    pub transport: &'a mut dyn Transport,
    pub rng: &'a mut StdRng,
    pub config: &'a SrplConfig,
    pub now: Instant,
    pub signals: Vec<Signal>,
}

pub(crate) struct Session {
    sock_addr: SocketAddr,
    partner_id: PeerId,
    origin: Origin,
    role: Role,
    link: Link,
    state: PhaseState,
    queue: VecDeque<Arc<UpdateMessage>>,
    backoff: ReconnectBackoff,
    /// Set while errored: when to try again.
    reconnect_at: Option<Instant>,
    /// Set while marked for removal: when to drop the session.
    remove_at: Option<Instant>,
}

impl Session {
    pub fn new(sock_addr: SocketAddr, origin: Origin, config: &SrplConfig) -> Self {
        Self {
            sock_addr,
            partner_id: PeerId::none(),
            origin,
            role: Role::Client,
            link: Link::Disconnected,
            state: PhaseState::ToSync,
            queue: VecDeque::new(),
            backoff: config.backoff(),
            reconnect_at: None,
            remove_at: None,
        }
    }

    // -- Accessors --

    pub fn sock_addr(&self) -> SocketAddr {
        self.sock_addr
    }

    pub fn partner_id(&self) -> PeerId {
        self.partner_id
    }

    pub fn set_partner_id(&mut self, id: PeerId) {
        self.partner_id = id;
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn set_origin(&mut self, origin: Origin) {
        self.origin = origin;
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn link(&self) -> Link {
        self.link
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn is_errored(&self) -> bool {
        self.reconnect_at.is_some()
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn clear_error(&mut self) {
        self.reconnect_at = None;
    }

    #[cfg(test)]
    pub fn backoff(&self) -> &ReconnectBackoff {
        &self.backoff
    }

    pub fn remove_at(&self) -> Option<Instant> {
        self.remove_at
    }

    pub fn is_marked_to_remove(&self) -> bool {
        self.remove_at.is_some()
    }

    pub fn mark_to_remove(&mut self, deadline: Instant) {
        if self.remove_at.is_none() {
            self.remove_at = Some(deadline);
        }
    }

    pub fn clear_to_remove(&mut self) {
        self.remove_at = None;
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn view(&self) -> PartnerView {
        PartnerView {
            peer_id: self.partner_id,
            active: self.link == Link::Connected && self.phase() != Phase::ToSync,
        }
    }

    fn set_state(&mut self, state: PhaseState) {
        let (from, to) = (self.state.phase(), state.phase());
        self.state = state;
        if from != to {
            tracing::debug!(peer = %self.sock_addr, %from, %to, "session: phase changed");
        }
    }

    // -- Link management --

    /// Open a connection to the partner as client.
    pub fn connect(&mut self, ctx: &mut SessionContext<'_>) {
        tracing::debug!(peer = %self.sock_addr, partner_id = %self.partner_id, "session: connecting");
        self.role = Role::Client;
        self.link = Link::Connecting;
        ctx.transport.connect(self.sock_addr);
    }

    /// Take an inbound connection as server.
    pub fn accept(&mut self) {
        self.role = Role::Server;
        self.link = Link::Connecting;
        self.clear_to_remove();
    }

    pub fn handle_connected(&mut self, ctx: &mut SessionContext<'_>) {
        self.link = Link::Connected;
        self.set_state(PhaseState::EstablishingSession);
        if self.role == Role::Client {
            if let Err(e) = self.send_session_request(ctx) {
                self.fail(ctx, e);
            }
        }
    }

    pub fn handle_disconnected(&mut self, ctx: &mut SessionContext<'_>) {
        if self.link == Link::Disconnected {
            return;
        }
        tracing::info!(peer = %self.sock_addr, phase = %self.phase(), "session: disconnected");
        self.link = Link::Disconnected;
        self.handle_error(ctx);
    }

    /// Tear the link down without counting it as an error.
    pub fn disconnect(
        &mut self,
        ctx: &mut SessionContext<'_>,
        mode: DisconnectMode,
        reason: DisconnectReason,
    ) {
        if self.link != Link::Disconnected {
            tracing::debug!(peer = %self.sock_addr, %reason, "session: disconnecting");
            ctx.transport.disconnect(self.sock_addr, mode, reason);
            self.link = Link::Disconnected;
        }
        self.queue.clear();
        self.set_state(PhaseState::ToSync);
    }

    /// Abort the link and treat it as a session error.
    pub fn abort(&mut self, ctx: &mut SessionContext<'_>, reason: DisconnectReason) {
        if self.link != Link::Disconnected {
            ctx.transport
                .disconnect(self.sock_addr, DisconnectMode::Abort, reason);
            self.link = Link::Disconnected;
        }
        self.handle_error(ctx);
    }

    fn fail(&mut self, ctx: &mut SessionContext<'_>, error: SessionError) {
        tracing::warn!(
            peer = %self.sock_addr,
            partner_id = %self.partner_id,
            phase = %self.phase(),
            "session: {error}"
        );
        self.abort(ctx, DisconnectReason::ProtocolError);
    }

    fn handle_error(&mut self, ctx: &mut SessionContext<'_>) {
        self.queue.clear();
        self.set_state(PhaseState::ToSync);
        let delay = self.backoff.next_delay();
        self.reconnect_at = Some(ctx.now + delay);
        if self.origin == Origin::Inbound {
            self.mark_to_remove(ctx.now + ctx.config.remove_timeout());
        }
        tracing::debug!(
            peer = %self.sock_addr,
            delay_ms = delay.as_millis() as u64,
            "session: errored, reconnect scheduled"
        );
        ctx.signals.push(Signal::Errored);
    }

    // -- Incoming messages --

    pub fn handle_request(&mut self, ctx: &mut SessionContext<'_>, id: MessageId, message: &[u8]) {
        if let Err(e) = self.process_request(ctx, id, message) {
            self.fail(ctx, e);
        }
    }

    pub fn handle_response(
        &mut self,
        ctx: &mut SessionContext<'_>,
        header: &DsoHeader,
        message: &[u8],
        request_tlv: TlvType,
    ) {
        if let Err(e) = self.process_response(ctx, header, message, request_tlv) {
            self.fail(ctx, e);
        }
    }

    /// SRPL defines no unidirectional messages.
    pub fn handle_unidirectional(&mut self, ctx: &mut SessionContext<'_>, message: &[u8]) {
        let error = match messages::primary_tlv(message) {
            Ok(tlv) => SessionError::Unidirectional(tlv.tlv_type),
            Err(e) => e.into(),
        };
        self.fail(ctx, error);
    }

    fn process_request(
        &mut self,
        ctx: &mut SessionContext<'_>,
        id: MessageId,
        message: &[u8],
    ) -> Result<()> {
        let primary = messages::primary_tlv(message)?.tlv_type;

        match (primary, self.state) {
            (TlvType::SESSION, PhaseState::EstablishingSession) if self.role == Role::Server => {
                self.process_session_request(ctx, id, message)
            }
            (TlvType::SEND_CANDIDATES, PhaseState::SendCandidatesToPartner { walk: None }) => {
                messages::parse_empty(message, TlvType::SEND_CANDIDATES)?;
                self.set_state(PhaseState::SendCandidatesToPartner {
                    walk: Some(CandidateWalk {
                        request_id: id,
                        cursor: Cursor::Head,
                    }),
                });
                self.send_candidate_request(ctx)
            }
            (
                TlvType::CANDIDATE,
                PhaseState::SyncCandidatesFromPartner {
                    expect_host_request: false,
                },
            ) => self.process_candidate_request(ctx, id, message),
            (
                TlvType::HOST,
                PhaseState::SyncCandidatesFromPartner {
                    expect_host_request: true,
                },
            ) => {
                self.set_state(PhaseState::SyncCandidatesFromPartner {
                    expect_host_request: false,
                });
                self.process_host_request(ctx, id, message)
            }
            (TlvType::HOST, PhaseState::RoutineOperation) => {
                self.process_host_request(ctx, id, message)
            }
            (tlv, _) if !tlv.is_srpl_primary() => {
                Err(ProtocolError::UnrecognizedPrimary(tlv).into())
            }
            (tlv, state) => Err(SessionError::UnexpectedTlv {
                tlv,
                phase: state.phase(),
            }),
        }
    }

    fn process_response(
        &mut self,
        ctx: &mut SessionContext<'_>,
        header: &DsoHeader,
        message: &[u8],
        request_tlv: TlvType,
    ) -> Result<()> {
        if !header.is_success() {
            return Err(SessionError::ResponseCode(header.rcode));
        }
        let primary = messages::primary_tlv(message)?.tlv_type;
        if !primary.is_srpl_primary() {
            return Err(ProtocolError::UnrecognizedPrimary(primary).into());
        }
        if primary != request_tlv {
            return Err(SessionError::ResponseMismatch {
                request: request_tlv,
                response: primary,
            });
        }

        match (primary, self.state) {
            (TlvType::SESSION, PhaseState::EstablishingSession) if self.role == Role::Client => {
                self.process_session_response(ctx, message)
            }
            (TlvType::SEND_CANDIDATES, PhaseState::SyncCandidatesFromPartner { .. }) => {
                messages::parse_empty(message, TlvType::SEND_CANDIDATES)?;
                match self.role {
                    // Server's hosts are in; now wait for it to pull ours.
                    Role::Client => {
                        self.set_state(PhaseState::SendCandidatesToPartner { walk: None });
                        Ok(())
                    }
                    Role::Server => self.start_routine_operation(ctx),
                }
            }
            (TlvType::CANDIDATE, PhaseState::SendCandidatesToPartner { walk: Some(_) }) => {
                self.process_candidate_response(ctx, message)
            }
            (
                TlvType::HOST,
                PhaseState::SendCandidatesToPartner { walk: Some(_) }
                | PhaseState::RoutineOperation,
            ) => self.process_host_response(ctx, message),
            (tlv, state) => Err(SessionError::UnexpectedTlv {
                tlv,
                phase: state.phase(),
            }),
        }
    }

    // -- Session establishment --

    fn send_session_request(&mut self, ctx: &mut SessionContext<'_>) -> Result<()> {
        let request = SessionTlv {
            peer_id: *ctx.own_id,
            assigned_id: PeerId::none(),
        };
        self.send_request(ctx, request.encode()?)?;
        Ok(())
    }

    fn process_session_request(
        &mut self,
        ctx: &mut SessionContext<'_>,
        id: MessageId,
        message: &[u8],
    ) -> Result<()> {
        let request = SessionTlv::parse(message)?;
        if request.assigned_id.has_id() {
            return Err(SessionError::UnsolicitedAssignment(request.assigned_id));
        }

        let mut assigned = PeerId::none();
        if request.peer_id.has_id() {
            let claimed = request.peer_id;
            // Established partners with smaller ids are ours to dial.
            if claimed.is_smaller_than(ctx.own_id) {
                return Err(SessionError::SmallerId(claimed));
            }
            if claimed.matches(ctx.own_id)
                || ctx
                    .partners
                    .iter()
                    .any(|p| p.active && p.peer_id.matches(&claimed))
            {
                return Err(SessionError::IdConflict(claimed));
            }
            if self.partner_id.has_id() && !self.partner_id.matches(&claimed) {
                return Err(SessionError::IdMismatch {
                    expected: self.partner_id,
                    found: claimed,
                });
            }
            self.partner_id = claimed;
        } else {
            let highest = ctx
                .partners
                .iter()
                .fold(*ctx.own_id, |max, p| max.serial_max(p.peer_id));
            let base = if highest.has_id() {
                highest
            } else {
                PeerId::new(0)
            };
            let jitter = ctx.rng.gen_range(1..=ctx.config.assign_id_window.max(1));
            assigned = base.wrapping_add(jitter);
            self.partner_id = assigned;
            tracing::info!(peer = %self.sock_addr, %assigned, "session: assigned partner id");
        }

        let response = SessionTlv {
            peer_id: *ctx.own_id,
            assigned_id: assigned,
        };
        self.send_response(ctx, response.encode()?, id)?;
        self.set_state(PhaseState::SendCandidatesToPartner { walk: None });
        Ok(())
    }

    fn process_session_response(
        &mut self,
        ctx: &mut SessionContext<'_>,
        message: &[u8],
    ) -> Result<()> {
        let response = SessionTlv::parse(message)?;
        let server_id = response.peer_id;
        if !server_id.has_id() {
            return Err(SessionError::MissingPeerId);
        }
        if self.partner_id.has_id() && !self.partner_id.matches(&server_id) {
            return Err(SessionError::IdMismatch {
                expected: self.partner_id,
                found: server_id,
            });
        }
        if server_id.matches(ctx.own_id) {
            return Err(SessionError::IdConflict(server_id));
        }
        self.partner_id = server_id;

        let assigned = response.assigned_id;
        if assigned.has_id() {
            if ctx.own_id.has_id() {
                return Err(SessionError::UnsolicitedAssignment(assigned));
            }
            if assigned.matches(&server_id)
                || ctx.partners.iter().any(|p| p.peer_id.matches(&assigned))
            {
                return Err(SessionError::IdConflict(assigned));
            }
            *ctx.own_id = assigned;
            tracing::info!(peer = %self.sock_addr, peer_id = %assigned, "session: acquired peer id");
            ctx.signals.push(Signal::PeerIdAcquired);
        } else if !ctx.own_id.has_id() {
            return Err(SessionError::MissingAssignment);
        }

        self.send_request(ctx, messages::encode_empty(TlvType::SEND_CANDIDATES)?)?;
        self.set_state(PhaseState::SyncCandidatesFromPartner {
            expect_host_request: false,
        });
        Ok(())
    }

    // -- Candidate walk (sender side) --

    fn walk(&self) -> Option<CandidateWalk> {
        match self.state {
            PhaseState::SendCandidatesToPartner { walk } => walk,
            _ => None,
        }
    }

    fn set_cursor(&mut self, cursor: Cursor) {
        if let PhaseState::SendCandidatesToPartner { walk: Some(walk) } = &mut self.state {
            walk.cursor = cursor;
        }
    }

    /// Offer the host under the cursor, or finish the walk.
    fn send_candidate_request(&mut self, ctx: &mut SessionContext<'_>) -> Result<()> {
        let Some(walk) = self.walk() else {
            return Ok(());
        };

        let host = match walk.cursor {
            Cursor::Head => ctx.registry.first_host(),
            Cursor::At(id) if ctx.registry.host(id).is_some() => Some(id),
            Cursor::At(_) => {
                tracing::debug!(peer = %self.sock_addr, "session: candidate host gone, restarting walk");
                ctx.registry.first_host()
            }
            Cursor::End => None,
        }
        .and_then(|id| ctx.registry.host(id));

        let Some(host) = host else {
            return self.finish_candidate_walk(ctx, walk.request_id);
        };

        let elapsed = ctx.now.saturating_duration_since(host.update_time);
        let request = CandidateRequest {
            hostname: host.full_name.clone(),
            time_offset: rounded_seconds(elapsed.as_millis()),
            key_id: host.key.key_id(),
        };
        let host_id = host.id;
        self.set_cursor(Cursor::At(host_id));
        tracing::trace!(peer = %self.sock_addr, host = %request.hostname, "session: offering candidate");
        self.send_request(ctx, request.encode()?)?;
        Ok(())
    }

    fn finish_candidate_walk(
        &mut self,
        ctx: &mut SessionContext<'_>,
        request_id: MessageId,
    ) -> Result<()> {
        self.send_response(
            ctx,
            messages::encode_empty(TlvType::SEND_CANDIDATES)?,
            request_id,
        )?;
        match self.role {
            // Now pull the client's hosts.
            Role::Server => {
                self.send_request(ctx, messages::encode_empty(TlvType::SEND_CANDIDATES)?)?;
                self.set_state(PhaseState::SyncCandidatesFromPartner {
                    expect_host_request: false,
                });
                Ok(())
            }
            Role::Client => self.start_routine_operation(ctx),
        }
    }

    /// Resolve the cursor after a response: `None` if the offered host has
    /// been removed in the meantime.
    fn offered_host(&self, ctx: &SessionContext<'_>) -> Option<HostId> {
        match self.walk()?.cursor {
            Cursor::At(id) => ctx.registry.host(id).map(|h| h.id),
            Cursor::Head | Cursor::End => None,
        }
    }

    fn advance_cursor(&mut self, ctx: &mut SessionContext<'_>) -> Result<()> {
        let next = match self.offered_host(ctx) {
            Some(id) => ctx.registry.next_host(id).map_or(Cursor::End, Cursor::At),
            None => Cursor::Head,
        };
        self.set_cursor(next);
        self.send_candidate_request(ctx)
    }

    fn process_candidate_response(
        &mut self,
        ctx: &mut SessionContext<'_>,
        message: &[u8],
    ) -> Result<()> {
        let verdict = CandidateVerdict::parse_response(message)?;

        let Some(host_id) = self.offered_host(ctx) else {
            tracing::debug!(peer = %self.sock_addr, "session: candidate host gone, restarting walk");
            self.set_cursor(Cursor::Head);
            return self.send_candidate_request(ctx);
        };

        tracing::trace!(peer = %self.sock_addr, host = %host_id, %verdict, "session: candidate answered");
        if verdict.wants_host() {
            self.send_host_request(ctx, host_id)
        } else {
            self.advance_cursor(ctx)
        }
    }

    /// Replay everything the host retains, oldest first.
    fn send_host_request(&mut self, ctx: &mut SessionContext<'_>, host_id: HostId) -> Result<()> {
        let mut retained: Vec<&Arc<UpdateMessage>> = Vec::new();
        if let Some(host) = ctx.registry.host(host_id) {
            for message in host.retained_messages() {
                if !retained.iter().any(|m| Arc::ptr_eq(m, message)) {
                    retained.push(message);
                }
            }
        }
        retained.sort_by_key(|m| m.rx_time);

        let request = HostRequest {
            messages: retained
                .into_iter()
                .map(|m| host_message(m, ctx.now))
                .collect(),
        };
        self.send_request(ctx, request.encode()?)?;
        Ok(())
    }

    fn process_host_response(&mut self, ctx: &mut SessionContext<'_>, message: &[u8]) -> Result<()> {
        messages::parse_empty(message, TlvType::HOST)?;

        if self.state == PhaseState::RoutineOperation {
            if self.queue.pop_front().is_none() {
                return Err(SessionError::NothingOutstanding);
            }
            return self.send_queued_host_request(ctx);
        }
        self.advance_cursor(ctx)
    }

    // -- Candidate walk (receiver side) --

    fn process_candidate_request(
        &mut self,
        ctx: &mut SessionContext<'_>,
        id: MessageId,
        message: &[u8],
    ) -> Result<()> {
        let request = CandidateRequest::parse(message)?;

        let verdict = match ctx.registry.find_host(&request.hostname) {
            None => CandidateVerdict::Yes,
            Some(host) if host.key.key_id() != request.key_id => CandidateVerdict::Conflict,
            Some(host) => {
                let remote_update = ctx
                    .now
                    .checked_sub(Duration::from_secs(request.time_offset as u64));
                match remote_update {
                    Some(remote) if abs_diff(remote, host.update_time) <= ctx.config.update_skew_window() => {
                        CandidateVerdict::No
                    }
                    _ => CandidateVerdict::Yes,
                }
            }
        };

        tracing::trace!(peer = %self.sock_addr, host = %request.hostname, %verdict, "session: candidate received");
        self.send_response(ctx, verdict.encode_response()?, id)?;
        if verdict.wants_host() {
            self.set_state(PhaseState::SyncCandidatesFromPartner {
                expect_host_request: true,
            });
        }
        Ok(())
    }

    /// Apply a partner's host state. Every TLV is validated before anything
    /// is applied; a registry that rejects one update does not fail the
    /// session.
    fn process_host_request(
        &mut self,
        ctx: &mut SessionContext<'_>,
        id: MessageId,
        message: &[u8],
    ) -> Result<()> {
        let request = HostRequest::parse(message)?;

        for update in &request.messages {
            let rx_time = ctx
                .now
                .checked_sub(Duration::from_secs(update.rx_time_offset as u64))
                .unwrap_or(ctx.now);
            if let Err(e) = ctx.registry.process_message(
                &update.data,
                rx_time,
                update.granted_lease,
                update.granted_key_lease,
            ) {
                tracing::warn!(peer = %self.sock_addr, "session: failed to apply partner update: {e}");
            }
        }

        self.send_response(ctx, messages::encode_empty(TlvType::HOST)?, id)
    }

    // -- Routine operation --

    fn start_routine_operation(&mut self, ctx: &mut SessionContext<'_>) -> Result<()> {
        self.set_state(PhaseState::RoutineOperation);
        self.backoff.reset();
        ctx.transport.set_long_lived(self.sock_addr, true);
        tracing::info!(
            peer = %self.sock_addr,
            partner_id = %self.partner_id,
            queued = self.queue.len(),
            "session: routine operation"
        );
        ctx.signals.push(Signal::RoutineStarted);
        self.send_queued_host_request(ctx)
    }

    /// Queue a local update for the partner. Dropped before the candidate
    /// walk starts: the walk will carry it.
    pub fn send_update_message(&mut self, ctx: &mut SessionContext<'_>, message: Arc<UpdateMessage>) {
        match self.state {
            PhaseState::SyncCandidatesFromPartner { .. }
            | PhaseState::SendCandidatesToPartner { .. } => self.insert_in_queue(message, 0),
            PhaseState::RoutineOperation => {
                let was_empty = self.queue.is_empty();
                // The head is in flight; never reorder ahead of it.
                self.insert_in_queue(message, 1);
                if was_empty {
                    if let Err(e) = self.send_queued_host_request(ctx) {
                        self.fail(ctx, e);
                    }
                }
            }
            PhaseState::ToSync | PhaseState::EstablishingSession => {}
        }
    }

    fn insert_in_queue(&mut self, message: Arc<UpdateMessage>, first_movable: usize) {
        if self.queue.iter().any(|m| Arc::ptr_eq(m, &message)) {
            return;
        }
        let start = first_movable.min(self.queue.len());
        let index = self
            .queue
            .iter()
            .skip(start)
            .position(|m| m.rx_time > message.rx_time)
            .map_or(self.queue.len(), |i| start + i);
        self.queue.insert(index, message);
    }

    fn send_queued_host_request(&mut self, ctx: &mut SessionContext<'_>) -> Result<()> {
        let Some(head) = self.queue.front() else {
            return Ok(());
        };
        let request = HostRequest {
            messages: vec![host_message(head, ctx.now)],
        };
        self.send_request(ctx, request.encode()?)?;
        Ok(())
    }

    /// Forget a host the registry is about to remove.
    pub fn handle_host_removed(&mut self, host: HostId) {
        if matches!(self.walk(), Some(CandidateWalk { cursor: Cursor::At(id), .. }) if id == host) {
            tracing::debug!(peer = %self.sock_addr, %host, "session: candidate host removed");
            self.set_cursor(Cursor::Head);
        }
    }

    // -- Transport helpers --

    fn send_request(&self, ctx: &mut SessionContext<'_>, message: BytesMut) -> Result<MessageId> {
        Ok(ctx.transport.send_request(self.sock_addr, message.freeze())?)
    }

    fn send_response(
        &self,
        ctx: &mut SessionContext<'_>,
        message: BytesMut,
        id: MessageId,
    ) -> Result<()> {
        Ok(ctx
            .transport
            .send_response(self.sock_addr, message.freeze(), id)?)
    }
}

fn host_message(message: &UpdateMessage, now: Instant) -> HostMessage {
    HostMessage {
        rx_time_offset: rounded_seconds(now.saturating_duration_since(message.rx_time).as_millis()),
        granted_lease: message.granted_lease,
        granted_key_lease: message.granted_key_lease,
        data: message.data.clone(),
    }
}

fn abs_diff(a: Instant, b: Instant) -> Duration {
    if a > b {
        a - b
    } else {
        b - a
    }
}
