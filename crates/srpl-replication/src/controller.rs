//! Replication controller -- discovery, peer-id acquisition, primary partner
//! selection, and the set of partner sessions.
//!
//! Lifecycle: `Disabled -> Discovery -> AcquireId -> PrimaryPartnerSync ->
//! Running`. During discovery the node only listens for partner adverts.
//! It then syncs from the lowest-id partner (acquiring an id from it if it
//! has none), or picks its own id when nobody is around, and finally starts
//! serving and replicating with every partner.
//!
//! Partners replicate one dataset. A node joins the dataset of the first
//! partner it hears from and restarts whenever it hears of a larger one;
//! partners in a smaller dataset are left alone until they do the same.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use srpl_protocol::txt::MAX_DOMAIN_LENGTH;
use srpl_protocol::{DatasetId, DsoHeader, MessageId, PartnerInfo, PartnerTxt, PeerId, TlvType};
use srpl_registry::{AddressMode, HostId, Registry, UpdateMessage};

use crate::clock::Clock;
use crate::error::SrplError;
use crate::session::{Link, Origin, PartnerView, Phase, Role, Session, SessionContext, Signal};
use crate::transport::{DisconnectMode, DisconnectReason, Discovery, Transport};
use crate::SrplConfig;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disabled,
    /// Browsing for partners before doing anything else.
    Discovery,
    /// Syncing from the primary partner to get a peer id assigned.
    AcquireId,
    /// Have an id; finishing the initial sync with the primary partner.
    PrimaryPartnerSync,
    /// Serving and replicating with every partner.
    Running,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Disabled => "disabled",
            State::Discovery => "discovery",
            State::AcquireId => "acquire-id",
            State::PrimaryPartnerSync => "primary-partner-sync",
            State::Running => "running",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Coarse session state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Establishing,
    InitialSync,
    RoutineOperation,
    Errored,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Establishing => "establishing",
            SessionState::InitialSync => "initial-sync",
            SessionState::RoutineOperation => "routine-operation",
            SessionState::Errored => "errored",
        })
    }
}

/// A read-only view of one partner session.
#[derive(Debug, Clone, PartialEq)]
pub struct PartnerSnapshot {
    pub sock_addr: SocketAddr,
    pub peer_id: PeerId,
    pub role: Role,
    pub session_state: SessionState,
    /// Local updates waiting to be sent.
    pub queued: usize,
}

/// The replication controller. Sans-IO: every method runs to completion and
/// acts only through the collaborators it owns.
pub struct Srpl<R: Registry> {
    config: SrplConfig,
    registry: R,
    transport: Box<dyn Transport>,
    discovery: Box<dyn Discovery>,
    clock: Box<dyn Clock>,
    rng: StdRng,

    state: State,
    peer_id: PeerId,
    dataset_id: Option<DatasetId>,
    /// Sequence number of the last dataset served, carried into the next
    /// self-selected one.
    dataset_seq: Option<u8>,
    domain: Option<String>,
    default_domain: String,
    primary: Option<SocketAddr>,
    /// Ordered so that selection and fan-out are deterministic.
    sessions: BTreeMap<SocketAddr, Session>,
    timer: Option<Instant>,
    discovery_end: Option<Instant>,
    /// Used once, in place of the first random self-selected id.
    fixed_peer_id: Option<u32>,
    fixed_dataset_id: Option<u64>,
}

impl<R: Registry> Srpl<R> {
    pub fn new(
        config: SrplConfig,
        registry: R,
        transport: Box<dyn Transport>,
        discovery: Box<dyn Discovery>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let default_domain = config.default_domain.clone();
        let fixed_peer_id = config.fixed_peer_id;
        let fixed_dataset_id = config.fixed_dataset_id;
        Self {
            config,
            registry,
            transport,
            discovery,
            clock,
            rng: StdRng::from_entropy(),
            state: State::Disabled,
            peer_id: PeerId::none(),
            dataset_id: None,
            dataset_seq: None,
            domain: None,
            default_domain,
            primary: None,
            sessions: BTreeMap::new(),
            timer: None,
            discovery_end: None,
            fixed_peer_id,
            fixed_dataset_id,
        }
    }

    /// Replace the random source, for reproducible runs.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> State {
        self.state
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn dataset_id(&self) -> Option<DatasetId> {
        self.dataset_id
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn config(&self) -> &SrplConfig {
        &self.config
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Local registry changes must be followed by
    /// `send_update_message_to_partners` or `handle_server_removing_host`.
    pub fn registry_mut(&mut self) -> &mut R {
        &mut self.registry
    }

    pub fn primary(&self) -> Option<SocketAddr> {
        self.primary
    }

    /// When `handle_timer` next needs to run.
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timer
    }

    pub fn partners(&self) -> Vec<PartnerSnapshot> {
        self.sessions
            .values()
            .map(|s| PartnerSnapshot {
                sock_addr: s.sock_addr(),
                peer_id: s.partner_id(),
                role: s.role(),
                session_state: session_state(s),
                queued: s.queue_len(),
            })
            .collect()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), SrplError> {
        match (enabled, self.state) {
            (true, State::Disabled) => {
                if self.registry.is_enabled() {
                    return Err(SrplError::InvalidState("registry already enabled"));
                }
                self.registry.set_address_mode(AddressMode::Anycast);
                self.start();
            }
            (false, state) if state != State::Disabled => {
                self.stop();
                self.registry.set_address_mode(AddressMode::Unicast);
            }
            _ => {}
        }
        self.schedule_timer();
        Ok(())
    }

    /// Fix the replication domain instead of adopting one from partners.
    pub fn set_domain(&mut self, domain: Option<&str>) -> Result<(), SrplError> {
        if self.state != State::Disabled {
            return Err(SrplError::InvalidState(self.state.name()));
        }
        if let Some(domain) = domain {
            check_domain(domain)?;
        }
        self.domain = domain.map(str::to_string);
        Ok(())
    }

    pub fn set_default_domain(&mut self, domain: &str) -> Result<(), SrplError> {
        if self.state != State::Disabled {
            return Err(SrplError::InvalidState(self.state.name()));
        }
        check_domain(domain)?;
        self.default_domain = domain.to_string();
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn start(&mut self) {
        self.state = State::Discovery;
        self.peer_id.clear();
        self.primary = None;
        self.discovery.browse(true);
        self.transport.start_listening();

        let min = self.config.discovery_min_ms;
        let wait = self.rng.gen_range(min..=self.config.discovery_max_ms.max(min));
        self.discovery_end = Some(self.clock.now() + Duration::from_millis(wait));
        tracing::info!(wait_ms = wait, domain = ?self.domain, "srpl: discovering partners");
    }

    fn stop(&mut self) {
        self.transport.stop_listening();
        self.discovery.browse(false);
        self.discovery.unregister_service();

        let addrs: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for addr in addrs {
            self.with_session(addr, |s, ctx| {
                s.disconnect(ctx, DisconnectMode::Graceful, DisconnectReason::Shutdown)
            });
        }
        self.sessions.clear();
        self.primary = None;
        self.timer = None;
        self.discovery_end = None;
        self.dataset_id = None;
        self.registry.disable();
        self.state = State::Disabled;
        tracing::info!("srpl: stopped");
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            tracing::info!(from = %self.state, to = %state, peer_id = %self.peer_id, "srpl: state changed");
            self.state = state;
        }
    }

    /// Sync from the lowest-id usable partner, or become a server with a
    /// self-selected id when there is none.
    fn select_primary(&mut self) {
        let own = self.peer_id;
        let best = self
            .sessions
            .values()
            .filter(|s| {
                let id = s.partner_id();
                id.has_id()
                    && s.origin() == Origin::Discovered
                    && !s.is_marked_to_remove()
                    && !s.is_errored()
                    && (!own.has_id() || id.is_at_most(&own))
            })
            .min_by(|a, b| serial_cmp(a.partner_id(), b.partner_id()))
            .map(|s| s.sock_addr());

        let Some(addr) = best else {
            if !own.has_id() {
                let id = match self.fixed_peer_id.take() {
                    Some(id) => id,
                    None => self.rng.gen_range(0..self.config.self_selected_id_window.max(1)),
                };
                self.peer_id.set(id);
                tracing::info!(peer_id = id, "srpl: no partner to sync from, selected own id");
            }
            self.start_srp_server();
            return;
        };

        self.primary = Some(addr);
        self.set_state(if own.has_id() {
            State::PrimaryPartnerSync
        } else {
            State::AcquireId
        });
        tracing::info!(primary = %addr, "srpl: selected primary partner");
        self.with_session(addr, |s, ctx| {
            if s.phase() == Phase::ToSync && s.link() == Link::Disconnected {
                s.connect(ctx);
            }
        });
    }

    fn start_srp_server(&mut self) {
        let Some(id) = self.peer_id.get() else {
            return;
        };
        let domain = self
            .domain
            .clone()
            .unwrap_or_else(|| self.default_domain.clone());
        let dataset_id = match self.dataset_id {
            Some(dataset_id) => dataset_id,
            None => self.select_dataset_id(),
        };
        self.dataset_id = Some(dataset_id);
        self.dataset_seq = Some(dataset_id.seq_number());

        match PartnerTxt::new(domain.as_str(), true, id, dataset_id).encode() {
            Ok(txt) => self.discovery.register_service(&txt),
            Err(e) => tracing::error!(%domain, "srpl: cannot advertise: {e}"),
        }
        self.registry.enable();
        self.primary = None;
        self.set_state(State::Running);
        tracing::info!(peer_id = id, %dataset_id, %domain, "srpl: serving and replicating");

        let addrs: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for addr in addrs {
            self.start_session(addr);
        }
    }

    /// Start a new dataset: nobody was around to adopt one from.
    fn select_dataset_id(&mut self) -> DatasetId {
        let dataset_id = match self.fixed_dataset_id.take() {
            Some(id) => DatasetId::new(id),
            None => {
                let random = DatasetId::new(self.rng.gen());
                match self.dataset_seq {
                    Some(seq) => random.with_seq_number(seq.wrapping_add(1)),
                    None => random,
                }
            }
        };
        tracing::info!(%dataset_id, "srpl: selected dataset id");
        dataset_id
    }

    /// Connect to a discovered partner if it is ours to connect to: the
    /// larger id initiates.
    fn start_session(&mut self, addr: SocketAddr) {
        let own = self.peer_id;
        self.with_session(addr, |s, ctx| {
            if s.origin() == Origin::Discovered
                && !s.is_errored()
                && !s.is_marked_to_remove()
                && s.partner_id().is_smaller_than(&own)
                && s.phase() == Phase::ToSync
                && s.link() == Link::Disconnected
            {
                s.connect(ctx);
            }
        });
    }

    fn remove_session(&mut self, addr: SocketAddr) {
        self.with_session(addr, |s, ctx| {
            s.disconnect(ctx, DisconnectMode::Graceful, DisconnectReason::PartnerRemoved)
        });
        if self.sessions.remove(&addr).is_some() {
            tracing::info!(peer = %addr, "srpl: partner removed");
        }
        if self.primary == Some(addr) {
            self.primary = None;
            if matches!(self.state, State::AcquireId | State::PrimaryPartnerSync) {
                self.select_primary();
            }
        }
    }

    // ========================================================================
    // Timer
    // ========================================================================

    pub fn handle_timer(&mut self) {
        let now = self.clock.now();

        if self.state == State::Discovery && self.discovery_end.is_some_and(|end| end <= now) {
            self.discovery_end = None;
            if self.domain.is_none() {
                tracing::info!(domain = %self.default_domain, "srpl: no partners found, using default domain");
                self.domain = Some(self.default_domain.clone());
            }
            self.set_state(State::AcquireId);
            self.select_primary();
        }

        let expired: Vec<SocketAddr> = self
            .sessions
            .values()
            .filter(|s| s.remove_at().is_some_and(|at| at <= now))
            .map(|s| s.sock_addr())
            .collect();
        for addr in expired {
            self.remove_session(addr);
        }

        let due: Vec<SocketAddr> = self
            .sessions
            .values()
            .filter(|s| s.reconnect_at().is_some_and(|at| at <= now))
            .map(|s| s.sock_addr())
            .collect();
        for addr in due {
            if let Some(session) = self.sessions.get_mut(&addr) {
                session.clear_error();
            }
            match self.state {
                State::Running => self.start_session(addr),
                State::AcquireId | State::PrimaryPartnerSync if self.primary.is_none() => {
                    self.select_primary()
                }
                _ => {}
            }
        }

        self.schedule_timer();
    }

    fn schedule_timer(&mut self) {
        let discovery = match self.state {
            State::Discovery => self.discovery_end,
            _ => None,
        };
        self.timer = self
            .sessions
            .values()
            .flat_map(|s| [s.reconnect_at(), s.remove_at()])
            .chain([discovery])
            .flatten()
            .min();
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    pub fn handle_browse_result(&mut self, info: PartnerInfo) {
        if self.state == State::Disabled {
            return;
        }
        if info.removed {
            self.remove_partner(info.sock_addr);
        } else {
            self.add_partner(info.sock_addr, &info.txt_data);
        }
        self.schedule_timer();
    }

    fn add_partner(&mut self, addr: SocketAddr, txt: &[u8]) {
        let txt = match PartnerTxt::parse(txt) {
            Ok(txt) => txt,
            Err(e) => {
                tracing::debug!(peer = %addr, "srpl: ignoring partner with bad TXT: {e}");
                return;
            }
        };
        if !txt.allows_join {
            tracing::debug!(peer = %addr, "srpl: partner does not allow joining");
            return;
        }
        match &self.domain {
            Some(domain) if !domain.eq_ignore_ascii_case(&txt.domain) => {
                tracing::debug!(peer = %addr, domain = %txt.domain, "srpl: partner in another domain");
                return;
            }
            Some(_) => {}
            None => {
                tracing::info!(peer = %addr, domain = %txt.domain, "srpl: adopted partner domain");
                self.domain = Some(txt.domain.clone());
            }
        }

        let partner_dataset = txt.dataset_id;
        match self.dataset_id {
            None => {
                tracing::info!(peer = %addr, dataset_id = %partner_dataset, "srpl: adopted partner dataset id");
                self.dataset_id = Some(partner_dataset);
            }
            Some(own) if partner_dataset > own => {
                tracing::info!(
                    peer = %addr,
                    dataset_id = %partner_dataset,
                    "srpl: partner has a larger dataset id, restarting"
                );
                self.stop();
                // Only this dataset or a larger one is acceptable from now on.
                self.dataset_id = Some(partner_dataset);
                self.start();
                return;
            }
            Some(own) if partner_dataset != own => {
                tracing::debug!(peer = %addr, dataset_id = %partner_dataset, "srpl: partner in another dataset");
                return;
            }
            Some(_) => {}
        }

        let partner_id = txt.peer_id;
        if partner_id.matches(&self.peer_id) {
            tracing::warn!(peer = %addr, %partner_id, "srpl: partner claims our peer id, restarting");
            self.stop();
            self.start();
            return;
        }

        // Two partners with one id: the newer advert wins.
        let stale: Vec<SocketAddr> = self
            .sessions
            .values()
            .filter(|s| {
                s.sock_addr() != addr
                    && s.origin() == Origin::Discovered
                    && s.partner_id().matches(&partner_id)
            })
            .map(|s| s.sock_addr())
            .collect();
        for other in stale {
            tracing::warn!(peer = %other, %partner_id, "srpl: peer id taken over by {addr}");
            self.with_session(other, |s, ctx| {
                s.set_partner_id(PeerId::none());
                s.abort(ctx, DisconnectReason::Superseded);
            });
        }

        let config = &self.config;
        let session = self
            .sessions
            .entry(addr)
            .or_insert_with(|| Session::new(addr, Origin::Discovered, config));
        let previous = session.partner_id();
        session.set_origin(Origin::Discovered);
        session.clear_to_remove();
        if previous.has_id() && !previous.matches(&partner_id) {
            tracing::info!(peer = %addr, %previous, %partner_id, "srpl: partner id changed");
            self.with_session(addr, |s, ctx| {
                s.abort(ctx, DisconnectReason::ProtocolError);
                s.set_partner_id(partner_id);
            });
        } else {
            session.set_partner_id(partner_id);
        }

        match self.state {
            State::Running => self.start_session(addr),
            State::AcquireId | State::PrimaryPartnerSync if self.primary.is_none() => {
                self.select_primary()
            }
            _ => {}
        }
    }

    fn remove_partner(&mut self, addr: SocketAddr) {
        if !self.sessions.contains_key(&addr) {
            return;
        }
        if self.state == State::Discovery {
            self.sessions.remove(&addr);
            return;
        }
        let deadline = self.clock.now() + self.config.remove_timeout();
        if let Some(session) = self.sessions.get_mut(&addr) {
            tracing::debug!(peer = %addr, "srpl: partner advert withdrawn");
            session.mark_to_remove(deadline);
        }
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    /// Accept an inbound connection. Returns false if it should be dropped.
    pub fn accept_connection(&mut self, addr: SocketAddr) -> bool {
        if self.state != State::Running {
            tracing::debug!(peer = %addr, state = %self.state, "srpl: refusing connection");
            return false;
        }
        match self.sessions.get(&addr) {
            Some(s) if s.is_errored() => {
                tracing::debug!(peer = %addr, "srpl: refusing connection from errored partner");
                return false;
            }
            Some(s) if s.link() != Link::Disconnected => {
                tracing::info!(peer = %addr, "srpl: new connection supersedes existing link");
                self.with_session(addr, |s, ctx| {
                    s.disconnect(ctx, DisconnectMode::Abort, DisconnectReason::Superseded)
                });
            }
            Some(_) => {}
            None => {
                let session = Session::new(addr, Origin::Inbound, &self.config);
                self.sessions.insert(addr, session);
            }
        }
        if let Some(session) = self.sessions.get_mut(&addr) {
            session.accept();
        }
        self.schedule_timer();
        true
    }

    pub fn handle_connected(&mut self, addr: SocketAddr) {
        self.dispatch(addr, |s, ctx| s.handle_connected(ctx));
    }

    pub fn handle_disconnected(&mut self, addr: SocketAddr) {
        self.dispatch(addr, |s, ctx| s.handle_disconnected(ctx));
    }

    pub fn handle_request(&mut self, addr: SocketAddr, id: MessageId, message: &[u8]) {
        self.dispatch(addr, |s, ctx| s.handle_request(ctx, id, message));
    }

    pub fn handle_response(
        &mut self,
        addr: SocketAddr,
        header: &DsoHeader,
        message: &[u8],
        request_tlv: TlvType,
    ) {
        self.dispatch(addr, |s, ctx| {
            s.handle_response(ctx, header, message, request_tlv)
        });
    }

    pub fn handle_unidirectional(&mut self, addr: SocketAddr, message: &[u8]) {
        self.dispatch(addr, |s, ctx| s.handle_unidirectional(ctx, message));
    }

    fn dispatch(&mut self, addr: SocketAddr, f: impl FnOnce(&mut Session, &mut SessionContext<'_>)) {
        if self.with_session(addr, f).is_none() {
            tracing::debug!(peer = %addr, "srpl: event for unknown partner");
        }
        self.schedule_timer();
    }

    // ========================================================================
    // Registry events
    // ========================================================================

    /// Forward a locally received update to every partner.
    pub fn send_update_message_to_partners(&mut self, message: Arc<UpdateMessage>) {
        let addrs: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for addr in addrs {
            self.with_session(addr, |s, ctx| {
                s.send_update_message(ctx, Arc::clone(&message))
            });
        }
        self.schedule_timer();
    }

    /// Must be called before the registry drops a host.
    pub fn handle_server_removing_host(&mut self, host: HostId) {
        for session in self.sessions.values_mut() {
            session.handle_host_removed(host);
        }
    }

    // ========================================================================
    // Session plumbing
    // ========================================================================

    fn with_session<T>(
        &mut self,
        addr: SocketAddr,
        f: impl FnOnce(&mut Session, &mut SessionContext<'_>) -> T,
    ) -> Option<T> {
        let partners: Vec<PartnerView> = self
            .sessions
            .iter()
            .filter(|(a, _)| **a != addr)
            .map(|(_, s)| s.view())
            .collect();
        let now = self.clock.now();
        let session = self.sessions.get_mut(&addr)?;
        let mut ctx = SessionContext {
            own_id: &mut self.peer_id,
            partners: &partners,
            registry: &mut self.registry,
            transport: &mut *self.transport,
            rng: &mut self.rng,
            config: &self.config,
            now,
            signals: Vec::new(),
        };
        let out = f(session, &mut ctx);
        let signals = ctx.signals;
        for signal in signals {
            self.handle_signal(addr, signal);
        }
        Some(out)
    }

    fn handle_signal(&mut self, addr: SocketAddr, signal: Signal) {
        let from_primary = self.primary == Some(addr);
        match signal {
            Signal::PeerIdAcquired => {
                if self.state == State::AcquireId {
                    self.set_state(State::PrimaryPartnerSync);
                }
            }
            Signal::RoutineStarted => {
                if from_primary
                    && matches!(self.state, State::AcquireId | State::PrimaryPartnerSync)
                {
                    self.start_srp_server();
                }
            }
            Signal::Errored => {
                if from_primary
                    && matches!(self.state, State::AcquireId | State::PrimaryPartnerSync)
                {
                    tracing::info!(primary = %addr, "srpl: primary partner failed, reselecting");
                    self.primary = None;
                    self.select_primary();
                }
            }
        }
    }
}

fn check_domain(domain: &str) -> Result<(), SrplError> {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LENGTH {
        return Err(SrplError::InvalidDomain(domain.to_string()));
    }
    Ok(())
}

fn serial_cmp(a: PeerId, b: PeerId) -> std::cmp::Ordering {
    if a.matches(&b) {
        std::cmp::Ordering::Equal
    } else if a.is_smaller_than(&b) {
        std::cmp::Ordering::Less
    } else {
        std::cmp::Ordering::Greater
    }
}

fn session_state(s: &Session) -> SessionState {
    if s.is_errored() {
        return SessionState::Errored;
    }
    match (s.link(), s.phase()) {
        (Link::Disconnected, _) => SessionState::Disconnected,
        (Link::Connecting, _) => SessionState::Connecting,
        (Link::Connected, Phase::ToSync | Phase::EstablishingSession) => SessionState::Establishing,
        (Link::Connected, Phase::SyncCandidatesFromPartner | Phase::SendCandidatesToPartner) => {
            SessionState::InitialSync
        }
        (Link::Connected, Phase::RoutineOperation) => SessionState::RoutineOperation,
    }
}
