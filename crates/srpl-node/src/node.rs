//! Node runtime -- the dispatch loop that owns the replication controller.
//!
//! Every input (link events, browse results, local registry changes, status
//! queries, the controller timer) arrives at one `tokio::select!` loop, so
//! the controller only ever handles one event at a time.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use srpl_protocol::{DatasetId, Frame, PartnerInfo, PeerId};
use srpl_registry::{MemoryRegistry, Registry, UpdateRecord};
use srpl_replication::{PartnerSnapshot, Srpl, State, SystemClock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::discovery::DirectoryDiscovery;
use crate::expand_tilde;
use crate::transport::{run_accept_loop, Delivery, TcpTransport};

const EVENT_CHANNEL_SIZE: usize = 1024;

pub type EventSender = mpsc::Sender<NodeEvent>;

/// Everything the dispatch loop reacts to.
pub enum NodeEvent {
    Accepted {
        peer: SocketAddr,
        stream: TcpStream,
    },
    LinkUp {
        peer: SocketAddr,
        generation: u64,
    },
    LinkDown {
        peer: SocketAddr,
        generation: u64,
    },
    Frame {
        peer: SocketAddr,
        generation: u64,
        frame: Frame,
    },
    BrowseResult(PartnerInfo),
    LocalUpdate {
        record: UpdateRecord,
        reply: Option<oneshot::Sender<Result<(), String>>>,
    },
    RemoveHost {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Status(oneshot::Sender<NodeStatus>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStatus {
    pub name: String,
    pub key_id: u32,
    pub deleted: bool,
    /// Live (not deleted) service names.
    pub services: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub listen_addr: SocketAddr,
    pub state: State,
    pub peer_id: PeerId,
    pub dataset_id: Option<DatasetId>,
    pub domain: Option<String>,
    pub partners: Vec<PartnerSnapshot>,
    pub hosts: Vec<HostStatus>,
}

impl NodeStatus {
    pub fn host(&self, name: &str) -> Option<&HostStatus> {
        self.hosts.iter().find(|h| h.name.eq_ignore_ascii_case(name))
    }
}

// ============================================================================
// Handle
// ============================================================================

/// A running node: the dispatch loop and the accept loop.
pub struct NodeHandle {
    listen_addr: SocketAddr,
    events: EventSender,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Register or update a host locally and fan it out to partners.
    /// Resolves once the update is applied, which is not before the node is
    /// serving.
    pub async fn update(&self, record: UpdateRecord) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeEvent::LocalUpdate {
            record,
            reply: Some(tx),
        })
        .await?;
        rx.await
            .context("node stopped before applying update")?
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Drop a host from the local registry. Returns false if unknown.
    pub async fn remove_host(&self, name: &str) -> anyhow::Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeEvent::RemoveHost {
            name: name.to_string(),
            reply: tx,
        })
        .await?;
        rx.await.context("node stopped")
    }

    pub async fn status(&self) -> anyhow::Result<NodeStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeEvent::Status(tx)).await?;
        rx.await.context("node stopped")
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    async fn send(&self, event: NodeEvent) -> anyhow::Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("node stopped"))
    }
}

/// Bind the listener, wire the controller to its collaborators, enable
/// replication and spawn the node's tasks.
pub async fn spawn_node(config: NodeConfig) -> anyhow::Result<NodeHandle> {
    let listener = TcpListener::bind(&config.node.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.node.listen_addr))?;
    let listen_addr = listener.local_addr()?;
    let advertise_addr = config.advertise_addr(listen_addr)?;

    let directory = expand_tilde(&config.discovery.directory);
    std::fs::create_dir_all(&directory)
        .with_context(|| format!("creating {}", directory.display()))?;

    let pending = config.host_records()?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let transport = TcpTransport::new(events_tx.clone(), config.idle_timeout());
    let discovery = DirectoryDiscovery::new(
        directory,
        advertise_addr,
        config.poll_interval(),
        events_tx.clone(),
    );

    let mut srpl = Srpl::new(
        config.replication.clone(),
        MemoryRegistry::new(),
        Box::new(transport.clone()),
        Box::new(discovery),
        Box::new(SystemClock),
    );
    if let Some(seed) = config.node.rng_seed {
        srpl = srpl.with_rng(StdRng::seed_from_u64(seed));
    }
    srpl.set_default_domain(&config.replication.default_domain)?;
    srpl.set_domain(config.node.domain.as_deref())?;
    srpl.set_enabled(true)?;

    tracing::info!(
        %listen_addr,
        %advertise_addr,
        hosts = pending.len(),
        "srpl: node started"
    );

    let dispatcher = Dispatcher {
        srpl,
        transport,
        listen_addr,
        pending: pending
            .into_iter()
            .map(|record| PendingUpdate {
                record,
                reply: None,
            })
            .collect(),
    };

    let mut handles = Vec::new();
    {
        let events = events_tx.clone();
        let shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            run_accept_loop(listener, events, shutdown).await;
        }));
    }
    {
        let shutdown = shutdown_tx.subscribe();
        let expiry_interval = config.expiry_interval();
        handles.push(tokio::spawn(async move {
            run_srpl_loop(dispatcher, events_rx, shutdown, expiry_interval).await;
        }));
    }

    Ok(NodeHandle {
        listen_addr,
        events: events_tx,
        shutdown_tx,
        handles,
    })
}

// ============================================================================
// Dispatch loop
// ============================================================================

struct PendingUpdate {
    record: UpdateRecord,
    reply: Option<oneshot::Sender<Result<(), String>>>,
}

pub struct Dispatcher {
    srpl: Srpl<MemoryRegistry>,
    transport: TcpTransport,
    listen_addr: SocketAddr,
    /// Local updates held until the registry is serving.
    pending: Vec<PendingUpdate>,
}

impl Dispatcher {
    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Accepted { peer, stream } => {
                if !self.transport.is_listening() {
                    tracing::debug!(%peer, "transport: not listening, dropping connection");
                    return;
                }
                if self.srpl.accept_connection(peer) {
                    self.transport.adopt(peer, stream);
                    self.srpl.handle_connected(peer);
                }
            }
            NodeEvent::LinkUp { peer, generation } => {
                if self.transport.link_up(peer, generation) {
                    self.srpl.handle_connected(peer);
                }
            }
            NodeEvent::LinkDown { peer, generation } => {
                if self.transport.link_down(peer, generation) {
                    self.srpl.handle_disconnected(peer);
                }
            }
            NodeEvent::Frame {
                peer,
                generation,
                frame,
            } => match self.transport.receive(peer, generation, frame) {
                Some(Delivery::Request { id, body }) => self.srpl.handle_request(peer, id, &body),
                Some(Delivery::Response {
                    header,
                    body,
                    request_tlv,
                }) => self
                    .srpl
                    .handle_response(peer, &header, &body, request_tlv),
                Some(Delivery::Unidirectional { body }) => {
                    self.srpl.handle_unidirectional(peer, &body)
                }
                Some(Delivery::LinkLost) => self.srpl.handle_disconnected(peer),
                None => {}
            },
            NodeEvent::BrowseResult(info) => self.srpl.handle_browse_result(info),
            NodeEvent::LocalUpdate { record, reply } => {
                self.pending.push(PendingUpdate { record, reply });
            }
            NodeEvent::RemoveHost { name, reply } => {
                let _ = reply.send(self.remove_host(&name));
            }
            NodeEvent::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
        self.flush_pending();
    }

    fn flush_pending(&mut self) {
        if self.pending.is_empty()
            || self.srpl.state() != State::Running
            || !self.srpl.registry().is_enabled()
        {
            return;
        }
        for PendingUpdate { record, reply } in std::mem::take(&mut self.pending) {
            let result = match self.srpl.registry_mut().apply_local(&record, Instant::now()) {
                Ok(message) => {
                    tracing::info!(host = %record.host_name, "registry: local update applied");
                    self.srpl.send_update_message_to_partners(message);
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!(host = %record.host_name, "registry: local update rejected: {e}");
                    Err(e.to_string())
                }
            };
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
    }

    fn remove_host(&mut self, name: &str) -> bool {
        let Some(id) = self.srpl.registry().find_host(name).map(|h| h.id) else {
            return false;
        };
        self.srpl.handle_server_removing_host(id);
        self.srpl.registry_mut().remove_host(name).is_some()
    }

    /// Drop hosts whose key lease has run out, telling the sessions first.
    fn expire_hosts(&mut self) {
        let now = Instant::now();
        let expiring = self.srpl.registry().expired_hosts(now);
        if expiring.is_empty() {
            return;
        }
        for host in &expiring {
            self.srpl.handle_server_removing_host(*host);
        }
        let expired = self.srpl.registry_mut().expire(now);
        tracing::info!(count = expired.len(), "registry: expired hosts");
    }

    fn status(&self) -> NodeStatus {
        let registry = self.srpl.registry();
        NodeStatus {
            listen_addr: self.listen_addr,
            state: self.srpl.state(),
            peer_id: self.srpl.peer_id(),
            dataset_id: self.srpl.dataset_id(),
            domain: self.srpl.domain().map(str::to_string),
            partners: self.srpl.partners(),
            hosts: registry
                .hosts()
                .map(|host| HostStatus {
                    name: host.full_name.clone(),
                    key_id: host.key.key_id(),
                    deleted: host.deleted,
                    services: host
                        .services
                        .iter()
                        .filter(|s| !s.deleted)
                        .map(|s| s.name.clone())
                        .collect(),
                })
                .collect(),
        }
    }

    fn stop(&mut self) {
        if let Err(e) = self.srpl.set_enabled(false) {
            tracing::warn!("srpl: failed to stop: {e}");
        }
        for PendingUpdate { reply, .. } in self.pending.drain(..) {
            if let Some(reply) = reply {
                let _ = reply.send(Err("node stopped".into()));
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

pub async fn run_srpl_loop(
    mut dispatcher: Dispatcher,
    mut events: mpsc::Receiver<NodeEvent>,
    mut shutdown: broadcast::Receiver<()>,
    expiry_interval: Duration,
) {
    let mut expiry = tokio::time::interval(expiry_interval);
    expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let deadline = dispatcher.srpl.next_timer_deadline();
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => dispatcher.handle_event(event),
                None => break,
            },
            _ = sleep_until_deadline(deadline) => {
                dispatcher.srpl.handle_timer();
                dispatcher.flush_pending();
            }
            _ = expiry.tick() => dispatcher.expire_hosts(),
            _ = shutdown.recv() => {
                tracing::info!("srpl: shutting down");
                break;
            }
        }
    }

    dispatcher.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use srpl_registry::ServiceRecord;

    fn test_config(dir: &std::path::Path) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.listen_addr = "127.0.0.1:0".into();
        config.discovery.directory = dir.display().to_string();
        config.discovery.poll_interval_ms = 20;
        config.replication.discovery_min_ms = 50;
        config.replication.discovery_max_ms = 100;
        config.replication.fixed_peer_id = Some(7);
        config.replication.fixed_dataset_id = Some(0x0100_0000_0000_00ff);
        config
    }

    fn record(name: &str, lease: u32, key_lease: u32) -> UpdateRecord {
        UpdateRecord {
            host_name: name.into(),
            key: vec![3u8; srpl_registry::HOST_KEY_SIZE],
            services: vec![ServiceRecord {
                name: "_ipp._tcp".into(),
                deleted: false,
            }],
            host_deleted: false,
            lease,
            key_lease,
        }
    }

    async fn wait_running(node: &NodeHandle) -> NodeStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = node.status().await.unwrap();
            if status.state == State::Running {
                return status;
            }
            assert!(tokio::time::Instant::now() < deadline, "node never reached running");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_alone_node_serves_with_fixed_id() {
        let dir = tempfile::tempdir().unwrap();
        let node = spawn_node(test_config(dir.path())).await.unwrap();

        let status = wait_running(&node).await;
        assert_eq!(status.peer_id, PeerId::new(7));
        assert_eq!(status.dataset_id, Some(DatasetId::new(0x0100_0000_0000_00ff)));
        assert_eq!(status.domain.as_deref(), Some("default.service.arpa."));
        assert!(status.partners.is_empty());
        // The node advertised itself.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        node.update(record("printer.default.service.arpa.", 60, 600))
            .await
            .unwrap();
        let status = node.status().await.unwrap();
        let host = status.host("PRINTER.default.service.arpa.").unwrap();
        assert_eq!(host.services, vec!["_ipp._tcp".to_string()]);

        assert!(node.remove_host("printer.default.service.arpa.").await.unwrap());
        assert!(!node.remove_host("printer.default.service.arpa.").await.unwrap());

        node.shutdown().await;
        // Shutdown withdraws the advert.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_update_before_running_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.replication.discovery_min_ms = 300;
        config.replication.discovery_max_ms = 300;
        let node = spawn_node(config).await.unwrap();

        assert_eq!(node.status().await.unwrap().state, State::Discovery);
        node.update(record("early.default.service.arpa.", 60, 600))
            .await
            .unwrap();
        let status = node.status().await.unwrap();
        assert_eq!(status.state, State::Running);
        assert!(status.host("early.default.service.arpa.").is_some());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_key_lease_expiry_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.node.expiry_interval_ms = 50;
        let node = spawn_node(config).await.unwrap();
        wait_running(&node).await;

        node.update(record("brief.default.service.arpa.", 1, 1))
            .await
            .unwrap();
        node.update(record("lasting.default.service.arpa.", 60, 600))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let status = node.status().await.unwrap();
        assert!(status.host("brief.default.service.arpa.").is_none());
        assert!(status.host("lasting.default.service.arpa.").is_some());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_update_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let node = spawn_node(test_config(dir.path())).await.unwrap();
        wait_running(&node).await;

        let mut bad = record("bad.default.service.arpa.", 60, 600);
        bad.key.truncate(10);
        assert!(node.update(bad).await.is_err());

        node.shutdown().await;
    }
}
