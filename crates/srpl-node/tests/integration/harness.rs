//! Test harness for in-process srpl-node integration tests.
//!
//! Provides TestNode (single node), TestNodeBuilder (config), and TestMesh
//! (N nodes sharing one partner directory) running real TCP links on
//! loopback in the same tokio runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use srpl_node::config::{HostEntry, NodeConfig};
use srpl_node::{spawn_node, NodeHandle, NodeStatus};
use srpl_registry::{ServiceRecord, UpdateRecord, HOST_KEY_SIZE};
use srpl_replication::{SessionState, State};

pub const DOMAIN: &str = "default.service.arpa.";

/// Fully qualified test host name.
pub fn host_name(label: &str) -> String {
    format!("{label}.{DOMAIN}")
}

pub fn host_record(label: &str, key_byte: u8) -> UpdateRecord {
    UpdateRecord {
        host_name: host_name(label),
        key: vec![key_byte; HOST_KEY_SIZE],
        services: vec![ServiceRecord {
            name: format!("{label}._ipp._tcp"),
            deleted: false,
        }],
        host_deleted: false,
        lease: 3_600,
        key_lease: 86_400,
    }
}

/// A running in-process node.
pub struct TestNode {
    pub name: String,
    handle: NodeHandle,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn status(&self) -> NodeStatus {
        self.handle.status().await.expect("node status")
    }

    pub async fn update(&self, record: UpdateRecord) -> anyhow::Result<()> {
        self.handle.update(record).await
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }

    /// Poll status until `check` passes, or fail after `timeout`.
    pub async fn wait_for(
        &self,
        what: &str,
        timeout: Duration,
        check: impl Fn(&NodeStatus) -> bool,
    ) -> anyhow::Result<NodeStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status().await;
            if check(&status) {
                return Ok(status);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!(
                    "{}: timeout waiting for {} (state {}, peer id {}, {} partners, {} hosts)",
                    self.name,
                    what,
                    status.state,
                    status.peer_id,
                    status.partners.len(),
                    status.hosts.len(),
                );
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn wait_running(&self, timeout: Duration) -> anyhow::Result<NodeStatus> {
        self.wait_for("running", timeout, |s| s.state == State::Running)
            .await
    }

    pub async fn wait_host(&self, name: &str, timeout: Duration) -> anyhow::Result<NodeStatus> {
        self.wait_for(name, timeout, |s| s.host(name).is_some()).await
    }

    /// Wait until at least `n` sessions are in routine operation.
    pub async fn wait_routine_partners(
        &self,
        n: usize,
        timeout: Duration,
    ) -> anyhow::Result<NodeStatus> {
        self.wait_for("routine partners", timeout, |s| {
            s.partners
                .iter()
                .filter(|p| p.session_state == SessionState::RoutineOperation)
                .count()
                >= n
        })
        .await
    }
}

/// Builder for configuring and spawning a TestNode.
pub struct TestNodeBuilder {
    name: String,
    directory: PathBuf,
    fixed_peer_id: Option<u32>,
    hosts: Vec<HostEntry>,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(name: &str, directory: &Path) -> Self {
        Self {
            name: name.into(),
            directory: directory.to_path_buf(),
            fixed_peer_id: None,
            hosts: vec![],
        }
    }

    pub fn fixed_peer_id(mut self, id: u32) -> Self {
        self.fixed_peer_id = Some(id);
        self
    }

    /// Register a host from config once the node is serving.
    pub fn host(mut self, label: &str, key_byte: u8) -> Self {
        self.hosts.push(HostEntry {
            name: host_name(label),
            key: STANDARD.encode([key_byte; HOST_KEY_SIZE]),
            services: vec![],
            lease: 3_600,
            key_lease: 86_400,
        });
        self
    }

    pub fn config(&self) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.node.listen_addr = "127.0.0.1:0".into();
        config.discovery.directory = self.directory.display().to_string();
        config.discovery.poll_interval_ms = 50;

        let repl = &mut config.replication;
        repl.discovery_min_ms = 300;
        repl.discovery_max_ms = 500;
        repl.remove_timeout_ms = 2_000;
        repl.min_reconnect_ms = 200;
        repl.max_reconnect_ms = 2_000;
        repl.fixed_peer_id = self.fixed_peer_id;

        config.hosts = self.hosts.clone();
        config
    }

    pub async fn build(self) -> anyhow::Result<TestNode> {
        let handle = spawn_node(self.config()).await?;
        Ok(TestNode {
            name: self.name,
            handle,
        })
    }
}

/// N nodes started one after another, each joining once the previous one
/// is serving. The first node picks id 5.
pub struct TestMesh {
    pub nodes: Vec<TestNode>,
    directory: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestMesh {
    pub async fn new(n: usize) -> anyhow::Result<Self> {
        let directory = tempfile::tempdir()?;
        let mut nodes: Vec<TestNode> = Vec::with_capacity(n);
        for i in 0..n {
            let mut builder = TestNodeBuilder::new(&format!("node-{i}"), directory.path());
            if i == 0 {
                builder = builder.fixed_peer_id(5);
            }
            let node = builder.build().await?;
            node.wait_running(Duration::from_secs(15)).await?;
            nodes.push(node);
        }
        Ok(Self { nodes, directory })
    }

    pub fn directory(&self) -> &Path {
        self.directory.path()
    }

    pub fn builder(&self, name: &str) -> TestNodeBuilder {
        TestNodeBuilder::new(name, self.directory.path())
    }

    /// Wait until every node holds the host.
    pub async fn wait_host_everywhere(&self, name: &str, timeout: Duration) -> anyhow::Result<()> {
        for node in &self.nodes {
            node.wait_host(name, timeout).await?;
        }
        Ok(())
    }

    pub async fn shutdown_all(self) {
        for node in self.nodes {
            node.shutdown().await;
        }
    }
}
