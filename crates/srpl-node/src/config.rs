//! Configuration types for srpl-node.
//! Parsed from ~/.srpl/config.toml.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use srpl_protocol::CURRENT_PARAMS;
use srpl_registry::{ServiceRecord, UpdateRecord, HOST_KEY_SIZE};
use srpl_replication::SrplConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub replication: SrplConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<HostEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address written into the partner directory. Defaults to the bound
    /// listen address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_addr: Option<String>,
    /// Fixed replication domain; adopted from partners when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_expiry_interval_ms")]
    pub expiry_interval_ms: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            advertise_addr: None,
            domain: None,
            rng_seed: None,
            idle_timeout_ms: default_idle_timeout_ms(),
            expiry_interval_ms: default_expiry_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_directory")]
    pub directory: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// A host registered locally once the node is serving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub name: String,
    /// Base64 of the 64-byte host key.
    pub key: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(default = "default_lease")]
    pub lease: u32,
    #[serde(default = "default_key_lease")]
    pub key_lease: u32,
}

impl HostEntry {
    pub fn to_record(&self) -> anyhow::Result<UpdateRecord> {
        let key = STANDARD
            .decode(self.key.trim())
            .with_context(|| format!("host {}: key is not base64", self.name))?;
        if key.len() != HOST_KEY_SIZE {
            anyhow::bail!(
                "host {}: key is {} bytes, expected {HOST_KEY_SIZE}",
                self.name,
                key.len()
            );
        }
        Ok(UpdateRecord {
            host_name: self.name.clone(),
            key,
            services: self
                .services
                .iter()
                .map(|name| ServiceRecord {
                    name: name.clone(),
                    deleted: false,
                })
                .collect(),
            host_deleted: false,
            lease: self.lease,
            key_lease: self.key_lease,
        })
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8853".into()
}

fn default_idle_timeout_ms() -> u64 {
    CURRENT_PARAMS.idle_timeout_ms
}

fn default_expiry_interval_ms() -> u64 {
    1_000
}

fn default_directory() -> String {
    "~/.srpl/partners".into()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_lease() -> u32 {
    7_200
}

fn default_key_lease() -> u32 {
    1_209_600
}

impl NodeConfig {
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: NodeConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn advertise_addr(&self, bound: SocketAddr) -> anyhow::Result<SocketAddr> {
        match &self.node.advertise_addr {
            Some(addr) => addr
                .parse()
                .with_context(|| format!("invalid advertise_addr {addr:?}")),
            None => Ok(bound),
        }
    }

    pub fn host_records(&self) -> anyhow::Result<Vec<UpdateRecord>> {
        self.hosts.iter().map(HostEntry::to_record).collect()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.node.idle_timeout_ms)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.node.expiry_interval_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.discovery.poll_interval_ms.max(1))
    }
}
