//! SRPL Registry -- the SRP registry-server interface replication drives.
//!
//! Replication only needs a narrow view of the registry: an ordered host
//! list it can walk by id, each host's key and last update time, the update
//! messages the host retains, and a way to apply an update received from a
//! partner. `MemoryRegistry` is a complete in-memory engine behind that view.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

pub mod memory;
pub mod record;

pub use memory::MemoryRegistry;
pub use record::{ServiceRecord, UpdateRecord};

/// Size of a host's public key (ECDSA P-256, uncompressed x || y).
pub const HOST_KEY_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("malformed update: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid host key length {0} (expected {HOST_KEY_SIZE})")]
    InvalidKey(usize),
    #[error("invalid host name {0:?}")]
    InvalidName(String),
    #[error("host {host} is registered under a different key")]
    KeyConflict { host: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Stable handle for a host; never reused by a registry instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(pub u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A host's public key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct HostKey([u8; HOST_KEY_SIZE]);

impl HostKey {
    pub fn new(bytes: [u8; HOST_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; HOST_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| RegistryError::InvalidKey(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; HOST_KEY_SIZE] {
        &self.0
    }

    /// Non-cryptographic fingerprint: wrapping sum of the key's big-endian
    /// 32-bit words. Cheap to compare, not a security check.
    pub fn key_id(&self) -> u32 {
        self.0
            .chunks_exact(4)
            .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
            .fold(0u32, u32::wrapping_add)
    }
}

impl fmt::Debug for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostKey(id={:#010x})", self.key_id())
    }
}

/// A registry update as received, kept so it can be replayed to partners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMessage {
    pub data: Bytes,
    /// When this node received (or, for replicated updates, the sender
    /// received) the update, on this node's monotonic clock.
    pub rx_time: Instant,
    pub granted_lease: u32,
    pub granted_key_lease: u32,
}

/// A service registered under a host.
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub deleted: bool,
    pub add_message: Option<Arc<UpdateMessage>>,
    pub delete_message: Option<Arc<UpdateMessage>>,
}

/// A registered host.
#[derive(Debug, Clone)]
pub struct Host {
    pub id: HostId,
    pub full_name: String,
    pub key: HostKey,
    pub update_time: Instant,
    pub deleted: bool,
    /// The latest update that touched the host itself.
    pub message: Option<Arc<UpdateMessage>>,
    pub services: Vec<Service>,
}

impl Host {
    /// Every update handle the host retains. The same message may appear
    /// more than once when one update touched several services.
    pub fn retained_messages(&self) -> impl Iterator<Item = &Arc<UpdateMessage>> {
        self.services
            .iter()
            .flat_map(|s| s.add_message.iter().chain(s.delete_message.iter()))
            .chain(self.message.iter())
    }
}

/// How the registry server advertises itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    Unicast,
    /// Shared anycast address served by every replicating node.
    Anycast,
}

/// The registry-server operations replication consumes.
pub trait Registry: Send {
    /// Head of the host list.
    fn first_host(&self) -> Option<HostId>;

    /// The host after `host`, or `None` at the end or if `host` is gone.
    fn next_host(&self, host: HostId) -> Option<HostId>;

    fn host(&self, host: HostId) -> Option<&Host>;

    /// Look up by full name, ASCII case-insensitively.
    fn find_host(&self, full_name: &str) -> Option<&Host>;

    /// Apply an update received from a partner as if it had arrived at
    /// `rx_time` with the given lease grants.
    fn process_message(
        &mut self,
        data: &[u8],
        rx_time: Instant,
        granted_lease: u32,
        granted_key_lease: u32,
    ) -> Result<()>;

    fn enable(&mut self);

    fn disable(&mut self);

    fn is_enabled(&self) -> bool;

    fn set_address_mode(&mut self, mode: AddressMode);
}
