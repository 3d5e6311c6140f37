//! SRPL Node -- library crate for running a replication node.
//!
//! Exposes the config, transport, discovery and dispatch loop so the binary
//! and the integration tests share one code path.

pub mod config;
pub mod discovery;
pub mod node;
pub mod transport;

use std::path::PathBuf;

pub use node::{spawn_node, HostStatus, NodeHandle, NodeStatus};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
