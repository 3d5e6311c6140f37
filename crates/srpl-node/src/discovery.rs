//! Partner discovery over a shared directory.
//!
//! Every node advertises itself by writing one JSON entry file,
//! `{ "addr": ..., "txt": <base64> }`, into the directory. Browsing polls
//! the directory and reports the difference from the previous poll as
//! browse results.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use srpl_protocol::PartnerInfo;
use srpl_replication::Discovery;
use tokio::task::JoinHandle;

use crate::node::{EventSender, NodeEvent};

const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub addr: SocketAddr,
    /// Base64 of the TXT record.
    pub txt: String,
}

pub struct DirectoryDiscovery {
    directory: PathBuf,
    own_addr: SocketAddr,
    poll_interval: Duration,
    events: EventSender,
    poller: Option<JoinHandle<()>>,
}

impl DirectoryDiscovery {
    pub fn new(
        directory: PathBuf,
        own_addr: SocketAddr,
        poll_interval: Duration,
        events: EventSender,
    ) -> Self {
        Self {
            directory,
            own_addr,
            poll_interval,
            events,
            poller: None,
        }
    }

    fn entry_path(&self) -> PathBuf {
        self.directory.join(entry_file_name(self.own_addr))
    }

    fn write_entry(&self, txt: &[u8]) -> anyhow::Result<()> {
        let entry = DirectoryEntry {
            addr: self.own_addr,
            txt: STANDARD.encode(txt),
        };
        let path = self.entry_path();
        let tmp = self
            .directory
            .join(format!(".{}.tmp", entry_file_name(self.own_addr)));
        std::fs::write(&tmp, serde_json::to_vec(&entry)?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }
}

impl Discovery for DirectoryDiscovery {
    fn browse(&mut self, enable: bool) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        if enable {
            tracing::debug!(directory = %self.directory.display(), "directory: browsing");
            self.poller = Some(tokio::spawn(poll_directory(
                self.directory.clone(),
                self.own_addr,
                self.poll_interval,
                self.events.clone(),
            )));
        }
    }

    fn register_service(&mut self, txt: &[u8]) {
        match self.write_entry(txt) {
            Ok(()) => tracing::info!(addr = %self.own_addr, "directory: advertised"),
            Err(e) => tracing::warn!(addr = %self.own_addr, "directory: failed to advertise: {e:#}"),
        }
    }

    fn unregister_service(&mut self) {
        let path = self.entry_path();
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::info!(addr = %self.own_addr, "directory: advert withdrawn"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), "directory: failed to withdraw advert: {e}"),
        }
    }
}

impl Drop for DirectoryDiscovery {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

fn entry_file_name(addr: SocketAddr) -> String {
    let stem: String = addr
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{stem}.{ENTRY_EXTENSION}")
}

/// Read every advert in the directory except our own. Unreadable entries
/// are skipped.
pub fn read_directory(directory: &Path, own_addr: SocketAddr) -> BTreeMap<SocketAddr, Bytes> {
    let mut adverts = BTreeMap::new();
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(directory = %directory.display(), "directory: unreadable: {e}");
            return adverts;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(true, |n| n.starts_with('.'));
        if hidden || path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
            continue;
        }
        match read_entry(&path) {
            Ok((addr, txt)) if addr != own_addr => {
                adverts.insert(addr, txt);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(path = %path.display(), "directory: bad entry: {e:#}"),
        }
    }
    adverts
}

fn read_entry(path: &Path) -> anyhow::Result<(SocketAddr, Bytes)> {
    let data = std::fs::read(path)?;
    let entry: DirectoryEntry = serde_json::from_slice(&data)?;
    let txt = STANDARD.decode(entry.txt.as_bytes())?;
    Ok((entry.addr, Bytes::from(txt)))
}

/// Browse results that turn `previous` into `current`: removals first, then
/// new or changed adverts.
pub fn diff_adverts(
    previous: &BTreeMap<SocketAddr, Bytes>,
    current: &BTreeMap<SocketAddr, Bytes>,
) -> Vec<PartnerInfo> {
    let removed = previous
        .keys()
        .filter(|addr| !current.contains_key(*addr))
        .map(|addr| PartnerInfo::removed(*addr));
    let added = current
        .iter()
        .filter(|(addr, txt)| previous.get(*addr) != Some(*txt))
        .map(|(addr, txt)| PartnerInfo::added(*addr, txt.clone()));
    removed.chain(added).collect()
}

async fn poll_directory(
    directory: PathBuf,
    own_addr: SocketAddr,
    poll_interval: Duration,
    events: EventSender,
) {
    let mut known = BTreeMap::new();
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let current = read_directory(&directory, own_addr);
        for info in diff_adverts(&known, &current) {
            tracing::debug!(peer = %info.sock_addr, removed = info.removed, "directory: browse result");
            if events.send(NodeEvent::BrowseResult(info)).await.is_err() {
                return;
            }
        }
        known = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use srpl_protocol::{DatasetId, PartnerTxt};
    use tokio::sync::mpsc;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn discovery(dir: &Path, port: u16) -> (DirectoryDiscovery, mpsc::Receiver<NodeEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            DirectoryDiscovery::new(dir.to_path_buf(), addr(port), Duration::from_millis(20), tx),
            rx,
        )
    }

    async fn next_browse_result(rx: &mut mpsc::Receiver<NodeEvent>) -> PartnerInfo {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(NodeEvent::BrowseResult(info))) => info,
            _ => panic!("expected browse result"),
        }
    }

    #[test]
    fn test_diff_adverts() {
        let a = Bytes::from_static(b"a");
        let mut previous = BTreeMap::new();
        previous.insert(addr(1), a.clone());
        previous.insert(addr(2), a.clone());

        let mut current = BTreeMap::new();
        current.insert(addr(2), Bytes::from_static(b"b"));
        current.insert(addr(3), a.clone());

        let diff = diff_adverts(&previous, &current);
        assert_eq!(
            diff,
            vec![
                PartnerInfo::removed(addr(1)),
                PartnerInfo::added(addr(2), Bytes::from_static(b"b")),
                PartnerInfo::added(addr(3), a),
            ]
        );
        assert!(diff_adverts(&current, &current).is_empty());
    }

    #[tokio::test]
    async fn test_register_and_read_excludes_self() {
        let dir = tempfile::tempdir().unwrap();
        let (mut one, _rx1) = discovery(dir.path(), 1);
        let (mut two, _rx2) = discovery(dir.path(), 2);
        let txt = PartnerTxt::new("home.arpa.", true, 9, DatasetId::new(1))
            .encode()
            .unwrap();

        one.register_service(&txt);
        two.register_service(&txt);
        std::fs::write(dir.path().join("junk.json"), b"not json").unwrap();

        let seen = read_directory(dir.path(), addr(1));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen.get(&addr(2)), Some(&txt));

        two.unregister_service();
        assert!(read_directory(dir.path(), addr(1)).is_empty());
        // Withdrawing twice is harmless.
        two.unregister_service();
    }

    #[tokio::test]
    async fn test_browse_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (mut browser, mut rx) = discovery(dir.path(), 1);
        let (mut other, _rx) = discovery(dir.path(), 2);
        let txt = PartnerTxt::new("home.arpa.", true, 4, DatasetId::new(1))
            .encode()
            .unwrap();

        browser.browse(true);
        other.register_service(&txt);

        let info = next_browse_result(&mut rx).await;
        assert_eq!(info, PartnerInfo::added(addr(2), txt));

        other.unregister_service();
        let info = next_browse_result(&mut rx).await;
        assert_eq!(info, PartnerInfo::removed(addr(2)));

        browser.browse(false);
    }
}
