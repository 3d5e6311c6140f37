//! In-memory registry engine.
//!
//! Hosts live in insertion order. An update replaces a host's state when it
//! is at least as new as what is held and carries the same key; an update
//! under a different key only wins when strictly newer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    AddressMode, Host, HostId, HostKey, Registry, RegistryError, Result, Service, UpdateMessage,
    UpdateRecord,
};

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    hosts: Vec<Host>,
    next_id: u64,
    enabled: bool,
    address_mode: AddressMode,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.iter()
    }

    pub fn address_mode(&self) -> AddressMode {
        self.address_mode
    }

    /// Apply an update from a local client and return the retained message
    /// so it can be fanned out to partners.
    pub fn apply_local(&mut self, record: &UpdateRecord, now: Instant) -> Result<Arc<UpdateMessage>> {
        let message = Arc::new(UpdateMessage {
            data: record.encode()?,
            rx_time: now,
            granted_lease: record.lease,
            granted_key_lease: record.key_lease,
        });
        self.apply(record, Arc::clone(&message))?;
        Ok(message)
    }

    /// Drop a host outright. Returns its id so replication can be told.
    pub fn remove_host(&mut self, full_name: &str) -> Option<HostId> {
        let index = self.position_by_name(full_name)?;
        let host = self.hosts.remove(index);
        tracing::debug!(host = %host.full_name, id = %host.id, "registry: host removed");
        Some(host.id)
    }

    /// Hosts whose key lease has run out, for telling replication before
    /// `expire` drops them.
    pub fn expired_hosts(&self, now: Instant) -> Vec<HostId> {
        self.hosts
            .iter()
            .filter(|host| key_lease_ended(host, now))
            .map(|host| host.id)
            .collect()
    }

    /// Remove every host whose key lease has run out.
    pub fn expire(&mut self, now: Instant) -> Vec<HostId> {
        let mut expired = Vec::new();
        self.hosts.retain(|host| {
            if !key_lease_ended(host, now) {
                return true;
            }
            tracing::debug!(host = %host.full_name, id = %host.id, "registry: key lease expired");
            expired.push(host.id);
            false
        });
        expired
    }

    fn position(&self, id: HostId) -> Option<usize> {
        self.hosts.iter().position(|h| h.id == id)
    }

    fn position_by_name(&self, full_name: &str) -> Option<usize> {
        let wanted = canonical_name(full_name);
        self.hosts
            .iter()
            .position(|h| h.full_name.eq_ignore_ascii_case(&wanted))
    }

    fn apply(&mut self, record: &UpdateRecord, message: Arc<UpdateMessage>) -> Result<()> {
        let full_name = canonical_name(&record.host_name);
        if full_name == "." {
            return Err(RegistryError::InvalidName(record.host_name.clone()));
        }
        let key = HostKey::from_slice(&record.key)?;
        let rx_time = message.rx_time;

        let index = match self.position_by_name(&full_name) {
            Some(index) => {
                let host = &mut self.hosts[index];
                if host.key != key {
                    if rx_time <= host.update_time {
                        return Err(RegistryError::KeyConflict {
                            host: host.full_name.clone(),
                        });
                    }
                    tracing::info!(host = %host.full_name, "registry: newer update under a new key replaces host");
                    host.key = key;
                    host.services.clear();
                } else if rx_time < host.update_time {
                    tracing::debug!(host = %host.full_name, "registry: ignoring stale update");
                    return Ok(());
                }
                index
            }
            None if record.host_deleted => return Ok(()),
            None => {
                self.next_id += 1;
                self.hosts.push(Host {
                    id: HostId(self.next_id),
                    full_name,
                    key,
                    update_time: rx_time,
                    deleted: false,
                    message: None,
                    services: Vec::new(),
                });
                self.hosts.len() - 1
            }
        };

        let host = &mut self.hosts[index];
        host.update_time = rx_time;
        host.deleted = record.host_deleted;
        host.message = Some(Arc::clone(&message));

        if record.host_deleted {
            for service in &mut host.services {
                service.deleted = true;
                service.add_message = None;
                service.delete_message = Some(Arc::clone(&message));
            }
        }
        for update in &record.services {
            let deleted = update.deleted || record.host_deleted;
            let (add_message, delete_message) = if deleted {
                (None, Some(Arc::clone(&message)))
            } else {
                (Some(Arc::clone(&message)), None)
            };
            match host
                .services
                .iter_mut()
                .find(|s| s.name.eq_ignore_ascii_case(&update.name))
            {
                Some(service) => {
                    service.deleted = deleted;
                    service.add_message = add_message;
                    service.delete_message = delete_message;
                }
                None => host.services.push(Service {
                    name: update.name.clone(),
                    deleted,
                    add_message,
                    delete_message,
                }),
            }
        }

        tracing::debug!(
            host = %host.full_name,
            id = %host.id,
            services = host.services.len(),
            deleted = host.deleted,
            "registry: update applied"
        );
        Ok(())
    }
}

fn key_lease_ended(host: &Host, now: Instant) -> bool {
    let key_lease = host
        .message
        .as_ref()
        .map(|m| Duration::from_secs(m.granted_key_lease as u64))
        .unwrap_or_default();
    host.update_time
        .checked_add(key_lease)
        .map_or(false, |deadline| deadline <= now)
}

impl Registry for MemoryRegistry {
    fn first_host(&self) -> Option<HostId> {
        self.hosts.first().map(|h| h.id)
    }

    fn next_host(&self, host: HostId) -> Option<HostId> {
        let index = self.position(host)?;
        self.hosts.get(index + 1).map(|h| h.id)
    }

    fn host(&self, host: HostId) -> Option<&Host> {
        self.position(host).map(|i| &self.hosts[i])
    }

    fn find_host(&self, full_name: &str) -> Option<&Host> {
        self.position_by_name(full_name).map(|i| &self.hosts[i])
    }

    fn process_message(
        &mut self,
        data: &[u8],
        rx_time: Instant,
        granted_lease: u32,
        granted_key_lease: u32,
    ) -> Result<()> {
        let record = UpdateRecord::decode(data)?;
        let message = Arc::new(UpdateMessage {
            data: bytes::Bytes::copy_from_slice(data),
            rx_time,
            granted_lease,
            granted_key_lease,
        });
        self.apply(&record, message)
    }

    fn enable(&mut self) {
        if !self.enabled {
            tracing::info!(mode = ?self.address_mode, "registry: enabled");
        }
        self.enabled = true;
    }

    fn disable(&mut self) {
        if self.enabled {
            tracing::info!("registry: disabled");
        }
        self.enabled = false;
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_address_mode(&mut self, mode: AddressMode) {
        self.address_mode = mode;
    }
}

/// Full names are stored with a trailing dot.
fn canonical_name(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}
