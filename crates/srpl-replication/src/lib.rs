//! SRPL Replication -- per-partner sessions and the replication controller.
//!
//! Everything here is sans-IO and single-threaded: the host feeds events in
//! (`Srpl::handle_*`), and the controller acts through the `Transport`,
//! `Discovery` and `Registry` collaborators. The only timer is the deadline
//! returned by `Srpl::next_timer_deadline`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use srpl_protocol::{CURRENT_PARAMS, DEFAULT_DOMAIN};

pub mod backoff;
pub mod clock;
pub mod controller;
pub mod error;
pub mod session;
pub mod transport;

pub use backoff::ReconnectBackoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{PartnerSnapshot, SessionState, Srpl, State};
pub use error::{SessionError, SrplError};
pub use session::{Phase, Role};
pub use transport::{DisconnectMode, DisconnectReason, Discovery, Transport, TransportError};

/// Tunable replication parameters. Defaults come from the current protocol
/// parameter set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SrplConfig {
    pub discovery_min_ms: u64,
    pub discovery_max_ms: u64,
    pub remove_timeout_ms: u64,
    pub min_reconnect_ms: u64,
    pub max_reconnect_ms: u64,
    pub reconnect_growth_num: u64,
    pub reconnect_growth_den: u64,
    pub update_skew_window_ms: u64,
    pub self_selected_id_window: u32,
    pub assign_id_window: u32,
    /// Domain used when discovery finds no partner to adopt one from.
    pub default_domain: String,
    /// Replaces the first random self-selected id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_peer_id: Option<u32>,
    /// Replaces the first random dataset id this node starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_dataset_id: Option<u64>,
}

impl Default for SrplConfig {
    fn default() -> Self {
        Self {
            discovery_min_ms: CURRENT_PARAMS.discovery_min_ms,
            discovery_max_ms: CURRENT_PARAMS.discovery_max_ms,
            remove_timeout_ms: CURRENT_PARAMS.remove_timeout_ms,
            min_reconnect_ms: CURRENT_PARAMS.min_reconnect_ms,
            max_reconnect_ms: CURRENT_PARAMS.max_reconnect_ms,
            reconnect_growth_num: CURRENT_PARAMS.reconnect_growth_num,
            reconnect_growth_den: CURRENT_PARAMS.reconnect_growth_den,
            update_skew_window_ms: CURRENT_PARAMS.update_skew_window_ms,
            self_selected_id_window: CURRENT_PARAMS.self_selected_id_window,
            assign_id_window: CURRENT_PARAMS.assign_id_window,
            default_domain: DEFAULT_DOMAIN.to_string(),
            fixed_peer_id: None,
            fixed_dataset_id: None,
        }
    }
}

impl SrplConfig {
    pub fn remove_timeout(&self) -> Duration {
        Duration::from_millis(self.remove_timeout_ms)
    }

    pub fn update_skew_window(&self) -> Duration {
        Duration::from_millis(self.update_skew_window_ms)
    }

    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff::new(
            Duration::from_millis(self.min_reconnect_ms),
            Duration::from_millis(self.max_reconnect_ms),
            self.reconnect_growth_num,
            self.reconnect_growth_den,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_params() {
        let cfg = SrplConfig::default();
        assert_eq!(cfg.update_skew_window(), Duration::from_millis(1_100));
        assert_eq!(cfg.remove_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.backoff().current(), Duration::from_secs(5));
        assert_eq!(cfg.default_domain, DEFAULT_DOMAIN);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: SrplConfig = serde_json::from_str(r#"{"min_reconnect_ms": 100}"#).unwrap();
        assert_eq!(cfg.min_reconnect_ms, 100);
        assert_eq!(cfg.max_reconnect_ms, CURRENT_PARAMS.max_reconnect_ms);
    }
}
