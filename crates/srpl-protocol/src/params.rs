//! Protocol parameters -- timing and id-allocation constants partners share.
//!
//! Every node in a replication domain is expected to run with the same
//! parameter set. Nodes may override individual values through
//! configuration, mostly to shrink timers in tests.

/// A versioned set of SRPL timing and id-allocation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolParams {
    /// Parameter set identifier.
    pub version: u16,

    // -- Discovery --
    /// Lower bound of the randomised discovery window in milliseconds.
    pub discovery_min_ms: u64,
    /// Upper bound of the randomised discovery window in milliseconds.
    pub discovery_max_ms: u64,
    /// Grace period before a partner that vanished from discovery is dropped.
    pub remove_timeout_ms: u64,

    // -- Peer ids --
    /// Self-selected ids are drawn from `[0, self_selected_id_window)`.
    pub self_selected_id_window: u32,
    /// Assigned ids are `max known id + [1, assign_id_window]`.
    pub assign_id_window: u32,

    // -- Reconnect backoff --
    /// First reconnect delay after a session error.
    pub min_reconnect_ms: u64,
    /// Reconnect delay ceiling.
    pub max_reconnect_ms: u64,
    /// Growth ratio numerator applied on each consecutive error.
    pub reconnect_growth_num: u64,
    /// Growth ratio denominator.
    pub reconnect_growth_den: u64,

    // -- Candidate sync --
    /// Two update times within this window count as the same update.
    /// Assumes partner clocks tick at the same rate.
    pub update_skew_window_ms: u64,

    // -- Transport --
    /// Idle timeout for links not yet marked long-lived.
    pub idle_timeout_ms: u64,
}

/// SRPL parameter set version 1.
pub const SRPL_V1: ProtocolParams = ProtocolParams {
    version: 1,

    discovery_min_ms: 3_000,
    discovery_max_ms: 5_000,
    remove_timeout_ms: 30_000,

    self_selected_id_window: 200,
    assign_id_window: 5,

    min_reconnect_ms: 5_000,
    max_reconnect_ms: 300_000,
    reconnect_growth_num: 3,
    reconnect_growth_den: 2,

    update_skew_window_ms: 1_100,

    idle_timeout_ms: 30_000,
};

/// The parameter set this build speaks.
pub const CURRENT_PARAMS: ProtocolParams = SRPL_V1;

/// Domain used when discovery finds no partner to adopt one from.
pub const DEFAULT_DOMAIN: &str = "default.service.arpa.";

/// Seconds elapsed since an event, rounded to the nearest second.
pub fn rounded_seconds(elapsed_ms: u128) -> u32 {
    u32::try_from((elapsed_ms + 500) / 1000).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_window_ordered() {
        assert!(SRPL_V1.discovery_min_ms <= SRPL_V1.discovery_max_ms);
        assert!(SRPL_V1.discovery_min_ms > 0);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        assert!(SRPL_V1.reconnect_growth_num > SRPL_V1.reconnect_growth_den);
        assert!(SRPL_V1.reconnect_growth_den > 0);
        assert!(SRPL_V1.min_reconnect_ms < SRPL_V1.max_reconnect_ms);
    }

    #[test]
    fn test_id_windows_non_empty() {
        assert!(SRPL_V1.self_selected_id_window > 0);
        assert!(SRPL_V1.assign_id_window > 0);
        // Assigned ids must stay clear of the serial-number half range.
        assert!(SRPL_V1.assign_id_window < 0x7fff_ffff);
    }

    #[test]
    fn test_skew_window_exceeds_rounding_error() {
        // Two rounded offsets can disagree by up to one second.
        assert!(SRPL_V1.update_skew_window_ms > 1_000);
    }

    #[test]
    fn test_rounded_seconds() {
        assert_eq!(rounded_seconds(0), 0);
        assert_eq!(rounded_seconds(499), 0);
        assert_eq!(rounded_seconds(500), 1);
        assert_eq!(rounded_seconds(1_499), 1);
        assert_eq!(rounded_seconds(u128::MAX / 2), u32::MAX);
    }

    #[test]
    fn test_current_is_v1() {
        assert_eq!(CURRENT_PARAMS, SRPL_V1);
    }
}
