//! Runtime configuration.
//!
//! Plain structs with production defaults. The `sample-worker` binary maps
//! command-line arguments onto these; tests override individual fields with
//! struct-update syntax.

use std::time::Duration;

/// Top-level configuration for a bus process.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Identifier of this process, attached to log spans.
    pub node_id: String,
    /// Lease-lock settings.
    pub lock: LockConfig,
    /// In-process transport settings.
    pub transport: TransportConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            lock: LockConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Distributed lock timing.
///
/// The TTL bounds how long a crashed owner can block a saga instance; the
/// poll interval is the spin-wait between acquisition attempts.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lifetime of a lease from the moment it is inserted.
    pub lease_ttl: Duration,
    /// Back-off between attempts while a live lease is held by someone else.
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(25),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Settings for the in-process transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum deliveries routed concurrently (broker prefetch).
    pub prefetch: u32,
    /// Redelivery delay for a delivery rejected because of the prefetch bound.
    pub overload_backoff: Duration,
    /// Interval at which the retry scheduler releases due re-sends.
    pub retry_tick: Duration,
    /// Maximum time to wait for in-flight deliveries on shutdown.
    pub drain_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            prefetch: 64,
            overload_backoff: Duration::from_millis(100),
            retry_tick: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_defaults_match_reference_timing() {
        let config = LockConfig::default();
        assert_eq!(config.lease_ttl, Duration::from_secs(25));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn transport_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.prefetch, 64);
        assert_eq!(config.overload_backoff, Duration::from_millis(100));
        assert_eq!(config.retry_tick, Duration::from_millis(50));
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
    }

    #[test]
    fn bus_config_nests_defaults() {
        let config = BusConfig {
            node_id: "worker-1".to_string(),
            ..BusConfig::default()
        };
        assert_eq!(config.node_id, "worker-1");
        assert_eq!(config.lock.lease_ttl, Duration::from_secs(25));
        assert_eq!(config.transport.prefetch, 64);
    }
}
