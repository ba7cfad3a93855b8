//! Centralized configuration for the protocol core
//!
//! Every tunable deadline, cap and threshold lives here so the router and its
//! components share a single source of truth.

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Handshake Configuration
// ----------------------------------------------------------------------------

/// Tunables for the handshake coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Maximum initiation attempts before a peer is marked unretryable
    pub max_attempts: u32,
    /// An `Initiating` record older than this may be forcibly restarted
    pub handshake_timeout_ms: u64,
    /// Minimum wait after a failure before re-initiating
    pub retry_delay_ms: u64,
    /// Minimum spacing between consecutive initiations to the same peer
    pub min_time_between_handshakes_ms: u64,
    /// Raw handshake messages remembered for duplicate suppression
    pub message_history_limit: usize,
    /// `Initiating`/`Responding` records older than this are dropped on tick
    pub stale_timeout_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            handshake_timeout_ms: 10_000,
            retry_delay_ms: 2_000,
            min_time_between_handshakes_ms: 1_000,
            message_history_limit: 100,
            stale_timeout_ms: 30_000,
        }
    }
}

// ----------------------------------------------------------------------------
// Delivery Configuration
// ----------------------------------------------------------------------------

/// Tunables for the delivery tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Retries allowed for a pending delivery to a favorite
    pub max_retries: u32,
    /// Pending deliveries older than this are dropped on cleanup
    pub max_delivery_age_ms: u64,
    /// Cap on each of the received/sent ack-ID sets
    pub ack_id_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_delivery_age_ms: 3_600_000,
            ack_id_capacity: 1_000,
        }
    }
}

// ----------------------------------------------------------------------------
// Retry Queue Configuration
// ----------------------------------------------------------------------------

/// Tunables for the outbound retry queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Hard capacity; inserts beyond this are rejected
    pub capacity: usize,
    /// Retries per message before it is dropped
    pub max_retries: u32,
    /// Base backoff unit; attempt n waits `base * (n + 1)`
    pub base_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            max_retries: 3,
            base_backoff_ms: 2_000,
        }
    }
}

// ----------------------------------------------------------------------------
// Deduplication Configuration
// ----------------------------------------------------------------------------

/// Bloom filter sizing for packet deduplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Expected distinct packets per filter lifetime
    pub expected_items: usize,
    /// Target false-positive rate
    pub false_positive_rate: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            expected_items: 1_000,
            false_positive_rate: 0.01,
        }
    }
}

// ----------------------------------------------------------------------------
// Fragmentation Configuration
// ----------------------------------------------------------------------------

/// Tunables for fragmentation and reassembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentConfig {
    /// Partial reassembly buffers older than this are dropped
    pub reassembly_timeout_ms: u64,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            reassembly_timeout_ms: 30_000,
        }
    }
}

// ----------------------------------------------------------------------------
// Identity Configuration
// ----------------------------------------------------------------------------

/// Tunables for the identity store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Minimum spacing between persisted cache writes
    pub save_interval_ms: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            save_interval_ms: 250,
        }
    }
}

// ----------------------------------------------------------------------------
// Protocol Configuration
// ----------------------------------------------------------------------------

/// Top-level configuration for the protocol core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub handshake: HandshakeConfig,
    pub delivery: DeliveryConfig,
    pub retry: RetryConfig,
    pub dedup: DedupConfig,
    pub fragment: FragmentConfig,
    pub identity: IdentityConfig,
}

impl ProtocolConfig {
    /// Configuration sized for constrained BLE deployments: a smaller dedup
    /// window and tighter reassembly horizon.
    pub fn constrained() -> Self {
        Self {
            dedup: DedupConfig {
                expected_items: 500,
                false_positive_rate: 0.01,
            },
            fragment: FragmentConfig {
                reassembly_timeout_ms: 15_000,
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = ProtocolConfig::default();
        assert_eq!(config.handshake.max_attempts, 3);
        assert_eq!(config.handshake.handshake_timeout_ms, 10_000);
        assert_eq!(config.handshake.retry_delay_ms, 2_000);
        assert_eq!(config.handshake.message_history_limit, 100);
        assert_eq!(config.retry.capacity, 50);
        assert_eq!(config.delivery.ack_id_capacity, 1_000);
    }
}
