//! Handshake arbitration
//!
//! When two peers discover each other they may both try to handshake at
//! once. The coordinator makes the pair converge on a single session: the
//! peer with the lexicographically smaller ID initiates, the other responds.
//! The decision uses only the two IDs, so both sides agree without clocks or
//! randomness.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::HandshakeConfig;
use crate::noise::session::NoiseRole;
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Handshake Records
// ----------------------------------------------------------------------------

/// Coordinator-visible phase of a handshake with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    Idle,
    Initiating,
    Responding,
    Established,
    Failed,
}

/// Value record of one peer's handshake progress. The coordinator never
/// holds references into the session table.
#[derive(Debug, Clone)]
pub struct HandshakeRecord {
    pub phase: HandshakePhase,
    pub timestamp: Timestamp,
    pub attempt: u32,
    pub can_retry: bool,
    pub reason: String,
}

// ----------------------------------------------------------------------------
// Coordinator
// ----------------------------------------------------------------------------

/// Arbitrates who initiates, when retries are allowed, and which raw
/// handshake messages have already been processed.
#[derive(Debug)]
pub struct HandshakeCoordinator {
    config: HandshakeConfig,
    records: BTreeMap<PeerId, HandshakeRecord>,
    /// Raw handshake messages seen recently. Cleared, not rotated, when the
    /// limit is reached: bounded memory matters more than long-tail
    /// duplicate detection on constrained devices.
    processed_messages: Vec<Vec<u8>>,
}

impl HandshakeCoordinator {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            records: BTreeMap::new(),
            processed_messages: Vec::new(),
        }
    }

    /// Deterministic tie-break: the smaller peer ID initiates.
    pub fn determine_role(my_peer_id: &PeerId, remote_peer_id: &PeerId) -> NoiseRole {
        if my_peer_id < remote_peer_id {
            NoiseRole::Initiator
        } else {
            NoiseRole::Responder
        }
    }

    /// Should we start a handshake toward `remote_peer_id` right now?
    pub fn should_initiate(
        &self,
        my_peer_id: &PeerId,
        remote_peer_id: &PeerId,
        force_if_stale: bool,
        now: Timestamp,
    ) -> bool {
        if let Some(record) = self.records.get(remote_peer_id) {
            if matches!(
                record.phase,
                HandshakePhase::Initiating | HandshakePhase::Responding
            ) {
                // Already in flight. A stuck initiation may be restarted.
                return force_if_stale
                    && record.phase == HandshakePhase::Initiating
                    && now.millis_since(record.timestamp) > self.config.handshake_timeout_ms;
            }
        }

        if Self::determine_role(my_peer_id, remote_peer_id) != NoiseRole::Initiator {
            return false;
        }

        if let Some(record) = self.records.get(remote_peer_id) {
            if record.phase == HandshakePhase::Failed {
                if !record.can_retry {
                    return false;
                }
                if now.millis_since(record.timestamp) < self.config.retry_delay_ms {
                    return false;
                }
            }
        }

        true
    }

    /// Should we accept an incoming initiation from `remote_peer_id`?
    ///
    /// An established pair refuses re-initiation. If both sides initiated at
    /// once, the rightful initiator still accepts the remote's message so
    /// the pair can converge.
    pub fn should_accept_initiation(&self, remote_peer_id: &PeerId) -> bool {
        !self
            .records
            .get(remote_peer_id)
            .is_some_and(|record| record.phase == HandshakePhase::Established)
    }

    /// Record that we sent an initiation. Each call increments the attempt
    /// counter.
    pub fn record_initiation(&mut self, peer_id: PeerId, now: Timestamp) {
        let attempt = self.current_attempt(&peer_id) + 1;
        self.records.insert(
            peer_id,
            HandshakeRecord {
                phase: HandshakePhase::Initiating,
                timestamp: now,
                attempt,
                can_retry: false,
                reason: String::new(),
            },
        );
    }

    /// Record that we are responding to a remote initiation.
    pub fn record_response(&mut self, peer_id: PeerId, now: Timestamp) {
        self.records.insert(
            peer_id,
            HandshakeRecord {
                phase: HandshakePhase::Responding,
                timestamp: now,
                attempt: 0,
                can_retry: false,
                reason: String::new(),
            },
        );
    }

    /// Record a completed handshake.
    pub fn record_success(&mut self, peer_id: PeerId, now: Timestamp) {
        self.records.insert(
            peer_id,
            HandshakeRecord {
                phase: HandshakePhase::Established,
                timestamp: now,
                attempt: 0,
                can_retry: false,
                reason: String::new(),
            },
        );
    }

    /// Record a failed handshake. Retry is allowed while the attempt count
    /// is below the configured maximum.
    pub fn record_failure(&mut self, peer_id: PeerId, reason: impl Into<String>, now: Timestamp) {
        let attempt = self.current_attempt(&peer_id);
        let can_retry = attempt < self.config.max_attempts;
        let reason = reason.into();
        debug!(peer = %peer_id, attempt, can_retry, %reason, "handshake failed");
        self.records.insert(
            peer_id,
            HandshakeRecord {
                phase: HandshakePhase::Failed,
                timestamp: now,
                attempt,
                can_retry,
                reason,
            },
        );
    }

    /// Linear membership test against recently processed raw handshake
    /// messages. Marks the message as seen.
    pub fn is_duplicate_handshake_message(&mut self, message: &[u8]) -> bool {
        if self.processed_messages.iter().any(|seen| seen == message) {
            return true;
        }
        if self.processed_messages.len() >= self.config.message_history_limit {
            self.processed_messages.clear();
        }
        self.processed_messages.push(message.to_vec());
        false
    }

    /// Milliseconds until a retry toward `peer_id` is allowed.
    /// `None` means retries are exhausted; `Some(0)` means now.
    pub fn retry_delay_remaining(&self, peer_id: &PeerId, now: Timestamp) -> Option<u64> {
        let record = self.records.get(peer_id)?;
        match record.phase {
            HandshakePhase::Failed => {
                if !record.can_retry {
                    return None;
                }
                let elapsed = now.millis_since(record.timestamp);
                Some(self.config.retry_delay_ms.saturating_sub(elapsed))
            }
            HandshakePhase::Initiating => {
                let elapsed = now.millis_since(record.timestamp);
                Some(
                    self.config
                        .min_time_between_handshakes_ms
                        .saturating_sub(elapsed),
                )
            }
            _ => Some(0),
        }
    }

    /// Drop `Initiating`/`Responding` records older than the stale timeout,
    /// returning the affected peers so the caller can surface the failure.
    pub fn cleanup_stale(&mut self, now: Timestamp) -> Vec<PeerId> {
        let stale_timeout = self.config.stale_timeout_ms;
        let stale: Vec<PeerId> = self
            .records
            .iter()
            .filter(|(_, record)| {
                matches!(
                    record.phase,
                    HandshakePhase::Initiating | HandshakePhase::Responding
                ) && now.millis_since(record.timestamp) > stale_timeout
            })
            .map(|(peer_id, _)| *peer_id)
            .collect();
        for peer_id in &stale {
            self.records.remove(peer_id);
        }
        stale
    }

    /// Current phase for a peer; `Idle` when no record exists.
    pub fn phase(&self, peer_id: &PeerId) -> HandshakePhase {
        self.records
            .get(peer_id)
            .map(|record| record.phase)
            .unwrap_or(HandshakePhase::Idle)
    }

    /// Retries performed so far (attempts beyond the first).
    pub fn retry_count(&self, peer_id: &PeerId) -> u32 {
        self.current_attempt(peer_id).saturating_sub(1)
    }

    /// Last failure reason, if the peer's record is `Failed`.
    pub fn failure_reason(&self, peer_id: &PeerId) -> Option<&str> {
        self.records.get(peer_id).and_then(|record| {
            (record.phase == HandshakePhase::Failed).then_some(record.reason.as_str())
        })
    }

    /// Forget the record for one peer.
    pub fn reset_state(&mut self, peer_id: &PeerId) {
        self.records.remove(peer_id);
    }

    /// Forget everything, including the message history.
    pub fn clear_all(&mut self) {
        self.records.clear();
        self.processed_messages.clear();
    }

    fn current_attempt(&self, peer_id: &PeerId) -> u32 {
        self.records
            .get(peer_id)
            .map(|record| record.attempt)
            .unwrap_or(0)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &[u8]) -> PeerId {
        PeerId::from_bytes(name)
    }

    fn coordinator() -> HandshakeCoordinator {
        HandshakeCoordinator::new(HandshakeConfig::default())
    }

    const NOW: Timestamp = Timestamp::new(100_000);

    #[test]
    fn test_role_tie_break_is_antisymmetric() {
        let a = peer(b"AAA");
        let z = peer(b"ZZZ");
        assert_eq!(HandshakeCoordinator::determine_role(&a, &z), NoiseRole::Initiator);
        assert_eq!(HandshakeCoordinator::determine_role(&z, &a), NoiseRole::Responder);
    }

    #[test]
    fn test_only_initiator_side_initiates() {
        let a = peer(b"AAA");
        let z = peer(b"ZZZ");
        let coordinator = coordinator();
        assert!(coordinator.should_initiate(&a, &z, false, NOW));
        assert!(!coordinator.should_initiate(&z, &a, false, NOW));
    }

    #[test]
    fn test_in_flight_handshake_blocks_reinitiation() {
        let me = peer(b"AAA");
        let remote = peer(b"ZZZ");
        let mut coordinator = coordinator();

        coordinator.record_initiation(remote, NOW);
        assert!(!coordinator.should_initiate(&me, &remote, false, NOW.plus_millis(500)));

        // forceIfStale restarts only once the in-flight attempt is old enough.
        assert!(!coordinator.should_initiate(&me, &remote, true, NOW.plus_millis(5_000)));
        assert!(coordinator.should_initiate(&me, &remote, true, NOW.plus_millis(10_001)));
    }

    #[test]
    fn test_failure_gating_and_retry_delay() {
        let me = peer(b"AAA");
        let remote = peer(b"ZZZ");
        let mut coordinator = coordinator();

        coordinator.record_initiation(remote, NOW);
        coordinator.record_failure(remote, "timeout", NOW);

        // Within the retry delay: blocked.
        assert!(!coordinator.should_initiate(&me, &remote, false, NOW.plus_millis(1_000)));
        // After the delay: allowed.
        assert!(coordinator.should_initiate(&me, &remote, false, NOW.plus_millis(2_000)));
        assert_eq!(
            coordinator.retry_delay_remaining(&remote, NOW.plus_millis(500)),
            Some(1_500)
        );
    }

    #[test]
    fn test_attempts_exhaust_after_max() {
        let me = peer(b"AAA");
        let remote = peer(b"ZZZ");
        let mut coordinator = coordinator();

        for _ in 0..3 {
            coordinator.record_initiation(remote, NOW);
            coordinator.record_failure(remote, "timeout", NOW);
        }
        // attempt == max_attempts, so canRetry is false.
        assert!(!coordinator.should_initiate(&me, &remote, false, NOW.plus_millis(60_000)));
        assert_eq!(coordinator.retry_delay_remaining(&remote, NOW), None);
        assert_eq!(coordinator.retry_count(&remote), 2);
        assert_eq!(coordinator.failure_reason(&remote), Some("timeout"));
    }

    #[test]
    fn test_duplicate_message_history_clears_on_overflow() {
        let mut coordinator = coordinator();

        assert!(!coordinator.is_duplicate_handshake_message(b"msg-0"));
        assert!(coordinator.is_duplicate_handshake_message(b"msg-0"));

        // Fill to the limit; the buffer is cleared wholesale, so the
        // original message is forgotten.
        for i in 1..100u32 {
            let message = i.to_be_bytes();
            assert!(!coordinator.is_duplicate_handshake_message(&message));
        }
        assert!(!coordinator.is_duplicate_handshake_message(b"overflow"));
        assert!(!coordinator.is_duplicate_handshake_message(b"msg-0"));
    }

    #[test]
    fn test_cleanup_stale_returns_peers() {
        let remote = peer(b"ZZZ");
        let other = peer(b"YYY");
        let mut coordinator = coordinator();

        coordinator.record_initiation(remote, NOW);
        coordinator.record_response(other, NOW.plus_millis(25_000));

        let stale = coordinator.cleanup_stale(NOW.plus_millis(31_000));
        assert_eq!(stale, vec![remote]);
        assert_eq!(coordinator.phase(&remote), HandshakePhase::Idle);
        assert_eq!(coordinator.phase(&other), HandshakePhase::Responding);
    }

    #[test]
    fn test_established_pair_refuses_reinitiation() {
        let remote = peer(b"ZZZ");
        let mut coordinator = coordinator();
        assert!(coordinator.should_accept_initiation(&remote));
        coordinator.record_success(remote, NOW);
        assert!(!coordinator.should_accept_initiation(&remote));
        coordinator.reset_state(&remote);
        assert!(coordinator.should_accept_initiation(&remote));
    }

    #[test]
    fn test_simultaneous_initiation_converges() {
        // Both sides call should_initiate at the same instant: only the
        // lexicographically smaller peer goes ahead.
        let a = peer(b"AAA");
        let z = peer(b"ZZZ");
        let coordinator_a = coordinator();
        let coordinator_z = coordinator();

        let a_initiates = coordinator_a.should_initiate(&a, &z, false, NOW);
        let z_initiates = coordinator_z.should_initiate(&z, &a, false, NOW);
        assert!(a_initiates);
        assert!(!z_initiates);
    }
}
