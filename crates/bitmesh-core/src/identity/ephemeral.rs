//! Ephemeral per-connection sessions
//!
//! Keyed by the *transient* peer ID, which changes across reconnects.
//! Identity stickiness comes from the fingerprint captured when the
//! handshake completes.

use serde::{Deserialize, Serialize};

use super::types::HandshakeState;
use crate::types::{Fingerprint, PeerId, Timestamp};

/// State of one live connection to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralSession {
    pub peer_id: PeerId,
    pub session_start: Timestamp,
    pub handshake_state: HandshakeState,
    /// Captured at handshake completion; bridges this transient session to
    /// the persistent social identity.
    pub fingerprint: Option<Fingerprint>,
}

impl EphemeralSession {
    pub fn new(peer_id: PeerId, now: Timestamp) -> Self {
        Self {
            peer_id,
            session_start: now,
            handshake_state: HandshakeState::None,
            fingerprint: None,
        }
    }
}
