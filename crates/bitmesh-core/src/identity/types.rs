//! Identity enums shared across the store

use serde::{Deserialize, Serialize};

use crate::types::Fingerprint;

// ----------------------------------------------------------------------------
// Trust Level
// ----------------------------------------------------------------------------

/// How much the local user trusts a fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Never interacted, or nothing known
    #[default]
    Unknown,
    /// Seen around, no particular trust
    Casual,
    /// Trusted by the user
    Trusted,
    /// Fingerprint confirmed out-of-band
    Verified,
}

// ----------------------------------------------------------------------------
// Handshake State (identity view)
// ----------------------------------------------------------------------------

/// Handshake progress as tracked per ephemeral session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    /// No handshake started
    None,
    /// Handshake messages in flight
    InProgress,
    /// Handshake finished; the peer's fingerprint is now known
    Completed { fingerprint: Fingerprint },
    /// Handshake failed
    Failed { reason: String },
}

impl HandshakeState {
    pub fn is_complete(&self) -> bool {
        matches!(self, HandshakeState::Completed { .. })
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match self {
            HandshakeState::Completed { fingerprint } => Some(fingerprint),
            _ => None,
        }
    }
}
