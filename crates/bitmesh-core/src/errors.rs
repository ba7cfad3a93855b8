//! Error types for the bitmesh protocol core
//!
//! One top-level [`MeshError`] composed of per-domain enums. Handlers in the
//! router catch these and convert them to counters plus app-visible status;
//! the event loop itself never terminates on a handler error.

use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Parse Errors
// ----------------------------------------------------------------------------

/// Malformed wire data. Always a local drop, never surfaced to the app.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("buffer too short: need {needed} bytes, have {available}")]
    ShortBuffer { needed: usize, available: usize },
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("recipient flag set but recipient ID is all-zero")]
    NullRecipient,
    #[error("unknown message type 0x{0:02X}")]
    UnknownMessageType(u8),
    #[error("malformed {0}")]
    Malformed(&'static str),
}

// ----------------------------------------------------------------------------
// Crypto Errors
// ----------------------------------------------------------------------------

/// Failures in the cryptographic layer. These terminate the affected session.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("AEAD verification failed")]
    AeadFailed,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("nonce counter went backwards")]
    NonceRegression,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("session with {peer_id} is not established")]
    SessionNotEstablished { peer_id: PeerId },
    #[error("no session for peer {peer_id}")]
    SessionNotFound { peer_id: PeerId },
}

// ----------------------------------------------------------------------------
// Handshake Errors
// ----------------------------------------------------------------------------

/// Handshake arbitration and lifecycle failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake with {peer_id} timed out")]
    Timeout { peer_id: PeerId },
    #[error("handshake with {peer_id} exceeded {attempts} attempts")]
    AttemptsExhausted { peer_id: PeerId, attempts: u32 },
    #[error("duplicate handshake message from {peer_id}")]
    DuplicateMessage { peer_id: PeerId },
    #[error("handshake message out of order for {peer_id}")]
    OutOfOrder { peer_id: PeerId },
}

// ----------------------------------------------------------------------------
// Delivery Errors
// ----------------------------------------------------------------------------

/// Message delivery failures, tied to a specific message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("retries exhausted for message {message_id}")]
    RetriesExhausted { message_id: String },
    #[error("retry queue full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("message {message_id} already queued for retry")]
    AlreadyQueued { message_id: String },
}

// ----------------------------------------------------------------------------
// Persistence Errors
// ----------------------------------------------------------------------------

/// Storage adapter failures. Logged; in-memory state is preserved and the
/// next mutation retries the save.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache blob corrupt: {0}")]
    Corrupt(String),
}

// ----------------------------------------------------------------------------
// Top-Level Error
// ----------------------------------------------------------------------------

/// Core error type unifying every failure domain of the protocol core.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

// ----------------------------------------------------------------------------
// Convenience Constructors
// ----------------------------------------------------------------------------

impl MeshError {
    /// Short buffer while parsing
    pub fn short_buffer(needed: usize, available: usize) -> Self {
        MeshError::Parse(ParseError::ShortBuffer { needed, available })
    }

    /// Malformed structure with a static description
    pub fn malformed(what: &'static str) -> Self {
        MeshError::Parse(ParseError::Malformed(what))
    }

    /// No session exists for the peer
    pub fn session_not_found(peer_id: PeerId) -> Self {
        MeshError::Crypto(CryptoError::SessionNotFound { peer_id })
    }

    /// A session exists but has not completed its handshake
    pub fn session_not_established(peer_id: PeerId) -> Self {
        MeshError::Crypto(CryptoError::SessionNotEstablished { peer_id })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, MeshError>;
