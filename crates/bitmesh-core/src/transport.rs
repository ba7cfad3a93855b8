//! Seams between the core and its host
//!
//! The router is synchronous and run-to-completion: handlers push
//! [`Effect`]s (bytes to transmit) and [`AppEvent`]s (UI-visible updates)
//! onto queues the host drains after every call. Blocking work never happens
//! inside the core.

use crate::protocol::message::ChatMessage;
use crate::types::{Fingerprint, PeerId};

/// Conservative MTU when the transport has not advertised one.
pub const DEFAULT_MTU: u16 = 244;

// ----------------------------------------------------------------------------
// Effects (core → transport)
// ----------------------------------------------------------------------------

/// An action the host transport should carry out. Best-effort; the radio may
/// drop silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Broadcast a framed packet
    Broadcast(Vec<u8>),
}

// ----------------------------------------------------------------------------
// App Events (core → application)
// ----------------------------------------------------------------------------

/// Delivery state surfaced for a specific message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Retrying { attempt: u32 },
    Undelivered,
}

/// UI-visible updates emitted by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// A chat message arrived
    MessageReceived(ChatMessage),
    /// Delivery progress for a message we sent
    DeliveryStatusChanged {
        message_id: String,
        status: DeliveryStatus,
    },
    /// The connected peer set changed
    PeerListChanged { peers: Vec<PeerId> },
    /// An encrypted session was lost and will not self-recover
    SessionLost { peer_id: PeerId },
    /// A handshake gave up after exhausting its retries
    HandshakeFailed { peer_id: PeerId, reason: String },
    /// A peer proved ownership of a static identity
    PeerIdentityVerified {
        peer_id: PeerId,
        fingerprint: Fingerprint,
        nickname: String,
    },
}
