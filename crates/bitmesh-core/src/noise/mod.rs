//! Noise XX session layer: handshake crypto, per-peer sessions, and the
//! coordinator that arbitrates concurrent initiations.

pub mod coordinator;
pub mod crypto;
pub mod session;

pub use coordinator::{HandshakeCoordinator, HandshakePhase, HandshakeRecord};
pub use crypto::{
    generate_fingerprint, validate_public_key, IdentityKeyPair, NoiseHandshake, NoiseKeyPair,
    NoiseTransport, NOISE_PATTERN,
};
pub use session::{NoiseRole, NoiseSession, NoiseSessionManager, SessionState};
