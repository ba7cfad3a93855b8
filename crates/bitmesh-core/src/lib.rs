//! bitmesh core protocol
//!
//! The packet-level core of a peer-to-peer Bluetooth-mesh chat protocol.
//! Peers discover each other over a short-range radio, exchange identity,
//! establish Noise-XX encrypted channels, and relay messages through the
//! mesh with store-and-forward retries and delivery acknowledgements.
//!
//! ## Architecture
//!
//! Four tightly-coupled subsystems define protocol correctness, glued by a
//! single [`Router`]:
//!
//! - [`protocol`] - wire framing: the packet binary format, inner message
//!   TLVs, fragmentation/reassembly, LZ4 compression and the bloom-filter
//!   duplicate suppression.
//! - [`noise`] - the Noise XX session layer: per-peer handshake state
//!   machines, transport ciphers, and the coordinator that arbitrates
//!   concurrent initiations.
//! - [`identity`] - persistent social identities keyed by fingerprint,
//!   trust levels, the verified set, and the ephemeral map from transient
//!   peer IDs to fingerprints.
//! - [`delivery`] - the pending-delivery tracker with deduplicated acks and
//!   the bounded retry queue.
//!
//! ## Execution model
//!
//! The core is single-threaded and run-to-completion. Three events drive
//! it: incoming transport bytes, the periodic tick, and application sends.
//! Handlers are synchronous; outbound bytes ([`Effect`]) and UI updates
//! ([`AppEvent`]) accumulate on queues the host drains after every call.
//! Hosts on multi-core systems may wrap the router in a single actor or
//! mutex, but its internal tables are never shared across threads.
//!
//! ```no_run
//! use bitmesh_core::{
//!     MemoryBlobStore, PeerId, ProtocolConfig, Router, Timestamp,
//! };
//!
//! let mut router = Router::new(
//!     PeerId::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]),
//!     "alice",
//!     Box::new(MemoryBlobStore::new()),
//!     ProtocolConfig::default(),
//!     Timestamp::now(),
//! );
//!
//! router.announce(Timestamp::now()).unwrap();
//! for effect in router.take_effects() {
//!     // hand the framed bytes to the radio
//!     let _ = effect;
//! }
//! ```

pub mod config;
pub mod delivery;
pub mod errors;
pub mod identity;
pub mod noise;
pub mod protocol;
pub mod router;
pub mod transport;
pub mod types;

pub use config::ProtocolConfig;
pub use errors::{
    CryptoError, DeliveryError, HandshakeError, MeshError, ParseError, PersistError, Result,
};
pub use identity::{
    BlobStore, FileBlobStore, IdentityStore, MemoryBlobStore, SocialIdentity, TrustLevel,
};
pub use noise::{HandshakeCoordinator, NoiseRole, NoiseSession, NoiseSessionManager, SessionState};
pub use protocol::{ChatMessage, MessageType, Packet, PacketFlags};
pub use router::{Router, RouterStats};
pub use transport::{AppEvent, DeliveryStatus, Effect};
pub use types::{Fingerprint, PeerId, SystemTimeSource, TimeSource, Timestamp, Ttl};
