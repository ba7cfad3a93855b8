//! Identity and trust: persistent social identities keyed by fingerprint,
//! plus the ephemeral sessions that map transient peer IDs onto them.

pub mod cache;
pub mod ephemeral;
pub mod social;
pub mod storage;
pub mod store;
pub mod types;

pub use cache::{IdentityCache, CACHE_VERSION};
pub use ephemeral::EphemeralSession;
pub use social::SocialIdentity;
pub use storage::{BlobStore, FileBlobStore, MemoryBlobStore, IDENTITY_CACHE_KEY, STATIC_KEY_KEY};
pub use store::IdentityStore;
pub use types::{HandshakeState, TrustLevel};
