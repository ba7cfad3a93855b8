//! The identity store
//!
//! Owns the persisted [`IdentityCache`] and the ephemeral session map.
//! Loads on construction; saves on mutation, coalesced so slow storage is
//! written at most once per configured interval. Storage failures never
//! reach the caller's control flow: they are logged, in-memory state stays
//! intact, and the next mutation retries the save.

use std::collections::BTreeMap;

use tracing::warn;

use super::cache::IdentityCache;
use super::ephemeral::EphemeralSession;
use super::social::SocialIdentity;
use super::storage::{BlobStore, IDENTITY_CACHE_KEY};
use super::types::HandshakeState;
use crate::config::IdentityConfig;
use crate::types::{Fingerprint, PeerId, Timestamp};

/// Persistent social identities plus transient per-connection sessions.
pub struct IdentityStore {
    cache: IdentityCache,
    storage: Box<dyn BlobStore>,
    config: IdentityConfig,
    ephemeral_sessions: BTreeMap<PeerId, EphemeralSession>,
    /// claimed nickname / petname → fingerprint
    nickname_index: BTreeMap<String, Fingerprint>,
    dirty: bool,
    last_save: Timestamp,
}

impl core::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("identities", &self.cache.social_identities.len())
            .field("ephemeral_sessions", &self.ephemeral_sessions.len())
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl IdentityStore {
    /// Load the cache from storage. A missing or corrupt blob starts fresh;
    /// an I/O failure is logged and also starts fresh.
    pub fn new(storage: Box<dyn BlobStore>, config: IdentityConfig, now: Timestamp) -> Self {
        let cache = match storage.load(IDENTITY_CACHE_KEY) {
            Ok(Some(blob)) => match bincode::deserialize::<IdentityCache>(&blob) {
                Ok(cache) => cache,
                Err(err) => {
                    warn!(%err, "identity cache blob corrupt, starting fresh");
                    IdentityCache::new()
                }
            },
            Ok(None) => IdentityCache::new(),
            Err(err) => {
                warn!(%err, "identity cache load failed, starting fresh");
                IdentityCache::new()
            }
        };

        let mut store = Self {
            cache,
            storage,
            config,
            ephemeral_sessions: BTreeMap::new(),
            nickname_index: BTreeMap::new(),
            dirty: false,
            last_save: now,
        };
        store.rebuild_nickname_index();
        store
    }

    // ------------------------------------------------------------------------
    // Social identities
    // ------------------------------------------------------------------------

    /// The stored identity, or the unknown default. Never inserts.
    pub fn get_social_identity(&self, fingerprint: &Fingerprint) -> SocialIdentity {
        self.cache
            .get_social_identity(fingerprint)
            .cloned()
            .unwrap_or_else(|| SocialIdentity::unknown(fingerprint.clone()))
    }

    /// Upsert an identity and refresh the nickname index.
    pub fn update_social_identity(&mut self, identity: SocialIdentity, now: Timestamp) {
        if let Some(previous) = self.cache.get_social_identity(&identity.fingerprint) {
            self.nickname_index.remove(previous.display_name());
        }
        self.nickname_index
            .insert(identity.display_name().to_string(), identity.fingerprint.clone());
        self.cache.upsert_social_identity(identity);
        self.mark_dirty_and_save(now);
    }

    /// Mark or unmark a favorite. Blocked peers cannot become favorites.
    pub fn set_favorite(&mut self, fingerprint: &Fingerprint, favorite: bool, now: Timestamp) {
        let mut identity = self.get_social_identity(fingerprint);
        identity.is_favorite = favorite && !identity.is_blocked;
        self.cache.upsert_social_identity(identity);
        self.mark_dirty_and_save(now);
    }

    /// Block or unblock. Blocking forcibly clears favorite status.
    pub fn set_blocked(&mut self, fingerprint: &Fingerprint, blocked: bool, now: Timestamp) {
        let mut identity = self.get_social_identity(fingerprint);
        identity.is_blocked = blocked;
        if blocked {
            identity.is_favorite = false;
        }
        self.cache.upsert_social_identity(identity);
        self.mark_dirty_and_save(now);
    }

    /// Flip verified status; keeps the verified set and trust level in sync.
    pub fn set_verified(&mut self, fingerprint: &Fingerprint, verified: bool, now: Timestamp) {
        self.cache.set_verified(fingerprint, verified);
        self.mark_dirty_and_save(now);
    }

    pub fn is_favorite(&self, fingerprint: &Fingerprint) -> bool {
        self.cache
            .get_social_identity(fingerprint)
            .is_some_and(|identity| identity.is_favorite)
    }

    pub fn is_blocked(&self, fingerprint: &Fingerprint) -> bool {
        self.cache
            .get_social_identity(fingerprint)
            .is_some_and(|identity| identity.is_blocked)
    }

    pub fn is_verified(&self, fingerprint: &Fingerprint) -> bool {
        self.cache.is_verified(fingerprint)
    }

    pub fn favorites(&self) -> Vec<Fingerprint> {
        self.cache.favorites()
    }

    pub fn find_by_nickname(&self, nickname: &str) -> Option<&Fingerprint> {
        self.nickname_index.get(nickname)
    }

    // ------------------------------------------------------------------------
    // Ephemeral sessions
    // ------------------------------------------------------------------------

    /// Register a fresh session for a transient peer ID.
    pub fn register_ephemeral_session(&mut self, peer_id: PeerId, now: Timestamp) {
        self.ephemeral_sessions
            .insert(peer_id, EphemeralSession::new(peer_id, now));
    }

    /// Advance a session's handshake state. On completion the fingerprint is
    /// captured into the session and the last-interaction time stamped.
    pub fn update_handshake_state(
        &mut self,
        peer_id: &PeerId,
        state: HandshakeState,
        now: Timestamp,
    ) {
        let Some(session) = self.ephemeral_sessions.get_mut(peer_id) else {
            return;
        };
        if let HandshakeState::Completed { fingerprint } = &state {
            session.fingerprint = Some(fingerprint.clone());
            self.cache
                .last_interactions
                .insert(fingerprint.clone(), now);
            session.handshake_state = state;
            self.mark_dirty_and_save(now);
        } else {
            session.handshake_state = state;
        }
    }

    pub fn handshake_state(&self, peer_id: &PeerId) -> HandshakeState {
        self.ephemeral_sessions
            .get(peer_id)
            .map(|session| session.handshake_state.clone())
            .unwrap_or(HandshakeState::None)
    }

    pub fn ephemeral_session(&self, peer_id: &PeerId) -> Option<&EphemeralSession> {
        self.ephemeral_sessions.get(peer_id)
    }

    pub fn remove_ephemeral_session(&mut self, peer_id: &PeerId) {
        self.ephemeral_sessions.remove(peer_id);
    }

    /// Fingerprint for a transient peer ID, if its handshake completed.
    pub fn fingerprint_for_peer(&self, peer_id: &PeerId) -> Option<&Fingerprint> {
        self.ephemeral_sessions
            .get(peer_id)
            .and_then(|session| session.fingerprint.as_ref())
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Flush a pending save if the coalescing interval has passed.
    pub fn tick(&mut self, now: Timestamp) {
        if self.dirty && now.millis_since(self.last_save) >= self.config.save_interval_ms {
            self.save(now);
        }
    }

    /// Force a save regardless of the coalescing interval.
    pub fn flush(&mut self, now: Timestamp) {
        if self.dirty {
            self.save(now);
        }
    }

    /// Wipe everything: in-memory state and the persisted blob.
    pub fn clear_all_identity_data(&mut self) {
        self.cache = IdentityCache::new();
        self.ephemeral_sessions.clear();
        self.nickname_index.clear();
        self.dirty = false;
        if let Err(err) = self.storage.remove(IDENTITY_CACHE_KEY) {
            warn!(%err, "failed to remove identity cache blob");
        }
    }

    fn mark_dirty_and_save(&mut self, now: Timestamp) {
        self.dirty = true;
        if now.millis_since(self.last_save) >= self.config.save_interval_ms {
            self.save(now);
        }
    }

    fn save(&mut self, now: Timestamp) {
        let blob = match bincode::serialize(&self.cache) {
            Ok(blob) => blob,
            Err(err) => {
                warn!(%err, "identity cache serialization failed");
                return;
            }
        };
        match self.storage.store(IDENTITY_CACHE_KEY, &blob) {
            Ok(()) => {
                self.dirty = false;
                self.last_save = now;
            }
            Err(err) => {
                // Keep dirty; the next mutation retries.
                warn!(%err, "identity cache save failed");
            }
        }
    }

    fn rebuild_nickname_index(&mut self) {
        self.nickname_index = self
            .cache
            .social_identities
            .values()
            .map(|identity| {
                (
                    identity.display_name().to_string(),
                    identity.fingerprint.clone(),
                )
            })
            .collect();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
