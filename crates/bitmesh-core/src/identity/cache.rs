//! The persisted identity cache
//!
//! One serializable blob holding every social identity, the verified set and
//! last-interaction times. `verified_fingerprints` is redundant with
//! `trust_level == Verified` and is kept consistent by [`set_verified`].
//!
//! [`set_verified`]: IdentityCache::set_verified

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::social::SocialIdentity;
use super::types::TrustLevel;
use crate::types::{Fingerprint, Timestamp};

/// Current cache schema version
pub const CACHE_VERSION: u32 = 1;

/// In-memory form of the persisted identity blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityCache {
    pub version: u32,
    pub social_identities: BTreeMap<Fingerprint, SocialIdentity>,
    pub verified_fingerprints: BTreeSet<Fingerprint>,
    pub last_interactions: BTreeMap<Fingerprint, Timestamp>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self {
            version: CACHE_VERSION,
            social_identities: BTreeMap::new(),
            verified_fingerprints: BTreeSet::new(),
            last_interactions: BTreeMap::new(),
        }
    }

    /// Upsert a social identity, enforcing blocked ⇒ not-favorite.
    pub fn upsert_social_identity(&mut self, mut identity: SocialIdentity) {
        if identity.is_blocked {
            identity.is_favorite = false;
        }
        self.social_identities
            .insert(identity.fingerprint.clone(), identity);
    }

    pub fn get_social_identity(&self, fingerprint: &Fingerprint) -> Option<&SocialIdentity> {
        self.social_identities.get(fingerprint)
    }

    /// Flip verified status, keeping the redundant set and the trust level
    /// consistent: verifying promotes to `Verified`, unverifying demotes to
    /// `Casual`.
    pub fn set_verified(&mut self, fingerprint: &Fingerprint, verified: bool) {
        if verified {
            self.verified_fingerprints.insert(fingerprint.clone());
        } else {
            self.verified_fingerprints.remove(fingerprint);
        }
        let identity = self
            .social_identities
            .entry(fingerprint.clone())
            .or_insert_with(|| SocialIdentity::unknown(fingerprint.clone()));
        identity.trust_level = if verified {
            TrustLevel::Verified
        } else {
            TrustLevel::Casual
        };
    }

    pub fn is_verified(&self, fingerprint: &Fingerprint) -> bool {
        self.verified_fingerprints.contains(fingerprint)
    }

    /// Fingerprints marked favorite.
    pub fn favorites(&self) -> Vec<Fingerprint> {
        self.social_identities
            .values()
            .filter(|identity| identity.is_favorite)
            .map(|identity| identity.fingerprint.clone())
            .collect()
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}
