//! Social identity: user-assigned metadata keyed by fingerprint

use serde::{Deserialize, Serialize};

use super::types::TrustLevel;
use crate::types::Fingerprint;

/// Everything the local user knows and has decided about one fingerprint.
///
/// Invariant: `is_blocked` implies `!is_favorite`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialIdentity {
    pub fingerprint: Fingerprint,
    /// Name the local user assigned; empty when unset
    pub local_petname: String,
    /// Nickname the peer last claimed for itself
    pub claimed_nickname: String,
    pub trust_level: TrustLevel,
    pub is_favorite: bool,
    pub is_blocked: bool,
    pub notes: String,
}

impl SocialIdentity {
    /// The default identity returned for a fingerprint we know nothing about.
    pub fn unknown(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            local_petname: String::new(),
            claimed_nickname: "Unknown".to_string(),
            trust_level: TrustLevel::Unknown,
            is_favorite: false,
            is_blocked: false,
            notes: String::new(),
        }
    }

    /// Petname when set, otherwise the claimed nickname.
    pub fn display_name(&self) -> &str {
        if self.local_petname.is_empty() {
            &self.claimed_nickname
        } else {
            &self.local_petname
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_defaults() {
        let identity = SocialIdentity::unknown(Fingerprint::new([1; 32]));
        assert_eq!(identity.claimed_nickname, "Unknown");
        assert_eq!(identity.trust_level, TrustLevel::Unknown);
        assert!(!identity.is_favorite);
        assert!(!identity.is_blocked);
        assert_eq!(identity.display_name(), "Unknown");
    }

    #[test]
    fn test_display_name_prefers_petname() {
        let mut identity = SocialIdentity::unknown(Fingerprint::new([1; 32]));
        identity.claimed_nickname = "alice".into();
        assert_eq!(identity.display_name(), "alice");
        identity.local_petname = "work-alice".into();
        assert_eq!(identity.display_name(), "work-alice");
    }
}
