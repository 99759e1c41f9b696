//! Identity types for localbus entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

/// UTC timestamp used throughout the broker.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Monotonically increasing per-entity message sequence number.
pub type SequenceNumber = i64;

// ============================================================================
// LOCK TOKEN
// ============================================================================

/// Opaque lock token bound to exactly one locked message or session.
///
/// Tokens are UUID v4. Equality is constant-time over the raw bytes so a
/// token comparison leaks nothing about how many leading bytes matched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Issue a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl PartialEq for LockToken {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time: fold XOR of every byte pair, compare once at the end.
        let a = self.0.as_bytes();
        let b = other.0.as_bytes();
        let mut diff = 0u8;
        for i in 0..16 {
            diff |= a[i] ^ b[i];
        }
        diff == 0
    }
}

impl Eq for LockToken {}

impl Hash for LockToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_bytes().hash(state);
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LockToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_token_roundtrip() {
        let token = LockToken::generate();
        let parsed: LockToken = token.to_string().parse().expect("token should parse back");
        assert_eq!(token, parsed);
    }

    #[test]
    fn test_lock_token_inequality() {
        let a = LockToken::generate();
        let b = LockToken::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_lock_token_is_v4() {
        let token = LockToken::generate();
        assert_eq!(token.as_uuid().get_version_num(), 4);
    }
}
