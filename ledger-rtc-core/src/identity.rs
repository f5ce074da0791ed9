//! Ledger identities
//!
//! Parties are identified by their ledger account address; call records and
//! profiles are ledger objects identified by an object id. Both are opaque
//! strings to this crate (typically `0x`-prefixed hex).

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Account address of a call party
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Create an address from its string form
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare two addresses ignoring hex case
    pub fn matches(&self, other: &Address) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a ledger object (call record, profile)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Create an object id from its string form
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Generate a fresh random object id
    pub fn random() -> Self {
        Self(format!("0x{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// UTF-8 bytes of the id, as passed to entry functions taking `vector<u8>`
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// Parse an id previously encoded with [`ObjectId::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let s = std::str::from_utf8(bytes)?;
        if s.is_empty() {
            anyhow::bail!("empty object id");
        }
        Ok(Self(s.to_string()))
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        let addr = Address::new("0xABC");
        assert_eq!(addr.to_string(), "0xABC");
        assert_eq!(addr.as_str(), "0xABC");
    }

    #[test]
    fn test_address_matches_ignores_case() {
        assert!(Address::new("0xabc").matches(&Address::new("0xABC")));
        assert!(!Address::new("0xabc").matches(&Address::new("0xabd")));
    }

    #[test]
    fn test_object_id_bytes() {
        let id = ObjectId::new("0x42");
        let parsed = ObjectId::from_bytes(&id.to_bytes()).unwrap();
        assert_eq!(parsed, id);
        assert!(ObjectId::from_bytes(&[]).is_err());
        assert!(ObjectId::from_bytes(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_random_object_ids_are_distinct() {
        let a = ObjectId::random();
        let b = ObjectId::random();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("0x"));
    }

    #[test]
    fn test_identity_serialization_is_transparent() {
        let addr = Address::new("0xfeed");
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"0xfeed\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
