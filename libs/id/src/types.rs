//! ID definitions used across the broker.

use std::fmt;
use std::str::FromStr;

use crate::{define_id, IdError};

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(ConnectionId, "conn");
define_id!(RequestId, "req");

// =============================================================================
// User
// =============================================================================

/// Stable identifier of an already-authenticated user.
///
/// The broker treats it as opaque. Parsing only rejects values that would be
/// awkward in logs, tags or database keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(String);

impl UserId {
    /// Maximum accepted length in bytes.
    pub const MAX_LEN: usize = 128;

    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > Self::MAX_LEN {
            return Err(IdError::TooLong {
                len: s.len(),
                max: Self::MAX_LEN,
            });
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':')))
        {
            return Err(IdError::InvalidChar(c));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for UserId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for UserId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Resource
// =============================================================================

/// Identifier of a provisioned resource, unique among in-use identifiers.
///
/// Values come from a small bounded domain, so uniqueness is enforced by the
/// allocator's pool rather than by the value space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u32);

impl ResourceId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        s.parse::<u32>()
            .map(Self)
            .map_err(|e| IdError::InvalidNumber(e.to_string()))
    }
}

impl From<u32> for ResourceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<ResourceId> for u32 {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl serde::Serialize for ResourceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ResourceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Self)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn connection_id_roundtrip() {
        let id = ConnectionId::new();
        let s = id.to_string();
        assert!(s.starts_with("conn_"));
        assert_eq!(s.parse::<ConnectionId>().unwrap(), id);
    }

    #[test]
    fn connection_id_rejects_wrong_prefix() {
        let id = RequestId::new().to_string();
        let err = id.parse::<ConnectionId>().unwrap_err();
        assert!(matches!(err, IdError::InvalidPrefix { expected: "conn", .. }));
    }

    #[test]
    fn connection_id_rejects_missing_separator() {
        let err = ConnectionId::parse("01HV4Z2WQXKJNM8GPQY6VBKC3D").unwrap_err();
        assert!(matches!(err, IdError::InvalidPrefix { .. }));
    }

    #[test]
    fn user_id_accepts_uuid_and_email_forms() {
        assert!(UserId::parse("1b4e28ba-2fa1-11d2-883f-0016d3cca427").is_ok());
        assert!(UserId::parse("alice@example.com").is_ok());
    }

    #[test]
    fn user_id_rejects_bad_values() {
        assert!(UserId::parse("").unwrap_err().is_empty());
        assert_eq!(UserId::parse("a b").unwrap_err(), IdError::InvalidChar(' '));
        let long = "a".repeat(UserId::MAX_LEN + 1);
        assert!(matches!(
            UserId::parse(&long).unwrap_err(),
            IdError::TooLong { .. }
        ));
    }

    #[test]
    fn user_id_serde_is_plain_string() {
        let id = UserId::parse("user-1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"user-1\"");
        let back: UserId = serde_json::from_str("\"user-1\"").unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<UserId>("\"\"").is_err());
    }

    #[test]
    fn resource_id_display_is_decimal() {
        assert_eq!(ResourceId::new(42).to_string(), "42");
        assert_eq!("42".parse::<ResourceId>().unwrap(), ResourceId::new(42));
        assert!("x".parse::<ResourceId>().is_err());
    }

    proptest! {
        #[test]
        fn resource_id_parse_matches_display(n in any::<u32>()) {
            let id = ResourceId::new(n);
            prop_assert_eq!(id.to_string().parse::<ResourceId>().unwrap(), id);
        }
    }
}
