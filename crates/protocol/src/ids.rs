//! Opaque identifiers handed to clients.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a connection context, unique while the context is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u32);

/// Identifier of a multicast membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MembershipId(pub u32);

/// Identifier of a client session.
///
/// Session ids are never reused for the lifetime of a broker, which makes
/// them usable as the identity order for locking two sessions at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

impl fmt::Display for MembershipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mc#{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

impl From<u32> for ContextId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<u32> for MembershipId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_bare_numbers() {
        assert_eq!(serde_json::to_string(&ContextId(7)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&SessionId(42)).unwrap(), "42");
        let mc: MembershipId = serde_json::from_str("3").unwrap();
        assert_eq!(mc, MembershipId(3));
    }

    #[test]
    fn ids_display_with_kind_prefix() {
        assert_eq!(ContextId(1).to_string(), "ctx#1");
        assert_eq!(MembershipId(2).to_string(), "mc#2");
        assert_eq!(SessionId(3).to_string(), "session#3");
    }
}
