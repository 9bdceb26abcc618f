#![forbid(unsafe_code)]

// Matrix identifier newtypes — opaque strings with localpart/homeserver parsing.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed user ID '{0}'")]
pub struct MalformedUserId(pub String);

/// A Matrix user ID (`@localpart:homeserver`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into (localpart, homeserver). Fails unless the ID has the
    /// `@localpart:homeserver` shape with both parts non-empty.
    pub fn parse(&self) -> Result<(&str, &str), MalformedUserId> {
        let rest = self
            .0
            .strip_prefix('@')
            .ok_or_else(|| MalformedUserId(self.0.clone()))?;
        match rest.split_once(':') {
            Some((localpart, homeserver)) if !localpart.is_empty() && !homeserver.is_empty() => {
                Ok((localpart, homeserver))
            }
            _ => Err(MalformedUserId(self.0.clone())),
        }
    }

    pub fn localpart(&self) -> Result<&str, MalformedUserId> {
        Ok(self.parse()?.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A Matrix room ID (`!opaque:homeserver`). Treated as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A Matrix room alias (`#name:homeserver`). Treated as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomAlias(String);

impl RoomAlias {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_id() {
        let user = UserId::new("@alice:example.com");
        assert_eq!(user.parse().unwrap(), ("alice", "example.com"));
    }

    #[test]
    fn test_parse_keeps_extra_colons_in_homeserver() {
        let user = UserId::new("@alice:example.com:8448");
        assert_eq!(user.parse().unwrap(), ("alice", "example.com:8448"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(UserId::new("alice:example.com").parse().is_err());
        assert!(UserId::new("@alice").parse().is_err());
        assert!(UserId::new("@:example.com").parse().is_err());
        assert!(UserId::new("@alice:").parse().is_err());
    }

    #[test]
    fn test_serde_transparent() {
        let user: UserId = serde_json::from_str("\"@bob:hs\"").unwrap();
        assert_eq!(user, UserId::new("@bob:hs"));
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"@bob:hs\"");
    }
}
