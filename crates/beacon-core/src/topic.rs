//! Typed room topics.
//!
//! A topic is the multicast address of a room. The wire form is a short
//! `kind:id` string (`user:user_1`, `post:42`, `conversation:9`) or a bare
//! name for process-global rooms (`announcements`). Parsing happens once at
//! the boundary; everything downstream works with [`RoomTopic`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::ids::UserId;

/// A named multicast group that connections can join.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RoomTopic {
    /// Per-user room, auto-joined at handshake. Target of direct notifies.
    User(UserId),
    /// Followers of a single post (likes, comments).
    Post(String),
    /// Participants of a direct-message conversation.
    Conversation(String),
    /// A process-global room, e.g. `announcements`.
    Global(String),
}

impl RoomTopic {
    /// Per-user topic for `user_id`.
    pub fn user(user_id: impl Into<UserId>) -> Self {
        Self::User(user_id.into())
    }

    /// Parse a wire topic string.
    ///
    /// Returns [`GatewayError::Protocol`] for empty segments or topics with
    /// whitespace; unknown `kind:` prefixes are rejected rather than being
    /// silently treated as global rooms.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        if raw.is_empty() || raw.chars().any(char::is_whitespace) {
            return Err(GatewayError::Protocol(format!("invalid topic: {raw:?}")));
        }
        match raw.split_once(':') {
            Some(("user", id)) if !id.is_empty() => Ok(Self::User(UserId::from(id))),
            Some(("post", id)) if !id.is_empty() => Ok(Self::Post(id.to_owned())),
            Some(("conversation", id)) if !id.is_empty() => {
                Ok(Self::Conversation(id.to_owned()))
            }
            Some(_) => Err(GatewayError::Protocol(format!("unknown topic kind: {raw}"))),
            None => Ok(Self::Global(raw.to_owned())),
        }
    }

    /// Whether joining this topic requires an authorization check.
    ///
    /// `user:{id}` is only ever auto-joined for the connection's own user,
    /// and global rooms are open; post and conversation rooms are gated on
    /// the caller being a participant.
    #[must_use]
    pub fn requires_authorization(&self) -> bool {
        matches!(self, Self::Post(_) | Self::Conversation(_))
    }
}

impl fmt::Display for RoomTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Post(id) => write!(f, "post:{id}"),
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::Global(name) => f.write_str(name),
        }
    }
}

impl Serialize for RoomTopic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomTopic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_user_topic() {
        let topic = RoomTopic::parse("user:user_7").unwrap();
        assert_matches!(topic, RoomTopic::User(ref id) if id.as_str() == "user_7");
    }

    #[test]
    fn parse_post_topic() {
        let topic = RoomTopic::parse("post:42").unwrap();
        assert_matches!(topic, RoomTopic::Post(ref id) if id == "42");
    }

    #[test]
    fn parse_conversation_topic() {
        let topic = RoomTopic::parse("conversation:9").unwrap();
        assert_matches!(topic, RoomTopic::Conversation(ref id) if id == "9");
    }

    #[test]
    fn parse_global_topic() {
        let topic = RoomTopic::parse("announcements").unwrap();
        assert_matches!(topic, RoomTopic::Global(ref name) if name == "announcements");
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(RoomTopic::parse("").is_err());
    }

    #[test]
    fn parse_rejects_whitespace() {
        assert!(RoomTopic::parse("post: 42").is_err());
        assert!(RoomTopic::parse("two words").is_err());
    }

    #[test]
    fn parse_rejects_empty_id_segment() {
        assert!(RoomTopic::parse("post:").is_err());
        assert!(RoomTopic::parse("user:").is_err());
    }

    #[test]
    fn parse_rejects_unknown_kind() {
        assert!(RoomTopic::parse("job:13").is_err());
    }

    #[test]
    fn display_roundtrip() {
        for raw in ["user:user_1", "post:42", "conversation:9", "announcements"] {
            let topic = RoomTopic::parse(raw).unwrap();
            assert_eq!(topic.to_string(), raw);
        }
    }

    #[test]
    fn authorization_requirements() {
        assert!(RoomTopic::parse("post:1").unwrap().requires_authorization());
        assert!(
            RoomTopic::parse("conversation:1")
                .unwrap()
                .requires_authorization()
        );
        assert!(!RoomTopic::parse("user:u1").unwrap().requires_authorization());
        assert!(!RoomTopic::parse("lobby").unwrap().requires_authorization());
    }

    #[test]
    fn serde_as_wire_string() {
        let topic = RoomTopic::Post("42".into());
        let json = serde_json::to_string(&topic).unwrap();
        assert_eq!(json, "\"post:42\"");
        let back: RoomTopic = serde_json::from_str(&json).unwrap();
        assert_eq!(back, topic);
    }

    #[test]
    fn serde_rejects_invalid_wire_string() {
        assert!(serde_json::from_str::<RoomTopic>("\"job:1\"").is_err());
    }

    #[test]
    fn user_constructor() {
        let topic = RoomTopic::user("user_3");
        assert_eq!(topic.to_string(), "user:user_3");
    }
}
