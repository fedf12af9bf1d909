//! The closed set of event types clients can receive.
//!
//! Wire strings are part of the client contract — web and mobile switch on
//! them — so each variant pins its snake_case name via serde and the set is
//! exhaustively tested. Anything not in this enum is rejected at the publish
//! boundary rather than leaking downstream as a loosely-typed payload.

use serde::{Deserialize, Serialize};

/// Event types pushed to connected clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Generic notification (follow, job match, mention).
    Notification,
    /// A post's like counter changed.
    LikeUpdate,
    /// A post's comment list changed.
    CommentUpdate,
    /// A user went online or offline.
    UserStatus,
    /// A new direct message arrived.
    NewMessage,
    /// Someone is typing in a conversation.
    Typing,
    /// Application-level heartbeat reply.
    Pong,
}

/// All event kinds, for exhaustive testing.
pub const ALL_EVENT_KINDS: &[EventKind] = &[
    EventKind::Notification,
    EventKind::LikeUpdate,
    EventKind::CommentUpdate,
    EventKind::UserStatus,
    EventKind::NewMessage,
    EventKind::Typing,
    EventKind::Pong,
];

impl EventKind {
    /// The wire string for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::LikeUpdate => "like_update",
            Self::CommentUpdate => "comment_update",
            Self::UserStatus => "user_status",
            Self::NewMessage => "new_message",
            Self::Typing => "typing",
            Self::Pong => "pong",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
