//! Domain model for conversations and durable presence.

use chrono::{DateTime, Utc};
use parley_protocol::{ChatId, MessageId, UserId};
use serde::{Deserialize, Serialize};

/// Canonical ordering of a user pair.
///
/// Two-party conversations are keyed by the unordered pair of
/// participants; sorting makes the key deterministic regardless of
/// argument order.
#[must_use]
pub fn canonical_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A two-party conversation.
///
/// At most one chat exists per unordered participant pair; the store
/// enforces that invariant. Chats are created lazily and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    /// Conversation identifier.
    pub id: ChatId,
    /// Participants in canonical (sorted) order.
    pub participants: [UserId; 2],
    /// Most recent message, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<MessageId>,
    /// When the chat was created.
    pub created_at: DateTime<Utc>,
}

impl Chat {
    /// Create a new chat between two users.
    #[must_use]
    pub fn new(a: UserId, b: UserId) -> Self {
        let (first, second) = canonical_pair(a, b);
        Self {
            id: ChatId::generate(),
            participants: [first, second],
            last_message_id: None,
            created_at: Utc::now(),
        }
    }

    /// Check whether a user participates in this chat.
    #[must_use]
    pub fn has_participant(&self, user: UserId) -> bool {
        self.participants.contains(&user)
    }

    /// Get the other participant, if `user` is one of the two.
    #[must_use]
    pub fn peer_of(&self, user: UserId) -> Option<UserId> {
        match self.participants {
            [a, b] if a == user => Some(b),
            [a, b] if b == user => Some(a),
            _ => None,
        }
    }
}

/// Durable presence attributes for a user.
///
/// Mutated only by presence transitions; never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// Whether the user currently has at least one live connection.
    pub is_online: bool,
    /// Last presence transition timestamp.
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    /// Record an online/offline transition at the current instant.
    #[must_use]
    pub fn now(is_online: bool) -> Self {
        Self {
            is_online,
            last_seen: Utc::now(),
        }
    }
}
