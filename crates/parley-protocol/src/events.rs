//! Event types for the Parley wire protocol.
//!
//! Events are the unit of communication between clients and the relay.
//! Each event serializes as `{ "type": ..., "payload": ... }` with
//! camelCase payload fields.

use crate::ids::{ChatId, MessageId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content type of a chat message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// Image attachment reference.
    Image,
    /// Generic file attachment reference.
    File,
}

/// A chat message as stored and as pushed on the wire.
///
/// Immutable after creation except for the one-way read transition
/// (`is_read` false -> true, `read_at` set once).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Store-issued identifier, strictly increasing.
    pub id: MessageId,
    /// Conversation this message belongs to.
    pub chat_id: ChatId,
    /// Sending user.
    pub sender_id: UserId,
    /// Receiving user.
    pub receiver_id: UserId,
    /// Message body.
    pub content: String,
    /// Content type.
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    /// Whether the receiver has read this message.
    pub is_read: bool,
    /// When the receiver read it, if ever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    /// When the store accepted it.
    pub created_at: DateTime<Utc>,
}

/// Inbound events, client to relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Authenticate the connection with a bearer token.
    Auth {
        /// Opaque bearer credential.
        token: String,
    },

    /// Send a chat message to another user.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        /// Conversation the client believes it is writing to.
        chat_id: ChatId,
        /// Target user.
        receiver_id: UserId,
        /// Message body.
        content: String,
        /// Content type.
        #[serde(rename = "type", default)]
        kind: MessageKind,
    },

    /// Transient typing indicator. Never persisted or replayed.
    #[serde(rename_all = "camelCase")]
    Typing {
        /// Conversation the indicator applies to.
        chat_id: ChatId,
        /// Target user.
        receiver_id: UserId,
        /// Whether the client is currently typing.
        is_typing: bool,
    },

    /// Mark every unread message addressed to the caller in a
    /// conversation as read.
    #[serde(rename_all = "camelCase")]
    ReadMessages {
        /// Conversation to mark.
        chat_id: ChatId,
        /// Original sender, so their connections get the receipt.
        sender_id: UserId,
    },
}

/// Outbound events, relay to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Authentication succeeded; the connection is bound to this user.
    #[serde(rename_all = "camelCase")]
    Authenticated {
        /// Bound user identity.
        user_id: UserId,
    },

    /// Something the client asked for failed. Scoped to one event;
    /// the connection stays open.
    Error {
        /// Human-readable description.
        message: String,
    },

    /// A message addressed to this connection's user arrived.
    NewMessage(Message),

    /// Confirmation of a message this user sent, delivered to all of
    /// the sender's connections so other tabs stay in sync.
    MessageSent(Message),

    /// The peer started or stopped typing.
    #[serde(rename_all = "camelCase")]
    TypingStatus {
        /// Who is typing.
        user_id: UserId,
        /// Whether they are typing right now.
        is_typing: bool,
        /// Conversation the indicator applies to.
        chat_id: ChatId,
    },

    /// The peer read this user's messages in a conversation.
    #[serde(rename_all = "camelCase")]
    MessagesRead {
        /// Conversation that was read.
        chat_id: ChatId,
        /// Who read it.
        reader_id: UserId,
    },

    /// A user went online or offline.
    #[serde(rename_all = "camelCase")]
    PresenceUpdate {
        /// Subject of the transition.
        user_id: UserId,
        /// Whether the user now has at least one live connection.
        is_online: bool,
        /// Last activity timestamp.
        last_seen: DateTime<Utc>,
    },
}

impl ServerEvent {
    /// Create an `authenticated` event.
    #[must_use]
    pub fn authenticated(user_id: UserId) -> Self {
        ServerEvent::Authenticated { user_id }
    }

    /// Create an `error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// Create a `typing_status` event.
    #[must_use]
    pub fn typing_status(user_id: UserId, is_typing: bool, chat_id: ChatId) -> Self {
        ServerEvent::TypingStatus {
            user_id,
            is_typing,
            chat_id,
        }
    }

    /// Create a `messages_read` event.
    #[must_use]
    pub fn messages_read(chat_id: ChatId, reader_id: UserId) -> Self {
        ServerEvent::MessagesRead { chat_id, reader_id }
    }

    /// Create a `presence_update` event.
    #[must_use]
    pub fn presence_update(user_id: UserId, is_online: bool, last_seen: DateTime<Utc>) -> Self {
        ServerEvent::PresenceUpdate {
            user_id,
            is_online,
            last_seen,
        }
    }
}
