//! Conversation store contract and in-process implementation.
//!
//! The relay consumes persistence through [`ConversationStore`]; the
//! store owns message ordering and the one-chat-per-pair invariant.
//! [`MemoryStore`] is the single-process implementation used by the
//! server and the tests.

use crate::model::{canonical_pair, Chat, PresenceRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_protocol::{ChatId, Message, MessageId, MessageKind, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Chat not found.
    #[error("Chat not found: {0}")]
    ChatNotFound(ChatId),

    /// A chat needs two distinct participants.
    #[error("Chat participants must be distinct")]
    SelfChat,

    /// The sender does not participate in the chat.
    #[error("User {user} is not a participant of chat {chat}")]
    NotParticipant {
        /// Offending user.
        user: UserId,
        /// Target chat.
        chat: ChatId,
    },

    /// Backend unavailable or write failed.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Persistence contract consumed by the relay.
///
/// Implementations must enforce the one-chat-per-unordered-pair
/// invariant atomically: two concurrent first-contact requests for the
/// same pair must converge on a single chat.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Find the chat for an unordered user pair, creating it on first
    /// contact. Idempotent and argument-order-insensitive.
    async fn find_or_create_chat(&self, a: UserId, b: UserId) -> Result<Chat, StoreError>;

    /// Look up a chat by ID.
    async fn chat(&self, id: ChatId) -> Result<Option<Chat>, StoreError>;

    /// Append a message to a chat, issuing its identifier and creation
    /// timestamp.
    async fn append_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
        kind: MessageKind,
    ) -> Result<Message, StoreError>;

    /// Update a chat's last-message reference.
    async fn update_last_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), StoreError>;

    /// List messages newest-first, at most `limit`, strictly older than
    /// the exclusive `before` cursor when given.
    async fn list_messages(
        &self,
        chat_id: ChatId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, StoreError>;

    /// Mark every unread message addressed to `receiver_id` in the chat
    /// as read. Returns how many messages flipped; already-read
    /// messages are untouched, so the operation is idempotent.
    async fn mark_read(&self, chat_id: ChatId, receiver_id: UserId) -> Result<usize, StoreError>;

    /// Count unread messages addressed to `receiver_id` in the chat.
    async fn count_unread(&self, chat_id: ChatId, receiver_id: UserId)
        -> Result<usize, StoreError>;

    /// Persist a user's presence attributes.
    async fn update_presence(
        &self,
        user: UserId,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Fetch a user's durable presence attributes.
    async fn presence(&self, user: UserId) -> Result<Option<PresenceRecord>, StoreError>;
}

/// In-process conversation store.
///
/// Chats and messages live in concurrent maps; the pair index sits
/// behind a plain mutex so find-or-create is atomic under concurrent
/// first contact. Message IDs are issued from a sequence inside the
/// per-chat entry lock, which keeps ID order and vector order aligned.
#[derive(Debug, Default)]
pub struct MemoryStore {
    chats: DashMap<ChatId, Chat>,
    pair_index: Mutex<HashMap<(UserId, UserId), ChatId>>,
    messages: DashMap<ChatId, Vec<Message>>,
    presence: DashMap<UserId, PresenceRecord>,
    sequence: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pair_lock(&self) -> std::sync::MutexGuard<'_, HashMap<(UserId, UserId), ChatId>> {
        // A poisoned lock means a panic mid-insert; the index itself is
        // still a valid map.
        self.pair_index
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn find_or_create_chat(&self, a: UserId, b: UserId) -> Result<Chat, StoreError> {
        if a == b {
            return Err(StoreError::SelfChat);
        }

        let key = canonical_pair(a, b);
        let mut index = self.pair_lock();

        if let Some(chat_id) = index.get(&key) {
            let chat = self
                .chats
                .get(chat_id)
                .map(|c| c.clone())
                .ok_or(StoreError::ChatNotFound(*chat_id))?;
            return Ok(chat);
        }

        let chat = Chat::new(a, b);
        index.insert(key, chat.id);
        self.chats.insert(chat.id, chat.clone());
        debug!(chat = %chat.id, "Created chat");
        Ok(chat)
    }

    async fn chat(&self, id: ChatId) -> Result<Option<Chat>, StoreError> {
        Ok(self.chats.get(&id).map(|c| c.clone()))
    }

    async fn append_message(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
        kind: MessageKind,
    ) -> Result<Message, StoreError> {
        let chat = self
            .chats
            .get(&chat_id)
            .map(|c| c.clone())
            .ok_or(StoreError::ChatNotFound(chat_id))?;

        if !chat.has_participant(sender_id) {
            return Err(StoreError::NotParticipant {
                user: sender_id,
                chat: chat_id,
            });
        }
        if !chat.has_participant(receiver_id) {
            return Err(StoreError::NotParticipant {
                user: receiver_id,
                chat: chat_id,
            });
        }

        let mut entry = self.messages.entry(chat_id).or_default();
        let message = Message {
            id: MessageId(self.sequence.fetch_add(1, Ordering::Relaxed) + 1),
            chat_id,
            sender_id,
            receiver_id,
            content,
            kind,
            is_read: false,
            read_at: None,
            created_at: Utc::now(),
        };
        entry.push(message.clone());

        debug!(chat = %chat_id, message = %message.id, "Appended message");
        Ok(message)
    }

    async fn update_last_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), StoreError> {
        let mut chat = self
            .chats
            .get_mut(&chat_id)
            .ok_or(StoreError::ChatNotFound(chat_id))?;
        chat.last_message_id = Some(message_id);
        Ok(())
    }

    async fn list_messages(
        &self,
        chat_id: ChatId,
        limit: usize,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, StoreError> {
        if !self.chats.contains_key(&chat_id) {
            return Err(StoreError::ChatNotFound(chat_id));
        }

        let page = self
            .messages
            .get(&chat_id)
            .map(|messages| {
                messages
                    .iter()
                    .rev()
                    .filter(|m| before.map_or(true, |cursor| m.id < cursor))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(page)
    }

    async fn mark_read(&self, chat_id: ChatId, receiver_id: UserId) -> Result<usize, StoreError> {
        if !self.chats.contains_key(&chat_id) {
            return Err(StoreError::ChatNotFound(chat_id));
        }

        let Some(mut messages) = self.messages.get_mut(&chat_id) else {
            return Ok(0);
        };

        let read_at = Utc::now();
        let mut flipped = 0;
        for message in messages.iter_mut() {
            if message.receiver_id == receiver_id && !message.is_read {
                message.is_read = true;
                message.read_at = Some(read_at);
                flipped += 1;
            }
        }

        if flipped > 0 {
            debug!(chat = %chat_id, reader = %receiver_id, flipped, "Marked messages read");
        }
        Ok(flipped)
    }

    async fn count_unread(
        &self,
        chat_id: ChatId,
        receiver_id: UserId,
    ) -> Result<usize, StoreError> {
        Ok(self
            .messages
            .get(&chat_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.receiver_id == receiver_id && !m.is_read)
                    .count()
            })
            .unwrap_or(0))
    }

    async fn update_presence(
        &self,
        user: UserId,
        is_online: bool,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.presence.insert(
            user,
            PresenceRecord {
                is_online,
                last_seen,
            },
        );
        Ok(())
    }

    async fn presence(&self, user: UserId) -> Result<Option<PresenceRecord>, StoreError> {
        Ok(self.presence.get(&user).map(|p| *p))
    }
}
