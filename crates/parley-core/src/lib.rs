//! # parley-core
//!
//! Core state and contracts for the Parley chat relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **PresenceRegistry** - Map from user identity to live connections
//! - **ConversationStore** - Persistence contract for chats and messages
//! - **MemoryStore** - In-process store implementation
//! - **Chat** / **PresenceRecord** - Domain model
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────────┐     ┌───────────────────┐
//! │  Connection │────▶│ PresenceRegistry │────▶│ ConnectionHandle  │
//! └─────────────┘     └──────────────────┘     └───────────────────┘
//!        │
//!        ▼
//! ┌───────────────────┐
//! │ ConversationStore │
//! └───────────────────┘
//! ```
//!
//! The registry answers "which connections can reach this user right
//! now"; the store owns durable conversation history. The relay server
//! wires the two together.

pub mod model;
pub mod presence;
pub mod store;

pub use model::{canonical_pair, Chat, PresenceRecord};
pub use presence::{ConnectionHandle, ConnectionId, Delivery, PresenceRegistry, RegistryStats};
pub use store::{ConversationStore, MemoryStore, StoreError};
