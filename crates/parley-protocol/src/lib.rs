//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat relay.
//!
//! Every event on the wire is a JSON text frame with the envelope
//! `{ "type": "...", "payload": { ... } }`. Inbound events come from
//! clients ([`ClientEvent`]); outbound events are pushed by the relay
//! ([`ServerEvent`]).
//!
//! ## Event types
//!
//! - `auth` - bind a connection to a user identity
//! - `send_message` / `new_message` / `message_sent` - chat messages
//! - `typing` / `typing_status` - transient typing indicators
//! - `read_messages` / `messages_read` - read receipts
//! - `presence_update` - online/offline transitions
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientEvent};
//!
//! let text = r#"{"type":"auth","payload":{"token":"abc"}}"#;
//! let event = codec::decode_client(text).unwrap();
//! assert!(matches!(event, ClientEvent::Auth { .. }));
//! ```

pub mod codec;
pub mod events;
pub mod ids;

pub use codec::{decode_client, encode_server, ProtocolError};
pub use events::{ClientEvent, Message, MessageKind, ServerEvent};
pub use ids::{ChatId, MessageId, UserId};
