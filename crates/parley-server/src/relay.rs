//! Relay dispatcher and connection handling.
//!
//! One task per live connection: inbound events are interpreted in
//! arrival order, persisted through the conversation store when
//! applicable, and fanned out to the presence registry's resolved
//! connection sets. Delivery is best effort; an offline peer simply
//! receives nothing and catches up through the history endpoint.

use crate::auth::{JwtVerifier, TokenVerifier};
use crate::config::Config;
use crate::liveness;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::session::{AuthAttempt, Session};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parley_core::{
    ConnectionHandle, ConnectionId, ConversationStore, Delivery, MemoryStore, PresenceRegistry,
    StoreError,
};
use parley_protocol::{codec, ChatId, ClientEvent, Message, MessageId, MessageKind, ServerEvent, UserId};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Live connections per user.
    pub registry: Arc<PresenceRegistry>,
    /// Durable conversation history.
    pub store: Arc<dyn ConversationStore>,
    /// Credential verification.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state with the in-process store and JWT verifier.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            registry: Arc::new(PresenceRegistry::new()),
            store: Arc::new(MemoryStore::new()),
            verifier: Arc::new(JwtVerifier::new(&config.auth.secret)),
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Heartbeat sweep over all registered connections
    tokio::spawn(liveness::run(
        Arc::clone(&state.registry),
        config.heartbeat.interval_ms,
    ));

    let app = router(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley relay listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the route table.
fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/chats/:chat_id/messages", get(history_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// History pagination parameters.
#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    before: Option<MessageId>,
}

/// Paginated message history, newest first.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(chat_id): Path<ChatId>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(state.config.limits.history_page_size)
        .min(state.config.limits.history_page_max);

    match state.store.list_messages(chat_id, limit, query.before).await {
        Ok(messages) => Json(messages).into_response(),
        Err(StoreError::ChatNotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "chat not found" })),
        )
            .into_response(),
        Err(e) => {
            error!(chat = %chat_id, error = %e, "History fetch failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "storage unavailable" })),
            )
                .into_response()
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::next();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Outbound queue: the registry and the liveness monitor push into
    // it, this task drains it onto the socket.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(connection_id, tx);
    let mut session = Session::new(connection_id);

    loop {
        tokio::select! {
            biased;

            Some(delivery) = rx.recv() => match delivery {
                Delivery::Event(event) => {
                    match codec::encode_server(&event) {
                        Ok(text) => {
                            metrics::record_event("outbound");
                            if sender.send(WsMessage::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!(connection = %connection_id, error = %e, "Failed to encode event");
                        }
                    }
                }
                Delivery::Ping => {
                    if sender.send(WsMessage::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Delivery::Close => {
                    debug!(connection = %connection_id, "Force-closed by liveness monitor");
                    break;
                }
            },

            inbound = receiver.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    metrics::record_event("inbound");
                    if !handle_text(&state, &mut session, &handle, &text).await {
                        break;
                    }
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if sender.send(WsMessage::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    handle.mark_responsive();
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    warn!(connection = %connection_id, "Dropping binary frame");
                    metrics::record_error("malformed");
                }
                Some(Ok(WsMessage::Close(_))) => {
                    debug!(connection = %connection_id, "Received close frame");
                    break;
                }
                Some(Err(e)) => {
                    warn!(connection = %connection_id, error = %e, "WebSocket error");
                    metrics::record_error("websocket");
                    break;
                }
                None => {
                    debug!(connection = %connection_id, "WebSocket stream ended");
                    break;
                }
            }
        }
    }

    disconnect(&state, &mut session).await;
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Closed transition: deregister and, on the user's last connection,
/// persist and broadcast presence-offline.
///
/// Transport failures land here exactly like graceful closes.
async fn disconnect(state: &AppState, session: &mut Session) {
    let connection_id = session.id();
    let Some(user) = session.close() else {
        return;
    };

    if state.registry.deregister(user, connection_id) {
        let now = Utc::now();
        // Fire-and-forget: the socket is already gone, so a failed
        // write only gets logged.
        if let Err(e) = state.store.update_presence(user, false, now).await {
            warn!(user = %user, error = %e, "Failed to persist offline presence");
        }
        state
            .registry
            .broadcast_all(ServerEvent::presence_update(user, false, now));
        metrics::record_presence_transition("offline");
        info!(user = %user, "User went offline");
    }

    metrics::set_online_users(state.registry.stats().online_users);
}

/// Decode and dispatch one inbound text frame.
///
/// Returns `false` when the connection should close.
async fn handle_text(
    state: &AppState,
    session: &mut Session,
    handle: &ConnectionHandle,
    text: &str,
) -> bool {
    let event = match codec::decode_client(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(connection = %session.id(), error = %e, "Dropping malformed event");
            metrics::record_error("malformed");
            return true;
        }
    };

    handle_event(state, session, handle, event).await
}

/// Dispatch one decoded client event against the session state machine.
///
/// Returns `false` when the connection should close.
pub(crate) async fn handle_event(
    state: &AppState,
    session: &mut Session,
    handle: &ConnectionHandle,
    event: ClientEvent,
) -> bool {
    if session.is_closed() {
        warn!(connection = %session.id(), "Dropping event on closed session");
        return false;
    }

    match event {
        ClientEvent::Auth { token } => handle_auth(state, session, handle, &token).await,

        ClientEvent::SendMessage {
            chat_id,
            receiver_id,
            content,
            kind,
        } => {
            let Some(sender_id) = session.user() else {
                debug!(connection = %session.id(), "Dropping send_message from unauthenticated session");
                return true;
            };
            handle_send_message(state, handle, sender_id, chat_id, receiver_id, content, kind)
                .await;
            true
        }

        ClientEvent::Typing {
            chat_id,
            receiver_id,
            is_typing,
        } => {
            let Some(user) = session.user() else {
                debug!(connection = %session.id(), "Dropping typing from unauthenticated session");
                return true;
            };
            // Transient: lost if the receiver is offline, never replayed.
            state
                .registry
                .send_to(receiver_id, ServerEvent::typing_status(user, is_typing, chat_id));
            true
        }

        ClientEvent::ReadMessages { chat_id, sender_id } => {
            let Some(reader) = session.user() else {
                debug!(connection = %session.id(), "Dropping read_messages from unauthenticated session");
                return true;
            };
            handle_read_messages(state, handle, reader, chat_id, sender_id).await;
            true
        }
    }
}

/// Validate the credential and register the connection.
async fn handle_auth(
    state: &AppState,
    session: &mut Session,
    handle: &ConnectionHandle,
    token: &str,
) -> bool {
    if session.user().is_some() {
        warn!(connection = %session.id(), "Dropping duplicate auth on authenticated session");
        return true;
    }

    match state.verifier.verify(token) {
        Ok(user) => {
            session.authenticate(user);
            let first = state.registry.register(user, handle.clone());
            let now = Utc::now();

            if first {
                if let Err(e) = state.store.update_presence(user, true, now).await {
                    warn!(user = %user, error = %e, "Failed to persist online presence");
                }
                state
                    .registry
                    .broadcast_all(ServerEvent::presence_update(user, true, now));
                metrics::record_presence_transition("online");
                info!(user = %user, "User came online");
            }

            metrics::set_online_users(state.registry.stats().online_users);
            handle.send(Arc::new(ServerEvent::authenticated(user)));
            debug!(connection = %session.id(), user = %user, "Connection authenticated");
            true
        }
        Err(e) => {
            debug!(connection = %session.id(), error = %e, "Authentication failed");
            metrics::record_error("auth");
            handle.send(Arc::new(ServerEvent::error("Authentication failed")));

            match session.record_auth_failure(state.config.auth.max_attempts) {
                AuthAttempt::Retry => true,
                AuthAttempt::Exhausted => {
                    warn!(connection = %session.id(), "Auth attempts exhausted, closing");
                    false
                }
            }
        }
    }
}

/// Persist a message, then push it to both parties' connections.
async fn handle_send_message(
    state: &AppState,
    handle: &ConnectionHandle,
    sender_id: UserId,
    client_chat_id: ChatId,
    receiver_id: UserId,
    content: String,
    kind: MessageKind,
) {
    match persist_message(state, sender_id, receiver_id, content, kind).await {
        Ok(message) => {
            if message.chat_id != client_chat_id {
                // The participant pair, not the client, decides the chat.
                debug!(
                    claimed = %client_chat_id,
                    actual = %message.chat_id,
                    "Client chat id superseded by canonical chat"
                );
            }
            metrics::record_message_persisted();

            state
                .registry
                .send_to(receiver_id, ServerEvent::NewMessage(message.clone()));
            // Self-delivery keeps the sender's other tabs in sync.
            state
                .registry
                .send_to(sender_id, ServerEvent::MessageSent(message));
        }
        Err(e) => {
            error!(user = %sender_id, error = %e, "Message persistence failed");
            metrics::record_error("persistence");
            handle.send(Arc::new(ServerEvent::error(
                "Message could not be stored, try again",
            )));
        }
    }
}

/// Store-then-push, sequenced so a connected receiver observes messages
/// in creation order.
async fn persist_message(
    state: &AppState,
    sender_id: UserId,
    receiver_id: UserId,
    content: String,
    kind: MessageKind,
) -> Result<Message, StoreError> {
    let chat = state.store.find_or_create_chat(sender_id, receiver_id).await?;
    let message = state
        .store
        .append_message(chat.id, sender_id, receiver_id, content, kind)
        .await?;
    state.store.update_last_message(chat.id, message.id).await?;
    Ok(message)
}

/// Bulk-mark a conversation read and notify the original sender.
async fn handle_read_messages(
    state: &AppState,
    handle: &ConnectionHandle,
    reader: UserId,
    chat_id: ChatId,
    sender_id: UserId,
) {
    match state.store.mark_read(chat_id, reader).await {
        // Nothing newly read: no receipt to emit.
        Ok(0) => {}
        Ok(flipped) => {
            debug!(chat = %chat_id, reader = %reader, flipped, "Messages read");
            state
                .registry
                .send_to(sender_id, ServerEvent::messages_read(chat_id, reader));
        }
        Err(e) => {
            error!(chat = %chat_id, reader = %reader, error = %e, "Read receipt persistence failed");
            metrics::record_error("persistence");
            handle.send(Arc::new(ServerEvent::error(
                "Read receipt could not be stored, try again",
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::mint_token;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parley_core::{Chat, PresenceRecord};

    const SECRET: &str = "test-secret";

    struct TestClient {
        session: Session,
        handle: ConnectionHandle,
        rx: mpsc::UnboundedReceiver<Delivery>,
    }

    impl TestClient {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = ConnectionId::next();
            Self {
                session: Session::new(id),
                handle: ConnectionHandle::new(id, tx),
                rx,
            }
        }

        /// Drain queued deliveries into plain events.
        fn events(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(delivery) = self.rx.try_recv() {
                if let Delivery::Event(event) = delivery {
                    events.push((*event).clone());
                }
            }
            events
        }
    }

    fn test_state() -> AppState {
        let mut config = Config::default();
        config.auth.secret = SECRET.to_string();
        AppState::new(config)
    }

    async fn authenticate(state: &AppState, client: &mut TestClient, user: UserId) {
        let token = mint_token(SECRET, user, 3600);
        let keep_open = handle_event(
            state,
            &mut client.session,
            &client.handle,
            ClientEvent::Auth { token },
        )
        .await;
        assert!(keep_open);
        assert_eq!(client.session.user(), Some(user));
    }

    #[tokio::test]
    async fn test_message_flow_end_to_end() {
        let state = test_state();
        let user_a = UserId::generate();
        let user_b = UserId::generate();

        let mut alice = TestClient::new();
        let mut bob = TestClient::new();
        authenticate(&state, &mut alice, user_a).await;
        authenticate(&state, &mut bob, user_b).await;
        alice.events();
        bob.events();

        // A sends "hi" to B; the client-side chat id may be stale.
        let keep_open = handle_event(
            &state,
            &mut alice.session,
            &alice.handle,
            ClientEvent::SendMessage {
                chat_id: ChatId::generate(),
                receiver_id: user_b,
                content: "hi".to_string(),
                kind: MessageKind::Text,
            },
        )
        .await;
        assert!(keep_open);

        let bob_events = bob.events();
        let new_message = bob_events
            .iter()
            .find_map(|e| match e {
                ServerEvent::NewMessage(m) => Some(m.clone()),
                _ => None,
            })
            .expect("B receives new_message");
        assert_eq!(new_message.content, "hi");
        assert_eq!(new_message.sender_id, user_a);
        assert!(!new_message.is_read);

        let alice_events = alice.events();
        let sent = alice_events
            .iter()
            .find_map(|e| match e {
                ServerEvent::MessageSent(m) => Some(m.clone()),
                _ => None,
            })
            .expect("A receives message_sent");
        assert_eq!(sent.id, new_message.id);

        // B marks the conversation read; A gets the receipt.
        handle_event(
            &state,
            &mut bob.session,
            &bob.handle,
            ClientEvent::ReadMessages {
                chat_id: new_message.chat_id,
                sender_id: user_a,
            },
        )
        .await;

        let receipt = alice.events();
        assert!(receipt.iter().any(|e| matches!(
            e,
            ServerEvent::MessagesRead { chat_id, reader_id }
                if *chat_id == new_message.chat_id && *reader_id == user_b
        )));

        // History shows the read flag flipped.
        let history = state
            .store
            .list_messages(new_message.chat_id, 10, None)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_read);
        assert!(history[0].read_at.is_some());

        // A second read_messages flips nothing and emits nothing.
        handle_event(
            &state,
            &mut bob.session,
            &bob.handle,
            ClientEvent::ReadMessages {
                chat_id: new_message.chat_id,
                sender_id: user_a,
            },
        )
        .await;
        assert!(alice.events().is_empty());
    }

    #[tokio::test]
    async fn test_presence_broadcast_once_per_transition() {
        let state = test_state();
        let user_a = UserId::generate();
        let watcher = UserId::generate();

        let mut observer = TestClient::new();
        authenticate(&state, &mut observer, watcher).await;
        observer.events();

        // A opens two connections: only the first broadcasts online.
        let mut tab1 = TestClient::new();
        let mut tab2 = TestClient::new();
        authenticate(&state, &mut tab1, user_a).await;
        authenticate(&state, &mut tab2, user_a).await;

        let online: Vec<_> = observer
            .events()
            .into_iter()
            .filter(|e| matches!(
                e,
                ServerEvent::PresenceUpdate { user_id, is_online: true, .. } if *user_id == user_a
            ))
            .collect();
        assert_eq!(online.len(), 1);

        // Closing the first tab leaves A online: no broadcast.
        disconnect(&state, &mut tab1.session).await;
        assert!(observer.events().is_empty());
        assert!(state.registry.is_online(user_a));

        // Closing the last tab broadcasts offline exactly once.
        disconnect(&state, &mut tab2.session).await;
        let offline: Vec<_> = observer
            .events()
            .into_iter()
            .filter(|e| matches!(
                e,
                ServerEvent::PresenceUpdate { user_id, is_online: false, .. } if *user_id == user_a
            ))
            .collect();
        assert_eq!(offline.len(), 1);
        assert!(!state.registry.is_online(user_a));

        // Durable presence followed the transitions.
        let record = state.store.presence(user_a).await.unwrap().unwrap();
        assert!(!record.is_online);
    }

    #[tokio::test]
    async fn test_unauthenticated_events_are_dropped() {
        let state = test_state();
        let mut client = TestClient::new();

        let keep_open = handle_event(
            &state,
            &mut client.session,
            &client.handle,
            ClientEvent::SendMessage {
                chat_id: ChatId::generate(),
                receiver_id: UserId::generate(),
                content: "hi".to_string(),
                kind: MessageKind::Text,
            },
        )
        .await;

        // Dropped silently: connection open, no reply, nothing stored.
        assert!(keep_open);
        assert!(client.events().is_empty());
    }

    #[tokio::test]
    async fn test_auth_failure_retries_then_closes() {
        let state = test_state();
        let mut client = TestClient::new();

        for attempt in 1..=3 {
            let keep_open = handle_event(
                &state,
                &mut client.session,
                &client.handle,
                ClientEvent::Auth {
                    token: "bogus".to_string(),
                },
            )
            .await;
            assert_eq!(keep_open, attempt < 3, "third failure closes");

            let events = client.events();
            assert!(events
                .iter()
                .any(|e| matches!(e, ServerEvent::Error { .. })));
        }

        assert_eq!(client.session.user(), None);
    }

    #[tokio::test]
    async fn test_failed_auth_then_success_still_works() {
        let state = test_state();
        let user = UserId::generate();
        let mut client = TestClient::new();

        handle_event(
            &state,
            &mut client.session,
            &client.handle,
            ClientEvent::Auth {
                token: "bogus".to_string(),
            },
        )
        .await;

        authenticate(&state, &mut client, user).await;
        assert!(state.registry.is_online(user));
    }

    #[tokio::test]
    async fn test_typing_relays_only_to_receiver() {
        let state = test_state();
        let user_a = UserId::generate();
        let user_b = UserId::generate();
        let chat_id = ChatId::generate();

        let mut alice = TestClient::new();
        let mut bob = TestClient::new();
        authenticate(&state, &mut alice, user_a).await;
        authenticate(&state, &mut bob, user_b).await;
        alice.events();
        bob.events();

        handle_event(
            &state,
            &mut alice.session,
            &alice.handle,
            ClientEvent::Typing {
                chat_id,
                receiver_id: user_b,
                is_typing: true,
            },
        )
        .await;

        let bob_events = bob.events();
        assert!(bob_events.iter().any(|e| matches!(
            e,
            ServerEvent::TypingStatus { user_id, is_typing: true, .. } if *user_id == user_a
        )));
        // Not echoed back to the typist.
        assert!(alice.events().is_empty());

        // Typing toward an offline user is silently lost.
        handle_event(
            &state,
            &mut alice.session,
            &alice.handle,
            ClientEvent::Typing {
                chat_id,
                receiver_id: UserId::generate(),
                is_typing: true,
            },
        )
        .await;
        assert!(alice.events().is_empty());
    }

    #[tokio::test]
    async fn test_send_to_offline_receiver_persists_without_error() {
        let state = test_state();
        let user_a = UserId::generate();
        let offline = UserId::generate();

        let mut alice = TestClient::new();
        authenticate(&state, &mut alice, user_a).await;
        alice.events();

        handle_event(
            &state,
            &mut alice.session,
            &alice.handle,
            ClientEvent::SendMessage {
                chat_id: ChatId::generate(),
                receiver_id: offline,
                content: "see you later".to_string(),
                kind: MessageKind::Text,
            },
        )
        .await;

        // Sender still gets the confirmation; no error anywhere.
        let events = alice.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::MessageSent(_))));
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::Error { .. })));

        // The message waits in history for the receiver's next connect.
        let chat = state
            .store
            .find_or_create_chat(user_a, offline)
            .await
            .unwrap();
        assert_eq!(state.store.count_unread(chat.id, offline).await.unwrap(), 1);
    }

    /// Store that fails every write, for persistence-failure paths.
    struct FailingStore;

    #[async_trait]
    impl ConversationStore for FailingStore {
        async fn find_or_create_chat(&self, _: UserId, _: UserId) -> Result<Chat, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn chat(&self, _: ChatId) -> Result<Option<Chat>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn append_message(
            &self,
            _: ChatId,
            _: UserId,
            _: UserId,
            _: String,
            _: MessageKind,
        ) -> Result<Message, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn update_last_message(&self, _: ChatId, _: MessageId) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn list_messages(
            &self,
            _: ChatId,
            _: usize,
            _: Option<MessageId>,
        ) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn mark_read(&self, _: ChatId, _: UserId) -> Result<usize, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn count_unread(&self, _: ChatId, _: UserId) -> Result<usize, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn update_presence(
            &self,
            _: UserId,
            _: bool,
            _: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn presence(&self, _: UserId) -> Result<Option<PresenceRecord>, StoreError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_reports_to_sender_only() {
        let mut config = Config::default();
        config.auth.secret = SECRET.to_string();
        let state = AppState {
            registry: Arc::new(PresenceRegistry::new()),
            store: Arc::new(FailingStore),
            verifier: Arc::new(JwtVerifier::new(SECRET)),
            config,
        };

        let user_a = UserId::generate();
        let user_b = UserId::generate();
        let mut alice = TestClient::new();
        let mut bob = TestClient::new();
        authenticate(&state, &mut alice, user_a).await;
        authenticate(&state, &mut bob, user_b).await;
        alice.events();
        bob.events();

        handle_event(
            &state,
            &mut alice.session,
            &alice.handle,
            ClientEvent::SendMessage {
                chat_id: ChatId::generate(),
                receiver_id: user_b,
                content: "hi".to_string(),
                kind: MessageKind::Text,
            },
        )
        .await;

        // Explicit retryable error to the sender, nothing to the receiver.
        assert!(alice
            .events()
            .iter()
            .any(|e| matches!(e, ServerEvent::Error { .. })));
        assert!(bob.events().is_empty());

        // Read receipts fail the same way.
        handle_event(
            &state,
            &mut bob.session,
            &bob.handle,
            ClientEvent::ReadMessages {
                chat_id: ChatId::generate(),
                sender_id: user_a,
            },
        )
        .await;
        assert!(bob
            .events()
            .iter()
            .any(|e| matches!(e, ServerEvent::Error { .. })));
        assert!(alice.events().is_empty());
    }

    #[tokio::test]
    async fn test_closed_session_drops_everything() {
        let state = test_state();
        let mut client = TestClient::new();
        client.session.close();

        let keep_open = handle_event(
            &state,
            &mut client.session,
            &client.handle,
            ClientEvent::Auth {
                token: "anything".to_string(),
            },
        )
        .await;

        assert!(!keep_open);
        assert!(client.events().is_empty());
    }
}
