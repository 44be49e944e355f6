//! Presence registry for the Parley relay.
//!
//! The registry is the source of truth for "is this user currently
//! reachable": it maps each user identity to the set of live,
//! authenticated connections. One user may hold several connections at
//! once (multiple tabs or devices).

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::{ServerEvent, UserId};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Counter backing [`ConnectionId::next`].
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next connection ID.
    #[must_use]
    pub fn next() -> Self {
        Self(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A command delivered to a connection's writer task.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Push a server event to the client.
    Event(Arc<ServerEvent>),
    /// Send a transport-level ping.
    Ping,
    /// Tear the connection down.
    Close,
}

/// Handle to one live connection, as held by the registry.
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<Delivery>,
    /// Liveness flag for the heartbeat sweep. Any pong sets it; each
    /// sweep clears it.
    responsive: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Create a handle around a connection's outbound queue.
    #[must_use]
    pub fn new(id: ConnectionId, sender: mpsc::UnboundedSender<Delivery>) -> Self {
        Self {
            id,
            sender,
            responsive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// This connection's identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an event for delivery.
    ///
    /// Returns `false` if the connection is mid-teardown; delivery is
    /// best effort and a dropped send is not an error.
    pub fn send(&self, event: Arc<ServerEvent>) -> bool {
        self.sender.send(Delivery::Event(event)).is_ok()
    }

    /// Queue a transport ping.
    pub fn ping(&self) -> bool {
        self.sender.send(Delivery::Ping).is_ok()
    }

    /// Ask the connection's task to close.
    pub fn close(&self) {
        let _ = self.sender.send(Delivery::Close);
    }

    /// Mark the connection responsive (a pong arrived).
    pub fn mark_responsive(&self) {
        self.responsive.store(true, Ordering::Relaxed);
    }

    /// Clear the responsive flag, returning its previous value.
    ///
    /// The heartbeat sweep calls this once per interval; a connection
    /// that was already cleared has missed a full interval.
    pub fn take_responsive(&self) -> bool {
        self.responsive.swap(false, Ordering::Relaxed)
    }
}

/// Registry of live connections per user.
///
/// All mutation happens under the per-user entry lock, so concurrent
/// connects and disconnects for the same user cannot lose updates, and
/// the first/last transition answers are exact. No operation performs
/// I/O while holding a lock; event delivery only queues onto unbounded
/// channels.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: DashMap<UserId, Vec<ConnectionHandle>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated connection for a user.
    ///
    /// Returns `true` iff this was the user's first live connection,
    /// which is exactly when a presence-online broadcast is due.
    pub fn register(&self, user: UserId, handle: ConnectionHandle) -> bool {
        let mut entry = self.entries.entry(user).or_default();
        let first = entry.is_empty();
        // Re-registration of the same connection replaces the old handle.
        entry.retain(|h| h.id != handle.id);
        entry.push(handle);

        debug!(user = %user, connections = entry.len(), "Connection registered");
        first
    }

    /// Remove one connection from a user's set.
    ///
    /// Returns `true` iff the set became empty and the entry was
    /// removed, which is exactly when a presence-offline broadcast is
    /// due. Unknown users and already-removed connections return
    /// `false`.
    pub fn deregister(&self, user: UserId, connection: ConnectionId) -> bool {
        match self.entries.entry(user) {
            Entry::Occupied(mut occupied) => {
                let before = occupied.get().len();
                occupied.get_mut().retain(|h| h.id != connection);
                let removed = occupied.get().len() < before;

                if removed {
                    debug!(
                        user = %user,
                        connections = occupied.get().len(),
                        "Connection deregistered"
                    );
                }

                if removed && occupied.get().is_empty() {
                    occupied.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    /// Resolve a user's live connections for fan-out.
    ///
    /// Returns a consistent snapshot; an offline user yields an empty
    /// vector, never an error.
    #[must_use]
    pub fn resolve(&self, user: UserId) -> Vec<ConnectionHandle> {
        self.entries
            .get(&user)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Whether the user has at least one live connection.
    #[must_use]
    pub fn is_online(&self, user: UserId) -> bool {
        self.entries.contains_key(&user)
    }

    /// Deliver an event to every connection of one user.
    ///
    /// Returns the number of connections reached. Zero is a silent
    /// no-op: best-effort delivery.
    pub fn send_to(&self, user: UserId, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let handles = self.resolve(user);
        let mut delivered = 0;
        for handle in &handles {
            if handle.send(Arc::clone(&event)) {
                delivered += 1;
            }
        }
        trace!(user = %user, delivered, "Fan-out");
        delivered
    }

    /// Deliver an event to every registered connection of every user.
    ///
    /// O(total connections); used for presence updates, which any
    /// online user may be watching.
    pub fn broadcast_all(&self, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        for entry in self.entries.iter() {
            for handle in entry.value() {
                if handle.send(Arc::clone(&event)) {
                    delivered += 1;
                }
            }
        }
        trace!(delivered, "Broadcast");
        delivered
    }

    /// Snapshot of every live connection handle, for the heartbeat
    /// sweep.
    #[must_use]
    pub fn handles(&self) -> Vec<(UserId, ConnectionHandle)> {
        self.entries
            .iter()
            .flat_map(|entry| {
                let user = *entry.key();
                entry.value().iter().cloned().map(move |h| (user, h)).collect::<Vec<_>>()
            })
            .collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            online_users: self.entries.len(),
            connections: self.entries.iter().map(|e| e.len()).sum(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    /// Number of users with at least one live connection.
    pub online_users: usize,
    /// Total live connections across all users.
    pub connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(ConnectionId::next(), tx), rx)
    }

    #[test]
    fn test_register_first_and_last() {
        let registry = PresenceRegistry::new();
        let user = UserId::generate();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();
        let (id1, id2) = (h1.id(), h2.id());

        assert!(registry.register(user, h1));
        assert!(!registry.register(user, h2));
        assert!(registry.is_online(user));

        assert!(!registry.deregister(user, id1));
        assert!(registry.deregister(user, id2));
        assert!(!registry.is_online(user));
    }

    #[test]
    fn test_deregister_unknown_is_noop() {
        let registry = PresenceRegistry::new();
        let user = UserId::generate();

        assert!(!registry.deregister(user, ConnectionId::next()));

        let (h, _rx) = handle();
        registry.register(user, h.clone());
        // Same connection twice: second removal must not fire offline again.
        assert!(registry.deregister(user, h.id()));
        assert!(!registry.deregister(user, h.id()));
    }

    #[test]
    fn test_resolve_offline_user_is_empty() {
        let registry = PresenceRegistry::new();
        assert!(registry.resolve(UserId::generate()).is_empty());
        assert_eq!(registry.send_to(UserId::generate(), ServerEvent::error("x")), 0);
    }

    #[test]
    fn test_send_to_reaches_all_connections() {
        let registry = PresenceRegistry::new();
        let user = UserId::generate();
        let (h1, mut rx1) = handle();
        let (h2, mut rx2) = handle();
        registry.register(user, h1);
        registry.register(user, h2);

        let delivered = registry.send_to(user, ServerEvent::error("boom"));
        assert_eq!(delivered, 2);
        assert!(matches!(rx1.try_recv(), Ok(Delivery::Event(_))));
        assert!(matches!(rx2.try_recv(), Ok(Delivery::Event(_))));
    }

    #[test]
    fn test_broadcast_all_spans_users() {
        let registry = PresenceRegistry::new();
        let (h1, mut rx1) = handle();
        let (h2, mut rx2) = handle();
        registry.register(UserId::generate(), h1);
        registry.register(UserId::generate(), h2);

        let delivered = registry.broadcast_all(ServerEvent::error("notice"));
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_responsive_flag() {
        let (h, _rx) = handle();
        assert!(h.take_responsive());
        assert!(!h.take_responsive());
        h.mark_responsive();
        assert!(h.take_responsive());
    }

    #[test]
    fn test_stats() {
        let registry = PresenceRegistry::new();
        let user = UserId::generate();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();
        let (h3, _rx3) = handle();
        registry.register(user, h1);
        registry.register(user, h2);
        registry.register(UserId::generate(), h3);

        let stats = registry.stats();
        assert_eq!(stats.online_users, 2);
        assert_eq!(stats.connections, 3);
    }

    #[tokio::test]
    async fn test_concurrent_register_deregister_is_exact() {
        let registry = Arc::new(PresenceRegistry::new());
        let user = UserId::generate();

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::unbounded_channel();
                let handle = ConnectionHandle::new(ConnectionId::next(), tx);
                let id = handle.id();
                let first = registry.register(user, handle);
                let last = registry.deregister(user, id);
                (first, last)
            }));
        }

        let mut firsts = 0;
        let mut lasts = 0;
        for task in tasks {
            let (first, last) = task.await.unwrap();
            firsts += usize::from(first);
            lasts += usize::from(last);
        }

        // Every zero->one transition is matched by a one->zero one.
        assert_eq!(firsts, lasts);
        assert!(firsts >= 1);
        assert!(!registry.is_online(user));
    }
}
