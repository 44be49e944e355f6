//! Liveness monitor.
//!
//! A periodic sweep over every registered connection: each sweep clears
//! the connection's responsive flag and sends a ping; any pong sets the
//! flag again. A connection whose flag is still clear at the next sweep
//! has gone a full interval without answering and is force-closed,
//! which runs the same teardown as a transport-initiated close. This
//! bounds how long a dead TCP connection can occupy a registry slot.

use parley_core::PresenceRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Run the sweep loop forever.
pub async fn run(registry: Arc<PresenceRegistry>, interval_ms: u64) {
    let mut ticker = interval(Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let (pinged, closed) = sweep(&registry);
        if pinged > 0 || closed > 0 {
            debug!(pinged, closed, "Heartbeat sweep");
        }
    }
}

/// One sweep pass. Returns how many connections were pinged and how
/// many were force-closed.
pub fn sweep(registry: &PresenceRegistry) -> (usize, usize) {
    let mut pinged = 0;
    let mut closed = 0;

    for (user, handle) in registry.handles() {
        if handle.take_responsive() {
            handle.ping();
            pinged += 1;
        } else {
            warn!(user = %user, connection = %handle.id(), "Unresponsive connection, closing");
            handle.close();
            closed += 1;
        }
    }

    (pinged, closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{ConnectionHandle, ConnectionId, Delivery};
    use parley_protocol::UserId;
    use tokio::sync::mpsc;

    #[test]
    fn test_sweep_pings_then_closes() {
        let registry = PresenceRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(ConnectionId::next(), tx);
        registry.register(UserId::generate(), handle);

        // Fresh connections answer the first sweep with a ping.
        let (pinged, closed) = sweep(&registry);
        assert_eq!((pinged, closed), (1, 0));
        assert!(matches!(rx.try_recv(), Ok(Delivery::Ping)));

        // No pong arrived: the next sweep closes it.
        let (pinged, closed) = sweep(&registry);
        assert_eq!((pinged, closed), (0, 1));
        assert!(matches!(rx.try_recv(), Ok(Delivery::Close)));
    }

    #[test]
    fn test_pong_keeps_connection_alive() {
        let registry = PresenceRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(ConnectionId::next(), tx);
        registry.register(UserId::generate(), handle.clone());

        for _ in 0..3 {
            let (pinged, closed) = sweep(&registry);
            assert_eq!((pinged, closed), (1, 0));
            assert!(matches!(rx.try_recv(), Ok(Delivery::Ping)));
            // Simulate the client answering.
            handle.mark_responsive();
        }
    }
}
