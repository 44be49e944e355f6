//! Per-connection session state machine.
//!
//! A session moves Unauthenticated -> Authenticated -> Closed. There is
//! no transition out of Closed, and a failed authentication leaves the
//! session Unauthenticated and usable for retry up to the configured
//! attempt cap.

use parley_core::ConnectionId;
use parley_protocol::UserId;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial state; only `auth` events are accepted.
    Unauthenticated {
        /// Consecutive failed auth attempts so far.
        failed_attempts: u32,
    },
    /// Bound to a user; chat events are accepted.
    Authenticated(UserId),
    /// Terminal; every event is dropped.
    Closed,
}

/// Outcome of a failed authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAttempt {
    /// The connection stays open for another try.
    Retry,
    /// The attempt cap is reached; force-close the connection.
    Exhausted,
}

/// State for one transport connection.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    state: SessionState,
}

impl Session {
    /// Create a session in the Unauthenticated state.
    #[must_use]
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: SessionState::Unauthenticated { failed_attempts: 0 },
        }
    }

    /// The connection this session wraps.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The bound user, if authenticated.
    #[must_use]
    pub fn user(&self) -> Option<UserId> {
        match self.state {
            SessionState::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    /// Whether the session has reached its terminal state.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Bind the session to a user identity.
    ///
    /// Only valid from Unauthenticated; anything else is a no-op
    /// returning `false`.
    pub fn authenticate(&mut self, user: UserId) -> bool {
        match self.state {
            SessionState::Unauthenticated { .. } => {
                self.state = SessionState::Authenticated(user);
                true
            }
            _ => false,
        }
    }

    /// Record a failed auth attempt against the cap.
    pub fn record_auth_failure(&mut self, max_attempts: u32) -> AuthAttempt {
        match &mut self.state {
            SessionState::Unauthenticated { failed_attempts } => {
                *failed_attempts += 1;
                if *failed_attempts >= max_attempts {
                    AuthAttempt::Exhausted
                } else {
                    AuthAttempt::Retry
                }
            }
            // Failures only count while unauthenticated.
            _ => AuthAttempt::Retry,
        }
    }

    /// Enter the terminal state, returning the user that was bound, if
    /// any. Idempotent: a second close returns `None`.
    pub fn close(&mut self) -> Option<UserId> {
        let user = self.user();
        self.state = SessionState::Closed;
        user
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(ConnectionId::next())
    }

    #[test]
    fn test_initial_state() {
        let session = session();
        assert_eq!(session.user(), None);
        assert!(!session.is_closed());
    }

    #[test]
    fn test_authenticate_binds_once() {
        let mut session = session();
        let user = UserId::generate();

        assert!(session.authenticate(user));
        assert_eq!(session.user(), Some(user));

        // Re-authentication is rejected.
        assert!(!session.authenticate(UserId::generate()));
        assert_eq!(session.user(), Some(user));
    }

    #[test]
    fn test_auth_failures_hit_the_cap() {
        let mut session = session();

        assert_eq!(session.record_auth_failure(3), AuthAttempt::Retry);
        assert_eq!(session.record_auth_failure(3), AuthAttempt::Retry);
        assert_eq!(session.record_auth_failure(3), AuthAttempt::Exhausted);
    }

    #[test]
    fn test_close_is_terminal() {
        let mut session = session();
        let user = UserId::generate();
        session.authenticate(user);

        assert_eq!(session.close(), Some(user));
        assert!(session.is_closed());
        // No transition out of Closed.
        assert_eq!(session.close(), None);
        assert!(!session.authenticate(UserId::generate()));
        assert_eq!(session.user(), None);
    }

    #[test]
    fn test_close_unauthenticated() {
        let mut session = session();
        assert_eq!(session.close(), None);
        assert!(session.is_closed());
    }
}
