//! Session state machine.
//!
//! ```text
//! uninitialized → authenticating → authenticated ⇄ refreshing
//!                        │                 │            │
//!                        └──────→ unauthenticated ←─────┘
//! ```
//!
//! `unauthenticated` is terminal until the next login. The machine only
//! reaches it on a definitive 401 from refresh or an explicit logout;
//! transient failures leave it where it was.

mod bus;

pub use bus::{SessionBus, SessionEvent};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Authenticating,
    Authenticated,
    Refreshing,
    Unauthenticated,
}

impl SessionState {
    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (a, b) if a == b => false,
            (_, Unauthenticated) => true,
            (Uninitialized, Authenticating) => true,
            (Authenticating, Authenticated) => true,
            (Authenticated, Refreshing) => true,
            (Refreshing, Authenticated) => true,
            (Unauthenticated, Authenticating) => true,
            _ => false,
        }
    }

    /// Authenticated for the purpose of issuing requests.
    pub fn is_authenticated(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Refreshing)
    }
}

/// The state machine plus the deliberate-logout marker and the session epoch.
///
/// One per `AppClient`. Transitions are published on the [`SessionBus`].
pub struct Session {
    origin: Uuid,
    state: watch::Sender<SessionState>,
    deliberate_logout: AtomicBool,
    epoch: AtomicU64,
    bus: SessionBus,
}

impl Session {
    pub fn new(bus: SessionBus) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        Self {
            origin: Uuid::new_v4(),
            state,
            deliberate_logout: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            bus,
        }
    }

    /// Identity of this instance on the shared bus.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn bus(&self) -> &SessionBus {
        &self.bus
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every transition.
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    /// Move to `next` if the edge exists. Returns whether the state changed.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut from = next;
        let changed = self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                from = *current;
                *current = next;
                true
            } else {
                false
            }
        });

        if changed {
            let deliberate_logout = self.is_deliberate_logout();
            debug!(from = ?from, to = ?next, deliberate_logout, "Session transition");
            self.bus.publish(SessionEvent::StateChanged {
                origin: self.origin,
                state: next,
                deliberate_logout,
            });
        } else if self.state() != next {
            warn!(from = ?self.state(), to = ?next, "Ignored invalid session transition");
        }
        changed
    }

    /// Counter bumped by every logout. Work started under an older epoch
    /// must not write session state back.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn end_epoch(&self) {
        let ended = self.epoch.fetch_add(1, Ordering::SeqCst);
        debug!(epoch = ended, "Session epoch ended");
    }

    /// Set before any other logout mutation.
    pub fn mark_deliberate_logout(&self) {
        self.deliberate_logout.store(true, Ordering::SeqCst);
    }

    /// Cleared when a new session starts.
    pub fn clear_deliberate_logout(&self) {
        self.deliberate_logout.store(false, Ordering::SeqCst);
    }

    pub fn is_deliberate_logout(&self) -> bool {
        self.deliberate_logout.load(Ordering::SeqCst)
    }

    pub fn publish(&self, event: SessionEvent) {
        self.bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use SessionState::*;
        assert!(Uninitialized.can_transition_to(Authenticating));
        assert!(Authenticating.can_transition_to(Authenticated));
        assert!(Authenticated.can_transition_to(Refreshing));
        assert!(Refreshing.can_transition_to(Authenticated));
        assert!(Refreshing.can_transition_to(Unauthenticated));
        assert!(!Unauthenticated.can_transition_to(Authenticated));

        assert!(!Uninitialized.can_transition_to(Authenticated));
        assert!(!Unauthenticated.can_transition_to(Refreshing));
        assert!(!Authenticating.can_transition_to(Refreshing));
        assert!(!Authenticated.can_transition_to(Authenticated));
    }

    #[test]
    fn test_transition_publishes_state_changed() {
        let bus = SessionBus::default();
        let mut rx = bus.subscribe();
        let session = Session::new(bus);

        assert!(session.transition(SessionState::Authenticating));
        assert_eq!(session.state(), SessionState::Authenticating);

        match rx.try_recv().unwrap() {
            SessionEvent::StateChanged {
                origin,
                state,
                deliberate_logout,
            } => {
                assert_eq!(origin, session.origin());
                assert_eq!(state, SessionState::Authenticating);
                assert!(!deliberate_logout);
            }
            other => panic!("Expected StateChanged, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_transition_is_ignored() {
        let bus = SessionBus::default();
        let mut rx = bus.subscribe();
        let session = Session::new(bus);

        assert!(!session.transition(SessionState::Refreshing));
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_marker_captured_at_transition() {
        let bus = SessionBus::default();
        let session = Session::new(bus.clone());
        session.transition(SessionState::Authenticating);
        session.transition(SessionState::Authenticated);

        let mut rx = bus.subscribe();
        session.mark_deliberate_logout();
        session.transition(SessionState::Unauthenticated);

        match rx.try_recv().unwrap() {
            SessionEvent::StateChanged {
                state,
                deliberate_logout,
                ..
            } => {
                assert_eq!(state, SessionState::Unauthenticated);
                assert!(deliberate_logout);
            }
            other => panic!("Expected StateChanged, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_watch_observes_transitions() {
        let session = Session::new(SessionBus::default());
        let mut rx = session.watch();

        session.transition(SessionState::Authenticating);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Authenticating);
    }
}
