//! Session event bus.
//!
//! An explicit broadcast subject for everything session-dependent code reacts
//! to: state transitions, login/logout, refresh outcomes, scope revocation.
//! Several `AppClient` instances may share one bus; each event carries the
//! publisher's `origin` so a listener can tell its own events from another
//! instance's (the "other tab" case).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::SessionState;

/// Default broadcast channel capacity
const DEFAULT_CAPACITY: usize = 256;

/// Event published on the session bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The state machine moved. `deliberate_logout` is the marker value at
    /// the moment of the transition.
    StateChanged {
        origin: Uuid,
        state: SessionState,
        deliberate_logout: bool,
    },
    LoggedIn {
        origin: Uuid,
        user_id: String,
    },
    /// Terminal. Other instances sharing the bus follow with a local logout.
    LoggedOut {
        origin: Uuid,
        deliberate: bool,
    },
    TokenRefreshed {
        origin: Uuid,
        user_id: Option<String>,
    },
    /// The refresh credential was rejected; the session must end.
    RefreshRejected {
        origin: Uuid,
    },
    /// Access to a project was withdrawn (403 or realtime forbidden close).
    ScopeRevoked {
        origin: Uuid,
        project_id: String,
    },
    /// The realtime channel was closed for authentication reasons.
    RealtimeAuthFailed {
        origin: Uuid,
    },
}

impl SessionEvent {
    pub fn origin(&self) -> Uuid {
        match self {
            SessionEvent::StateChanged { origin, .. }
            | SessionEvent::LoggedIn { origin, .. }
            | SessionEvent::LoggedOut { origin, .. }
            | SessionEvent::TokenRefreshed { origin, .. }
            | SessionEvent::RefreshRejected { origin }
            | SessionEvent::ScopeRevoked { origin, .. }
            | SessionEvent::RealtimeAuthFailed { origin } => *origin,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SessionEvent::StateChanged { .. } => "state_changed",
            SessionEvent::LoggedIn { .. } => "logged_in",
            SessionEvent::LoggedOut { .. } => "logged_out",
            SessionEvent::TokenRefreshed { .. } => "token_refreshed",
            SessionEvent::RefreshRejected { .. } => "refresh_rejected",
            SessionEvent::ScopeRevoked { .. } => "scope_revoked",
            SessionEvent::RealtimeAuthFailed { .. } => "realtime_auth_failed",
        }
    }
}

/// Broadcast channel for [`SessionEvent`]s.
///
/// Fire-and-forget: publishing never blocks, never panics.
/// If no subscribers are connected, events are silently dropped.
#[derive(Debug, Clone)]
pub struct SessionBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl SessionBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: SessionEvent) {
        let kind = event.kind();
        let origin = event.origin();
        if let Ok(n) = self.sender.send(event) {
            debug!(event = kind, origin = %origin, subscribers = n, "SessionEvent published");
        }
    }
}

impl Default for SessionBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
