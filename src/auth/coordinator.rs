//! Single-flight refresh coordination.
//!
//! `SessionCoordinator` is the only code path that mutates the access token
//! after login. Every caller that needs a refresh (the request interceptor on
//! a 401, initialization, the realtime channel before connecting) goes
//! through [`SessionCoordinator::refresh`]. While one refresh is in flight,
//! further callers await the same shared future instead of starting another
//! network call, and all of them observe the same outcome.
//!
//! The in-flight refresh is driven by a spawned task, so it completes even if
//! every awaiting caller is dropped. A refresh that outlives a logout finds
//! the session epoch moved and discards its result without touching the
//! token, the marker or the state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::refresh::{RefreshClient, RefreshError, RefreshResponse};
use crate::error::ApiError;
use super::token::TokenStore;
use crate::session::{Session, SessionEvent, SessionState};

type SharedRefresh = Shared<BoxFuture<'static, Result<String, RefreshError>>>;

/// Owns the token and the in-flight refresh slot.
pub struct SessionCoordinator {
    tokens: Arc<TokenStore>,
    refresher: RefreshClient,
    session: Arc<Session>,
    in_flight: Mutex<Option<SharedRefresh>>,
    refresh_calls: AtomicU64,
}

impl SessionCoordinator {
    pub fn new(tokens: Arc<TokenStore>, refresher: RefreshClient, session: Arc<Session>) -> Self {
        Self {
            tokens,
            refresher,
            session,
            in_flight: Mutex::new(None),
            refresh_calls: AtomicU64::new(0),
        }
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Current access token, if any.
    pub fn get_token(&self) -> Option<String> {
        self.tokens.get_token()
    }

    /// Whether a refresh is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        match self.in_flight.lock() {
            Ok(slot) => slot.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Number of refresh operations started by this coordinator (each may
    /// include the policy's retries).
    pub fn refresh_count(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Refresh the access token, joining the in-flight refresh if there is one.
    pub async fn refresh(self: &Arc<Self>) -> Result<String, RefreshError> {
        let shared = {
            let mut slot = match self.in_flight.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Refresh already in flight, joining");
                    existing.clone()
                }
                None => {
                    let this = Arc::clone(self);
                    let fut = async move { this.run_refresh().await }.boxed().shared();
                    *slot = Some(fut.clone());
                    self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(fut.clone());
                    fut
                }
            }
        };
        shared.await
    }

    /// Return a token valid for at least `lead`, refreshing first if needed.
    pub async fn ensure_fresh(self: &Arc<Self>, lead: Duration) -> Result<String, RefreshError> {
        if let Some(token) = self.tokens.get_token() {
            if !self.tokens.expires_within(lead) {
                return Ok(token);
            }
            debug!(
                remaining_secs = ?self.tokens.seconds_remaining(),
                lead_secs = lead.as_secs(),
                "Token expires within lead window, refreshing"
            );
        }
        self.refresh().await
    }

    async fn run_refresh(self: Arc<Self>) -> Result<String, RefreshError> {
        let epoch = self.session.epoch();
        let was_authenticated = self.session.state() == SessionState::Authenticated
            && self.session.transition(SessionState::Refreshing);

        let outcome = self.refresher.refresh().await;
        let result = if self.session.epoch() != epoch {
            debug!(succeeded = outcome.is_ok(), "Session ended during refresh, discarding result");
            Err(RefreshError::Transient(ApiError {
                status: None,
                body: serde_json::Value::Null,
                url: self.refresher.url().to_string(),
                method: "POST".to_string(),
                message: "session ended during refresh".to_string(),
            }))
        } else {
            self.apply_outcome(outcome, was_authenticated)
        };

        let mut slot = match self.in_flight.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
        result
    }

    fn apply_outcome(
        &self,
        outcome: Result<RefreshResponse, RefreshError>,
        was_authenticated: bool,
    ) -> Result<String, RefreshError> {
        match outcome {
            Ok(response) => {
                if let Err(e) = self.tokens.set_token(&response.token) {
                    warn!("Failed to persist refreshed token: {}", e);
                }
                if let Some(ref user_id) = response.user_id {
                    if let Err(e) = self.tokens.set_user_id(user_id) {
                        warn!("Failed to persist session marker: {}", e);
                    }
                }
                if was_authenticated {
                    self.session.transition(SessionState::Authenticated);
                }
                info!(user_id = ?response.user_id, "Access token refreshed");
                self.session.publish(SessionEvent::TokenRefreshed {
                    origin: self.session.origin(),
                    user_id: response.user_id,
                });
                Ok(response.token)
            }
            Err(err) if err.is_rejected() => {
                if let Err(e) = self.tokens.clear() {
                    warn!("Failed to clear rejected token: {}", e);
                }
                warn!("Refresh credential rejected, ending session");
                self.session.publish(SessionEvent::RefreshRejected {
                    origin: self.session.origin(),
                });
                Err(err)
            }
            Err(err) => {
                // Transient: token and marker untouched.
                if was_authenticated {
                    self.session.transition(SessionState::Authenticated);
                }
                Err(err)
            }
        }
    }
}
