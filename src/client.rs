//! Application context.
//!
//! `AppClient` owns one of everything: token store, refresh coordinator,
//! REST client, query cache, persister, project selection and realtime
//! channel. Several instances may share a [`SessionBus`] and a [`Storage`],
//! the way browser tabs share local storage.
//!
//! A supervisor task listens on the bus and turns session signals into
//! action:
//!
//! | event | origin | reaction |
//! |---|---|---|
//! | `RefreshRejected` | own | end the session (once) |
//! | `RealtimeAuthFailed` | own | end the session (once) |
//! | `ScopeRevoked` | own | clear the matching selection |
//! | `LoggedOut` | other | local logout, no re-broadcast |

use std::sync::{Arc, LazyLock, Mutex, Weak};

use regex::Regex;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{build_http_client, ApiClient, Message, Project};
use crate::auth::jwt;
use crate::auth::oauth::parse_callback;
use crate::auth::{RefreshClient, RefreshError, SessionCoordinator, TokenStore};
use crate::cache::{CachePersister, QueryCache, QueryKey};
use crate::error::{ClientError, ClientResult};
use crate::realtime::RealtimeChannel;
use crate::selection::SelectedProject;
use crate::session::{Session, SessionBus, SessionEvent, SessionState};
use crate::storage::{FileStorage, Storage};
use crate::Config;

static EMAIL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok());

/// Reject malformed email addresses before any network traffic.
pub fn validate_email(email: &str) -> ClientResult<()> {
    let email = email.trim();
    if EMAIL_RE.as_ref().is_some_and(|re| re.is_match(email)) {
        Ok(())
    } else {
        Err(ClientError::Validation(format!("invalid email address: {email}")))
    }
}

pub struct AppClient {
    config: Config,
    session: Arc<Session>,
    tokens: Arc<TokenStore>,
    coordinator: Arc<SessionCoordinator>,
    api: ApiClient,
    cache: Arc<QueryCache>,
    persister: CachePersister,
    selection: SelectedProject,
    realtime: Arc<RealtimeChannel>,
    /// Serializes login, initialize and logout with persister selection.
    lifecycle: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl AppClient {
    /// Build a client over `storage`, publishing on `bus`. Must be called
    /// inside a tokio runtime (the supervisor is spawned here).
    pub fn new(config: Config, storage: Arc<dyn Storage>, bus: SessionBus) -> anyhow::Result<Arc<Self>> {
        let http = build_http_client(config.request_timeout())?;
        let session = Arc::new(Session::new(bus));
        let tokens = Arc::new(TokenStore::with_buffer(Arc::clone(&storage), config.expiry_buffer()));
        let refresher = RefreshClient::new(http.clone(), &config.api_base_url, config.refresh_policy());
        let coordinator = Arc::new(SessionCoordinator::new(
            Arc::clone(&tokens),
            refresher,
            Arc::clone(&session),
        ));
        let api = ApiClient::new(http, &config.api_base_url, Arc::clone(&coordinator));
        let cache = Arc::new(QueryCache::new(Arc::new(api.clone())));
        let realtime = Arc::new(RealtimeChannel::new(
            config.realtime_config(),
            Arc::clone(&coordinator),
            Arc::clone(&cache),
        ));

        let client = Arc::new(Self {
            persister: CachePersister::new(&config.data_dir),
            selection: SelectedProject::new(storage),
            config,
            session,
            tokens,
            coordinator,
            api,
            cache,
            realtime,
            lifecycle: tokio::sync::Mutex::new(()),
            supervisor: Mutex::new(None),
        });
        client.spawn_supervisor();
        Ok(client)
    }

    /// Client over `session.json` in the configured data directory.
    pub fn open(config: Config) -> anyhow::Result<Arc<Self>> {
        let storage = Arc::new(FileStorage::in_dir(&config.data_dir)?);
        Self::new(config, storage, SessionBus::default())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn bus(&self) -> &SessionBus {
        self.session.bus()
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.coordinator
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn realtime(&self) -> &Arc<RealtimeChannel> {
        &self.realtime
    }

    pub fn selected_project(&self) -> Option<String> {
        self.selection.get()
    }

    pub fn user_id(&self) -> Option<String> {
        self.tokens.user_id()
    }

    // ========================================================================
    // Session start
    // ========================================================================

    /// Restore a persisted session. With a session marker present the token
    /// is refreshed unconditionally; the backend decides whether it is valid.
    pub async fn initialize(&self) -> ClientResult<SessionState> {
        let guard = self.lifecycle.lock().await;
        self.session.transition(SessionState::Authenticating);

        let Some(user_id) = self.tokens.user_id() else {
            self.session.transition(SessionState::Unauthenticated);
            return Ok(SessionState::Unauthenticated);
        };

        self.session.clear_deliberate_logout();
        self.prepare_user(&user_id).await;

        match self.coordinator.refresh().await {
            Ok(_) => {
                self.session.transition(SessionState::Authenticated);
                info!(user_id = %user_id, "Session restored");
                Ok(SessionState::Authenticated)
            }
            Err(RefreshError::Rejected(err)) => {
                drop(guard);
                self.end_session().await;
                Err(ClientError::Unauthenticated(err))
            }
            Err(RefreshError::Transient(err)) => {
                // Keep the persisted token; the caller may retry.
                self.session.transition(SessionState::Authenticated);
                warn!(error = %err, "Session restore refresh failed transiently");
                Err(ClientError::Transient(err))
            }
        }
    }

    /// Email/password login.
    pub async fn login(&self, email: &str, password: &str) -> ClientResult<String> {
        validate_email(email)?;
        if password.is_empty() {
            return Err(ClientError::Validation("password is required".into()));
        }

        let _guard = self.lifecycle.lock().await;
        self.session.transition(SessionState::Authenticating);
        let result = match self.api.login(email.trim(), password).await {
            Ok(response) => self.establish(&response.token, response.user_id).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.session.transition(SessionState::Unauthenticated);
        }
        result
    }

    /// Finish an OAuth redirect. The token must arrive in the URL fragment.
    pub async fn complete_oauth(&self, callback_url: &str) -> ClientResult<String> {
        let callback = parse_callback(callback_url)?;
        let _guard = self.lifecycle.lock().await;
        self.session.transition(SessionState::Authenticating);
        let result = self.establish(&callback.token, callback.user_id).await;
        if result.is_err() {
            self.session.transition(SessionState::Unauthenticated);
        }
        result
    }

    async fn establish(&self, token: &str, user_id: Option<String>) -> ClientResult<String> {
        let user_id = match user_id {
            Some(id) => id,
            None => jwt::read_claims(token)
                .ok()
                .and_then(|c| c.subject().map(str::to_string))
                .ok_or_else(|| ClientError::Validation("token carries no user id".into()))?,
        };

        self.tokens.set_token(token)?;
        self.tokens.set_user_id(&user_id)?;
        self.session.clear_deliberate_logout();
        self.prepare_user(&user_id).await;

        self.session.transition(SessionState::Authenticated);
        self.session.publish(SessionEvent::LoggedIn {
            origin: self.session.origin(),
            user_id: user_id.clone(),
        });
        info!(user_id = %user_id, "Logged in");
        Ok(user_id)
    }

    /// Point per-user state (persisted cache, selection) at `user_id`.
    async fn prepare_user(&self, user_id: &str) {
        self.cache.set_enabled(true);
        self.persister.select(Some(user_id)).await;
        match self.persister.restore(&self.cache).await {
            Ok(0) => {}
            Ok(n) => debug!(entries = n, "Restored persisted cache"),
            Err(e) => warn!(error = %e, "Failed to restore persisted cache"),
        }
        self.selection.load(user_id);
    }

    // ========================================================================
    // Logout
    // ========================================================================

    /// Explicit logout. Tells the backend (best effort) then runs the local
    /// sequence and notifies other instances.
    pub async fn logout(&self) {
        if self.tokens.get_token().is_some() {
            if let Err(e) = self.api.logout_remote().await {
                debug!(error = %e, "Remote logout failed, continuing locally");
            }
        }
        self.run_logout(LogoutCause::Explicit).await;
    }

    /// Non-deliberate end of session (refresh rejected, realtime auth
    /// failure). Runs at most once per session: the first run removes the
    /// session marker the next one looks for.
    async fn end_session(&self) {
        self.run_logout(LogoutCause::SessionEnded).await;
    }

    /// The ordered logout sequence.
    async fn run_logout(&self, cause: LogoutCause) {
        let _guard = self.lifecycle.lock().await;
        let proceed = match cause {
            LogoutCause::Explicit => true,
            LogoutCause::SessionEnded => self.tokens.has_session_marker(),
            LogoutCause::Remote { .. } => self.session.state() != SessionState::Unauthenticated,
        };
        if !proceed {
            debug!(cause = ?cause, "Session already ended");
            return;
        }
        let deliberate = cause.is_deliberate();
        let user_id = self.tokens.user_id();

        // 1
        self.session.end_epoch();
        if deliberate {
            self.session.mark_deliberate_logout();
        }
        // 2
        self.session.transition(SessionState::Unauthenticated);
        // 3
        self.cache.cancel_all();
        // 4
        self.realtime.disconnect();
        // 5
        if let Err(e) = self.selection.clear(None) {
            warn!(error = %e, "Failed to clear selected project");
        }
        // 6
        if let Err(e) = self.tokens.clear_session() {
            warn!(error = %e, "Failed to clear token");
        }
        // 7
        self.cache.clear();
        // 8
        if let Err(e) = self.persister.clear().await {
            warn!(error = %e, "Failed to clear persisted cache");
        }
        // 9
        if !matches!(cause, LogoutCause::Remote { .. }) {
            self.session.publish(SessionEvent::LoggedOut {
                origin: self.session.origin(),
                deliberate,
            });
        }
        info!(user_id = ?user_id, deliberate, "Logged out");
    }

    // ========================================================================
    // Project scope
    // ========================================================================

    /// Select `project_id` for the current user and connect realtime to it.
    pub fn select_project(&self, project_id: &str) -> ClientResult<()> {
        let user_id = self.tokens.user_id().ok_or(ClientError::NotLoggedIn)?;
        self.selection.select(&user_id, project_id)?;
        self.realtime.connect(project_id);
        Ok(())
    }

    /// React to a 403 on `key`: drop that entry and, when it belongs to the
    /// selected project, leave the project. The session is untouched.
    pub fn handle_forbidden(&self, key: &QueryKey) {
        self.cache.remove(key);
        let project_id = match key {
            QueryKey::Project { project_id } => Some(project_id.as_str()),
            other => other.project_scope(),
        };
        if let Some(project_id) = project_id {
            if self.revoke_scope(project_id) {
                self.session.publish(SessionEvent::ScopeRevoked {
                    origin: self.session.origin(),
                    project_id: project_id.to_string(),
                });
            }
        }
    }

    /// Clear the selection if it is `project_id`. Returns whether it was.
    fn revoke_scope(&self, project_id: &str) -> bool {
        if !self.selection.is_selected(project_id) {
            return false;
        }
        let user_id = self.tokens.user_id();
        if let Err(e) = self.selection.clear(user_id.as_deref()) {
            warn!(error = %e, "Failed to clear selected project");
        }
        self.realtime.disconnect();
        self.cache.remove(&QueryKey::Project {
            project_id: project_id.to_string(),
        });
        info!(project_id = %project_id, "Project access revoked");
        true
    }

    // ========================================================================
    // Data
    // ========================================================================

    /// Cached read of `key`. A 403 is handled before the error is returned.
    pub async fn query(&self, key: &QueryKey) -> ClientResult<Value> {
        match self.cache.fetch(key).await {
            Err(ClientError::Forbidden(e)) => {
                self.handle_forbidden(key);
                Err(ClientError::Forbidden(e))
            }
            other => other,
        }
    }

    pub async fn projects(&self) -> ClientResult<Vec<Project>> {
        let user_id = self.tokens.user_id().ok_or(ClientError::NotLoggedIn)?;
        let value = self.query(&QueryKey::Projects { user_id }).await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::Validation(format!("unexpected project list: {e}")))
    }

    /// Post a chat message. The message list is left alone here: the
    /// realtime `message_created` event invalidates and refetches it.
    pub async fn send_message(&self, project_id: &str, body: &str) -> ClientResult<Message> {
        if body.trim().is_empty() {
            return Err(ClientError::Validation("message body is empty".into()));
        }
        self.api.send_message(project_id, body).await
    }

    /// Write the cache for the current user to disk.
    pub async fn persist_cache(&self) -> anyhow::Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.persister.persist(&self.cache).await
    }

    // ========================================================================
    // Supervisor
    // ========================================================================

    fn spawn_supervisor(self: &Arc<Self>) {
        let rx = self.session.bus().subscribe();
        let weak = Arc::downgrade(self);
        let origin = self.session.origin();
        let handle = tokio::spawn(async move {
            supervise(weak, rx, origin).await;
        });
        if let Ok(mut slot) = self.supervisor.lock() {
            *slot = Some(handle);
        }
    }

    async fn on_session_event(&self, event: SessionEvent) {
        let own = event.origin() == self.session.origin();
        match event {
            SessionEvent::RefreshRejected { .. } if own => {
                debug!("Refresh rejected, ending session");
                self.end_session().await;
            }
            SessionEvent::RealtimeAuthFailed { .. } if own => {
                self.end_session().await;
            }
            SessionEvent::ScopeRevoked { ref project_id, .. } if own => {
                self.revoke_scope(project_id);
            }
            SessionEvent::LoggedOut { deliberate, origin } if !own => {
                debug!(from = %origin, "Another instance logged out");
                self.run_logout(LogoutCause::Remote { deliberate }).await;
            }
            _ => {}
        }
    }
}

/// Why the logout sequence runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogoutCause {
    /// The user asked for it.
    Explicit,
    /// The backend ended the session.
    SessionEnded,
    /// Another instance sharing the bus logged out; follow locally without
    /// re-broadcasting.
    Remote { deliberate: bool },
}

impl LogoutCause {
    fn is_deliberate(self) -> bool {
        match self {
            LogoutCause::Explicit => true,
            LogoutCause::SessionEnded => false,
            LogoutCause::Remote { deliberate } => deliberate,
        }
    }
}

impl Drop for AppClient {
    fn drop(&mut self) {
        self.realtime.disconnect();
        if let Ok(mut slot) = self.supervisor.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

async fn supervise(
    weak: Weak<AppClient>,
    mut rx: tokio::sync::broadcast::Receiver<SessionEvent>,
    origin: uuid::Uuid,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Some(client) = weak.upgrade() else {
                    return;
                };
                client.on_session_event(event).await;
            }
            Err(RecvError::Lagged(n)) => {
                warn!(origin = %origin, skipped = n, "Session supervisor lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::tests::mint_token;
    use crate::storage::MemoryStorage;

    fn test_config() -> Config {
        Config {
            api_base_url: "http://127.0.0.1:1".into(),
            ws_base_url: "ws://127.0.0.1:1".into(),
            data_dir: tempfile::tempdir().unwrap().into_path(),
            refresh_401_retry_delay_ms: 1,
            refresh_max_attempts: 1,
            refresh_backoff_base_ms: 1,
            reconnect_base_ms: 5,
            reconnect_max_ms: 20,
            ..Config::default()
        }
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("ada@example.com").is_ok());
        assert!(validate_email(" ada@example.com ").is_ok());
        assert!(matches!(
            validate_email("ada@example"),
            Err(ClientError::Validation(_))
        ));
        assert!(validate_email("not an email").is_err());
    }

    #[tokio::test]
    async fn test_invalid_email_never_touches_session() {
        let client = AppClient::new(test_config(), Arc::new(MemoryStorage::new()), SessionBus::default()).unwrap();
        let err = client.login("nope", "pw").await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert_eq!(client.state(), SessionState::Uninitialized);
    }

    #[tokio::test]
    async fn test_initialize_without_marker_is_unauthenticated() {
        let client = AppClient::new(test_config(), Arc::new(MemoryStorage::new()), SessionBus::default()).unwrap();
        let state = client.initialize().await.unwrap();
        assert_eq!(state, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_oauth_establishes_session_and_forbidden_clears_scope() {
        let client = AppClient::new(test_config(), Arc::new(MemoryStorage::new()), SessionBus::default()).unwrap();
        let token = mint_token("u1", 3600);
        let user = client
            .complete_oauth(&format!("app://callback#token={token}&userID=u1"))
            .await
            .unwrap();
        assert_eq!(user, "u1");
        assert_eq!(client.state(), SessionState::Authenticated);

        client.select_project("P1").unwrap();
        assert_eq!(client.selected_project().as_deref(), Some("P1"));
        let key = QueryKey::Tasks {
            project_id: "P1".into(),
        };
        client.cache().set(key.clone(), serde_json::json!([]));

        client.handle_forbidden(&key);
        assert!(!client.cache().contains(&key));
        assert_eq!(client.selected_project(), None);
        // Authorization failures leave the session alone
        assert_eq!(client.state(), SessionState::Authenticated);
        assert!(client.coordinator().get_token().is_some());
    }

    #[tokio::test]
    async fn test_explicit_logout_marks_deliberate_before_state_flip() {
        let bus = SessionBus::default();
        let client = AppClient::new(test_config(), Arc::new(MemoryStorage::new()), bus.clone()).unwrap();
        let token = mint_token("u1", 3600);
        client
            .complete_oauth(&format!("app://cb#token={token}"))
            .await
            .unwrap();
        let mut rx = bus.subscribe();

        client.run_logout(LogoutCause::Explicit).await;

        let mut saw_state = false;
        let mut saw_logged_out = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::StateChanged {
                    state: SessionState::Unauthenticated,
                    deliberate_logout,
                    ..
                } => {
                    assert!(deliberate_logout);
                    assert!(!saw_logged_out);
                    saw_state = true;
                }
                SessionEvent::LoggedOut { deliberate, .. } => {
                    assert!(deliberate);
                    saw_logged_out = true;
                }
                _ => {}
            }
        }
        assert!(saw_state && saw_logged_out);
        assert!(client.coordinator().get_token().is_none());
        assert!(client.user_id().is_none());
        assert!(!client.cache().is_enabled());
    }
}
