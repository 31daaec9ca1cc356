//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{encode, EncodingKey, Header};
use sprintdesk::storage::{MemoryStorage, Storage, TOKEN_KEY, USER_ID_KEY};
use sprintdesk::{AppClient, Config, SessionBus, SessionEvent};
use tokio::sync::broadcast;

/// HS256 token for `user_id`. The client never checks the signature.
pub fn mint_token(user_id: &str, ttl_secs: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = serde_json::json!({
        "sub": user_id,
        "iat": now,
        "exp": now + ttl_secs,
        "iss": "sprintdesk",
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"integration-test-secret-0123456789"),
    )
    .unwrap()
}

/// Config pointing at `api_base_url` with millisecond tunables.
pub fn test_config(api_base_url: &str, ws_base_url: &str) -> Config {
    Config {
        api_base_url: api_base_url.to_string(),
        ws_base_url: ws_base_url.to_string(),
        data_dir: tempfile::tempdir().unwrap().into_path(),
        refresh_401_retry_delay_ms: 10,
        refresh_max_attempts: 3,
        refresh_backoff_base_ms: 10,
        reconnect_base_ms: 20,
        reconnect_max_ms: 100,
        heartbeat_secs: 30,
        request_timeout_secs: 5,
        ..Config::default()
    }
}

/// Storage holding a persisted session for `user_id`.
pub fn seeded_storage(user_id: &str, token: &str) -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    storage.set(TOKEN_KEY, token).unwrap();
    storage.set(USER_ID_KEY, user_id).unwrap();
    storage
}

pub fn client_with(config: Config, storage: Arc<dyn Storage>, bus: SessionBus) -> Arc<AppClient> {
    AppClient::new(config, storage, bus).unwrap()
}

/// Poll `check` every 10ms until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Every event currently buffered in `rx`.
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
