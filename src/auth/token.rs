//! Access token lifecycle: memory first, persisted storage as fallback.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use super::jwt;
use crate::storage::{Storage, StorageError, TOKEN_EXPIRY_KEY, TOKEN_KEY, USER_ID_KEY};

/// Safety margin applied by [`TokenStore::is_expired`].
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(30);

/// Holds the access token and its expiry.
///
/// The expiry always comes from the token's own `exp` claim, never from a
/// locally computed "issued + lifetime" timestamp.
pub struct TokenStore {
    storage: Arc<dyn Storage>,
    memory: RwLock<Option<String>>,
    expiry_buffer: Duration,
}

impl TokenStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_buffer(storage, DEFAULT_EXPIRY_BUFFER)
    }

    pub fn with_buffer(storage: Arc<dyn Storage>, expiry_buffer: Duration) -> Self {
        Self {
            storage,
            memory: RwLock::new(None),
            expiry_buffer,
        }
    }

    /// Current token: the in-memory copy, else the persisted one.
    pub fn get_token(&self) -> Option<String> {
        if let Some(token) = self.memory.read().ok().and_then(|m| m.clone()) {
            return Some(token);
        }
        let persisted = self.storage.get(TOKEN_KEY)?;
        if let Ok(mut memory) = self.memory.write() {
            *memory = Some(persisted.clone());
        }
        Some(persisted)
    }

    /// Store a new token in memory and persisted storage, and persist the
    /// expiry read from its `exp` claim.
    pub fn set_token(&self, token: &str) -> Result<(), StorageError> {
        if let Ok(mut memory) = self.memory.write() {
            *memory = Some(token.to_string());
        }
        self.storage.set(TOKEN_KEY, token)?;

        match jwt::expiry_of(token) {
            Some(exp) => {
                self.storage.set(TOKEN_EXPIRY_KEY, &exp.to_string())?;
                debug!(expires_at = exp, "Access token stored");
            }
            None => {
                // No exp claim: reads as expired.
                warn!("Access token has no readable exp claim");
                self.storage.remove(TOKEN_EXPIRY_KEY)?;
            }
        }
        Ok(())
    }

    /// Stored expiry (unix seconds).
    pub fn expiry(&self) -> Option<i64> {
        self.storage
            .get(TOKEN_EXPIRY_KEY)
            .and_then(|raw| raw.parse().ok())
    }

    /// True when `now + buffer` is past the stored expiry, or when no expiry
    /// is known.
    pub fn is_expired(&self) -> bool {
        self.expires_within(self.expiry_buffer)
    }

    /// True when the token expires within `window` from now.
    pub fn expires_within(&self, window: Duration) -> bool {
        match self.expiry() {
            Some(exp) => chrono::Utc::now().timestamp() + window.as_secs() as i64 >= exp,
            None => true,
        }
    }

    /// Seconds until expiry, negative once expired.
    pub fn seconds_remaining(&self) -> Option<i64> {
        self.expiry()
            .map(|exp| exp - chrono::Utc::now().timestamp())
    }

    /// Session marker: the user id of the current session.
    pub fn user_id(&self) -> Option<String> {
        self.storage.get(USER_ID_KEY)
    }

    pub fn set_user_id(&self, user_id: &str) -> Result<(), StorageError> {
        self.storage.set(USER_ID_KEY, user_id)
    }

    pub fn has_session_marker(&self) -> bool {
        self.user_id().is_some()
    }

    /// Drop the token and its expiry. The session marker is kept; callers
    /// ending the session remove it with [`TokenStore::clear_session`].
    pub fn clear(&self) -> Result<(), StorageError> {
        if let Ok(mut memory) = self.memory.write() {
            *memory = None;
        }
        self.storage.remove(TOKEN_KEY)?;
        self.storage.remove(TOKEN_EXPIRY_KEY)
    }

    /// Drop the token, its expiry and the session marker.
    pub fn clear_session(&self) -> Result<(), StorageError> {
        self.clear()?;
        self.storage.remove(USER_ID_KEY)
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::tests::mint_token;
    use crate::storage::MemoryStorage;

    fn store() -> (Arc<MemoryStorage>, TokenStore) {
        let storage = Arc::new(MemoryStorage::new());
        let tokens = TokenStore::new(storage.clone());
        (storage, tokens)
    }

    #[test]
    fn test_get_token_falls_back_to_storage() {
        let (storage, tokens) = store();
        assert!(tokens.get_token().is_none());

        storage.set(TOKEN_KEY, "persisted").unwrap();
        assert_eq!(tokens.get_token().as_deref(), Some("persisted"));
    }

    #[test]
    fn test_set_token_persists_claim_expiry() {
        let (storage, tokens) = store();
        let token = mint_token("u1", 3600);
        tokens.set_token(&token).unwrap();

        assert_eq!(storage.get(TOKEN_KEY).as_deref(), Some(token.as_str()));
        let exp = tokens.expiry().unwrap();
        assert_eq!(Some(exp), jwt::expiry_of(&token));
        assert!(!tokens.is_expired());
    }

    #[test]
    fn test_is_expired_applies_buffer() {
        let (_storage, tokens) = store();
        // Expires in 10s, inside the 30s buffer
        tokens.set_token(&mint_token("u1", 10)).unwrap();
        assert!(tokens.is_expired());

        tokens.set_token(&mint_token("u1", 120)).unwrap();
        assert!(!tokens.is_expired());
        assert!(tokens.expires_within(Duration::from_secs(600)));
        assert!(!tokens.expires_within(Duration::from_secs(60)));
    }

    #[test]
    fn test_unreadable_token_counts_as_expired() {
        let (_storage, tokens) = store();
        tokens.set_token("opaque-token").unwrap();
        assert_eq!(tokens.get_token().as_deref(), Some("opaque-token"));
        assert!(tokens.expiry().is_none());
        assert!(tokens.is_expired());
    }

    #[test]
    fn test_clear_keeps_marker_clear_session_drops_it() {
        let (_storage, tokens) = store();
        tokens.set_token(&mint_token("u1", 3600)).unwrap();
        tokens.set_user_id("u1").unwrap();

        tokens.clear().unwrap();
        assert!(tokens.get_token().is_none());
        assert!(tokens.has_session_marker());

        tokens.clear_session().unwrap();
        assert!(!tokens.has_session_marker());
    }
}
