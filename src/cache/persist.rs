//! Per-user cache persistence.
//!
//! The cache is written to `cache-{user}.json` under the data directory so a
//! restart can show the last known data while revalidating. One file per user:
//! switching accounts never exposes another user's cached data.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{QueryCache, QueryKey};

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: QueryKey,
    data: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedCache {
    user_id: String,
    entries: Vec<PersistedEntry>,
}

pub struct CachePersister {
    dir: PathBuf,
    user: Mutex<Option<String>>,
}

impl CachePersister {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            user: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `user_id`'s cache.
    pub fn path_for(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("cache-{}.json", sanitize(user_id)))
    }

    /// Point persistence at `user_id`, or at nobody.
    pub async fn select(&self, user_id: Option<&str>) {
        *self.user.lock().await = user_id.map(str::to_string);
    }

    pub async fn selected(&self) -> Option<String> {
        self.user.lock().await.clone()
    }

    /// Write the cache for the selected user. No-op when nobody is selected.
    pub async fn persist(&self, cache: &QueryCache) -> Result<()> {
        let guard = self.user.lock().await;
        let Some(user_id) = guard.as_deref() else {
            return Ok(());
        };

        let snapshot = PersistedCache {
            user_id: user_id.to_string(),
            entries: cache
                .snapshot()
                .into_iter()
                .map(|(key, data)| PersistedEntry { key, data })
                .collect(),
        };
        let count = snapshot.entries.len();
        let json = serde_json::to_vec(&snapshot).context("Failed to serialize cache")?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path_for(user_id);
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        debug!(user_id, entries = count, "Persisted query cache");
        Ok(())
    }

    /// Load the selected user's cache into `cache`. Returns the number of
    /// entries restored. A corrupt or foreign file is ignored.
    pub async fn restore(&self, cache: &QueryCache) -> Result<usize> {
        let guard = self.user.lock().await;
        let Some(user_id) = guard.as_deref() else {
            return Ok(0);
        };

        let path = self.path_for(user_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let persisted: PersistedCache = match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Discarding corrupt cache file");
                return Ok(0);
            }
        };
        if persisted.user_id != user_id {
            warn!(path = %path.display(), "Cache file belongs to another user, ignoring");
            return Ok(0);
        }

        let count = persisted.entries.len();
        cache.restore(
            persisted
                .entries
                .into_iter()
                .map(|e| (e.key, e.data))
                .collect(),
        );
        debug!(user_id, entries = count, "Restored query cache");
        Ok(count)
    }

    /// Delete the selected user's file and deselect.
    pub async fn clear(&self) -> Result<()> {
        let mut guard = self.user.lock().await;
        if let Some(user_id) = guard.take() {
            let path = self.path_for(&user_id);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
                }
            }
            debug!(user_id, "Cleared persisted cache");
        }
        Ok(())
    }
}

fn sanitize(user_id: &str) -> String {
    user_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
