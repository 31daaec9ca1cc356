//! Read-through query cache.
//!
//! Entries never go stale by age. Only explicit invalidation (a realtime
//! event or a mutation) marks an entry stale; the next `fetch` of a stale or
//! missing entry goes to the network. Concurrent fetches of one key share a
//! single request.
//!
//! ## Design
//!
//! - `entries`: `DashMap<QueryKey, CacheEntry>`
//! - `in_flight`: one shared future per key being fetched, tagged with a
//!   fetch id. Only the fetch still registered under its key may write back;
//!   invalidating a key detaches its in-flight fetch.
//! - `observers`: keys currently displayed; `refetch_active` only touches these
//! - `cancel`: parent token of every in-flight fetch, replaced on `cancel_all`

pub mod key;
pub mod persist;

pub use key::QueryKey;
pub use persist::CachePersister;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::ApiClient;
use crate::error::{ClientError, ClientResult};

type SharedFetch = Shared<BoxFuture<'static, ClientResult<Value>>>;

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

/// Loads the data behind a key.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> ClientResult<Value>;
}

#[async_trait]
impl QueryFetcher for ApiClient {
    async fn fetch(&self, key: &QueryKey) -> ClientResult<Value> {
        self.request_json(reqwest::Method::GET, &key.path(), None)
            .await
    }
}

/// One cached value.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub data: Value,
    pub stale: bool,
    pub updated_at: DateTime<Utc>,
}

/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use serde_json::{json, Value};
/// use sprintdesk::cache::{QueryCache, QueryFetcher, QueryKey};
/// use sprintdesk::error::ClientResult;
///
/// struct Fixed;
///
/// #[async_trait::async_trait]
/// impl QueryFetcher for Fixed {
///     async fn fetch(&self, _key: &QueryKey) -> ClientResult<Value> {
///         Ok(json!(["from network"]))
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let cache = Arc::new(QueryCache::new(Arc::new(Fixed)));
/// let key = QueryKey::Tasks { project_id: "P1".into() };
///
/// cache.set(key.clone(), json!(["cached"]));
/// assert_eq!(cache.fetch(&key).await.unwrap(), json!(["cached"]));
/// assert_eq!(cache.network_fetches(), 0);
///
/// // Stale entries go back to the network
/// cache.invalidate(&key);
/// assert_eq!(cache.fetch(&key).await.unwrap(), json!(["from network"]));
/// assert_eq!(cache.network_fetches(), 1);
/// # });
/// ```
pub struct QueryCache {
    entries: DashMap<QueryKey, CacheEntry>,
    in_flight: DashMap<QueryKey, InFlight>,
    next_fetch_id: AtomicU64,
    observers: DashMap<QueryKey, usize>,
    fetcher: Arc<dyn QueryFetcher>,
    cancel: Mutex<CancellationToken>,
    enabled: AtomicBool,
    network_fetches: AtomicU64,
}

impl QueryCache {
    pub fn new(fetcher: Arc<dyn QueryFetcher>) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            next_fetch_id: AtomicU64::new(0),
            observers: DashMap::new(),
            fetcher,
            cancel: Mutex::new(CancellationToken::new()),
            enabled: AtomicBool::new(true),
            network_fetches: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_stale(&self, key: &QueryKey) -> Option<bool> {
        self.entries.get(key).map(|e| e.stale)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Total network fetches issued since creation.
    pub fn network_fetches(&self) -> u64 {
        self.network_fetches.load(Ordering::SeqCst)
    }

    /// Cached data if present and fresh, otherwise fetch it.
    pub async fn fetch(self: &Arc<Self>, key: &QueryKey) -> ClientResult<Value> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.stale {
                return Ok(entry.data.clone());
            }
        }
        self.refetch(key).await
    }

    /// Fetch from the network, joining an in-flight fetch of the same key.
    pub async fn refetch(self: &Arc<Self>, key: &QueryKey) -> ClientResult<Value> {
        if !self.is_enabled() {
            return Err(ClientError::NotLoggedIn);
        }

        let shared = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().fetch.clone(),
            Entry::Vacant(slot) => {
                let this = Arc::clone(self);
                let key = key.clone();
                let id = self.next_fetch_id.fetch_add(1, Ordering::SeqCst);
                let token = self.cancel_token().child_token();
                let fut = async move { this.run_fetch(key, id, token).await }
                    .boxed()
                    .shared();
                slot.insert(InFlight {
                    id,
                    fetch: fut.clone(),
                });
                fut
            }
        };
        shared.await
    }

    async fn run_fetch(
        self: Arc<Self>,
        key: QueryKey,
        id: u64,
        token: CancellationToken,
    ) -> ClientResult<Value> {
        self.network_fetches.fetch_add(1, Ordering::SeqCst);
        debug!(key = %key, "Fetching query");

        let result = tokio::select! {
            result = self.fetcher.fetch(&key) => result,
            _ = token.cancelled() => Err(ClientError::Cancelled),
        };

        // Write back under the in-flight shard lock so an invalidation either
        // detaches this fetch first or marks the fresh entry stale after it.
        let owned = self
            .in_flight
            .remove_if(&key, |_, current| {
                if current.id != id {
                    return false;
                }
                if let Ok(ref data) = result {
                    if !token.is_cancelled() {
                        self.set(key.clone(), data.clone());
                    }
                }
                true
            })
            .is_some();
        if !owned {
            debug!(key = %key, "Discarding detached fetch result");
        }
        result
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store fresh data for `key`.
    pub fn set(&self, key: QueryKey, data: Value) {
        self.entries.insert(
            key,
            CacheEntry {
                data,
                stale: false,
                updated_at: Utc::now(),
            },
        );
    }

    /// Mutate cached data in place (e.g. drop an item from a list).
    pub fn update<F>(&self, key: &QueryKey, f: F) -> bool
    where
        F: FnOnce(&mut Value),
    {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                f(&mut entry.data);
                entry.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Mark one entry stale and detach any fetch of it already in flight.
    /// Returns whether anything was touched.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        let detached = self.in_flight.remove(key).is_some();
        let marked = match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.stale = true;
                true
            }
            None => false,
        };
        detached || marked
    }

    /// Mark every matching entry stale and return the keys touched.
    pub fn invalidate_where<P>(&self, predicate: P) -> Vec<QueryKey>
    where
        P: Fn(&QueryKey) -> bool,
    {
        let mut touched = self.detach_where(&predicate);
        for mut entry in self.entries.iter_mut() {
            if predicate(entry.key()) {
                entry.stale = true;
                if !touched.contains(entry.key()) {
                    touched.push(entry.key().clone());
                }
            }
        }
        touched
    }

    fn detach_where<P>(&self, predicate: &P) -> Vec<QueryKey>
    where
        P: Fn(&QueryKey) -> bool,
    {
        let keys: Vec<QueryKey> = self
            .in_flight
            .iter()
            .filter(|f| predicate(f.key()))
            .map(|f| f.key().clone())
            .collect();
        for key in &keys {
            self.in_flight.remove(key);
        }
        keys
    }

    /// Drop one entry outright.
    pub fn remove(&self, key: &QueryKey) -> bool {
        self.in_flight.remove(key);
        self.entries.remove(key).is_some()
    }

    /// Drop every matching entry and return the keys removed.
    pub fn remove_where<P>(&self, predicate: P) -> Vec<QueryKey>
    where
        P: Fn(&QueryKey) -> bool,
    {
        self.detach_where(&predicate);
        let keys: Vec<QueryKey> = self
            .entries
            .iter()
            .filter(|e| predicate(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }
        keys
    }

    /// Refetch the given keys that are currently observed. Returns how many
    /// refetches were issued.
    pub async fn refetch_active(self: &Arc<Self>, keys: &[QueryKey]) -> usize {
        let active: Vec<&QueryKey> = keys.iter().filter(|k| self.is_observed(k)).collect();
        let count = active.len();
        let results = join_all(active.into_iter().map(|k| self.refetch(k))).await;
        for result in results {
            if let Err(e) = result {
                debug!(error = %e, "Active refetch failed");
            }
        }
        count
    }

    /// Refetch the given keys regardless of observers.
    pub async fn refetch_now(self: &Arc<Self>, keys: &[QueryKey]) {
        let results = join_all(keys.iter().map(|k| self.refetch(k))).await;
        for result in results {
            if let Err(e) = result {
                debug!(error = %e, "Forced refetch failed");
            }
        }
    }

    // ========================================================================
    // Observers ("currently displayed")
    // ========================================================================

    /// Register interest in `key` for as long as the guard lives.
    pub fn observe(self: &Arc<Self>, key: QueryKey) -> QueryObserver {
        *self.observers.entry(key.clone()).or_insert(0) += 1;
        QueryObserver {
            cache: Arc::clone(self),
            key,
        }
    }

    pub fn is_observed(&self, key: &QueryKey) -> bool {
        self.observers.get(key).is_some_and(|n| *n > 0)
    }

    fn release(&self, key: &QueryKey) {
        if let Entry::Occupied(mut count) = self.observers.entry(key.clone()) {
            *count.get_mut() = count.get().saturating_sub(1);
            if *count.get() == 0 {
                count.remove();
            }
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Queries are disabled while logged out.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn cancel_token(&self) -> CancellationToken {
        match self.cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Disable queries and cancel every in-flight fetch.
    pub fn cancel_all(&self) {
        self.set_enabled(false);
        let previous = match self.cancel.lock() {
            Ok(mut token) => std::mem::replace(&mut *token, CancellationToken::new()),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), CancellationToken::new()),
        };
        previous.cancel();
        let cancelled = self.in_flight.len();
        self.in_flight.clear();
        debug!(cancelled, "Cancelled in-flight queries");
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// All entries, for persistence.
    pub fn snapshot(&self) -> Vec<(QueryKey, Value)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().data.clone()))
            .collect()
    }

    /// Load persisted entries. They are marked stale so the first fetch
    /// revalidates them; `get` still returns them immediately.
    pub fn restore(&self, entries: Vec<(QueryKey, Value)>) {
        for (key, data) in entries {
            self.entries.insert(
                key,
                CacheEntry {
                    data,
                    stale: true,
                    updated_at: Utc::now(),
                },
            );
        }
    }
}

/// Keeps a key "displayed" until dropped.
pub struct QueryObserver {
    cache: Arc<QueryCache>,
    key: QueryKey,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}
