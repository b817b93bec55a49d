//! Optimistic updates and their reconciliation with server results.
//!
//! A [`Reconciler`] owns the bookkeeping for one cached query: which temp ids
//! are still in flight, which failed, and which server id each one became.
//! The cached items themselves live in the shared [`QueryCache`].

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheItem, CachedItem, QueryCache, SyncStatus};
use crate::error::{truncate_utf8_safe, ConfigError, ValidationError};
use crate::ids::{ServerId, TempId};
use crate::time::{Clock, SystemClock, UnixTimeMs};

const MAX_ERROR_BYTES: usize = 512;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
    /// How long a reconciled temp id stays resolvable for late duplicates.
    pub grace_period_ms: u64,
    /// Number of removed temp ids remembered so late results stay dropped.
    pub tombstone_capacity: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
            tombstone_capacity: 1_024,
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tombstone_capacity == 0 {
            return Err(ConfigError::Invalid(
                "tombstone_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct ReconciliationRecord {
    status: SyncStatus,
    last_error: Option<String>,
    server_id: Option<ServerId>,
    purge_after: Option<UnixTimeMs>,
}

struct ReconcilerState {
    records: HashMap<TempId, ReconciliationRecord>,
    tombstones: LruCache<TempId, UnixTimeMs>,
}

pub struct Reconciler<T: CacheItem> {
    cache: Arc<QueryCache<T>>,
    query: String,
    config: ReconcileConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<ReconcilerState>,
}

impl<T: CacheItem> Reconciler<T> {
    pub fn new(cache: Arc<QueryCache<T>>, query: impl Into<String>) -> Self {
        Self::with_config(cache, query, ReconcileConfig::default(), Arc::new(SystemClock))
    }

    pub fn with_config(
        cache: Arc<QueryCache<T>>,
        query: impl Into<String>,
        config: ReconcileConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.tombstone_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache,
            query: query.into(),
            config,
            clock,
            state: Mutex::new(ReconcilerState {
                records: HashMap::new(),
                tombstones: LruCache::new(capacity),
            }),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn cache(&self) -> &Arc<QueryCache<T>> {
        &self.cache
    }

    fn lock(&self) -> MutexGuard<'_, ReconcilerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn purge_expired(state: &mut ReconcilerState, now: UnixTimeMs) -> usize {
        let before = state.records.len();
        state
            .records
            .retain(|_, record| record.purge_after.map_or(true, |at| now < at));
        before - state.records.len()
    }

    /// Drops bookkeeping for reconciled writes whose grace period elapsed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let purged = Self::purge_expired(&mut self.lock(), now);
        if purged > 0 {
            debug!(purged, query = %self.query, "reconciled records purged");
        }
        purged
    }

    /// Shows `item` immediately, flagged as optimistic and sending.
    ///
    /// The item's own id is its temp id.
    #[instrument(skip(self, item), fields(query = %self.query, temp_id = item.item_id()))]
    pub fn add_optimistic(&self, item: T) -> Result<TempId, ValidationError> {
        let temp_id = TempId::new(item.item_id())?;
        {
            let mut state = self.lock();
            Self::purge_expired(&mut state, self.clock.now());
            state.tombstones.pop(&temp_id);
            state.records.insert(
                temp_id.clone(),
                ReconciliationRecord {
                    status: SyncStatus::Sending,
                    last_error: None,
                    server_id: None,
                    purge_after: None,
                },
            );
        }

        let key = temp_id.as_str();
        self.cache.upsert(&self.query, |data| {
            let entry = CachedItem::optimistic(item);
            if !data.replace_any(&[key], entry.clone()) {
                data.append(entry);
            }
        });
        Ok(temp_id)
    }

    /// Swaps the optimistic entry for the server's version, in place.
    ///
    /// Matches on the temp id or the server id, so repeating the call, or
    /// calling it after the server item already arrived by another path,
    /// leaves exactly one entry. Never inserts. A temp id that was
    /// [`remove`](Self::remove)d is ignored.
    #[instrument(skip(self, server_item), fields(query = %self.query, temp_id = %temp_id, server_id = server_item.item_id()))]
    pub fn reconcile(&self, temp_id: &TempId, server_item: T) {
        let now = self.clock.now();
        {
            let mut state = self.lock();
            Self::purge_expired(&mut state, now);
            if state.tombstones.contains(temp_id) {
                debug!("reconcile for removed write ignored");
                return;
            }
            let server_id = match ServerId::new(server_item.item_id()) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(error = %e, "server item has an unusable id");
                    None
                }
            };
            let purge_after = now.add_millis(self.config.grace_period_ms);
            if let Some(record) = state.records.get_mut(temp_id) {
                record.status = SyncStatus::Sent;
                record.last_error = None;
                record.server_id = server_id;
                // A repeated reconcile keeps the original deadline.
                record.purge_after.get_or_insert(purge_after);
            } else {
                debug!("reconciling unregistered temp id by id match");
            }
        }

        let server_key = server_item.item_id().to_string();
        let ids = [temp_id.as_str(), server_key.as_str()];
        let patched = self
            .cache
            .update(&self.query, |data| {
                data.replace_any(&ids, CachedItem::confirmed(server_item))
            })
            .unwrap_or(false);

        if patched {
            info!("optimistic write reconciled");
        } else {
            debug!("no cached entry to reconcile");
        }
    }

    /// Flags the write as failed. The item stays visible with its error.
    #[instrument(skip(self, error), fields(query = %self.query, temp_id = %temp_id))]
    pub fn mark_failed(&self, temp_id: &TempId, error: impl Into<String>) {
        let mut message = error.into();
        truncate_utf8_safe(&mut message, MAX_ERROR_BYTES);
        {
            let mut state = self.lock();
            if state.tombstones.contains(temp_id) {
                return;
            }
            match state.records.get_mut(temp_id) {
                Some(record) if record.status == SyncStatus::Sent => {
                    debug!("failure after reconcile ignored");
                    return;
                }
                Some(record) => {
                    record.status = SyncStatus::Error;
                    record.last_error = Some(message.clone());
                }
                None => {}
            }
        }

        warn!(error = %message, "optimistic write failed");
        self.cache.update(&self.query, |data| {
            if let Some(entry) = data.find_mut(temp_id.as_str()) {
                entry.status = SyncStatus::Error;
                entry.last_error = Some(message);
            }
        });
    }

    fn mark_sending(&self, temp_id: &TempId) {
        {
            let mut state = self.lock();
            if let Some(record) = state.records.get_mut(temp_id) {
                record.status = SyncStatus::Sending;
                record.last_error = None;
            }
        }
        self.cache.update(&self.query, |data| {
            if let Some(entry) = data.find_mut(temp_id.as_str()) {
                entry.status = SyncStatus::Sending;
                entry.last_error = None;
            }
        });
    }

    /// Puts the write back to `sending` and runs `retry_fn`. Success is
    /// reconciled; failure is recorded and handed back.
    #[instrument(skip(self, retry_fn), fields(query = %self.query, temp_id = %temp_id))]
    pub async fn retry<F, Fut, E>(&self, temp_id: &TempId, retry_fn: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.mark_sending(temp_id);
        match retry_fn().await {
            Ok(server_item) => {
                self.reconcile(temp_id, server_item.clone());
                Ok(server_item)
            }
            Err(e) => {
                self.mark_failed(temp_id, e.to_string());
                Err(e)
            }
        }
    }

    /// Forgets the write and drops its cache entry. Later results for the
    /// same temp id are ignored.
    #[instrument(skip(self), fields(query = %self.query, temp_id = %temp_id))]
    pub fn remove(&self, temp_id: &TempId) {
        let now = self.clock.now();
        let record = {
            let mut state = self.lock();
            state.tombstones.put(temp_id.clone(), now);
            state.records.remove(temp_id)
        };
        let server_id = record.and_then(|r| r.server_id);

        self.cache.update(&self.query, |data| {
            data.remove(temp_id.as_str());
            if let Some(server_id) = &server_id {
                data.remove(server_id.as_str());
            }
        });
    }

    pub fn status(&self, temp_id: &TempId) -> Option<SyncStatus> {
        let now = self.clock.now();
        let mut state = self.lock();
        Self::purge_expired(&mut state, now);
        state.records.get(temp_id).map(|r| r.status)
    }

    pub fn last_error(&self, temp_id: &TempId) -> Option<String> {
        self.lock()
            .records
            .get(temp_id)
            .and_then(|r| r.last_error.clone())
    }

    /// Server id a temp id resolved to, while its grace period lasts.
    pub fn server_id_for(&self, temp_id: &TempId) -> Option<ServerId> {
        let now = self.clock.now();
        let mut state = self.lock();
        Self::purge_expired(&mut state, now);
        state.records.get(temp_id).and_then(|r| r.server_id.clone())
    }

    /// Writes not yet confirmed: sending or failed.
    pub fn pending_count(&self) -> usize {
        self.lock()
            .records
            .values()
            .filter(|r| r.status != SyncStatus::Sent)
            .count()
    }
}

impl<T: CacheItem> std::fmt::Debug for Reconciler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("query", &self.query)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
