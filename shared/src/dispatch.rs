//! Send loop tying the guard, reconciler, outbox and commit endpoint
//! together.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheItem;
use crate::error::{CommitError, ValidationError};
use crate::guard::{AllowAll, WriteGuard};
use crate::ids::{IdSource, IdempotencyKey, RandomIds, TempId};
use crate::outbox::{NewWrite, OutboxQueue, QueuedWrite, ResourceRef, WriteStatus};
use crate::reconcile::Reconciler;
use crate::retry::{retry_with_backoff, RetryConfig, RetryPolicy};
use crate::storage::DurableStore;
use crate::time::{Clock, SystemClock};

const EVICTED_MESSAGE: &str = "dropped from a full outbox";

/// Server side of a write. Implementations must dedup on the idempotency
/// key: a retried commit returns the item created by the first one.
#[async_trait]
pub trait CommitEndpoint<T: Send>: Send + Sync {
    async fn commit(&self, key: &IdempotencyKey, write: &QueuedWrite) -> Result<T, CommitError>;
}

#[async_trait]
impl<T: Send, E: CommitEndpoint<T> + ?Sized> CommitEndpoint<T> for Arc<E> {
    async fn commit(&self, key: &IdempotencyKey, write: &QueuedWrite) -> Result<T, CommitError> {
        (**self).commit(key, write).await
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub failed: usize,
}

pub struct Dispatcher<T, S, E>
where
    T: CacheItem,
    S: DurableStore,
    E: CommitEndpoint<T>,
{
    outbox: Arc<OutboxQueue<S>>,
    reconciler: Arc<Reconciler<T>>,
    endpoint: E,
    guard: Arc<dyn WriteGuard>,
    ids: Arc<dyn IdSource>,
    retry_config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl<T, S, E> Dispatcher<T, S, E>
where
    T: CacheItem,
    S: DurableStore,
    E: CommitEndpoint<T>,
{
    pub fn new(outbox: Arc<OutboxQueue<S>>, reconciler: Arc<Reconciler<T>>, endpoint: E) -> Self {
        Self {
            outbox,
            reconciler,
            endpoint,
            guard: Arc::new(AllowAll),
            ids: Arc::new(RandomIds::default()),
            retry_config: RetryConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_guard(mut self, guard: impl WriteGuard + 'static) -> Self {
        self.guard = Arc::new(guard);
        self
    }

    /// Source of the temp ids handed out by [`create`](Self::create).
    #[must_use]
    pub fn with_id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn outbox(&self) -> &Arc<OutboxQueue<S>> {
        &self.outbox
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<T>> {
        &self.reconciler
    }

    /// Validates the write, shows `item` optimistically and queues it. The
    /// item's id becomes the write's temp id.
    #[instrument(skip_all, fields(temp_id = item.item_id(), kind = %resource_ref.kind))]
    pub fn submit(
        &self,
        item: T,
        resource_ref: ResourceRef,
        payload: serde_json::Value,
    ) -> Result<TempId, ValidationError> {
        let temp_id = TempId::new(item.item_id())?;
        let write = NewWrite::new(temp_id.clone(), resource_ref, payload);
        self.guard.check(&write)?;

        self.reconciler.add_optimistic(item)?;
        let outcome = self.outbox.enqueue(write);
        if let Some(evicted) = outcome.evicted() {
            self.reconciler.mark_failed(evicted, EVICTED_MESSAGE);
        }
        Ok(temp_id)
    }

    /// Like [`submit`](Self::submit), but draws a fresh temp id and lets
    /// `build` stamp it on the item.
    pub fn create<F>(
        &self,
        build: F,
        resource_ref: ResourceRef,
        payload: serde_json::Value,
    ) -> Result<TempId, ValidationError>
    where
        F: FnOnce(&TempId) -> T,
    {
        let temp_id = self.ids.next_temp_id()?;
        let item = build(&temp_id);
        if item.item_id() != temp_id.as_str() {
            return Err(ValidationError::Rejected(format!(
                "item id {} does not match temp id {temp_id}",
                item.item_id()
            )));
        }
        self.submit(item, resource_ref, payload)
    }

    /// One pass over everything currently ready to send.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for candidate in self.outbox.ready(self.clock.now()) {
            // Earlier commits in this pass may have cancelled or evicted it.
            let Some(write) = self
                .outbox
                .get(&candidate.id)
                .filter(|w| w.status != WriteStatus::Sending)
            else {
                debug!(temp_id = %candidate.id, "write left the queue before sending");
                continue;
            };
            if self.send(&write).await {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
        }
        if report != FlushReport::default() {
            info!(sent = report.sent, failed = report.failed, "outbox flushed");
        }
        report
    }

    async fn send(&self, write: &QueuedWrite) -> bool {
        self.outbox.update_status(&write.id, WriteStatus::Sending, None);
        match self.endpoint.commit(&write.idempotency_key, write).await {
            Ok(server_item) => {
                self.reconciler.reconcile(&write.id, server_item);
                self.outbox.remove(&write.id);
                true
            }
            Err(e) => {
                self.record_failure(&write.id, &e);
                false
            }
        }
    }

    fn record_failure(&self, id: &TempId, error: &CommitError) {
        let message = error.to_string();
        if error.is_retryable() {
            self.outbox
                .update_status(id, WriteStatus::Failed, Some(message.clone()));
        } else {
            warn!(temp_id = %id, category = error.category().code(), "write failed permanently");
            self.outbox.park(id, Some(message.clone()));
        }
        self.reconciler.mark_failed(id, message);
    }

    /// User-initiated retry of one queued write, with backoff between
    /// attempts. Clears earlier failures first.
    #[instrument(skip(self), fields(temp_id = %id))]
    pub async fn retry_entry(&self, id: &TempId) -> Result<T, CommitError> {
        let Some(write) = self.outbox.get(id) else {
            return Err(ValidationError::Rejected(format!("no queued write {id}")).into());
        };
        self.outbox.reset_retry(id);
        self.outbox.update_status(id, WriteStatus::Sending, None);

        let mut policy = RetryPolicy::new(self.retry_config.clone());
        let policy = &mut policy;
        let endpoint = &self.endpoint;
        let write = &write;
        let outcome = self
            .reconciler
            .retry(id, move || async move {
                retry_with_backoff(policy, |_| endpoint.commit(&write.idempotency_key, write)).await
            })
            .await;

        match &outcome {
            Ok(_) => {
                self.outbox.remove(id);
            }
            Err(e) if e.is_retryable() => {
                self.outbox
                    .update_status(id, WriteStatus::Failed, Some(e.to_string()));
            }
            Err(e) => self.outbox.park(id, Some(e.to_string())),
        }
        outcome
    }

    /// Drops a write from the queue and the cache. A commit already in
    /// flight can still reach the server but its result is ignored.
    #[instrument(skip(self), fields(temp_id = %id))]
    pub fn cancel(&self, id: &TempId) {
        self.outbox.remove(id);
        self.reconciler.remove(id);
    }
}

impl<T, S, E> std::fmt::Debug for Dispatcher<T, S, E>
where
    T: CacheItem,
    S: DurableStore,
    E: CommitEndpoint<T>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("outbox", &self.outbox)
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}
