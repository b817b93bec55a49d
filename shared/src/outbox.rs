//! Bounded, persisted FIFO of writes waiting to reach the server.
//!
//! The in-memory queue is authoritative. Every mutation writes the full queue
//! to the [`DurableStore`] and then notifies subscribers with the new
//! snapshot; a failed write is logged and otherwise ignored.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::error::{truncate_utf8_safe, ConfigError};
use crate::ids::{IdempotencyKey, ResourceId, TempId};
use crate::listeners::{Listeners, Subscription};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::storage::{DurableStore, KeyNamespace, StoreKey, TypedSlot};
use crate::time::{Clock, SystemClock, UnixTimeMs};

pub const DEFAULT_MAX_SIZE: usize = 100;
const MAX_ERROR_BYTES: usize = 512;

/// What a write targets, e.g. `{ kind: "comment", id: "ticket:7" }`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    pub id: ResourceId,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, id: ResourceId) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    Pending,
    Sending,
    Failed,
}

impl WriteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteStatus::Pending => "pending",
            WriteStatus::Sending => "sending",
            WriteStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedWrite {
    pub id: TempId,
    pub resource_ref: ResourceRef,
    pub idempotency_key: IdempotencyKey,
    pub payload: serde_json::Value,
    pub enqueued_at: UnixTimeMs,
    pub attempts: u32,
    pub status: WriteStatus,
    pub error: Option<String>,
}

/// Caller-supplied part of a [`QueuedWrite`]; the queue stamps the rest.
#[derive(Clone, Debug, PartialEq)]
pub struct NewWrite {
    pub id: TempId,
    pub resource_ref: ResourceRef,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<IdempotencyKey>,
}

impl NewWrite {
    pub fn new(id: TempId, resource_ref: ResourceRef, payload: serde_json::Value) -> Self {
        Self {
            id,
            resource_ref,
            payload,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutboxConfig {
    pub max_size: usize,
    /// Key inside the `outbox` namespace holding the queue snapshot.
    pub storage_key: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            storage_key: "queue".to_string(),
        }
    }
}

impl OutboxConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid("outbox max_size must be > 0".into()));
        }
        self.store_key()?;
        Ok(())
    }

    pub fn store_key(&self) -> Result<StoreKey, ConfigError> {
        StoreKey::new(KeyNamespace::Outbox, self.storage_key.as_str())
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { evicted: Option<TempId> },
    /// An entry with the same id is already queued; nothing changed.
    Duplicate,
}

impl EnqueueOutcome {
    pub fn evicted(&self) -> Option<&TempId> {
        match self {
            EnqueueOutcome::Enqueued { evicted } => evicted.as_ref(),
            EnqueueOutcome::Duplicate => None,
        }
    }
}

#[derive(Clone, Debug)]
struct RetryEntry {
    policy: RetryPolicy,
    next_attempt_at: Option<UnixTimeMs>,
    /// Set for failures that must wait for an explicit retry.
    parked: bool,
}

impl RetryEntry {
    fn new(config: &RetryConfig) -> Self {
        Self {
            policy: RetryPolicy::new(config.clone()),
            next_attempt_at: None,
            parked: false,
        }
    }

    fn is_due(&self, now: UnixTimeMs) -> bool {
        !self.parked && self.policy.can_retry() && self.next_attempt_at.map_or(true, |at| now >= at)
    }
}

struct QueueState {
    entries: VecDeque<QueuedWrite>,
    retry: HashMap<TempId, RetryEntry>,
}

impl QueueState {
    fn position(&self, id: &TempId) -> Option<usize> {
        self.entries.iter().position(|w| &w.id == id)
    }

    fn snapshot(&self) -> Vec<QueuedWrite> {
        self.entries.iter().cloned().collect()
    }
}

pub struct OutboxQueue<S: DurableStore> {
    store: S,
    slot: TypedSlot<Vec<QueuedWrite>>,
    config: OutboxConfig,
    retry_config: RetryConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    listeners: Listeners<Vec<QueuedWrite>>,
}

impl<S: DurableStore> OutboxQueue<S> {
    pub fn open(store: S, config: OutboxConfig) -> Result<Self, ConfigError> {
        Self::open_with(store, config, RetryConfig::default(), Arc::new(SystemClock))
    }

    /// Opens the queue and hydrates it from `store`.
    ///
    /// A missing or unreadable snapshot yields an empty queue. Entries that
    /// were `sending` when the previous session ended come back as `pending`.
    #[instrument(skip_all, fields(max_size = config.max_size))]
    pub fn open_with(
        store: S,
        config: OutboxConfig,
        retry_config: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        retry_config.validate()?;
        let slot: TypedSlot<Vec<QueuedWrite>> = TypedSlot::new(config.store_key()?);

        let mut entries: VecDeque<QueuedWrite> = match slot.load(&store) {
            Ok(Some(entries)) => entries.into(),
            Ok(None) => VecDeque::new(),
            Err(e) => {
                warn!(error = %e, "outbox snapshot unreadable, starting empty");
                VecDeque::new()
            }
        };

        let mut seen = std::collections::HashSet::new();
        entries.retain(|w| seen.insert(w.id.clone()));

        if entries.len() > config.max_size {
            let dropped = entries.len() - config.max_size;
            warn!(dropped, "outbox snapshot exceeds max_size, keeping newest entries");
            entries.drain(..dropped);
        }

        let mut retry = HashMap::with_capacity(entries.len());
        for write in entries.iter_mut() {
            if write.status == WriteStatus::Sending {
                write.status = WriteStatus::Pending;
            }
            let mut entry = RetryEntry::new(&retry_config);
            for _ in 0..write.attempts.min(retry_config.max_attempts) {
                entry.policy.record_attempt();
            }
            retry.insert(write.id.clone(), entry);
        }

        info!(entries = entries.len(), "outbox hydrated");

        Ok(Self {
            store,
            slot,
            config,
            retry_config,
            clock,
            state: Mutex::new(QueueState { entries, retry }),
            listeners: Listeners::new(),
        })
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persists `state` while still holding the lock so snapshots reach the
    /// store in mutation order.
    fn persist(&self, state: &QueueState) -> Vec<QueuedWrite> {
        let snapshot = state.snapshot();
        if let Err(e) = self.slot.save(&self.store, &snapshot) {
            warn!(error = %e, entries = snapshot.len(), "failed to persist outbox, keeping in memory");
        }
        snapshot
    }

    fn commit(&self, state: MutexGuard<'_, QueueState>) {
        let snapshot = self.persist(&state);
        drop(state);
        self.listeners.emit(&snapshot);
    }

    #[instrument(skip(self, write), fields(temp_id = %write.id))]
    pub fn enqueue(&self, write: NewWrite) -> EnqueueOutcome {
        let mut state = self.lock();
        if state.position(&write.id).is_some() {
            debug!("write already queued");
            return EnqueueOutcome::Duplicate;
        }

        let idempotency_key = write
            .idempotency_key
            .unwrap_or_else(|| IdempotencyKey::from(&write.id));
        let queued = QueuedWrite {
            id: write.id,
            resource_ref: write.resource_ref,
            idempotency_key,
            payload: write.payload,
            enqueued_at: self.clock.now(),
            attempts: 0,
            status: WriteStatus::Pending,
            error: None,
        };
        state
            .retry
            .insert(queued.id.clone(), RetryEntry::new(&self.retry_config));
        state.entries.push_back(queued);

        let mut evicted = None;
        while state.entries.len() > self.config.max_size {
            if let Some(oldest) = state.entries.pop_front() {
                state.retry.remove(&oldest.id);
                info!(evicted = %oldest.id, "outbox full, evicted oldest write");
                evicted = Some(oldest.id);
            }
        }

        self.commit(state);
        EnqueueOutcome::Enqueued { evicted }
    }

    /// Sets the status of `id`. Moving into `failed` counts one attempt and
    /// schedules the next one from the retry policy. Unknown ids are ignored.
    #[instrument(skip(self, error), fields(temp_id = %id, status = status.as_str()))]
    pub fn update_status(&self, id: &TempId, status: WriteStatus, error: Option<String>) {
        let now = self.clock.now();
        let mut state = self.lock();
        let Some(pos) = state.position(id) else {
            debug!("update for unknown write ignored");
            return;
        };
        self.apply_status(&mut state, pos, status, error, now);
        self.commit(state);
    }

    /// Marks `id` failed and keeps it out of [`ready`](Self::ready) until
    /// [`reset_retry`](Self::reset_retry). For errors another attempt cannot
    /// fix.
    #[instrument(skip(self, error), fields(temp_id = %id))]
    pub fn park(&self, id: &TempId, error: Option<String>) {
        let now = self.clock.now();
        let mut state = self.lock();
        let Some(pos) = state.position(id) else {
            return;
        };
        self.apply_status(&mut state, pos, WriteStatus::Failed, error, now);
        if let Some(retry) = state.retry.get_mut(id) {
            retry.parked = true;
        }
        self.commit(state);
    }

    fn apply_status(
        &self,
        state: &mut QueueState,
        pos: usize,
        status: WriteStatus,
        error: Option<String>,
        now: UnixTimeMs,
    ) {
        let id = state.entries[pos].id.clone();
        if status == WriteStatus::Failed && state.entries[pos].status != WriteStatus::Failed {
            state.entries[pos].attempts = state.entries[pos].attempts.saturating_add(1);
            self.schedule_next_attempt(state, &id, now);
        }

        let entry = &mut state.entries[pos];
        entry.status = status;
        if let Some(mut message) = error {
            truncate_utf8_safe(&mut message, MAX_ERROR_BYTES);
            entry.error = Some(message);
        }
    }

    fn schedule_next_attempt(&self, state: &mut QueueState, id: &TempId, now: UnixTimeMs) {
        let retry = state
            .retry
            .entry(id.clone())
            .or_insert_with(|| RetryEntry::new(&self.retry_config));
        let delay = retry.policy.get_delay();
        retry.policy.record_attempt();
        retry.next_attempt_at = Some(now.add_millis(delay));
    }

    /// Counts one failed attempt for `id` without changing its status.
    pub fn record_attempt(&self, id: &TempId) {
        let now = self.clock.now();
        let mut state = self.lock();
        let Some(pos) = state.position(id) else {
            return;
        };
        state.entries[pos].attempts = state.entries[pos].attempts.saturating_add(1);
        self.schedule_next_attempt(&mut state, id, now);
        self.commit(state);
    }

    /// Clears the attempt count of `id` so it is immediately eligible again.
    pub fn reset_retry(&self, id: &TempId) {
        let mut state = self.lock();
        let Some(pos) = state.position(id) else {
            return;
        };
        state.entries[pos].attempts = 0;
        if let Some(retry) = state.retry.get_mut(id) {
            retry.policy.reset();
            retry.next_attempt_at = None;
            retry.parked = false;
        }
        self.commit(state);
    }

    pub fn retry_state(&self, id: &TempId) -> Option<RetryPolicy> {
        self.lock().retry.get(id).map(|r| r.policy.clone())
    }

    #[instrument(skip(self), fields(temp_id = %id))]
    pub fn remove(&self, id: &TempId) -> Option<QueuedWrite> {
        let mut state = self.lock();
        let pos = state.position(id)?;
        let removed = state.entries.remove(pos);
        state.retry.remove(id);
        self.commit(state);
        removed
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.retry.clear();
        self.commit(state);
    }

    pub fn get(&self, id: &TempId) -> Option<QueuedWrite> {
        let state = self.lock();
        state.position(id).map(|pos| state.entries[pos].clone())
    }

    pub fn get_all(&self) -> Vec<QueuedWrite> {
        self.lock().snapshot()
    }

    pub fn get_for_resource(&self, resource_id: &ResourceId) -> Vec<QueuedWrite> {
        self.lock()
            .entries
            .iter()
            .filter(|w| &w.resource_ref.id == resource_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries that may be sent at `now`, oldest first: pending, or failed
    /// with attempts left and their backoff elapsed.
    pub fn ready(&self, now: UnixTimeMs) -> Vec<QueuedWrite> {
        let state = self.lock();
        state
            .entries
            .iter()
            .filter(|w| match w.status {
                WriteStatus::Pending => true,
                WriteStatus::Sending => false,
                WriteStatus::Failed => state.retry.get(&w.id).is_some_and(|r| r.is_due(now)),
            })
            .cloned()
            .collect()
    }

    pub fn next_ready(&self, now: UnixTimeMs) -> Option<QueuedWrite> {
        self.ready(now).into_iter().next()
    }

    pub fn is_parked(&self, id: &TempId) -> bool {
        self.lock().retry.get(id).is_some_and(|r| r.parked)
    }

    /// Registers `listener` for post-mutation snapshots.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Vec<QueuedWrite>) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }
}

impl<S: DurableStore> std::fmt::Debug for OutboxQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxQueue")
            .field("config", &self.config)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::storage::MemoryStore;
    use crate::time::ManualClock;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // Failure-injectable store wrapper
    struct FailableStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
    }

    impl FailableStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_writes: AtomicBool::new(false),
            }
        }

        fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }
    }

    impl DurableStore for FailableStore {
        fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key)
        }

        fn set(&self, key: &StoreKey, value: &[u8]) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("Injected failure".into()));
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &StoreKey) -> Result<bool, StoreError> {
            self.inner.remove(key)
        }
    }

    fn temp(n: usize) -> TempId {
        TempId::new(format!("tmp-{n}")).unwrap()
    }

    fn write(n: usize) -> NewWrite {
        NewWrite::new(
            temp(n),
            ResourceRef::new("comment", ResourceId::new(format!("ticket:{}", n % 3)).unwrap()),
            serde_json::json!({ "body": format!("comment {n}") }),
        )
    }

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_ratio: 0.0,
        }
    }

    fn queue_with(store: Arc<FailableStore>, max_size: usize) -> (OutboxQueue<Arc<FailableStore>>, ManualClock) {
        let clock = ManualClock::default();
        let config = OutboxConfig {
            max_size,
            ..OutboxConfig::default()
        };
        let queue = OutboxQueue::open_with(store, config, no_jitter(), Arc::new(clock.clone())).unwrap();
        (queue, clock)
    }

    #[test]
    fn enqueue_stamps_defaults() {
        let (queue, clock) = queue_with(Arc::new(FailableStore::new()), 10);
        queue.enqueue(write(1));

        let queued = queue.get(&temp(1)).unwrap();
        assert_eq!(queued.status, WriteStatus::Pending);
        assert_eq!(queued.attempts, 0);
        assert_eq!(queued.enqueued_at, clock.now());
        assert_eq!(queued.idempotency_key.as_str(), "tmp-1");
        assert!(queued.error.is_none());
    }

    #[test]
    fn overflow_evicts_oldest_with_retry_state() {
        let (queue, _) = queue_with(Arc::new(FailableStore::new()), 100);
        for n in 1..=100 {
            assert_eq!(queue.enqueue(write(n)), EnqueueOutcome::Enqueued { evicted: None });
        }
        let outcome = queue.enqueue(write(101));

        assert_eq!(outcome.evicted(), Some(&temp(1)));
        assert_eq!(queue.len(), 100);
        assert!(queue.get(&temp(1)).is_none());
        assert!(queue.retry_state(&temp(1)).is_none());
        assert!(queue.get(&temp(101)).is_some());
    }

    #[test]
    fn evicted_entry_stays_gone() {
        let (queue, _) = queue_with(Arc::new(FailableStore::new()), 2);
        queue.enqueue(write(1));
        queue.enqueue(write(2));
        queue.enqueue(write(3));

        queue.update_status(&temp(1), WriteStatus::Failed, Some("late".into()));
        queue.remove(&temp(1));
        assert!(queue.get_all().iter().all(|w| w.id != temp(1)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn duplicate_id_is_noop() {
        let (queue, _) = queue_with(Arc::new(FailableStore::new()), 10);
        queue.enqueue(write(1));
        assert_eq!(queue.enqueue(write(1)), EnqueueOutcome::Duplicate);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn failed_transition_counts_attempts() {
        let (queue, _) = queue_with(Arc::new(FailableStore::new()), 10);
        queue.enqueue(write(1));

        queue.update_status(&temp(1), WriteStatus::Sending, None);
        queue.update_status(&temp(1), WriteStatus::Failed, Some("offline".into()));
        // Already failed: not a transition.
        queue.update_status(&temp(1), WriteStatus::Failed, None);

        let queued = queue.get(&temp(1)).unwrap();
        assert_eq!(queued.attempts, 1);
        assert_eq!(queued.error.as_deref(), Some("offline"));
        assert_eq!(queue.retry_state(&temp(1)).unwrap().attempts(), 1);

        queue.update_status(&temp(1), WriteStatus::Sending, None);
        queue.update_status(&temp(1), WriteStatus::Failed, Some("offline again".into()));
        assert_eq!(queue.get(&temp(1)).unwrap().attempts, 2);

        queue.reset_retry(&temp(1));
        assert_eq!(queue.get(&temp(1)).unwrap().attempts, 0);
        assert_eq!(queue.retry_state(&temp(1)).unwrap().attempts(), 0);
    }

    #[test]
    fn long_errors_are_truncated() {
        let (queue, _) = queue_with(Arc::new(FailableStore::new()), 10);
        queue.enqueue(write(1));
        queue.update_status(&temp(1), WriteStatus::Failed, Some("x".repeat(2_000)));
        assert_eq!(queue.get(&temp(1)).unwrap().error.unwrap().len(), MAX_ERROR_BYTES);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let (queue, _) = queue_with(Arc::new(FailableStore::new()), 10);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _sub = queue.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        queue.update_status(&temp(9), WriteStatus::Failed, None);
        assert!(queue.remove(&temp(9)).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn next_ready_respects_backoff() {
        let (queue, clock) = queue_with(Arc::new(FailableStore::new()), 10);
        queue.enqueue(write(1));
        queue.enqueue(write(2));

        assert_eq!(queue.next_ready(clock.now()).unwrap().id, temp(1));

        queue.update_status(&temp(1), WriteStatus::Sending, None);
        assert_eq!(queue.next_ready(clock.now()).unwrap().id, temp(2));

        queue.update_status(&temp(1), WriteStatus::Failed, Some("offline".into()));
        queue.update_status(&temp(2), WriteStatus::Sending, None);
        assert!(queue.next_ready(clock.now()).is_none());

        clock.advance(1_000);
        assert_eq!(queue.next_ready(clock.now()).unwrap().id, temp(1));
    }

    #[test]
    fn exhausted_entries_are_not_ready() {
        let (queue, clock) = queue_with(Arc::new(FailableStore::new()), 10);
        queue.enqueue(write(1));
        for _ in 0..3 {
            queue.update_status(&temp(1), WriteStatus::Sending, None);
            queue.update_status(&temp(1), WriteStatus::Failed, Some("offline".into()));
            clock.advance(60_000);
        }
        assert!(!queue.retry_state(&temp(1)).unwrap().can_retry());
        assert!(queue.next_ready(clock.now()).is_none());
        assert_eq!(queue.get(&temp(1)).unwrap().status, WriteStatus::Failed);
    }

    #[test]
    fn parked_entries_wait_for_reset() {
        let (queue, clock) = queue_with(Arc::new(FailableStore::new()), 10);
        queue.enqueue(write(1));
        queue.park(&temp(1), Some("conflict".into()));

        clock.advance(60_000);
        assert!(queue.is_parked(&temp(1)));
        assert!(queue.ready(clock.now()).is_empty());
        assert_eq!(queue.get(&temp(1)).unwrap().attempts, 1);

        queue.reset_retry(&temp(1));
        assert!(!queue.is_parked(&temp(1)));
        assert_eq!(queue.next_ready(clock.now()).unwrap().id, temp(1));
    }

    #[test]
    fn subscribers_see_persisted_snapshot() {
        let store = Arc::new(FailableStore::new());
        let (queue, _) = queue_with(Arc::clone(&store), 10);
        let slot: TypedSlot<Vec<QueuedWrite>> =
            TypedSlot::new(OutboxConfig::default().store_key().unwrap());

        let observed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&observed);
        let persisted_store = Arc::clone(&store);
        let snapshot_slot = slot.clone();
        let _sub = queue.subscribe(move |snapshot| {
            let persisted = snapshot_slot.load(&*persisted_store).unwrap().unwrap_or_default();
            assert_eq!(&persisted, snapshot);
            seen.lock().unwrap().push(snapshot.len());
        });

        queue.enqueue(write(1));
        queue.enqueue(write(2));
        queue.remove(&temp(1));
        assert_eq!(*observed.lock().unwrap(), vec![1, 2, 1]);
    }

    #[test]
    fn storage_failure_keeps_memory_authoritative() {
        let store = Arc::new(FailableStore::new());
        let (queue, _) = queue_with(Arc::clone(&store), 10);
        queue.enqueue(write(1));

        store.set_fail_writes(true);
        queue.enqueue(write(2));
        queue.update_status(&temp(1), WriteStatus::Failed, Some("offline".into()));
        assert_eq!(queue.len(), 2);

        store.set_fail_writes(false);
        queue.enqueue(write(3));
        let (reopened, _) = queue_with(store, 10);
        assert_eq!(reopened.len(), 3);
    }

    #[test]
    fn hydrate_recovers_sending_as_pending() {
        let store = Arc::new(FailableStore::new());
        {
            let (queue, _) = queue_with(Arc::clone(&store), 10);
            queue.enqueue(write(1));
            queue.enqueue(write(2));
            queue.update_status(&temp(1), WriteStatus::Sending, None);
            queue.update_status(&temp(2), WriteStatus::Failed, Some("offline".into()));
        }
        let (queue, _) = queue_with(store, 10);
        assert_eq!(queue.get(&temp(1)).unwrap().status, WriteStatus::Pending);
        let failed = queue.get(&temp(2)).unwrap();
        assert_eq!(failed.status, WriteStatus::Failed);
        assert_eq!(queue.retry_state(&temp(2)).unwrap().attempts(), 1);
    }

    #[test]
    fn hydrate_truncates_to_newest() {
        let store = Arc::new(FailableStore::new());
        {
            let (queue, _) = queue_with(Arc::clone(&store), 10);
            for n in 1..=10 {
                queue.enqueue(write(n));
            }
        }
        let (queue, _) = queue_with(store, 4);
        let ids: Vec<_> = queue.get_all().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![temp(7), temp(8), temp(9), temp(10)]);
    }

    #[test]
    fn corrupt_snapshot_starts_empty() {
        let store = Arc::new(FailableStore::new());
        store
            .set(&OutboxConfig::default().store_key().unwrap(), b"{not json")
            .unwrap();
        let (queue, _) = queue_with(store, 10);
        assert!(queue.is_empty());
    }

    #[test]
    fn filters_by_resource() {
        let (queue, _) = queue_with(Arc::new(FailableStore::new()), 10);
        for n in 0..6 {
            queue.enqueue(write(n));
        }
        let target = ResourceId::new("ticket:1").unwrap();
        let ids: Vec<_> = queue
            .get_for_resource(&target)
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec![temp(1), temp(4)]);
    }

    #[test]
    fn config_validation() {
        assert!(OutboxConfig::default().validate().is_ok());
        let zero = OutboxConfig {
            max_size: 0,
            ..OutboxConfig::default()
        };
        assert!(zero.validate().is_err());
        let bad_key = OutboxConfig {
            storage_key: "../escape".into(),
            ..OutboxConfig::default()
        };
        assert!(bad_key.validate().is_err());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Enqueue(usize),
        Remove(usize),
        Fail(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0usize..40).prop_map(Op::Enqueue),
            1 => (0usize..40).prop_map(Op::Remove),
            1 => (0usize..40).prop_map(Op::Fail),
        ]
    }

    proptest! {
        #[test]
        fn queue_never_exceeds_max_size(
            max_size in 1usize..12,
            ops in proptest::collection::vec(op_strategy(), 0..120),
        ) {
            let (queue, _) = queue_with(Arc::new(FailableStore::new()), max_size);
            for op in ops {
                match op {
                    Op::Enqueue(n) => { queue.enqueue(write(n)); }
                    Op::Remove(n) => { queue.remove(&temp(n)); }
                    Op::Fail(n) => queue.update_status(&temp(n), WriteStatus::Failed, None),
                }
                prop_assert!(queue.len() <= max_size);
                let retry_tracked = queue.get_all().iter().all(|w| queue.retry_state(&w.id).is_some());
                prop_assert!(retry_tracked);
            }
        }
    }
}
