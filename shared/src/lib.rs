//! Optimistic writes for clients that may be offline or open in several
//! sessions at once.
//!
//! A write is shown in the [`QueryCache`] under a temporary id the moment the
//! user makes it, queued durably in the [`OutboxQueue`], and committed by the
//! [`Dispatcher`] with exponential backoff. When the server answers, the
//! [`Reconciler`] swaps the temporary entry for the confirmed one. The
//! [`LockCoordinator`] keeps two sessions from editing the same resource by
//! exchanging leases over a [`MessageBus`].

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bus;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod ids;
pub mod listeners;
pub mod lock;
pub mod outbox;
pub mod reconcile;
pub mod retry;
pub mod storage;
pub mod time;

pub use bus::{Channel, ChannelReceiver, Envelope, MemoryBus, MessageBus, TokioBus};
pub use cache::{CacheEvent, CacheItem, CachedItem, QueryCache, QueryData, SyncStatus};
pub use config::WriteSyncConfig;
pub use dispatch::{CommitEndpoint, Dispatcher, FlushReport};
pub use error::{
    BusError, CommitError, ConfigError, ErrorCategory, SetupError, StoreError, ValidationError,
};
pub use guard::{AllowAll, StatusTransitionGuard, WriteGuard};
pub use ids::{
    HolderId, IdSource, IdempotencyKey, RandomIds, ResourceId, ScriptedIds, SequentialIds, ServerId,
    TempId,
};
pub use listeners::{Listeners, Subscription};
pub use lock::{HeartbeatHandle, Lease, LockConfig, LockCoordinator, LockEvent};
pub use outbox::{
    EnqueueOutcome, NewWrite, OutboxConfig, OutboxQueue, QueuedWrite, ResourceRef, WriteStatus,
};
pub use reconcile::{ReconcileConfig, Reconciler};
pub use retry::{retry_with_backoff, RetryConfig, RetryPolicy, Retryable};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use storage::SqliteStore;
pub use storage::{DurableStore, FileStore, KeyNamespace, MemoryStore, StoreKey, TypedSlot};
pub use time::{Clock, ManualClock, SystemClock, UnixTimeMs};
