//! Advisory cross-session locks built from leases and broadcast heartbeats.
//!
//! Each session keeps its own view of who holds which resource. Views
//! converge through `acquire`, `release`, `force-take` and `heartbeat`
//! envelopes on a shared channel. A lease nobody renews for longer than its
//! TTL is expired and anyone may claim it.
//!
//! This is not linearizable: two sessions can both believe they hold a lease
//! for one broadcast round trip. Contention resolves the same way on every
//! side: the older `acquired_at` wins, then the smaller holder id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::bus::{validate_channel, Channel, ChannelReceiver, Envelope, MessageBus};
use crate::error::{BusError, ConfigError, SetupError};
use crate::ids::{HolderId, ResourceId};
use crate::listeners::{Listeners, Subscription};
use crate::time::{Clock, UnixTimeMs};

pub const MSG_ACQUIRE: &str = "acquire";
pub const MSG_RELEASE: &str = "release";
pub const MSG_FORCE_TAKE: &str = "force-take";
pub const MSG_HEARTBEAT: &str = "heartbeat";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub ttl_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub channel: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1000,
            heartbeat_interval_ms: 30 * 1000,
            channel: "writesync-locks".to_string(),
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_ms == 0 {
            return Err(ConfigError::Invalid("ttl_ms must be > 0".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be > 0".into(),
            ));
        }
        if self.heartbeat_interval_ms >= self.ttl_ms {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be shorter than ttl_ms".into(),
            ));
        }
        validate_channel(&self.channel).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// One session's claim on a resource. Also the payload of every lock message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub resource_id: ResourceId,
    pub holder_id: HolderId,
    pub acquired_at: UnixTimeMs,
    pub last_activity: UnixTimeMs,
    pub ttl_ms: u64,
}

impl Lease {
    pub fn is_expired(&self, now: UnixTimeMs) -> bool {
        now.since(self.last_activity) > self.ttl_ms
    }

    pub fn expires_at(&self) -> UnixTimeMs {
        self.last_activity.add_millis(self.ttl_ms)
    }

    pub fn is_held_by(&self, holder_id: &HolderId) -> bool {
        &self.holder_id == holder_id
    }

    /// Whether `self` beats `other` when both claim the same resource.
    fn outranks(&self, other: &Lease) -> bool {
        (self.acquired_at, &self.holder_id) < (other.acquired_at, &other.holder_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockEvent {
    Acquired {
        resource_id: ResourceId,
    },
    Released {
        resource_id: ResourceId,
    },
    /// Lost a simultaneous acquire to a peer.
    LostToPeer {
        resource_id: ResourceId,
        holder_id: HolderId,
    },
    ForceTakenByPeer {
        resource_id: ResourceId,
        holder_id: HolderId,
    },
}

pub struct LockCoordinator<B: MessageBus> {
    holder_id: HolderId,
    config: LockConfig,
    clock: Arc<dyn Clock>,
    channel: Channel<B>,
    receiver: tokio::sync::Mutex<ChannelReceiver>,
    leases: Mutex<HashMap<ResourceId, Lease>>,
    listeners: Listeners<LockEvent>,
}

impl<B: MessageBus> LockCoordinator<B> {
    #[instrument(skip(bus, config, clock), fields(holder_id = %holder_id))]
    pub fn new(
        bus: B,
        holder_id: HolderId,
        config: LockConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SetupError> {
        config.validate()?;
        let channel = Channel::new(bus, config.channel.clone(), holder_id.clone())?;
        let receiver = channel.subscribe()?;
        info!(channel = %config.channel, "lock coordinator joined");
        Ok(Self {
            holder_id,
            config,
            clock,
            channel,
            receiver: tokio::sync::Mutex::new(receiver),
            leases: Mutex::new(HashMap::new()),
            listeners: Listeners::new(),
        })
    }

    pub fn holder_id(&self) -> &HolderId {
        &self.holder_id
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceId, Lease>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn broadcast(&self, kind: &str, lease: &Lease) {
        if let Err(e) = self.channel.publish(kind, lease, self.clock.now()) {
            warn!(error = %e, kind, resource_id = %lease.resource_id, "lock broadcast failed");
        }
    }

    fn new_lease(&self, resource_id: &ResourceId, now: UnixTimeMs) -> Lease {
        Lease {
            resource_id: resource_id.clone(),
            holder_id: self.holder_id.clone(),
            acquired_at: now,
            last_activity: now,
            ttl_ms: self.config.ttl_ms,
        }
    }

    /// Claims `resource_id` unless a peer holds an unexpired lease on it.
    /// Calling it again while holding the lease renews it.
    #[instrument(skip(self), fields(holder_id = %self.holder_id))]
    pub fn acquire_lock(&self, resource_id: &ResourceId) -> bool {
        let now = self.clock.now();
        let (lease, renewed) = {
            let mut leases = self.lock();
            match leases.get(resource_id).cloned() {
                Some(mut lease) if lease.is_held_by(&self.holder_id) => {
                    lease.last_activity = now;
                    leases.insert(resource_id.clone(), lease.clone());
                    (lease, true)
                }
                Some(lease) if !lease.is_expired(now) => {
                    debug!(holder = %lease.holder_id, "resource held by peer");
                    return false;
                }
                _ => {
                    let lease = self.new_lease(resource_id, now);
                    leases.insert(resource_id.clone(), lease.clone());
                    (lease, false)
                }
            }
        };

        // Renewals go out as `acquire` too; late peers never saw the first.
        self.broadcast(MSG_ACQUIRE, &lease);
        if !renewed {
            info!("lock acquired");
            self.listeners.emit(&LockEvent::Acquired {
                resource_id: resource_id.clone(),
            });
        }
        true
    }

    /// Drops this session's lease and tells peers. No-op for leases held by
    /// someone else.
    #[instrument(skip(self), fields(holder_id = %self.holder_id))]
    pub fn release_lock(&self, resource_id: &ResourceId) {
        let released = {
            let mut leases = self.lock();
            let ours = leases
                .get(resource_id)
                .is_some_and(|lease| lease.is_held_by(&self.holder_id));
            if ours {
                leases.remove(resource_id)
            } else {
                None
            }
        };
        if let Some(lease) = released {
            info!("lock released");
            self.broadcast(MSG_RELEASE, &lease);
            self.listeners.emit(&LockEvent::Released {
                resource_id: resource_id.clone(),
            });
        }
    }

    /// Renews this session's lease and sends a heartbeat. Returns false when
    /// the lease is no longer ours.
    pub fn update_activity(&self, resource_id: &ResourceId) -> bool {
        let now = self.clock.now();
        let renewed = {
            let mut leases = self.lock();
            match leases.get_mut(resource_id) {
                Some(lease) if lease.is_held_by(&self.holder_id) => {
                    lease.last_activity = now;
                    Some(lease.clone())
                }
                _ => None,
            }
        };
        match renewed {
            Some(lease) => {
                self.broadcast(MSG_HEARTBEAT, &lease);
                true
            }
            None => false,
        }
    }

    /// Claims `resource_id` regardless of the current holder.
    #[instrument(skip(self), fields(holder_id = %self.holder_id))]
    pub fn force_take_lock(&self, resource_id: &ResourceId) -> Lease {
        let now = self.clock.now();
        let lease = self.new_lease(resource_id, now);
        let previous = self.lock().insert(resource_id.clone(), lease.clone());
        if let Some(previous) = previous.filter(|p| !p.is_held_by(&self.holder_id)) {
            info!(previous_holder = %previous.holder_id, "lock force-taken");
        }
        self.broadcast(MSG_FORCE_TAKE, &lease);
        self.listeners.emit(&LockEvent::Acquired {
            resource_id: resource_id.clone(),
        });
        lease
    }

    pub fn is_locked_by_other(&self, resource_id: &ResourceId) -> bool {
        self.lease(resource_id)
            .is_some_and(|lease| !lease.is_held_by(&self.holder_id))
    }

    pub fn is_held_by_self(&self, resource_id: &ResourceId) -> bool {
        self.lease(resource_id)
            .is_some_and(|lease| lease.is_held_by(&self.holder_id))
    }

    /// Current unexpired lease on `resource_id`, if any. Expired leases are
    /// dropped on the way.
    pub fn lease(&self, resource_id: &ResourceId) -> Option<Lease> {
        let now = self.clock.now();
        let mut leases = self.lock();
        if leases.get(resource_id).is_some_and(|l| l.is_expired(now)) {
            if let Some(expired) = leases.remove(resource_id) {
                debug!(resource_id = %resource_id, holder = %expired.holder_id, "lease expired");
            }
        }
        leases.get(resource_id).cloned()
    }

    /// Resources this session currently holds.
    pub fn held(&self) -> Vec<ResourceId> {
        let now = self.clock.now();
        self.lock()
            .values()
            .filter(|l| l.is_held_by(&self.holder_id) && !l.is_expired(now))
            .map(|l| l.resource_id.clone())
            .collect()
    }

    /// Releases everything this session holds, e.g. on shutdown.
    pub fn release_all(&self) {
        let held: Vec<ResourceId> = self
            .lock()
            .values()
            .filter(|l| l.is_held_by(&self.holder_id))
            .map(|l| l.resource_id.clone())
            .collect();
        for resource_id in held {
            self.release_lock(&resource_id);
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LockEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Applies every envelope already delivered, without waiting. Returns how
    /// many were applied. Does nothing while [`run`](Self::run) owns the
    /// receiver.
    pub fn process_incoming(&self) -> usize {
        let Ok(mut receiver) = self.receiver.try_lock() else {
            return 0;
        };
        let mut applied = 0;
        loop {
            match receiver.try_recv() {
                Ok(Some(envelope)) => {
                    self.handle_envelope(&envelope);
                    applied += 1;
                }
                Ok(None) => break,
                Err(BusError::Closed(_)) => break,
                Err(e) => warn!(error = %e, "dropped lock message"),
            }
        }
        applied
    }

    /// Applies envelopes as they arrive until the bus closes.
    pub async fn run(&self) {
        let mut receiver = self.receiver.lock().await;
        loop {
            match receiver.recv().await {
                Ok(envelope) => self.handle_envelope(&envelope),
                Err(BusError::Closed(channel)) => {
                    info!(channel = %channel, "lock channel closed");
                    break;
                }
                Err(e) => warn!(error = %e, "dropped lock message"),
            }
        }
    }

    fn handle_envelope(&self, envelope: &Envelope) {
        let lease: Lease = match envelope.payload_as() {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, kind = %envelope.kind, "malformed lock payload");
                return;
            }
        };
        if lease.holder_id != envelope.sender_id {
            warn!(sender = %envelope.sender_id, holder = %lease.holder_id, "lock payload holder does not match sender");
            return;
        }
        debug!(kind = %envelope.kind, resource_id = %lease.resource_id, sender = %envelope.sender_id, "lock message");

        let event = match envelope.kind.as_str() {
            MSG_ACQUIRE => self.on_peer_acquire(lease),
            MSG_HEARTBEAT => {
                self.on_peer_heartbeat(&lease);
                None
            }
            MSG_RELEASE => {
                self.on_peer_release(&lease);
                None
            }
            MSG_FORCE_TAKE => self.on_peer_force_take(lease),
            other => {
                debug!(kind = other, "unknown lock message ignored");
                None
            }
        };
        if let Some(event) = event {
            self.listeners.emit(&event);
        }
    }

    fn on_peer_acquire(&self, incoming: Lease) -> Option<LockEvent> {
        let (event, reassert) = self.apply_peer_acquire(incoming);
        if let Some(lease) = reassert {
            debug!(resource_id = %lease.resource_id, "reasserting held lease");
            self.broadcast(MSG_ACQUIRE, &lease);
        }
        event
    }

    /// Returns the event to emit and, when a peer's claim lost against a
    /// lease this session holds, that lease so the peer can yield.
    fn apply_peer_acquire(&self, mut incoming: Lease) -> (Option<LockEvent>, Option<Lease>) {
        let now = self.clock.now();
        // Expiry is judged against local receipt time.
        incoming.last_activity = now;
        let mut leases = self.lock();
        let current = leases.get(&incoming.resource_id).cloned();
        match current {
            Some(current) if !current.is_expired(now) => {
                if current.holder_id == incoming.holder_id {
                    leases.insert(incoming.resource_id.clone(), incoming);
                    return (None, None);
                }
                if current.outranks(&incoming) {
                    debug!(winner = %current.holder_id, "peer acquire lost contention");
                    let ours = current.is_held_by(&self.holder_id);
                    return (None, ours.then_some(current));
                }
                let lost = current.is_held_by(&self.holder_id);
                let event = lost.then(|| LockEvent::LostToPeer {
                    resource_id: incoming.resource_id.clone(),
                    holder_id: incoming.holder_id.clone(),
                });
                if lost {
                    info!(winner = %incoming.holder_id, "lost lock contention");
                }
                leases.insert(incoming.resource_id.clone(), incoming);
                (event, None)
            }
            _ => {
                leases.insert(incoming.resource_id.clone(), incoming);
                (None, None)
            }
        }
    }

    fn on_peer_heartbeat(&self, incoming: &Lease) {
        let now = self.clock.now();
        let mut leases = self.lock();
        match leases.get_mut(&incoming.resource_id) {
            Some(lease) if lease.holder_id == incoming.holder_id => {
                lease.last_activity = now;
            }
            Some(lease) => {
                debug!(holder = %lease.holder_id, stale = %incoming.holder_id, "stale heartbeat ignored");
            }
            None => {
                debug!(holder = %incoming.holder_id, "heartbeat without lease on file ignored");
            }
        }
    }

    fn on_peer_release(&self, incoming: &Lease) {
        let mut leases = self.lock();
        if leases
            .get(&incoming.resource_id)
            .is_some_and(|l| l.holder_id == incoming.holder_id)
        {
            leases.remove(&incoming.resource_id);
        }
    }

    fn on_peer_force_take(&self, mut incoming: Lease) -> Option<LockEvent> {
        incoming.last_activity = self.clock.now();
        let previous = self
            .lock()
            .insert(incoming.resource_id.clone(), incoming.clone());
        match previous {
            Some(previous) if previous.is_held_by(&self.holder_id) => {
                warn!(resource_id = %incoming.resource_id, by = %incoming.holder_id, "lock force-taken by peer");
                Some(LockEvent::ForceTakenByPeer {
                    resource_id: incoming.resource_id,
                    holder_id: incoming.holder_id,
                })
            }
            _ => None,
        }
    }
}

impl<B: MessageBus + 'static> LockCoordinator<B> {
    /// Renews `resource_id` every heartbeat interval until the handle is
    /// dropped, the lease is lost, or the coordinator goes away.
    pub fn spawn_heartbeat(self: &Arc<Self>, resource_id: ResourceId) -> HeartbeatHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.heartbeat_interval_ms);
        let task_resource = resource_id.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                if !coordinator.update_activity(&task_resource) {
                    debug!(resource_id = %task_resource, "heartbeat stopped, lease no longer held");
                    break;
                }
            }
        });
        HeartbeatHandle { resource_id, task }
    }
}

impl<B: MessageBus> std::fmt::Debug for LockCoordinator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("holder_id", &self.holder_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Background lease renewal. Stops when dropped.
#[derive(Debug)]
#[must_use = "dropping a HeartbeatHandle stops the heartbeat"]
pub struct HeartbeatHandle {
    resource_id: ResourceId,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(self) {}
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
