use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{validate_channel, BusReceiver, Envelope, Frame, MessageBus};
use crate::error::BusError;

#[derive(Default)]
struct Hub {
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Frame>>>>,
    published: AtomicU64,
}

/// Lossless in-process bus.
///
/// Every subscriber gets its own unbounded queue; nothing is delivered until
/// the subscriber drains it, which lets tests decide exactly when each
/// session observes a broadcast. Clones share the same hub.
#[derive(Clone, Default)]
pub struct MemoryBus {
    hub: Arc<Hub>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total envelopes published across all channels.
    pub fn published(&self) -> u64 {
        self.hub.published.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.hub.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|s| !s.is_closed()).count())
    }
}

impl MessageBus for MemoryBus {
    fn publish(&self, channel: &str, envelope: &Envelope) -> Result<(), BusError> {
        validate_channel(channel)?;
        let frame: Frame = serde_json::to_string(envelope)?.into();

        let mut channels = self.hub.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|tx| tx.send(Arc::clone(&frame)).is_ok());
        }
        self.hub.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<BusReceiver, BusError> {
        validate_channel(channel)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.hub.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.entry(channel.to_string()).or_default().push(tx);
        Ok(BusReceiver::unbounded(channel, rx))
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("published", &self.published())
            .finish_non_exhaustive()
    }
}
