use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use super::{validate_channel, BusReceiver, Envelope, Frame, MessageBus};
use crate::error::BusError;

const DEFAULT_CAPACITY: usize = 256;

/// Bus backed by one tokio broadcast ring per channel.
///
/// Slow receivers that fall more than `capacity` frames behind observe
/// [`BusError::Lagged`] and continue from the oldest retained frame.
#[derive(Clone)]
pub struct TokioBus {
    capacity: usize,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Frame>>>>,
}

impl TokioBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Frame> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for TokioBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus for TokioBus {
    fn publish(&self, channel: &str, envelope: &Envelope) -> Result<(), BusError> {
        validate_channel(channel)?;
        let frame: Frame = serde_json::to_string(envelope)?.into();
        if self.sender(channel).send(frame).is_err() {
            debug!(channel, "published with no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<BusReceiver, BusError> {
        validate_channel(channel)?;
        Ok(BusReceiver::broadcast(channel, self.sender(channel).subscribe()))
    }
}

impl std::fmt::Debug for TokioBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioBus")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::HolderId;
    use crate::time::UnixTimeMs;

    fn envelope(n: u32) -> Envelope {
        Envelope::new("tick", &n, UnixTimeMs(n as u64), HolderId::new("sender").unwrap()).unwrap()
    }

    #[tokio::test]
    async fn fan_out_to_all_subscribers() {
        let bus = TokioBus::new();
        let mut a = bus.subscribe("locks").unwrap();
        let mut b = bus.subscribe("locks").unwrap();
        bus.publish("locks", &envelope(1)).unwrap();
        assert_eq!(a.recv().await.unwrap().payload_as::<u32>().unwrap(), 1);
        assert_eq!(b.recv().await.unwrap().payload_as::<u32>().unwrap(), 1);
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = TokioBus::new();
        assert!(bus.publish("locks", &envelope(1)).is_ok());
    }

    #[test]
    fn slow_receiver_reports_lag() {
        let bus = TokioBus::with_capacity(2);
        let mut rx = bus.subscribe("locks").unwrap();
        for n in 0..5 {
            bus.publish("locks", &envelope(n)).unwrap();
        }
        assert!(matches!(rx.try_recv(), Err(BusError::Lagged(3))));
        assert_eq!(rx.try_recv().unwrap().unwrap().payload_as::<u32>().unwrap(), 3);
    }
}
