//! Cross-session message bus.
//!
//! Sessions never share memory; they coordinate by publishing JSON envelopes
//! `{ type, payload, timestamp, senderId }` on named channels. Delivery is
//! FIFO per publisher and channel, with no global ordering across publishers.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::error::BusError;
use crate::ids::HolderId;
use crate::time::UnixTimeMs;

mod broadcast_bus;
mod memory;

pub use self::broadcast_bus::TokioBus;
pub use self::memory::MemoryBus;

const MAX_CHANNEL_LENGTH: usize = 128;

pub(crate) fn validate_channel(name: &str) -> Result<(), BusError> {
    if name.is_empty()
        || name.len() > MAX_CHANNEL_LENGTH
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == ':')
    {
        return Err(BusError::InvalidChannel(name.to_string()));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: UnixTimeMs,
    pub sender_id: HolderId,
}

impl Envelope {
    pub fn new<T: Serialize>(
        kind: impl Into<String>,
        payload: &T,
        timestamp: UnixTimeMs,
        sender_id: HolderId,
    ) -> Result<Self, BusError> {
        Ok(Self {
            kind: kind.into(),
            payload: serde_json::to_value(payload)?,
            timestamp,
            sender_id,
        })
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Publish/subscribe over opaque channel names.
pub trait MessageBus: Send + Sync {
    fn publish(&self, channel: &str, envelope: &Envelope) -> Result<(), BusError>;
    fn subscribe(&self, channel: &str) -> Result<BusReceiver, BusError>;
}

impl<B: MessageBus + ?Sized> MessageBus for Arc<B> {
    fn publish(&self, channel: &str, envelope: &Envelope) -> Result<(), BusError> {
        (**self).publish(channel, envelope)
    }

    fn subscribe(&self, channel: &str) -> Result<BusReceiver, BusError> {
        (**self).subscribe(channel)
    }
}

type Frame = Arc<str>;

enum ReceiverInner {
    Unbounded(mpsc::UnboundedReceiver<Frame>),
    Broadcast(broadcast::Receiver<Frame>),
}

/// Receiving end of one channel subscription. Frames are decoded lazily so a
/// malformed frame only fails its own `recv`.
pub struct BusReceiver {
    channel: String,
    inner: ReceiverInner,
}

impl BusReceiver {
    pub(crate) fn unbounded(channel: &str, rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            channel: channel.to_string(),
            inner: ReceiverInner::Unbounded(rx),
        }
    }

    pub(crate) fn broadcast(channel: &str, rx: broadcast::Receiver<Frame>) -> Self {
        Self {
            channel: channel.to_string(),
            inner: ReceiverInner::Broadcast(rx),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next already-delivered envelope, without waiting.
    pub fn try_recv(&mut self) -> Result<Option<Envelope>, BusError> {
        let frame = match &mut self.inner {
            ReceiverInner::Unbounded(rx) => match rx.try_recv() {
                Ok(frame) => frame,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(None),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(BusError::Closed(self.channel.clone()))
                }
            },
            ReceiverInner::Broadcast(rx) => match rx.try_recv() {
                Ok(frame) => frame,
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(n)) => return Err(BusError::Lagged(n)),
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Err(BusError::Closed(self.channel.clone()))
                }
            },
        };
        Ok(Some(serde_json::from_str(&frame)?))
    }

    pub async fn recv(&mut self) -> Result<Envelope, BusError> {
        let frame = match &mut self.inner {
            ReceiverInner::Unbounded(rx) => rx
                .recv()
                .await
                .ok_or_else(|| BusError::Closed(self.channel.clone()))?,
            ReceiverInner::Broadcast(rx) => match rx.recv().await {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(BusError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(BusError::Closed(self.channel.clone()))
                }
            },
        };
        Ok(serde_json::from_str(&frame)?)
    }
}

impl std::fmt::Debug for BusReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusReceiver")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// One named channel as seen by one session.
///
/// Stamps outgoing envelopes with the session id and hides the session's own
/// envelopes from its receivers.
#[derive(Clone, Debug)]
pub struct Channel<B> {
    bus: B,
    name: String,
    sender_id: HolderId,
}

impl<B: MessageBus> Channel<B> {
    pub fn new(bus: B, name: impl Into<String>, sender_id: HolderId) -> Result<Self, BusError> {
        let name = name.into();
        validate_channel(&name)?;
        Ok(Self {
            bus,
            name,
            sender_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender_id(&self) -> &HolderId {
        &self.sender_id
    }

    pub fn publish<T: Serialize>(
        &self,
        kind: &str,
        payload: &T,
        now: UnixTimeMs,
    ) -> Result<(), BusError> {
        let envelope = Envelope::new(kind, payload, now, self.sender_id.clone())?;
        self.bus.publish(&self.name, &envelope)
    }

    pub fn subscribe(&self) -> Result<ChannelReceiver, BusError> {
        Ok(ChannelReceiver {
            inner: self.bus.subscribe(&self.name)?,
            own_id: self.sender_id.clone(),
        })
    }
}

#[derive(Debug)]
pub struct ChannelReceiver {
    inner: BusReceiver,
    own_id: HolderId,
}

impl ChannelReceiver {
    pub fn try_recv(&mut self) -> Result<Option<Envelope>, BusError> {
        loop {
            match self.inner.try_recv()? {
                Some(envelope) if envelope.sender_id == self.own_id => continue,
                other => return Ok(other),
            }
        }
    }

    pub async fn recv(&mut self) -> Result<Envelope, BusError> {
        loop {
            let envelope = self.inner.recv().await?;
            if envelope.sender_id != self.own_id {
                return Ok(envelope);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let envelope = Envelope::new(
            "heartbeat",
            &serde_json::json!({ "resourceId": "draft:1" }),
            UnixTimeMs(42),
            HolderId::new("tab-a").unwrap(),
        )
        .unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "heartbeat",
                "payload": { "resourceId": "draft:1" },
                "timestamp": 42,
                "senderId": "tab-a",
            })
        );
    }

    #[test]
    fn channel_name_validation() {
        assert!(validate_channel("writesync-locks").is_ok());
        assert!(validate_channel("").is_err());
        assert!(validate_channel("has space").is_err());
    }

    #[test]
    fn channel_hides_own_envelopes() {
        let bus = MemoryBus::new();
        let a = Channel::new(bus.clone(), "badges", HolderId::new("a").unwrap()).unwrap();
        let b = Channel::new(bus, "badges", HolderId::new("b").unwrap()).unwrap();
        let mut rx_a = a.subscribe().unwrap();
        let mut rx_b = b.subscribe().unwrap();

        a.publish("read", &3u32, UnixTimeMs(1)).unwrap();
        b.publish("read", &4u32, UnixTimeMs(2)).unwrap();

        let seen_by_a = rx_a.try_recv().unwrap().unwrap();
        assert_eq!(seen_by_a.payload_as::<u32>().unwrap(), 4);
        assert!(rx_a.try_recv().unwrap().is_none());

        let seen_by_b = rx_b.try_recv().unwrap().unwrap();
        assert_eq!(seen_by_b.payload_as::<u32>().unwrap(), 3);
        assert!(rx_b.try_recv().unwrap().is_none());
    }
}
