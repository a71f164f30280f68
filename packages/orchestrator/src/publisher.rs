// ABOUTME: Fire-and-forget fan-out of state deltas, snapshots and events to live subscribers
// ABOUTME: Publishing never blocks; with no subscribers messages are dropped

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Channel {
    #[serde(rename = "sessionBrowserStream")]
    SessionBrowserStream,
    #[serde(rename = "sessionLogs")]
    SessionLogs,
    #[serde(rename = "sessionContainers")]
    SessionContainers,
    #[serde(rename = "poolStatus")]
    PoolStatus,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionBrowserStream => "sessionBrowserStream",
            Self::SessionLogs => "sessionLogs",
            Self::SessionContainers => "sessionContainers",
            Self::PoolStatus => "poolStatus",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Snapshot,
    Delta,
    Event,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub channel: Channel,
    pub key: String,
    pub kind: MessageKind,
    pub payload: Value,
}

pub trait Publisher: Send + Sync {
    fn publish(&self, message: Message);

    fn publish_delta(&self, channel: Channel, key: &str, payload: Value) {
        self.publish(Message {
            channel,
            key: key.to_string(),
            kind: MessageKind::Delta,
            payload,
        });
    }

    fn publish_snapshot(&self, channel: Channel, key: &str, payload: Value) {
        self.publish(Message {
            channel,
            key: key.to_string(),
            kind: MessageKind::Snapshot,
            payload,
        });
    }

    fn publish_event(&self, channel: Channel, key: &str, payload: Value) {
        self.publish(Message {
            channel,
            key: key.to_string(),
            kind: MessageKind::Event,
            payload,
        });
    }
}

/// In-process publisher backed by a tokio broadcast channel. Slow receivers lag and
/// lose messages rather than slowing publishers down.
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<Message>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Publisher for BroadcastPublisher {
    fn publish(&self, message: Message) {
        if self.sender.send(message).is_err() {
            trace!("No subscribers for published message");
        }
    }
}
