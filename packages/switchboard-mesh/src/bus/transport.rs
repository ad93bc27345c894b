//! Relay of bus messages between runtimes.
//!
//! A bus with an attached [`Transport`] forwards `remote` and `broadcast`
//! publishes as `queue_message` envelopes and dispatches envelopes received
//! from other buses to its local handlers. Delivery is best-effort: a lagging
//! receiver loses envelopes and nothing is persisted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchboard_core::{MessageType, QueueMessage};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Wire envelope relayed between runtimes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Always [`MessageType::QueueMessage`].
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Id of the bus that sent the envelope; a bus ignores its own envelopes.
    pub origin: Uuid,
    pub message: QueueMessage,
}

impl Envelope {
    #[must_use]
    pub fn new(origin: Uuid, message: QueueMessage) -> Self {
        Self {
            kind: MessageType::QueueMessage,
            origin,
            message,
        }
    }
}

/// Cross-runtime relay used by the bus.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends an envelope to every other attached runtime.
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()>;

    /// Returns a receiver of envelopes sent by any attached runtime.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;
}

/// In-process transport backed by a `tokio::sync::broadcast` channel.
///
/// Clones share the same channel, so buses holding clones see each other's
/// envelopes.
#[derive(Debug, Clone)]
pub struct BroadcastTransport {
    sender: broadcast::Sender<Envelope>,
}

impl BroadcastTransport {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of attached receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    async fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        // No receivers just means no other runtime is listening.
        let _ = self.sender.send(envelope);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn envelopes_reach_every_subscriber() {
        let transport = BroadcastTransport::new(16);
        let mut a = transport.subscribe();
        let mut b = transport.clone().subscribe();
        assert_eq!(transport.receiver_count(), 2);

        let msg = QueueMessage::new(MessageType::DeployStarted, json!({"env": "prod"}), 0, 0);
        transport.send(Envelope::new(Uuid::new_v4(), msg.clone())).await.unwrap();

        assert_eq!(a.recv().await.unwrap().message, msg);
        assert_eq!(b.recv().await.unwrap().message, msg);
    }

    #[tokio::test]
    async fn send_without_receivers_is_not_an_error() {
        let transport = BroadcastTransport::new(4);
        let msg = QueueMessage::new(MessageType::DeployStarted, json!(null), 0, 0);
        assert!(transport.send(Envelope::new(Uuid::new_v4(), msg)).await.is_ok());
    }

    #[test]
    fn envelope_is_labelled_queue_message() {
        let msg = QueueMessage::new(MessageType::AiProcessComplete, json!({}), 0, 0);
        let json = serde_json::to_value(Envelope::new(Uuid::nil(), msg)).unwrap();
        assert_eq!(json["type"], "queue_message");
        assert_eq!(json["message"]["type"], "ai_process_complete");
    }
}
