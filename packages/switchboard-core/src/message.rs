//! Message-bus data model.
//!
//! Message types form a closed enum so every handler map, match and test
//! covers the full event taxonomy at compile time. Wire names are the stable
//! `snake_case` strings other runtimes depend on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Every event the orchestration layer publishes or consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Transport envelope relayed between runtimes.
    QueueMessage,
    /// A message that exhausted its retry budget.
    DeadLetter,
    /// Per-service metrics snapshot after a health check.
    ServiceMetrics,
    /// Healthy/unhealthy transition of a service.
    ServiceHealthAlert,
    /// Aggregated metrics after a full health sweep.
    SystemMetrics,
    DeployRequest,
    DeployStarted,
    DeployFailed,
    DataAnalysisRequest,
    DataAnalysisComplete,
    DataAnalysisFailed,
    AiProcessRequest,
    AiProcessComplete,
    AiProcessFailed,
    /// Emitted once the orchestrator finished initializing.
    InfrastructureReady,
}

impl MessageType {
    /// All variants, in declaration order.
    pub const ALL: [MessageType; 15] = [
        MessageType::QueueMessage,
        MessageType::DeadLetter,
        MessageType::ServiceMetrics,
        MessageType::ServiceHealthAlert,
        MessageType::SystemMetrics,
        MessageType::DeployRequest,
        MessageType::DeployStarted,
        MessageType::DeployFailed,
        MessageType::DataAnalysisRequest,
        MessageType::DataAnalysisComplete,
        MessageType::DataAnalysisFailed,
        MessageType::AiProcessRequest,
        MessageType::AiProcessComplete,
        MessageType::AiProcessFailed,
        MessageType::InfrastructureReady,
    ];

    /// Stable wire name of this message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageType::QueueMessage => "queue_message",
            MessageType::DeadLetter => "dead_letter",
            MessageType::ServiceMetrics => "service_metrics",
            MessageType::ServiceHealthAlert => "service_health_alert",
            MessageType::SystemMetrics => "system_metrics",
            MessageType::DeployRequest => "deploy_request",
            MessageType::DeployStarted => "deploy_started",
            MessageType::DeployFailed => "deploy_failed",
            MessageType::DataAnalysisRequest => "data_analysis_request",
            MessageType::DataAnalysisComplete => "data_analysis_complete",
            MessageType::DataAnalysisFailed => "data_analysis_failed",
            MessageType::AiProcessRequest => "ai_process_request",
            MessageType::AiProcessComplete => "ai_process_complete",
            MessageType::AiProcessFailed => "ai_process_failed",
            MessageType::InfrastructureReady => "infrastructure_ready",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known [`MessageType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessageType(pub String);

impl fmt::Display for UnknownMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message type: {}", self.0)
    }
}

impl std::error::Error for UnknownMessageType {}

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownMessageType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// QueueMessage
// ---------------------------------------------------------------------------

/// Unique identifier of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a published message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryTarget {
    /// Handlers in this runtime only.
    #[default]
    Local,
    /// Other runtimes only, via the attached transport.
    Remote,
    /// Both local handlers and other runtimes.
    Broadcast,
}

impl DeliveryTarget {
    #[must_use]
    pub const fn includes_local(self) -> bool {
        matches!(self, DeliveryTarget::Local | DeliveryTarget::Broadcast)
    }

    #[must_use]
    pub const fn includes_remote(self) -> bool {
        matches!(self, DeliveryTarget::Remote | DeliveryTarget::Broadcast)
    }
}

/// A message tracked by the bus from `publish` until completion or dead-lettering.
///
/// `retry_count` is only ever incremented by the bus's retry pipeline and
/// never exceeds `max_retries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: Value,
    /// Creation time in milliseconds since Unix epoch.
    pub created_at: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub delay_ms: Option<u64>,
}

impl QueueMessage {
    /// Creates a fresh message with a generated id and zero retries.
    #[must_use]
    pub fn new(kind: MessageType, payload: Value, created_at: u64, max_retries: u32) -> Self {
        Self {
            id: MessageId::generate(),
            kind,
            payload,
            created_at,
            retry_count: 0,
            max_retries,
            delay_ms: None,
        }
    }

    /// Whether another retry is allowed after a failed dispatch.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether this dispatch is the last one before dead-lettering.
    #[must_use]
    pub fn is_final_attempt(&self) -> bool {
        !self.can_retry()
    }
}

/// Payload of a `dead_letter` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// Type of the message that failed permanently.
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub message_id: MessageId,
    pub payload: Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: u64,
    pub failed_at: u64,
    /// Last handler failure, rendered as text.
    pub error: String,
}

impl DeadLetterRecord {
    /// Builds the dead-letter record for `message`.
    #[must_use]
    pub fn from_message(message: &QueueMessage, error: impl Into<String>, failed_at: u64) -> Self {
        Self {
            kind: message.kind,
            message_id: message.id,
            payload: message.payload.clone(),
            retry_count: message.retry_count,
            max_retries: message.max_retries,
            created_at: message.created_at,
            failed_at,
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn wire_names_match_serde_and_parse_back() {
        for kind in MessageType::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, Value::String(kind.as_str().to_string()));
            assert_eq!(kind.as_str().parse::<MessageType>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let err = "chat_message".parse::<MessageType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown message type: chat_message");
    }

    #[test]
    fn delivery_target_flags() {
        assert!(DeliveryTarget::Local.includes_local());
        assert!(!DeliveryTarget::Local.includes_remote());
        assert!(!DeliveryTarget::Remote.includes_local());
        assert!(DeliveryTarget::Broadcast.includes_local());
        assert!(DeliveryTarget::Broadcast.includes_remote());
    }

    #[test]
    fn retry_budget() {
        let mut msg = QueueMessage::new(MessageType::DeployRequest, json!({}), 0, 2);
        assert!(msg.can_retry());
        msg.retry_count = 2;
        assert!(msg.is_final_attempt());

        let none = QueueMessage::new(MessageType::DeployRequest, json!({}), 0, 0);
        assert!(none.is_final_attempt());
    }

    #[test]
    fn queue_message_serializes_type_field() {
        let msg = QueueMessage::new(MessageType::AiProcessRequest, json!({"v": 1}), 42, 3);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ai_process_request");
        assert_eq!(json["retryCount"], 0);
        assert_eq!(json["maxRetries"], 3);
        assert!(json.get("delayMs").is_none());
    }

    #[test]
    fn dead_letter_record_copies_message() {
        let mut msg = QueueMessage::new(MessageType::DeployRequest, json!({"v": 1}), 7, 2);
        msg.retry_count = 2;
        let record = DeadLetterRecord::from_message(&msg, "boom", 99);
        assert_eq!(record.kind, MessageType::DeployRequest);
        assert_eq!(record.message_id, msg.id);
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.failed_at, 99);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "deploy_request");
        assert_eq!(json["payload"]["v"], 1);
    }
}
