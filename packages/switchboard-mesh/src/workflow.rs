//! Bus handlers for the deployment, analysis and AI request flows.
//!
//! Each handler reads a [`WorkflowRequest`] from the message payload, performs
//! the call through the [`ServiceConnector`], and republishes the outcome:
//!
//! | request                 | success                  | failure                |
//! |-------------------------|--------------------------|------------------------|
//! | `deploy_request`        | `deploy_started`         | `deploy_failed`        |
//! | `data_analysis_request` | `data_analysis_complete` | `data_analysis_failed` |
//! | `ai_process_request`    | `ai_process_complete`    | `ai_process_failed`    |
//!
//! Transient failures are returned as errors while the message still has
//! retries left, so the bus retries silently. Authentication failures, other
//! permanent errors and the final attempt publish the `*_failed` event instead.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use switchboard_core::{MessageType, QueueMessage, SessionContext};
use tracing::{info, warn};

use crate::bus::{MessageBus, MessageHandler, PublishOptions};
use crate::connector::ServiceConnector;
use crate::error::MeshError;

/// Payload of the three `*_request` message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRequest {
    /// Domain input forwarded to the service.
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub session: SessionContext,
}

impl WorkflowRequest {
    #[must_use]
    pub fn new(data: Value, session: SessionContext) -> Self {
        Self { data, session }
    }
}

/// Which flow a [`Workflow`] handler drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowKind {
    Deploy,
    Analysis,
    Ai,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 3] = [WorkflowKind::Deploy, WorkflowKind::Analysis, WorkflowKind::Ai];

    #[must_use]
    pub const fn request(self) -> MessageType {
        match self {
            WorkflowKind::Deploy => MessageType::DeployRequest,
            WorkflowKind::Analysis => MessageType::DataAnalysisRequest,
            WorkflowKind::Ai => MessageType::AiProcessRequest,
        }
    }

    #[must_use]
    pub const fn success(self) -> MessageType {
        match self {
            WorkflowKind::Deploy => MessageType::DeployStarted,
            WorkflowKind::Analysis => MessageType::DataAnalysisComplete,
            WorkflowKind::Ai => MessageType::AiProcessComplete,
        }
    }

    #[must_use]
    pub const fn failure(self) -> MessageType {
        match self {
            WorkflowKind::Deploy => MessageType::DeployFailed,
            WorkflowKind::Analysis => MessageType::DataAnalysisFailed,
            WorkflowKind::Ai => MessageType::AiProcessFailed,
        }
    }
}

/// Handler for one request type.
///
/// Holds the bus weakly: the bus owns its handlers, so a strong reference
/// would keep both alive forever.
pub struct Workflow {
    kind: WorkflowKind,
    connector: Arc<ServiceConnector>,
    bus: Weak<MessageBus>,
}

impl Workflow {
    #[must_use]
    pub fn new(kind: WorkflowKind, connector: Arc<ServiceConnector>, bus: &Arc<MessageBus>) -> Self {
        Self {
            kind,
            connector,
            bus: Arc::downgrade(bus),
        }
    }

    async fn execute(&self, request: &WorkflowRequest) -> Result<Value, MeshError> {
        match self.kind {
            WorkflowKind::Deploy => self.connector.deploy(&request.data, &request.session).await,
            WorkflowKind::Analysis => self
                .connector
                .analyze_data(&request.data, &request.session)
                .await
                .map(|result| json!(result)),
            WorkflowKind::Ai => self
                .connector
                .process_with_ai(&request.data, &request.session)
                .await
                .map(|result| json!(result)),
        }
    }

    async fn emit(bus: &MessageBus, kind: MessageType, payload: Value) {
        bus.publish(kind, payload, PublishOptions::new()).await;
    }
}

#[async_trait]
impl MessageHandler for Workflow {
    async fn handle(&self, message: &QueueMessage) -> anyhow::Result<()> {
        let Some(bus) = self.bus.upgrade() else {
            return Ok(());
        };

        let request: WorkflowRequest = match serde_json::from_value(message.payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "malformed workflow request");
                let payload = json!({
                    "requestId": message.id,
                    "error": format!("malformed request: {e}"),
                });
                Self::emit(&bus, self.kind.failure(), payload).await;
                return Ok(());
            }
        };

        match self.execute(&request).await {
            Ok(result) => {
                info!(message_id = %message.id, outcome = %self.kind.success(), "workflow succeeded");
                let payload = json!({ "requestId": message.id, "result": result });
                Self::emit(&bus, self.kind.success(), payload).await;
                Ok(())
            }
            Err(e) if e.is_transient() && !message.is_final_attempt() => Err(e.into()),
            Err(e) => {
                warn!(message_id = %message.id, error = %e, outcome = %self.kind.failure(), "workflow failed");
                let payload = json!({
                    "requestId": message.id,
                    "error": e.to_string(),
                    "failure": e.to_failure(),
                });
                Self::emit(&bus, self.kind.failure(), payload).await;
                Ok(())
            }
        }
    }
}
