//! Composition root of the orchestration layer.
//!
//! An [`Orchestrator`] owns one instance of every component and wires them
//! together: the registry and auth mediator learn the configured services,
//! the workflow handlers subscribe to the bus, and the health monitor starts
//! polling. Nothing here is global; embedders build as many orchestrators as
//! they need and share them through `Arc`.
//!
//! Lifecycle: `idle -> ready -> stopped`. `initialize()` may be called again
//! after `shutdown()` to bring the same instance back up.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::{json, Value};
use switchboard_core::{
    ClockSource, MessageId, MessageType, ServiceEndpoint, ServiceMetrics, SessionContext, SystemClock, SystemMetrics,
};
use tracing::{debug, info};

use crate::auth::AuthMediator;
use crate::bus::{BusStatus, MessageBus, PublishOptions, Subscription};
use crate::config::MeshConfig;
use crate::connector::ServiceConnector;
use crate::error::MeshError;
use crate::health::HealthMonitor;
use crate::notify::{LogNotifier, Notifier};
use crate::registry::ServiceRegistry;
use crate::workflow::{Workflow, WorkflowKind, WorkflowRequest};

/// Lifecycle state of an [`Orchestrator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Built but not initialized.
    Idle,
    /// Services registered, workflows subscribed, monitoring running.
    Ready,
    /// Shut down; timers stopped and workflows unsubscribed.
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Ready => "ready",
            LifecycleState::Stopped => "stopped",
        }
    }
}

/// Aggregated snapshot returned by [`Orchestrator::get_status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub state: LifecycleState,
    pub monitoring: bool,
    pub services: Vec<ServiceEndpoint>,
    pub service_metrics: Vec<ServiceMetrics>,
    pub system: SystemMetrics,
    pub bus: BusStatus,
}

pub struct Orchestrator {
    config: MeshConfig,
    registry: Arc<ServiceRegistry>,
    auth: Arc<AuthMediator>,
    bus: Arc<MessageBus>,
    monitor: Arc<HealthMonitor>,
    connector: Arc<ServiceConnector>,
    state: ArcSwap<LifecycleState>,
    /// Workflow subscriptions; also serializes `initialize` and `shutdown`.
    workflows: tokio::sync::Mutex<Vec<Subscription>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: MeshConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(LogNotifier))
    }

    /// Builds an orchestrator whose components share `clock` and `notifier`.
    #[must_use]
    pub fn with_parts(config: MeshConfig, clock: Arc<dyn ClockSource>, notifier: Arc<dyn Notifier>) -> Self {
        let registry = Arc::new(ServiceRegistry::with_notifier(Arc::clone(&notifier)));
        let auth = Arc::new(AuthMediator::with_clock(
            Arc::clone(&registry),
            &config.auth,
            Arc::clone(&clock),
        ));
        let bus = Arc::new(MessageBus::with_parts(
            config.bus.clone(),
            Arc::clone(&clock),
            Arc::clone(&notifier),
        ));
        let monitor = Arc::new(HealthMonitor::with_parts(
            Arc::clone(&registry) as Arc<dyn crate::health::HealthProbe>,
            Arc::clone(&bus),
            Arc::clone(&clock),
            notifier,
        ));
        let connector = Arc::new(ServiceConnector::with_clock(
            Arc::clone(&registry),
            Arc::clone(&auth),
            clock,
        ));
        Self {
            config,
            registry,
            auth,
            bus,
            monitor,
            connector,
            state: ArcSwap::from_pointee(LifecycleState::Idle),
            workflows: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Brings the orchestrator to `ready`. Calling it again while ready is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if a service token cannot be issued.
    pub async fn initialize(&self) -> Result<SystemMetrics, MeshError> {
        let mut workflows = self.workflows.lock().await;
        if self.state() == LifecycleState::Ready {
            debug!("orchestrator already initialized");
            return Ok(self.monitor.get_system_metrics());
        }

        for (endpoint, settings) in self.config.endpoints().into_iter().zip(&self.config.services) {
            let permissions: Vec<&str> = settings.permissions.iter().map(String::as_str).collect();
            self.auth.register_service(&endpoint.id, &permissions)?;
            self.registry.register(endpoint);
        }

        if workflows.is_empty() {
            for kind in WorkflowKind::ALL {
                let handler = Workflow::new(kind, Arc::clone(&self.connector), &self.bus);
                workflows.push(self.bus.subscribe(kind.request(), handler));
            }
        }

        self.bus.start().await;
        self.monitor.start_monitoring(self.config.monitor.interval).await;

        let initial = self.monitor.check_all().await;
        info!(
            services = initial.total_services,
            healthy = initial.healthy_services,
            unhealthy = initial.unhealthy_services,
            avg_response_ms = initial.average_response_time_ms,
            "initial health sweep complete"
        );

        self.state.store(Arc::new(LifecycleState::Ready));
        self.bus
            .publish(
                MessageType::InfrastructureReady,
                json!({
                    "services": self.registry.ids(),
                    "system": initial,
                }),
                PublishOptions::no_retry(),
            )
            .await;
        info!("orchestrator ready");
        Ok(initial)
    }

    /// Stops monitoring, unsubscribes the workflows and stops the bus timers.
    /// Idempotent.
    pub async fn shutdown(&self) {
        let mut workflows = self.workflows.lock().await;
        if self.state() == LifecycleState::Stopped {
            return;
        }
        self.monitor.stop_monitoring().await;
        for subscription in workflows.drain(..) {
            subscription.unsubscribe();
        }
        self.bus.stop().await;
        self.state.store(Arc::new(LifecycleState::Stopped));
        info!("orchestrator stopped");
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    // -- workflow entry points ------------------------------------------------

    /// Publishes a `deploy_request`; the outcome arrives as `deploy_started`
    /// or `deploy_failed`.
    pub async fn trigger_deployment(&self, config: Value, session: &SessionContext) -> MessageId {
        self.submit(WorkflowKind::Deploy, config, session).await
    }

    /// Publishes a `data_analysis_request`; the outcome arrives as
    /// `data_analysis_complete` or `data_analysis_failed`.
    pub async fn request_data_analysis(&self, data: Value, session: &SessionContext) -> MessageId {
        self.submit(WorkflowKind::Analysis, data, session).await
    }

    /// Publishes an `ai_process_request`; the outcome arrives as
    /// `ai_process_complete` or `ai_process_failed`.
    pub async fn request_ai_processing(&self, input: Value, session: &SessionContext) -> MessageId {
        self.submit(WorkflowKind::Ai, input, session).await
    }

    async fn submit(&self, kind: WorkflowKind, data: Value, session: &SessionContext) -> MessageId {
        let request = WorkflowRequest::new(data, session.clone());
        self.bus
            .publish(kind.request(), json!(request), PublishOptions::new())
            .await
    }

    // -- introspection --------------------------------------------------------

    pub async fn get_status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            state: self.state(),
            monitoring: self.monitor.is_monitoring().await,
            services: self.registry.list_all(),
            service_metrics: self.monitor.get_all_metrics(),
            system: self.monitor.get_system_metrics(),
            bus: self.bus.status(),
        }
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn auth(&self) -> &Arc<AuthMediator> {
        &self.auth
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn connector(&self) -> &Arc<ServiceConnector> {
        &self.connector
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::MonitorConfig;

    fn unreachable_config() -> MeshConfig {
        MeshConfig {
            request_timeout: Duration::from_millis(200),
            monitor: MonitorConfig {
                interval: Duration::from_secs(60),
            },
            ..MeshConfig::default()
        }
        .with_base_address("deployment", "http://127.0.0.1:1")
        .with_base_address("analytics", "http://127.0.0.1:1")
        .with_base_address("ai", "http://127.0.0.1:1")
    }

    #[tokio::test]
    async fn initialize_twice_registers_each_service_once() {
        let orchestrator = Orchestrator::new(unreachable_config());
        assert_eq!(orchestrator.state(), LifecycleState::Idle);

        orchestrator.initialize().await.unwrap();
        orchestrator.initialize().await.unwrap();

        assert_eq!(orchestrator.state(), LifecycleState::Ready);
        assert_eq!(orchestrator.registry().len(), 3);
        for kind in WorkflowKind::ALL {
            assert_eq!(orchestrator.bus().handler_count(kind.request()), 1);
        }
        assert!(orchestrator.auth().service_token("analytics").is_some());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn initial_sweep_marks_unreachable_services_unhealthy() {
        let orchestrator = Orchestrator::new(unreachable_config());
        let initial = orchestrator.initialize().await.unwrap();
        assert_eq!(initial.total_services, 3);
        assert_eq!(initial.unhealthy_services, 3);

        let status = orchestrator.get_status().await;
        assert_eq!(status.state, LifecycleState::Ready);
        assert!(status.monitoring);
        assert_eq!(status.services.len(), 3);
        assert_eq!(status.service_metrics.len(), 3);
        assert!(status.bus.running);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_everything_and_is_idempotent() {
        let orchestrator = Orchestrator::new(unreachable_config());
        orchestrator.initialize().await.unwrap();
        orchestrator.shutdown().await;
        orchestrator.shutdown().await;

        let status = orchestrator.get_status().await;
        assert_eq!(status.state, LifecycleState::Stopped);
        assert!(!status.monitoring);
        assert!(!status.bus.running);
        for kind in WorkflowKind::ALL {
            assert_eq!(orchestrator.bus().handler_count(kind.request()), 0);
        }

        orchestrator.initialize().await.unwrap();
        assert_eq!(orchestrator.state(), LifecycleState::Ready);
        assert_eq!(orchestrator.bus().handler_count(MessageType::DeployRequest), 1);
        orchestrator.shutdown().await;
    }

    #[test]
    fn status_serializes_state_in_lowercase() {
        assert_eq!(serde_json::to_value(LifecycleState::Ready).unwrap(), "ready");
        assert_eq!(LifecycleState::Stopped.as_str(), "stopped");
    }
}
