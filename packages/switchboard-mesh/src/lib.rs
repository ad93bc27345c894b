//! Switchboard Mesh, the in-process service orchestration layer: registry, auth
//! mediator, message bus, health monitor, connector and orchestrator.

pub mod auth;
pub mod bus;
pub mod config;
pub mod connector;
pub mod error;
pub mod health;
pub mod notify;
pub mod orchestrator;
pub mod registry;
pub mod worker;
pub mod workflow;

pub use auth::{AuthCallOptions, AuthMediator};
pub use bus::{BusStatus, MessageBus, MessageHandler, PublishOptions, Subscription};
pub use config::{AuthConfig, BusConfig, MeshConfig, MonitorConfig, ServiceSettings};
pub use connector::{ServiceConnector, ServiceRequest};
pub use error::{AuthError, MeshError};
pub use health::{HealthMonitor, HealthProbe};
pub use notify::{LogNotifier, MemoryNotifier, Notification, NotificationLevel, Notifier};
pub use orchestrator::{LifecycleState, Orchestrator, OrchestratorStatus};
pub use registry::{CallOptions, ServiceRegistry};
pub use workflow::WorkflowRequest;
