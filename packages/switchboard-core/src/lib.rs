//! Switchboard Core: data model shared by the orchestration runtime and its callers.

pub mod auth;
pub mod clock;
pub mod endpoint;
pub mod message;
pub mod metrics;
pub mod result;
pub mod session;

pub use auth::{AuthenticatedRequest, ServiceToken, TokenKind, UserToken, ADMIN_GRANT, TOKEN_TTL_SECS};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use endpoint::ServiceEndpoint;
pub use message::{DeadLetterRecord, DeliveryTarget, MessageId, MessageType, QueueMessage};
pub use metrics::{HealthAlert, ServiceMetrics, ServiceStatus, SystemMetrics};
pub use result::{FailureKind, ResponseMetadata, ServiceCallResult, ServiceFailure, ServiceResponse};
pub use session::SessionContext;
