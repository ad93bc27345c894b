//! Error taxonomy of the orchestration layer.
//!
//! `PermanentFailure` has no variant here: exhausted messages are never
//! returned as errors, they become `dead_letter` events instead.

use switchboard_core::{FailureKind, MessageType, ServiceFailure};

/// Reasons an authentication attempt is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no token available for service {service}")]
    MissingToken { service: String },
    #[error("token is malformed, has a bad signature, or is of the wrong type")]
    InvalidToken,
    #[error("token has expired")]
    Expired,
    #[error("missing permissions: {}", missing.join(", "))]
    InsufficientPermissions { missing: Vec<String> },
    #[error("failed to encode token: {0}")]
    Encoding(String),
}

/// Errors surfaced by the registry, auth mediator and bus.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("service {service} is unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },
    #[error("service {service} timed out after {timeout_ms}ms")]
    ServiceTimeout { service: String, timeout_ms: u64 },
    #[error("service {service} responded with status {status}")]
    ServiceError { service: String, status: u16 },
    #[error("unknown service: {service}")]
    UnknownService { service: String },
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[from] AuthError),
    #[error("{failed} of {total} handlers failed for {message_type}: {reason}")]
    HandlerFailure {
        message_type: MessageType,
        failed: usize,
        total: usize,
        reason: String,
    },
}

impl MeshError {
    /// Whether the same call may succeed if retried later.
    ///
    /// Authentication failures are never transient: retrying with the same
    /// token cannot help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            MeshError::ServiceUnavailable { .. } | MeshError::ServiceTimeout { .. } => true,
            MeshError::ServiceError { status, .. } => *status >= 500,
            MeshError::HandlerFailure { .. } => true,
            MeshError::UnknownService { .. } | MeshError::AuthenticationFailed(_) => false,
        }
    }

    /// Whether the target service should be considered unreachable.
    ///
    /// This is what makes the connector fall back to simulated answers. A
    /// service that answers at all, even with a 5xx, is reachable.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            MeshError::ServiceUnavailable { .. } | MeshError::ServiceTimeout { .. }
        )
    }

    /// Converts the error into the tagged failure carried by connector responses.
    #[must_use]
    pub fn to_failure(&self) -> ServiceFailure {
        let (kind, status) = match self {
            MeshError::ServiceUnavailable { .. } => (FailureKind::ServiceUnavailable, None),
            MeshError::ServiceTimeout { .. } => (FailureKind::ServiceTimeout, None),
            MeshError::ServiceError { status, .. } => (FailureKind::ServiceError, Some(*status)),
            MeshError::UnknownService { .. } => (FailureKind::UnknownService, None),
            MeshError::HandlerFailure { .. } => (FailureKind::InvalidResponse, None),
            MeshError::AuthenticationFailed(_) => (FailureKind::AuthenticationFailed, None),
        };
        ServiceFailure {
            kind,
            message: self.to_string(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let unavailable = MeshError::ServiceUnavailable {
            service: "a".into(),
            reason: "refused".into(),
        };
        assert!(unavailable.is_transient());
        assert!(unavailable.is_unreachable());

        let not_found = MeshError::ServiceError {
            service: "a".into(),
            status: 404,
        };
        assert!(!not_found.is_transient());
        assert!(!not_found.is_unreachable());

        let bad_gateway = MeshError::ServiceError {
            service: "a".into(),
            status: 502,
        };
        assert!(bad_gateway.is_transient());
        assert!(!bad_gateway.is_unreachable());

        let auth = MeshError::from(AuthError::Expired);
        assert!(!auth.is_transient());
        assert!(!auth.is_unreachable());
    }

    #[test]
    fn to_failure_keeps_status() {
        let err = MeshError::ServiceError {
            service: "analytics".into(),
            status: 502,
        };
        let failure = err.to_failure();
        assert_eq!(failure.kind, FailureKind::ServiceError);
        assert_eq!(failure.status, Some(502));
        assert!(failure.is_transient());
        assert_eq!(failure.message, "service analytics responded with status 502");
    }

    #[test]
    fn insufficient_permissions_message_lists_missing() {
        let err = AuthError::InsufficientPermissions {
            missing: vec!["deploy".into(), "admin".into()],
        };
        assert_eq!(err.to_string(), "missing permissions: deploy, admin");
    }
}
