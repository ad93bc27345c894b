//! Tagged outcomes of service calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Data returned by a service call, tagged with where it came from.
///
/// `Simulated` answers come from the deterministic stand-in used when the
/// real backend is unreachable; callers must be able to tell them apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "data", rename_all = "lowercase")]
pub enum ServiceCallResult {
    Real(Value),
    Simulated(Value),
}

impl ServiceCallResult {
    #[must_use]
    pub fn is_simulated(&self) -> bool {
        matches!(self, ServiceCallResult::Simulated(_))
    }

    #[must_use]
    pub fn data(&self) -> &Value {
        match self {
            ServiceCallResult::Real(v) | ServiceCallResult::Simulated(v) => v,
        }
    }

    #[must_use]
    pub fn into_data(self) -> Value {
        match self {
            ServiceCallResult::Real(v) | ServiceCallResult::Simulated(v) => v,
        }
    }
}

/// Failure category carried in a [`ServiceResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ServiceUnavailable,
    ServiceTimeout,
    ServiceError,
    AuthenticationFailed,
    UnknownService,
    InvalidResponse,
}

/// Error half of a [`ServiceResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub status: Option<u16>,
}

impl ServiceFailure {
    /// Whether retrying the same call could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self.kind {
            FailureKind::ServiceUnavailable | FailureKind::ServiceTimeout => true,
            FailureKind::ServiceError => self.status.is_some_and(|s| s >= 500),
            FailureKind::AuthenticationFailed
            | FailureKind::UnknownService
            | FailureKind::InvalidResponse => false,
        }
    }
}

/// Call metadata attached to every [`ServiceResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub service: String,
    pub endpoint: String,
    pub authenticated: bool,
    pub duration_ms: u64,
    /// Milliseconds since Unix epoch when the call started.
    pub timestamp: u64,
}

/// Normalized result of a connector call: callers never see raw network errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ServiceFailure>,
    pub metadata: ResponseMetadata,
}

impl ServiceResponse {
    #[must_use]
    pub fn ok(data: Value, metadata: ResponseMetadata) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata,
        }
    }

    #[must_use]
    pub fn failed(error: ServiceFailure, metadata: ResponseMetadata) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn call_result_is_distinguishable() {
        let real = ServiceCallResult::Real(json!({"score": 1}));
        let sim = ServiceCallResult::Simulated(json!({"score": 1}));
        assert_ne!(real, sim);
        assert!(!real.is_simulated());
        assert!(sim.is_simulated());
        assert_eq!(real.data(), sim.data());
    }

    #[test]
    fn call_result_serializes_source_tag() {
        let sim = ServiceCallResult::Simulated(json!({"x": 1}));
        let json = serde_json::to_value(&sim).unwrap();
        assert_eq!(json["source"], "simulated");
        assert_eq!(json["data"]["x"], 1);
    }

    #[test]
    fn transient_classification() {
        let make = |kind, status| ServiceFailure {
            kind,
            message: String::new(),
            status,
        };
        assert!(make(FailureKind::ServiceUnavailable, None).is_transient());
        assert!(make(FailureKind::ServiceTimeout, None).is_transient());
        assert!(make(FailureKind::ServiceError, Some(503)).is_transient());
        assert!(!make(FailureKind::ServiceError, Some(404)).is_transient());
        assert!(!make(FailureKind::AuthenticationFailed, None).is_transient());
    }
}
