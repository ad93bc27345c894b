use serde::{Deserialize, Serialize};

/// Reachability state of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl ServiceStatus {
    #[must_use]
    pub fn from_check(healthy: bool) -> Self {
        if healthy {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Unhealthy
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Unknown => "unknown",
        }
    }

    /// Whether moving from `self` to `next` is an alert-worthy transition.
    ///
    /// Only `healthy <-> unhealthy` counts; leaving `unknown` does not.
    #[must_use]
    pub fn is_transition_to(self, next: ServiceStatus) -> bool {
        matches!(
            (self, next),
            (ServiceStatus::Healthy, ServiceStatus::Unhealthy)
                | (ServiceStatus::Unhealthy, ServiceStatus::Healthy)
        )
    }
}

/// Running health metrics for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    pub service_id: String,
    pub status: ServiceStatus,
    /// Duration of the most recent health check.
    pub response_time_ms: u64,
    /// Milliseconds since Unix epoch of the most recent check.
    pub last_checked_at: u64,
    pub error_count: u64,
    pub request_count: u64,
}

impl ServiceMetrics {
    /// Metrics for a service that has never been checked.
    #[must_use]
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            status: ServiceStatus::Unknown,
            response_time_ms: 0,
            last_checked_at: 0,
            error_count: 0,
            request_count: 0,
        }
    }

    /// Folds one health-check outcome into the metrics and returns the previous status.
    pub fn record_check(&mut self, healthy: bool, response_time_ms: u64, checked_at: u64) -> ServiceStatus {
        let previous = self.status;
        self.status = ServiceStatus::from_check(healthy);
        self.response_time_ms = response_time_ms;
        self.last_checked_at = checked_at;
        self.request_count += 1;
        if !healthy {
            self.error_count += 1;
        }
        previous
    }
}

/// Aggregate view over every service's metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub total_services: usize,
    pub healthy_services: usize,
    pub unhealthy_services: usize,
    pub average_response_time_ms: f64,
    pub total_requests: u64,
    pub total_errors: u64,
}

impl SystemMetrics {
    /// Aggregates a set of per-service metrics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn aggregate<'a>(metrics: impl IntoIterator<Item = &'a ServiceMetrics>) -> Self {
        let mut out = SystemMetrics::default();
        let mut response_sum: u64 = 0;
        for m in metrics {
            out.total_services += 1;
            match m.status {
                ServiceStatus::Healthy => out.healthy_services += 1,
                ServiceStatus::Unhealthy => out.unhealthy_services += 1,
                ServiceStatus::Unknown => {}
            }
            response_sum += m.response_time_ms;
            out.total_requests += m.request_count;
            out.total_errors += m.error_count;
        }
        if out.total_services > 0 {
            out.average_response_time_ms = response_sum as f64 / out.total_services as f64;
        }
        out
    }
}

/// Payload of a `service_health_alert` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthAlert {
    pub service_id: String,
    pub previous: ServiceStatus,
    pub current: ServiceStatus,
    pub response_time_ms: u64,
    pub error_count: u64,
    pub timestamp: u64,
}
