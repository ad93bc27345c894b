use serde::{Deserialize, Serialize};

/// Default per-call timeout applied when an endpoint does not set its own.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default health-check path for registered services.
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/health";

/// A remote service known to the registry.
///
/// Created once at startup and never mutated afterwards; re-registering the
/// same `id` replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    /// Unique identifier used for lookups, tokens and metrics.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Base address, e.g. `http://analytics.internal:4200`. No trailing slash required.
    pub base_address: String,
    /// Path appended to `base_address` for liveness probing.
    pub health_check_path: String,
    /// Default timeout for calls to this service.
    pub timeout_ms: u64,
}

impl ServiceEndpoint {
    /// Creates an endpoint with the default health-check path and timeout.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, base_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            base_address: base_address.into(),
            health_check_path: DEFAULT_HEALTH_CHECK_PATH.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Overrides the health-check path.
    #[must_use]
    pub fn with_health_check_path(mut self, path: impl Into<String>) -> Self {
        self.health_check_path = path.into();
        self
    }

    /// Overrides the default call timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Joins `path` onto the base address with exactly one `/` between them.
    #[must_use]
    pub fn url_for(&self, path: &str) -> String {
        let base = self.base_address.trim_end_matches('/');
        if path.is_empty() {
            return base.to_string();
        }
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    /// Full URL of the health-check endpoint.
    #[must_use]
    pub fn health_url(&self) -> String {
        self.url_for(&self.health_check_path)
    }
}
