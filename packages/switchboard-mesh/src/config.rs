//! Configuration types for the orchestration runtime.
//!
//! Only service base addresses, the request timeout and the token secret are
//! meant to come from the environment (see the `switchboard` binary). Retry
//! caps and polling intervals keep their in-code defaults.

use std::time::Duration;

use switchboard_core::{ServiceEndpoint, TOKEN_TTL_SECS};
use uuid::Uuid;

/// Identifiers of the services the orchestrator registers at startup.
pub mod service_ids {
    pub const DEPLOYMENT: &str = "deployment";
    pub const ANALYTICS: &str = "analytics";
    pub const AI: &str = "ai";
}

/// Permission names checked by the workflow handlers.
pub mod permissions {
    pub const READ: &str = "read";
    pub const DEPLOY: &str = "deploy";
    pub const ANALYZE: &str = "analyze";
    pub const AI_PROCESS: &str = "ai:process";
}

/// Top-level configuration for an [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Services registered during `initialize()`.
    pub services: Vec<ServiceSettings>,
    /// Default timeout for calls to registered services.
    pub request_timeout: Duration,
    pub bus: BusConfig,
    pub monitor: MonitorConfig,
    pub auth: AuthConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            services: vec![
                ServiceSettings::new(
                    service_ids::DEPLOYMENT,
                    "Deployment Service",
                    "http://localhost:4100",
                    &[permissions::READ, permissions::DEPLOY],
                ),
                ServiceSettings::new(
                    service_ids::ANALYTICS,
                    "Data Analysis Service",
                    "http://localhost:4200",
                    &[permissions::READ, permissions::ANALYZE],
                ),
                ServiceSettings::new(
                    service_ids::AI,
                    "AI Processing Service",
                    "http://localhost:4300",
                    &[permissions::READ, permissions::AI_PROCESS],
                ),
            ],
            request_timeout: Duration::from_secs(30),
            bus: BusConfig::default(),
            monitor: MonitorConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl MeshConfig {
    /// Replaces the base address of the service with `id`, if configured.
    #[must_use]
    pub fn with_base_address(mut self, id: &str, base_address: impl Into<String>) -> Self {
        let base_address = base_address.into();
        if let Some(svc) = self.services.iter_mut().find(|s| s.id == id) {
            svc.base_address = base_address;
        }
        self
    }

    /// Builds the endpoint list, applying `request_timeout` to every service.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn endpoints(&self) -> Vec<ServiceEndpoint> {
        let timeout_ms = self.request_timeout.as_millis() as u64;
        self.services
            .iter()
            .map(|s| {
                ServiceEndpoint::new(&s.id, &s.name, &s.base_address)
                    .with_health_check_path(&s.health_check_path)
                    .with_timeout_ms(timeout_ms)
            })
            .collect()
    }
}

/// Static registration entry for one service.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub id: String,
    pub name: String,
    pub base_address: String,
    pub health_check_path: String,
    /// Permissions baked into the service token issued at registration.
    pub permissions: Vec<String>,
}

impl ServiceSettings {
    #[must_use]
    pub fn new(id: &str, name: &str, base_address: &str, permissions: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            base_address: base_address.to_string(),
            health_check_path: switchboard_core::endpoint::DEFAULT_HEALTH_CHECK_PATH.to_string(),
            permissions: permissions.iter().map(|p| (*p).to_string()).collect(),
        }
    }
}

/// Message-bus tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Retry budget for messages published without an explicit one.
    pub default_max_retries: u32,
    /// Backoff unit: the n-th retry waits `2^n * base_backoff`.
    pub base_backoff: Duration,
    /// Upper bound on a single backoff delay.
    pub max_backoff: Duration,
    /// How often the pending-retry queue is drained.
    pub retry_drain_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            retry_drain_interval: Duration::from_secs(5),
        }
    }
}

/// Health-monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Polling interval used by the orchestrator.
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Token signing configuration.
///
/// No sensible fixed secret exists, so the default is a random per-process
/// secret: tokens are then only valid inside this runtime.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC secret used to sign and verify tokens.
    pub secret: String,
    /// Lifetime of issued tokens.
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: Uuid::new_v4().simple().to_string(),
            token_ttl_secs: TOKEN_TTL_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_config_defaults() {
        let config = MeshConfig::default();
        let ids: Vec<_> = config.services.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["deployment", "analytics", "ai"]);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.monitor.interval, Duration::from_secs(30));
    }

    #[test]
    fn bus_config_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.base_backoff, Duration::from_secs(1));
        assert_eq!(config.retry_drain_interval, Duration::from_secs(5));
    }

    #[test]
    fn auth_secret_is_random_per_config() {
        let a = AuthConfig::default();
        let b = AuthConfig::default();
        assert_ne!(a.secret, b.secret);
        assert_eq!(a.token_ttl_secs, 86_400);
    }

    #[test]
    fn endpoints_apply_request_timeout_and_overrides() {
        let config = MeshConfig {
            request_timeout: Duration::from_millis(1500),
            ..MeshConfig::default()
        }
        .with_base_address(service_ids::AI, "http://ai.internal:9000");

        let endpoints = config.endpoints();
        assert_eq!(endpoints.len(), 3);
        assert!(endpoints.iter().all(|e| e.timeout_ms == 1500));
        let ai = endpoints.iter().find(|e| e.id == "ai").unwrap();
        assert_eq!(ai.base_address, "http://ai.internal:9000");
    }
}
