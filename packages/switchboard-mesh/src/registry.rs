//! Registry of remote service endpoints.
//!
//! Holds the statically registered [`ServiceEndpoint`]s and performs the
//! actual HTTP calls to them. The registry reports connection failures and
//! server errors as notification intents but never raises alerts itself;
//! state-transition alerting belongs to the health monitor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use reqwest::Method;
use serde_json::Value;
use switchboard_core::ServiceEndpoint;
use tracing::{debug, warn};

use crate::error::MeshError;
use crate::health::HealthProbe;
use crate::notify::{LogNotifier, Notification, NotificationLevel, Notifier};

/// Upper bound on the timeout of a single health check.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// CallOptions
// ---------------------------------------------------------------------------

/// Per-call options for [`ServiceRegistry::call`].
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub method: Method,
    /// JSON body, sent with `Content-Type: application/json`.
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    /// Overrides the endpoint's default timeout.
    pub timeout: Option<Duration>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            headers: Vec::new(),
            timeout: None,
        }
    }
}

impl CallOptions {
    #[must_use]
    pub fn get() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn post(body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Thread-safe registry of remote services.
///
/// Endpoints are keyed by id in a `DashMap`; a separate list remembers
/// registration order so listings are deterministic.
pub struct ServiceRegistry {
    endpoints: DashMap<String, ServiceEndpoint>,
    order: RwLock<Vec<String>>,
    client: reqwest::Client,
    notifier: Arc<dyn Notifier>,
}

impl ServiceRegistry {
    /// Creates an empty registry that logs notification intents.
    #[must_use]
    pub fn new() -> Self {
        Self::with_notifier(Arc::new(LogNotifier))
    }

    /// Creates an empty registry that forwards notification intents to `notifier`.
    #[must_use]
    pub fn with_notifier(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            endpoints: DashMap::new(),
            order: RwLock::new(Vec::new()),
            client: reqwest::Client::new(),
            notifier,
        }
    }

    /// Adds an endpoint, replacing any previous endpoint with the same id.
    ///
    /// Returns the replaced endpoint, if any.
    pub fn register(&self, endpoint: ServiceEndpoint) -> Option<ServiceEndpoint> {
        let id = endpoint.id.clone();
        let previous = self.endpoints.insert(id.clone(), endpoint);
        if previous.is_none() {
            self.order.write().push(id.clone());
            debug!(service = %id, "service registered");
        } else {
            debug!(service = %id, "service re-registered");
        }
        previous
    }

    /// Looks up an endpoint by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ServiceEndpoint> {
        self.endpoints.get(id).map(|e| e.value().clone())
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.endpoints.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Registered ids in registration order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.order.read().clone()
    }

    /// Snapshot of every endpoint in registration order.
    ///
    /// The returned values are copies; modifying them does not affect the registry.
    #[must_use]
    pub fn list_all(&self) -> Vec<ServiceEndpoint> {
        self.order
            .read()
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Calls `path` on the service `id` and returns the decoded response body.
    ///
    /// Empty bodies decode to `Value::Null`; non-JSON bodies to `Value::String`.
    ///
    /// # Errors
    ///
    /// - `UnknownService` if `id` is not registered
    /// - `ServiceUnavailable` if the connection could not be made
    /// - `ServiceTimeout` if the deadline passed before the body was read
    /// - `ServiceError` for any non-2xx status
    pub async fn call(&self, id: &str, path: &str, options: CallOptions) -> Result<Value, MeshError> {
        let endpoint = self.get(id).ok_or_else(|| MeshError::UnknownService {
            service: id.to_string(),
        })?;
        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_millis(endpoint.timeout_ms));
        let url = endpoint.url_for(path);

        let mut request = self.client.request(options.method.clone(), &url);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let start = Instant::now();
        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        };
        let outcome = tokio::time::timeout(timeout, exchange).await;
        let elapsed_ms = duration_ms(start.elapsed());

        metrics::histogram!("switchboard_service_call_duration_ms", "service" => id.to_string())
            .record(elapsed_ms as f64);

        let result = match outcome {
            Err(_elapsed) => Err(MeshError::ServiceTimeout {
                service: id.to_string(),
                timeout_ms: duration_ms(timeout),
            }),
            Ok(Err(e)) if e.is_timeout() => Err(MeshError::ServiceTimeout {
                service: id.to_string(),
                timeout_ms: duration_ms(timeout),
            }),
            Ok(Err(e)) => Err(MeshError::ServiceUnavailable {
                service: id.to_string(),
                reason: e.to_string(),
            }),
            Ok(Ok((status, _))) if !status.is_success() => Err(MeshError::ServiceError {
                service: id.to_string(),
                status: status.as_u16(),
            }),
            Ok(Ok((_, body))) => Ok(decode_body(&body)),
        };

        match &result {
            Ok(_) => {
                debug!(service = id, method = %options.method, path, elapsed_ms, "service call ok");
            }
            Err(err) => {
                metrics::counter!("switchboard_service_call_errors_total", "service" => id.to_string())
                    .increment(1);
                debug!(service = id, method = %options.method, path, elapsed_ms, error = %err, "service call failed");
                self.surface_failure(&endpoint, err);
            }
        }
        result
    }

    /// Probes the service's health-check path.
    ///
    /// Uses the endpoint timeout capped at [`HEALTH_CHECK_TIMEOUT`]. Every
    /// failure, including an unknown id, collapses to `false`.
    pub async fn health_check(&self, id: &str) -> bool {
        let Some(endpoint) = self.get(id) else {
            return false;
        };
        let timeout = Duration::from_millis(endpoint.timeout_ms).min(HEALTH_CHECK_TIMEOUT);
        let probe = self.client.get(endpoint.health_url()).send();

        match tokio::time::timeout(timeout, probe).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                debug!(service = id, error = %e, "health check request failed");
                false
            }
            Err(_) => {
                debug!(service = id, timeout_ms = duration_ms(timeout), "health check timed out");
                false
            }
        }
    }

    /// Logs and forwards a notification intent for connection failures and 5xx responses.
    fn surface_failure(&self, endpoint: &ServiceEndpoint, err: &MeshError) {
        let notable = match err {
            MeshError::ServiceUnavailable { .. } => true,
            MeshError::ServiceError { status, .. } => *status >= 500,
            _ => false,
        };
        if !notable {
            return;
        }
        warn!(service = %endpoint.id, error = %err, "service call failed");
        self.notifier.notify(Notification::new(
            NotificationLevel::Warning,
            format!("{} unavailable", endpoint.name),
            err.to_string(),
        ));
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for ServiceRegistry {
    fn service_ids(&self) -> Vec<String> {
        self.ids()
    }

    async fn probe(&self, service_id: &str) -> bool {
        self.health_check(service_id).await
    }
}

fn decode_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::notify::MemoryNotifier;

    fn endpoint(id: &str, base: &str) -> ServiceEndpoint {
        ServiceEndpoint::new(id, id.to_uppercase(), base).with_timeout_ms(2_000)
    }

    #[test]
    fn register_is_idempotent_by_id() {
        let registry = ServiceRegistry::new();
        assert!(registry.register(endpoint("a", "http://one")).is_none());
        let replaced = registry.register(endpoint("a", "http://two"));
        assert_eq!(replaced.unwrap().base_address, "http://one");

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().base_address, "http://two");
        assert_eq!(registry.ids(), vec!["a"]);
    }

    #[test]
    fn list_all_returns_detached_snapshot_in_order() {
        let registry = ServiceRegistry::new();
        registry.register(endpoint("b", "http://b"));
        registry.register(endpoint("a", "http://a"));

        let mut snapshot = registry.list_all();
        assert_eq!(snapshot.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);

        snapshot[0].base_address = "http://mutated".into();
        snapshot.clear();
        assert_eq!(registry.get("b").unwrap().base_address, "http://b");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn call_returns_json_and_forwards_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(header("x-trace", "abc"))
            .and(body_json(json!({"rows": 3})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let registry = ServiceRegistry::new();
        registry.register(endpoint("analytics", &server.uri()));

        let value = registry
            .call("analytics", "/analyze", CallOptions::post(json!({"rows": 3})).with_header("x-trace", "abc"))
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn call_decodes_empty_and_text_bodies() {
        let server = MockServer::start().await;
        Mock::given(path("/empty"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(path("/text"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;

        let registry = ServiceRegistry::new();
        registry.register(endpoint("svc", &server.uri()));

        assert_eq!(registry.call("svc", "/empty", CallOptions::get()).await.unwrap(), Value::Null);
        assert_eq!(
            registry.call("svc", "/text", CallOptions::get()).await.unwrap(),
            Value::String("pong".into())
        );
    }

    #[tokio::test]
    async fn non_success_status_maps_to_service_error() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let notifier = Arc::new(MemoryNotifier::new());
        let registry = ServiceRegistry::with_notifier(notifier.clone());
        registry.register(endpoint("svc", &server.uri()));

        let err = registry.call("svc", "/missing", CallOptions::get()).await.unwrap_err();
        assert!(matches!(err, MeshError::ServiceError { status: 404, .. }));
        // 4xx responses are not notification-worthy.
        assert!(notifier.snapshot().is_empty());
    }

    #[tokio::test]
    async fn server_error_surfaces_notification_intent() {
        let server = MockServer::start().await;
        Mock::given(path("/boom"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let notifier = Arc::new(MemoryNotifier::new());
        let registry = ServiceRegistry::with_notifier(notifier.clone());
        registry.register(endpoint("svc", &server.uri()));

        let err = registry.call("svc", "/boom", CallOptions::get()).await.unwrap_err();
        assert!(matches!(err, MeshError::ServiceError { status: 503, .. }));
        let notes = notifier.snapshot();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].level, NotificationLevel::Warning);
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let registry = ServiceRegistry::new();
        registry.register(endpoint("svc", &server.uri()));

        let err = registry
            .call("svc", "/slow", CallOptions::get().with_timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::ServiceTimeout { timeout_ms: 50, .. }));
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        let notifier = Arc::new(MemoryNotifier::new());
        let registry = ServiceRegistry::with_notifier(notifier.clone());
        registry.register(endpoint("down", "http://127.0.0.1:1"));

        let err = registry.call("down", "/x", CallOptions::get()).await.unwrap_err();
        assert!(matches!(err, MeshError::ServiceUnavailable { .. }), "got {err:?}");
        let notes = notifier.snapshot();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].level, NotificationLevel::Warning);
        assert_eq!(notes[0].title, "DOWN unavailable");
    }

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let registry = ServiceRegistry::new();
        let err = registry.call("nope", "/x", CallOptions::get()).await.unwrap_err();
        assert!(matches!(err, MeshError::UnknownService { .. }));
    }

    #[tokio::test]
    async fn health_check_collapses_failures_to_false() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = ServiceRegistry::new();
        registry.register(endpoint("up", &server.uri()));
        registry.register(endpoint("sick", &server.uri()).with_health_check_path("/status"));
        registry.register(endpoint("down", "http://127.0.0.1:1"));

        assert!(registry.health_check("up").await);
        assert!(!registry.health_check("sick").await);
        assert!(!registry.health_check("down").await);
        assert!(!registry.health_check("unregistered").await);
    }
}
