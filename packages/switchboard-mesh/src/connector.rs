//! Typed facade over registry and auth calls.
//!
//! `call_service` never surfaces a raw network error; it always returns a
//! tagged [`ServiceResponse`]. The domain helpers (`analyze_data`,
//! `process_with_ai`) return a [`ServiceCallResult`] so callers can tell a real
//! answer from a simulated one. Simulation only kicks in when the target
//! service is unreachable and the `simulated-backends` feature is enabled.

use std::sync::Arc;

use reqwest::Method;
use serde_json::{json, Value};
use switchboard_core::{ClockSource, ResponseMetadata, ServiceCallResult, ServiceResponse, SessionContext, SystemClock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::auth::{AuthCallOptions, AuthMediator};
use crate::config::{permissions, service_ids};
use crate::error::MeshError;
use crate::registry::{CallOptions, ServiceRegistry};

pub const ANALYZE_PATH: &str = "/analyze";
pub const AI_PROCESS_PATH: &str = "/process";
pub const DEPLOY_PATH: &str = "/deploy";

/// A single call described by intent rather than by HTTP details.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub service: String,
    pub endpoint: String,
    pub method: Method,
    pub data: Option<Value>,
    /// Route the call through the auth mediator.
    pub authenticated: bool,
}

impl ServiceRequest {
    #[must_use]
    pub fn new(service: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            method: Method::GET,
            data: None,
            authenticated: false,
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Attaches a JSON body; switches a `GET` to `POST`.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        if self.method == Method::GET {
            self.method = Method::POST;
        }
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }
}

pub struct ServiceConnector {
    registry: Arc<ServiceRegistry>,
    auth: Arc<AuthMediator>,
    clock: Arc<dyn ClockSource>,
}

impl ServiceConnector {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, auth: Arc<AuthMediator>) -> Self {
        Self::with_clock(registry, auth, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(registry: Arc<ServiceRegistry>, auth: Arc<AuthMediator>, clock: Arc<dyn ClockSource>) -> Self {
        Self { registry, auth, clock }
    }

    /// Performs the call and folds the outcome into a [`ServiceResponse`].
    pub async fn call_service(&self, request: ServiceRequest, session: &SessionContext) -> ServiceResponse {
        let started = Instant::now();
        let outcome = if request.authenticated {
            let options = AuthCallOptions {
                method: request.method.clone(),
                data: request.data.clone(),
                permissions: Vec::new(),
            };
            self.auth
                .call_authenticated_service(&request.service, &request.endpoint, options, session)
                .await
        } else {
            let mut options = CallOptions::get().with_method(request.method.clone());
            options.body = request.data.clone();
            self.registry.call(&request.service, &request.endpoint, options).await
        };

        #[allow(clippy::cast_possible_truncation)]
        let metadata = ResponseMetadata {
            service: request.service,
            endpoint: request.endpoint,
            authenticated: request.authenticated,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: self.clock.now_millis(),
        };
        match outcome {
            Ok(data) => ServiceResponse::ok(data, metadata),
            Err(e) => {
                debug!(service = %metadata.service, endpoint = %metadata.endpoint, error = %e, "service call failed");
                ServiceResponse::failed(e.to_failure(), metadata)
            }
        }
    }

    /// Sends `data` to the analytics service.
    ///
    /// # Errors
    ///
    /// Authentication failures and non-transient service errors. With the
    /// `simulated-backends` feature an unreachable service yields a simulated
    /// result instead of an error.
    pub async fn analyze_data(&self, data: &Value, session: &SessionContext) -> Result<ServiceCallResult, MeshError> {
        let outcome = self
            .auth
            .call_authenticated_service(
                service_ids::ANALYTICS,
                ANALYZE_PATH,
                AuthCallOptions::post(data.clone()).requiring(&[permissions::ANALYZE]),
                session,
            )
            .await;
        resolve(service_ids::ANALYTICS, outcome, || simulation::analysis(data))
    }

    /// Sends `input` to the AI service.
    ///
    /// # Errors
    ///
    /// Same as [`analyze_data`](Self::analyze_data).
    pub async fn process_with_ai(&self, input: &Value, session: &SessionContext) -> Result<ServiceCallResult, MeshError> {
        let outcome = self
            .auth
            .call_authenticated_service(
                service_ids::AI,
                AI_PROCESS_PATH,
                AuthCallOptions::post(input.clone()).requiring(&[permissions::AI_PROCESS]),
                session,
            )
            .await;
        resolve(service_ids::AI, outcome, || simulation::ai(input))
    }

    /// Asks the deployment service to start a deployment. Never simulated.
    ///
    /// # Errors
    ///
    /// Any authentication or service error.
    pub async fn deploy(&self, config: &Value, session: &SessionContext) -> Result<Value, MeshError> {
        self.auth
            .call_authenticated_service(
                service_ids::DEPLOYMENT,
                DEPLOY_PATH,
                AuthCallOptions::post(config.clone()).requiring(&[permissions::DEPLOY]),
                session,
            )
            .await
    }

    /// Sends `items` in chunks of `batch_size`, one call per chunk, in order.
    ///
    /// Each chunk is posted as `{"batch": <index>, "items": [...]}`. A failed
    /// chunk does not stop the remaining ones.
    pub async fn batch_process(
        &self,
        service: &str,
        endpoint: &str,
        items: &[Value],
        batch_size: usize,
        session: &SessionContext,
    ) -> Vec<ServiceResponse> {
        let mut responses = Vec::with_capacity(items.len().div_ceil(batch_size.max(1)));
        for (index, chunk) in items.chunks(batch_size.max(1)).enumerate() {
            let request = ServiceRequest::new(service, endpoint).with_data(json!({
                "batch": index,
                "items": chunk,
            }));
            let response = self.call_service(request, session).await;
            if !response.success {
                warn!(service, endpoint, batch = index, "batch chunk failed");
            }
            responses.push(response);
        }
        responses
    }
}

#[cfg_attr(not(feature = "simulated-backends"), allow(unused_variables))]
fn resolve(
    service: &str,
    outcome: Result<Value, MeshError>,
    simulate: impl FnOnce() -> Value,
) -> Result<ServiceCallResult, MeshError> {
    match outcome {
        Ok(data) => Ok(ServiceCallResult::Real(data)),
        #[cfg(feature = "simulated-backends")]
        Err(e) if e.is_unreachable() => {
            warn!(service, error = %e, "service unreachable; returning simulated result");
            metrics::counter!("switchboard_simulated_responses_total", "service" => service.to_string()).increment(1);
            Ok(ServiceCallResult::Simulated(simulate()))
        }
        Err(e) => Err(e),
    }
}

/// Deterministic stand-ins for the analytics and AI services.
mod simulation {
    use serde_json::{json, Value};

    pub(super) fn analysis(data: &Value) -> Value {
        let (record_count, fields) = match data {
            Value::Array(rows) => {
                let fields = rows.first().map(field_names).unwrap_or_default();
                (rows.len(), fields)
            }
            Value::Object(_) => (1, field_names(data)),
            Value::Null => (0, Vec::new()),
            _ => (1, Vec::new()),
        };
        json!({
            "recordCount": record_count,
            "fields": fields,
            "summary": format!("analyzed {record_count} records"),
        })
    }

    pub(super) fn ai(input: &Value) -> Value {
        let prompt = input
            .get("prompt")
            .and_then(Value::as_str)
            .map_or_else(|| input.to_string(), str::to_string);
        let words = prompt.split_whitespace().count();
        json!({
            "model": "simulated",
            "output": format!("processed {words} words"),
            "inputLength": prompt.len(),
        })
    }

    fn field_names(value: &Value) -> Vec<String> {
        let mut names: Vec<String> = value
            .as_object()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use switchboard_core::{FailureKind, ServiceEndpoint};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::AuthConfig;

    fn connector_for(services: &[(&str, String)]) -> ServiceConnector {
        let registry = Arc::new(ServiceRegistry::new());
        let auth = Arc::new(AuthMediator::new(Arc::clone(&registry), &AuthConfig::default()));
        for (id, base) in services {
            registry.register(ServiceEndpoint::new(*id, *id, base.clone()));
            auth.register_service(
                id,
                &[permissions::READ, permissions::ANALYZE, permissions::AI_PROCESS, permissions::DEPLOY],
            )
            .unwrap();
        }
        ServiceConnector::new(registry, auth)
    }

    #[tokio::test]
    async fn call_service_wraps_success_with_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reports"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 3})))
            .mount(&server)
            .await;
        let connector = connector_for(&[("analytics", server.uri())]);

        let response = connector
            .call_service(ServiceRequest::new("analytics", "/reports"), &SessionContext::anonymous())
            .await;
        assert!(response.success);
        assert_eq!(response.data.unwrap()["count"], 3);
        assert!(response.error.is_none());
        assert_eq!(response.metadata.service, "analytics");
        assert_eq!(response.metadata.endpoint, "/reports");
        assert!(!response.metadata.authenticated);
        assert!(response.metadata.timestamp > 0);
    }

    #[tokio::test]
    async fn call_service_tags_failures_instead_of_erroring() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let connector = connector_for(&[("analytics", server.uri())]);

        let response = connector
            .call_service(
                ServiceRequest::new("analytics", "/missing").authenticated(),
                &SessionContext::anonymous(),
            )
            .await;
        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.kind, FailureKind::ServiceError);
        assert_eq!(error.status, Some(404));
        assert!(response.metadata.authenticated);

        let unknown = connector
            .call_service(ServiceRequest::new("billing", "/"), &SessionContext::anonymous())
            .await;
        assert_eq!(unknown.error.unwrap().kind, FailureKind::UnknownService);
    }

    #[tokio::test]
    async fn analyze_data_returns_real_result_when_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/analyze"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"trend": "up"})))
            .mount(&server)
            .await;
        let connector = connector_for(&[("analytics", server.uri())]);

        let result = connector
            .analyze_data(&json!([{"calls": 10}]), &SessionContext::anonymous())
            .await
            .unwrap();
        assert_eq!(result, ServiceCallResult::Real(json!({"trend": "up"})));
    }

    #[cfg(feature = "simulated-backends")]
    #[tokio::test]
    async fn unreachable_services_fall_back_to_deterministic_simulation() {
        let connector = connector_for(&[
            ("analytics", "http://127.0.0.1:1".to_string()),
            ("ai", "http://127.0.0.1:1".to_string()),
        ]);
        let data = json!([{"agent": "a", "calls": 4}, {"agent": "b", "calls": 7}]);

        let first = connector.analyze_data(&data, &SessionContext::anonymous()).await.unwrap();
        let second = connector.analyze_data(&data, &SessionContext::anonymous()).await.unwrap();
        assert!(first.is_simulated());
        assert_eq!(first, second);
        assert_eq!(first.data()["recordCount"], 2);
        assert_eq!(first.data()["fields"], json!(["agent", "calls"]));

        let ai = connector
            .process_with_ai(&json!({"prompt": "summarize today's calls"}), &SessionContext::anonymous())
            .await
            .unwrap();
        assert!(ai.is_simulated());
        assert_eq!(ai.data()["output"], "processed 3 words");
    }

    #[tokio::test]
    async fn server_errors_surface_instead_of_being_simulated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let connector = connector_for(&[("analytics", server.uri()), ("ai", server.uri())]);

        let err = connector
            .analyze_data(&json!([{"calls": 3}]), &SessionContext::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::ServiceError { status: 500, .. }));
        assert!(err.is_transient());

        let err = connector
            .process_with_ai(&json!({"prompt": "hi"}), &SessionContext::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::ServiceError { status: 500, .. }));
    }

    #[tokio::test]
    async fn auth_and_client_errors_are_never_simulated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        let connector = connector_for(&[("analytics", server.uri())]);

        let err = connector
            .analyze_data(&json!({}), &SessionContext::with_user_token("bogus"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::AuthenticationFailed(_)));

        let err = connector
            .analyze_data(&json!({}), &SessionContext::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::ServiceError { status: 400, .. }));
    }

    #[tokio::test]
    async fn batch_process_reports_one_result_per_chunk() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .and(body_partial_json(json!({"batch": 1})))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;
        let connector = connector_for(&[("analytics", server.uri())]);
        let items: Vec<Value> = (0..5).map(|i| json!({"row": i})).collect();

        let responses = connector
            .batch_process("analytics", "/ingest", &items, 2, &SessionContext::anonymous())
            .await;
        let outcomes: Vec<bool> = responses.iter().map(|r| r.success).collect();
        assert_eq!(outcomes, vec![true, false, true]);
        assert_eq!(responses[1].error.as_ref().unwrap().status, Some(500));

        let single = connector
            .batch_process("analytics", "/ingest", &items[..1], 0, &SessionContext::anonymous())
            .await;
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn simulation_is_shape_aware() {
        assert_eq!(simulation::analysis(&Value::Null)["recordCount"], 0);
        assert_eq!(simulation::analysis(&json!({"a": 1, "b": 2}))["fields"], json!(["a", "b"]));
        assert_eq!(simulation::ai(&json!("plain text input"))["model"], "simulated");
    }
}
