//! Token issuance and authenticated service calls.
//!
//! Tokens are HS256-signed JWTs. Expiry is checked against the injected
//! [`ClockSource`] rather than by `jsonwebtoken` itself, so a manual clock can
//! drive tokens past their lifetime in tests.

use std::sync::Arc;

use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::auth::missing_permissions;
use switchboard_core::{
    AuthenticatedRequest, ClockSource, ServiceToken, SessionContext, SystemClock, TokenKind, UserToken, ADMIN_GRANT,
};
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::error::{AuthError, MeshError};
use crate::registry::{CallOptions, ServiceRegistry};

/// Header carrying the calling service's id.
pub const SERVICE_ID_HEADER: &str = "X-Service-ID";
/// Header carrying the calling user's id, empty for service-only calls.
pub const USER_ID_HEADER: &str = "X-User-ID";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceClaims {
    service_id: String,
    permissions: Vec<String>,
    #[serde(rename = "type")]
    kind: TokenKind,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserClaims {
    sub: String,
    roles: Vec<String>,
    permissions: Vec<String>,
    #[serde(rename = "type")]
    kind: TokenKind,
    iat: u64,
    exp: u64,
}

/// Options for [`AuthMediator::call_authenticated_service`].
#[derive(Debug, Clone)]
pub struct AuthCallOptions {
    pub method: Method,
    pub data: Option<Value>,
    /// Permissions the caller must hold for this call.
    pub permissions: Vec<String>,
}

impl Default for AuthCallOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            data: None,
            permissions: Vec::new(),
        }
    }
}

impl AuthCallOptions {
    #[must_use]
    pub fn post(data: Value) -> Self {
        Self {
            method: Method::POST,
            data: Some(data),
            permissions: Vec::new(),
        }
    }

    #[must_use]
    pub fn requiring(mut self, permissions: &[&str]) -> Self {
        self.permissions = permissions.iter().map(|p| (*p).to_string()).collect();
        self
    }
}

/// Issues and validates tokens and attaches identity to outbound calls.
pub struct AuthMediator {
    registry: Arc<ServiceRegistry>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl_secs: u64,
    clock: Arc<dyn ClockSource>,
    /// Current token per registered service.
    service_tokens: DashMap<String, String>,
}

impl AuthMediator {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, config: &AuthConfig) -> Self {
        Self::with_clock(registry, config, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(registry: Arc<ServiceRegistry>, config: &AuthConfig, clock: Arc<dyn ClockSource>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        Self {
            registry,
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            ttl_secs: config.token_ttl_secs,
            clock,
            service_tokens: DashMap::new(),
        }
    }

    // -- issuance ------------------------------------------------------------

    /// Encodes a service token valid for the configured lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Encoding`] if signing fails.
    pub fn issue_service_token(&self, service_id: &str, permissions: &[&str]) -> Result<String, AuthError> {
        let iat = self.clock.now_secs();
        let claims = ServiceClaims {
            service_id: service_id.to_string(),
            permissions: permissions.iter().map(|p| (*p).to_string()).collect(),
            kind: TokenKind::Service,
            iat,
            exp: iat + self.ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Encoding(e.to_string()))
    }

    /// Issues a token for `service_id` and keeps it for later calls.
    /// Registering again replaces the stored token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Encoding`] if signing fails.
    pub fn register_service(&self, service_id: &str, permissions: &[&str]) -> Result<String, AuthError> {
        let token = self.issue_service_token(service_id, permissions)?;
        self.service_tokens.insert(service_id.to_string(), token.clone());
        debug!(service = service_id, ?permissions, "service token issued");
        Ok(token)
    }

    /// The stored token of a registered service.
    #[must_use]
    pub fn service_token(&self, service_id: &str) -> Option<String> {
        self.service_tokens.get(service_id).map(|t| t.clone())
    }

    /// Encodes a user token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Encoding`] if signing fails.
    pub fn issue_user_token(&self, user_id: &str, roles: &[&str], permissions: &[&str]) -> Result<String, AuthError> {
        let iat = self.clock.now_secs();
        let claims = UserClaims {
            sub: user_id.to_string(),
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
            permissions: permissions.iter().map(|p| (*p).to_string()).collect(),
            kind: TokenKind::User,
            iat,
            exp: iat + self.ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Encoding(e.to_string()))
    }

    // -- validation ----------------------------------------------------------

    /// Decodes a service token. `None` for a malformed token, a bad
    /// signature, a user token, or an expired token.
    #[must_use]
    pub fn validate_service_token(&self, token: &str) -> Option<ServiceToken> {
        self.decode_service_token(token).ok()
    }

    /// Decodes a user token. `None` under the same conditions as
    /// [`validate_service_token`](Self::validate_service_token).
    #[must_use]
    pub fn validate_user_token(&self, token: &str) -> Option<UserToken> {
        self.decode_user_token(token).ok()
    }

    fn decode_service_token(&self, token: &str) -> Result<ServiceToken, AuthError> {
        let claims = decode::<ServiceClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "service token rejected");
                AuthError::InvalidToken
            })?
            .claims;
        if claims.kind != TokenKind::Service {
            return Err(AuthError::InvalidToken);
        }
        let parsed = ServiceToken {
            service_id: claims.service_id,
            permissions: claims.permissions.into_iter().collect(),
            expires_at: claims.exp,
        };
        if parsed.is_expired_at(self.clock.now_secs()) {
            return Err(AuthError::Expired);
        }
        Ok(parsed)
    }

    fn decode_user_token(&self, token: &str) -> Result<UserToken, AuthError> {
        let claims = decode::<UserClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "user token rejected");
                AuthError::InvalidToken
            })?
            .claims;
        if claims.kind != TokenKind::User {
            return Err(AuthError::InvalidToken);
        }
        if self.clock.now_secs() > claims.exp {
            return Err(AuthError::Expired);
        }
        Ok(UserToken {
            user_id: claims.sub,
            roles: claims.roles.into_iter().collect(),
            permissions: claims.permissions.into_iter().collect(),
            expires_at: claims.exp,
        })
    }

    // -- authentication ------------------------------------------------------

    /// Resolves the caller's credential and checks `required` against it.
    ///
    /// The session's user token wins when present; otherwise the target
    /// service's own token is used.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::AuthenticationFailed`] when no token is available,
    /// the token is invalid or expired, or a required permission is missing.
    pub fn authenticate_request(
        &self,
        service_id: &str,
        session: &SessionContext,
        required: &[&str],
    ) -> Result<AuthenticatedRequest, MeshError> {
        let request = match &session.user_token {
            Some(token) => {
                let user = self.decode_user_token(token)?;
                let mut permissions = user.permissions.clone();
                if user.is_admin() {
                    permissions.insert(ADMIN_GRANT.to_string());
                }
                AuthenticatedRequest {
                    user_id: Some(user.user_id),
                    service_id: Some(service_id.to_string()),
                    permissions,
                    token: token.clone(),
                }
            }
            None => {
                let token = self.service_token(service_id).ok_or_else(|| AuthError::MissingToken {
                    service: service_id.to_string(),
                })?;
                let parsed = self.decode_service_token(&token)?;
                AuthenticatedRequest {
                    user_id: None,
                    service_id: Some(parsed.service_id),
                    permissions: parsed.permissions,
                    token,
                }
            }
        };

        let missing = missing_permissions(&request.permissions, required);
        if !missing.is_empty() {
            warn!(service = service_id, user = ?request.user_id, ?missing, "request lacks permissions");
            return Err(AuthError::InsufficientPermissions {
                missing: missing.into_iter().map(str::to_string).collect(),
            }
            .into());
        }
        Ok(request)
    }

    /// Authenticates and then calls `path` on the service with identity headers.
    ///
    /// # Errors
    ///
    /// Authentication failures are returned before any network traffic;
    /// otherwise any [`ServiceRegistry::call`] error.
    pub async fn call_authenticated_service(
        &self,
        service_id: &str,
        path: &str,
        options: AuthCallOptions,
        session: &SessionContext,
    ) -> Result<Value, MeshError> {
        let required: Vec<&str> = options.permissions.iter().map(String::as_str).collect();
        let auth = self.authenticate_request(service_id, session, &required)?;

        let mut call = CallOptions::get()
            .with_method(options.method)
            .with_header("Authorization", format!("Bearer {}", auth.token))
            .with_header(SERVICE_ID_HEADER, auth.service_id.unwrap_or_default())
            .with_header(USER_ID_HEADER, auth.user_id.unwrap_or_default());
        call.body = options.data;
        self.registry.call(service_id, path, call).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use switchboard_core::auth::permission_set;
    use switchboard_core::{ManualClock, ServiceEndpoint};
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    const START_MS: u64 = 1_700_000_000_000;

    fn config() -> AuthConfig {
        AuthConfig {
            secret: "test-secret".into(),
            ..AuthConfig::default()
        }
    }

    fn mediator(clock: Arc<ManualClock>) -> AuthMediator {
        AuthMediator::with_clock(Arc::new(ServiceRegistry::new()), &config(), clock)
    }

    #[test]
    fn service_token_round_trips_claims() {
        let auth = mediator(Arc::new(ManualClock::new(START_MS)));
        let token = auth.register_service("analytics", &["read", "analyze"]).unwrap();

        let parsed = auth.validate_service_token(&token).unwrap();
        assert_eq!(parsed.service_id, "analytics");
        assert_eq!(parsed.permissions, permission_set(&["read", "analyze"]));
        assert_eq!(parsed.expires_at, START_MS / 1000 + 86_400);
        assert_eq!(auth.service_token("analytics"), Some(token));
    }

    #[test]
    fn token_payload_uses_wire_field_names() {
        let auth = mediator(Arc::new(ManualClock::new(START_MS)));
        let token = auth.issue_service_token("ai", &["ai:process"]).unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        let claims = decode::<Value>(&token, &DecodingKey::from_secret(b"test-secret"), &validation)
            .unwrap()
            .claims;
        assert_eq!(claims["serviceId"], "ai");
        assert_eq!(claims["type"], "service");
        assert_eq!(claims["permissions"], json!(["ai:process"]));
        assert_eq!(claims["exp"].as_u64().unwrap() - claims["iat"].as_u64().unwrap(), 86_400);
    }

    #[test]
    fn malformed_wrong_type_and_foreign_tokens_are_rejected() {
        let auth = mediator(Arc::new(ManualClock::new(START_MS)));
        assert!(auth.validate_service_token("not-a-token").is_none());
        assert!(auth.validate_service_token("").is_none());

        let user = auth.issue_user_token("u-1", &["agent"], &["read"]).unwrap();
        assert!(auth.validate_service_token(&user).is_none());
        let service = auth.issue_service_token("ai", &[]).unwrap();
        assert!(auth.validate_user_token(&service).is_none());

        let other = AuthMediator::new(
            Arc::new(ServiceRegistry::new()),
            &AuthConfig {
                secret: "someone-else".into(),
                ..AuthConfig::default()
            },
        );
        let forged = other.issue_service_token("ai", &[ADMIN_GRANT]).unwrap();
        assert!(auth.validate_service_token(&forged).is_none());
    }

    #[test]
    fn tokens_expire_after_their_lifetime() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let auth = mediator(Arc::clone(&clock));
        let service = auth.register_service("deployment", &["deploy"]).unwrap();
        let user = auth.issue_user_token("u-1", &[], &["deploy"]).unwrap();

        clock.advance(86_400 * 1000);
        assert!(auth.validate_service_token(&service).is_some());
        assert!(auth.validate_user_token(&user).is_some());

        clock.advance(1000);
        assert!(auth.validate_service_token(&service).is_none());
        assert!(auth.validate_user_token(&user).is_none());
        let err = auth
            .authenticate_request("deployment", &SessionContext::anonymous(), &[])
            .unwrap_err();
        assert!(matches!(err, MeshError::AuthenticationFailed(AuthError::Expired)));
    }

    #[test]
    fn authenticate_request_checks_permissions() {
        let auth = mediator(Arc::new(ManualClock::new(START_MS)));
        auth.register_service("deployment", &["read", "deploy"]).unwrap();

        let ok = auth
            .authenticate_request("deployment", &SessionContext::anonymous(), &["deploy"])
            .unwrap();
        assert_eq!(ok.user_id, None);
        assert_eq!(ok.service_id.as_deref(), Some("deployment"));

        let err = auth
            .authenticate_request("deployment", &SessionContext::anonymous(), &["deploy", "admin:wipe"])
            .unwrap_err();
        match err {
            MeshError::AuthenticationFailed(AuthError::InsufficientPermissions { missing }) => {
                assert_eq!(missing, vec!["admin:wipe".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = auth
            .authenticate_request("analytics", &SessionContext::anonymous(), &[])
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::AuthenticationFailed(AuthError::MissingToken { .. })
        ));
    }

    #[test]
    fn user_token_takes_precedence_and_admin_grants_all() {
        let auth = mediator(Arc::new(ManualClock::new(START_MS)));
        auth.register_service("ai", &["read", "ai:process"]).unwrap();

        let agent = auth.issue_user_token("agent-7", &["agent"], &["read"]).unwrap();
        let err = auth
            .authenticate_request("ai", &SessionContext::with_user_token(agent), &["ai:process"])
            .unwrap_err();
        assert!(matches!(
            err,
            MeshError::AuthenticationFailed(AuthError::InsufficientPermissions { .. })
        ));

        let admin = auth.issue_user_token("root", &[ADMIN_GRANT], &[]).unwrap();
        let ok = auth
            .authenticate_request("ai", &SessionContext::with_user_token(admin), &["ai:process", "deploy"])
            .unwrap();
        assert_eq!(ok.user_id.as_deref(), Some("root"));
        assert!(ok.has_permission("anything"));

        let err = auth
            .authenticate_request("ai", &SessionContext::with_user_token("garbage"), &[])
            .unwrap_err();
        assert!(matches!(err, MeshError::AuthenticationFailed(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn authenticated_call_carries_identity_headers() {
        let server = MockServer::start().await;
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(ServiceEndpoint::new("analytics", "Analytics", server.uri()));
        let auth = AuthMediator::with_clock(Arc::clone(&registry), &config(), Arc::new(SystemClock));
        auth.register_service("analytics", &["read", "analyze"]).unwrap();
        let user = auth.issue_user_token("u-42", &[], &["analyze"]).unwrap();

        Mock::given(method("POST"))
            .and(path("/analyze"))
            .and(header("Authorization", format!("Bearer {user}").as_str()))
            .and(header("X-Service-ID", "analytics"))
            .and(header("X-User-ID", "u-42"))
            .and(body_json(json!({"rows": [1, 2]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"score": 0.9})))
            .expect(1)
            .mount(&server)
            .await;

        let result = auth
            .call_authenticated_service(
                "analytics",
                "/analyze",
                AuthCallOptions::post(json!({"rows": [1, 2]})).requiring(&["analyze"]),
                &SessionContext::with_user_token(user),
            )
            .await
            .unwrap();
        assert_eq!(result["score"], 0.9);
    }

    #[tokio::test]
    async fn service_only_call_still_sends_identity_headers() {
        let server = MockServer::start().await;
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(ServiceEndpoint::new("deployment", "Deployment", server.uri()));
        let auth = AuthMediator::new(Arc::clone(&registry), &config());
        auth.register_service("deployment", &["deploy"]).unwrap();

        Mock::given(method("GET"))
            .and(path("/status"))
            .and(header("X-Service-ID", "deployment"))
            .and(header_exists("X-User-ID"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let result = auth
            .call_authenticated_service("deployment", "/status", AuthCallOptions::default(), &SessionContext::anonymous())
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[tokio::test]
    async fn unauthorized_call_never_reaches_the_network() {
        let server = MockServer::start().await;
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(ServiceEndpoint::new("deployment", "Deployment", server.uri()));
        let auth = AuthMediator::new(Arc::clone(&registry), &config());
        auth.register_service("deployment", &["read"]).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = auth
            .call_authenticated_service(
                "deployment",
                "/deploy",
                AuthCallOptions::post(json!({})).requiring(&["deploy"]),
                &SessionContext::anonymous(),
            )
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
