use serde::{Deserialize, Serialize};

/// Caller identity threaded explicitly through orchestration calls.
///
/// Carries the bearer token of the signed-in user, if any. An anonymous
/// session falls back to the target service's own credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_token: Option<String>,
}

impl SessionContext {
    /// A session with no signed-in user.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A session for the user holding `token`.
    #[must_use]
    pub fn with_user_token(token: impl Into<String>) -> Self {
        Self {
            user_token: Some(token.into()),
        }
    }
}
