//! Identity values exchanged between the auth mediator and its callers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Role or permission that satisfies every permission check.
pub const ADMIN_GRANT: &str = "admin";

/// Default lifetime of issued tokens: 24 hours.
pub const TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Discriminates service tokens from user tokens inside the claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Service,
    User,
}

/// A validated service credential.
///
/// The permission set is fixed at issuance; changing it means reissuing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceToken {
    pub service_id: String,
    pub permissions: BTreeSet<String>,
    /// Seconds since Unix epoch.
    pub expires_at: u64,
}

impl ServiceToken {
    #[must_use]
    pub fn is_expired_at(&self, now_secs: u64) -> bool {
        now_secs > self.expires_at
    }
}

/// A validated user credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserToken {
    pub user_id: String,
    pub roles: BTreeSet<String>,
    pub permissions: BTreeSet<String>,
    pub expires_at: u64,
}

impl UserToken {
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.roles.contains(ADMIN_GRANT) || self.permissions.contains(ADMIN_GRANT)
    }
}

/// Outcome of a successful authentication; built per call and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedRequest {
    pub user_id: Option<String>,
    pub service_id: Option<String>,
    pub permissions: BTreeSet<String>,
    /// Raw bearer token to forward.
    pub token: String,
}

impl AuthenticatedRequest {
    /// Whether this identity holds `permission`, directly or through the admin grant.
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(ADMIN_GRANT) || self.permissions.contains(permission)
    }
}

/// Returns the required permissions that `granted` does not cover.
///
/// An [`ADMIN_GRANT`] entry in `granted` covers everything.
#[must_use]
pub fn missing_permissions<'a>(granted: &BTreeSet<String>, required: &[&'a str]) -> Vec<&'a str> {
    if granted.contains(ADMIN_GRANT) {
        return Vec::new();
    }
    required
        .iter()
        .copied()
        .filter(|p| !granted.contains(*p))
        .collect()
}

/// Builds a permission set from string slices.
#[must_use]
pub fn permission_set(permissions: &[&str]) -> BTreeSet<String> {
    permissions.iter().map(|p| (*p).to_string()).collect()
}
