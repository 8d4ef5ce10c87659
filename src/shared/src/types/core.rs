//! Core identity types for the Nexus Integration Gateway
//!
//! These types flow from credential validation through the request pipeline
//! and into outcome events, so they live in the shared crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// How the caller authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Jwt,
    ApiKey,
}

/// Authenticated identity attached to a request
///
/// Produced by the credential validator; everything downstream reads it but
/// never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Stable subject identifier (user id or service name)
    pub subject: String,
    /// Display name, when the credential carries one
    pub name: Option<String>,
    /// Tenant the caller belongs to
    pub tenant_id: Option<String>,
    pub auth_type: AuthType,
    pub roles: HashSet<String>,
    pub scopes: HashSet<String>,
    /// `resource:action` permission strings
    pub permissions: HashSet<String>,
    /// Remaining claims that did not map to a dedicated field
    pub claims: HashMap<String, serde_json::Value>,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }

    /// Check for every scope in `required`; an empty set always passes
    pub fn has_all_scopes<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> bool {
        required.into_iter().all(|s| self.scopes.contains(s))
    }

    /// String claim lookup over the free-form claim map
    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(|v| v.as_str())
    }
}

/// JWT claims recognized by the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user id)
    pub sub: String,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Expiration (UTC timestamp)
    pub exp: i64,
    /// Issued at (UTC timestamp)
    pub iat: i64,
    /// JWT id, used for revocation lookups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Space-separated scope string, OAuth style
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Machine-readable credential failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthErrorCode {
    InvalidTokenFormat,
    TokenExpired,
    TokenRevoked,
    InvalidToken,
    InvalidApiKey,
    InactiveApiKey,
    ExpiredApiKey,
    ValidationError,
}

impl AuthErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthErrorCode::InvalidTokenFormat => "INVALID_TOKEN_FORMAT",
            AuthErrorCode::TokenExpired => "TOKEN_EXPIRED",
            AuthErrorCode::TokenRevoked => "TOKEN_REVOKED",
            AuthErrorCode::InvalidToken => "INVALID_TOKEN",
            AuthErrorCode::InvalidApiKey => "INVALID_API_KEY",
            AuthErrorCode::InactiveApiKey => "INACTIVE_API_KEY",
            AuthErrorCode::ExpiredApiKey => "EXPIRED_API_KEY",
            AuthErrorCode::ValidationError => "VALIDATION_ERROR",
        }
    }
}

/// Credential validation failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthError {
    pub code: AuthErrorCode,
    pub message: String,
}

impl AuthError {
    pub fn new(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for AuthError {}

/// Outcome of credential validation
pub type AuthResult = Result<Principal, AuthError>;

/// Opaque service key record as stored in the distributed cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub service_name: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal_with_scopes(scopes: &[&str]) -> Principal {
        Principal {
            subject: "user-1".to_string(),
            name: None,
            tenant_id: None,
            auth_type: AuthType::Jwt,
            roles: HashSet::new(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            permissions: HashSet::new(),
            claims: HashMap::new(),
        }
    }

    #[test]
    fn test_scope_checks() {
        let p = principal_with_scopes(&["erp.read", "erp.write"]);
        assert!(p.has_scope("erp.read"));
        assert!(!p.has_scope("crm.read"));

        let required: Vec<String> = vec!["erp.read".to_string()];
        assert!(p.has_all_scopes(&required));

        let missing: Vec<String> = vec!["erp.read".to_string(), "crm.read".to_string()];
        assert!(!p.has_all_scopes(&missing));

        let empty: Vec<String> = vec![];
        assert!(p.has_all_scopes(&empty));
    }

    #[test]
    fn test_auth_error_code_strings() {
        assert_eq!(AuthErrorCode::TokenRevoked.as_str(), "TOKEN_REVOKED");
        assert_eq!(AuthErrorCode::InvalidApiKey.as_str(), "INVALID_API_KEY");
    }

    #[test]
    fn test_token_claims_optional_fields() {
        let json = r#"{
            "sub": "user-1",
            "iss": "nexus",
            "aud": "gateway",
            "exp": 1893456000,
            "iat": 1893452400
        }"#;
        let claims: TokenClaims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert!(claims.jti.is_none());
        assert!(claims.roles.is_empty());
    }
}
