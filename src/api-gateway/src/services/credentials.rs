//! Credential validation: signed tokens and opaque service keys
//!
//! Tokens verify signature, issuer, audience, and expiry (60 s skew
//! allowance), then consult the revocation list under
//! `token:blacklist:{jti}`. Opaque keys hash with SHA-256 and resolve via
//! `apikey:{hash}` in the counter store. Both paths produce a [`Principal`]
//! that lives no longer than the request.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use nexus_shared::{
    ApiKeyRecord, AuthError, AuthErrorCode, AuthResult, AuthType, Principal, TokenClaims,
};

use crate::cache::CounterStore;
use crate::error::Result;

/// Clock-skew allowance on expiry checks
const LEEWAY_SECS: u64 = 60;
/// Floor for revocation-entry TTLs
const MIN_REVOCATION_TTL: Duration = Duration::from_secs(60);

/// Signed-token verification settings
#[derive(Debug, Clone)]
pub struct JwtSettings {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub algorithm: Algorithm,
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: "nexus-platform".to_string(),
            audience: "nexus-gateway".to_string(),
            algorithm: Algorithm::HS256,
        }
    }
}

/// Pluggable role → permission resolution
pub trait RolePermissionSource: Send + Sync {
    fn permissions_for(&self, role: &str) -> Vec<String>;
}

/// Default source: roles carry no derived permissions
pub struct NoRolePermissions;

impl RolePermissionSource for NoRolePermissions {
    fn permissions_for(&self, _role: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Validates bearer tokens and opaque keys against the counter store
pub struct CredentialValidator {
    settings: JwtSettings,
    decoding_key: DecodingKey,
    store: Arc<dyn CounterStore>,
    role_source: Arc<dyn RolePermissionSource>,
}

impl CredentialValidator {
    pub fn new(settings: JwtSettings, store: Arc<dyn CounterStore>) -> Self {
        let decoding_key = DecodingKey::from_secret(settings.secret.as_bytes());
        Self {
            settings,
            decoding_key,
            store,
            role_source: Arc::new(NoRolePermissions),
        }
    }

    pub fn with_role_source(mut self, source: Arc<dyn RolePermissionSource>) -> Self {
        self.role_source = source;
        self
    }

    /// Verify a signed token and build the request principal
    pub async fn validate_token(&self, token: &str) -> AuthResult {
        if token.split('.').count() != 3 {
            return Err(AuthError::new(
                AuthErrorCode::InvalidTokenFormat,
                "token is not a three-part JWT",
            ));
        }

        let mut validation = Validation::new(self.settings.algorithm);
        validation.set_issuer(&[&self.settings.issuer]);
        validation.set_audience(&[&self.settings.audience]);
        validation.leeway = LEEWAY_SECS;

        let claims = decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map_err(map_jwt_error)?
            .claims;

        if let Some(jti) = &claims.jti {
            let blacklisted = self
                .store
                .get(&format!("token:blacklist:{}", jti))
                .await
                .map_err(|e| {
                    AuthError::new(AuthErrorCode::ValidationError, e.to_string())
                })?;
            if blacklisted.map_or(false, |v| !v.is_empty()) {
                warn!(jti = %jti, "Revoked token presented");
                return Err(AuthError::new(
                    AuthErrorCode::TokenRevoked,
                    "token has been revoked",
                ));
            }
        }

        debug!(subject = %claims.sub, "Token validated");
        Ok(principal_from_claims(claims))
    }

    /// Resolve an opaque service key via its SHA-256 hash
    pub async fn validate_key(&self, key: &str) -> AuthResult {
        let hash = BASE64.encode(Sha256::digest(key.as_bytes()));
        let stored = self
            .store
            .get(&format!("apikey:{}", hash))
            .await
            .map_err(|e| AuthError::new(AuthErrorCode::ValidationError, e.to_string()))?;

        let Some(raw) = stored else {
            return Err(AuthError::new(
                AuthErrorCode::InvalidApiKey,
                "unknown API key",
            ));
        };
        let record: ApiKeyRecord = serde_json::from_str(&raw)
            .map_err(|e| AuthError::new(AuthErrorCode::ValidationError, e.to_string()))?;

        if !record.active {
            return Err(AuthError::new(
                AuthErrorCode::InactiveApiKey,
                "API key is inactive",
            ));
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at < Utc::now() {
                return Err(AuthError::new(
                    AuthErrorCode::ExpiredApiKey,
                    "API key has expired",
                ));
            }
        }

        debug!(service = %record.service_name, "API key validated");
        Ok(Principal {
            subject: record.service_name.clone(),
            name: Some(record.service_name),
            tenant_id: None,
            auth_type: AuthType::ApiKey,
            roles: HashSet::new(),
            scopes: record.scopes.into_iter().collect(),
            permissions: HashSet::new(),
            claims: HashMap::new(),
        })
    }

    /// `resource:action` satisfaction: exact, `resource:*`, or `*:*`,
    /// including role-derived permissions.
    pub fn has_permission(&self, principal: &Principal, resource: &str, action: &str) -> bool {
        let wanted = [
            format!("{}:{}", resource, action),
            format!("{}:*", resource),
            "*:*".to_string(),
        ];
        if wanted.iter().any(|p| principal.permissions.contains(p)) {
            return true;
        }
        principal.roles.iter().any(|role| {
            self.role_source
                .permissions_for(role)
                .iter()
                .any(|p| wanted.iter().any(|w| w == p))
        })
    }

    /// Blacklist a refresh token's `jti` until the token would expire
    pub async fn revoke_refresh(&self, token: &str) -> Result<()> {
        let mut validation = Validation::new(self.settings.algorithm);
        validation.set_issuer(&[&self.settings.issuer]);
        validation.set_audience(&[&self.settings.audience]);
        validation.leeway = LEEWAY_SECS;
        // A token being revoked may already be past its expiry
        validation.validate_exp = false;

        let claims = decode::<TokenClaims>(token, &self.decoding_key, &validation)?.claims;
        let Some(jti) = claims.jti else {
            warn!("Refresh token without jti cannot be revoked");
            return Ok(());
        };

        let remaining = (claims.exp - Utc::now().timestamp()).max(0) as u64;
        let ttl = Duration::from_secs(remaining).max(MIN_REVOCATION_TTL);
        self.store
            .set(&format!("token:blacklist:{}", jti), "revoked", ttl)
            .await?;
        debug!(jti = %jti, "Refresh token revoked");
        Ok(())
    }

    /// Summary document for identity endpoints
    pub fn user_info(&self, principal: &Principal) -> Value {
        serde_json::json!({
            "subject": principal.subject,
            "name": principal.name,
            "tenantId": principal.tenant_id,
            "authType": principal.auth_type,
            "roles": principal.roles,
            "scopes": principal.scopes,
        })
    }
}

fn principal_from_claims(claims: TokenClaims) -> Principal {
    let scopes: HashSet<String> = claims
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let mut extra = HashMap::new();
    if let Some(client_id) = &claims.client_id {
        extra.insert("client_id".to_string(), Value::from(client_id.clone()));
    }
    if let Some(jti) = &claims.jti {
        extra.insert("jti".to_string(), Value::from(jti.clone()));
    }

    Principal {
        subject: claims.sub,
        name: claims.name,
        tenant_id: claims.tenant_id,
        auth_type: AuthType::Jwt,
        roles: claims.roles.into_iter().collect(),
        scopes,
        permissions: claims.permissions.into_iter().collect(),
        claims: extra,
    }
}

fn map_jwt_error(error: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match error.kind() {
        ErrorKind::ExpiredSignature => {
            AuthError::new(AuthErrorCode::TokenExpired, "token has expired")
        }
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            AuthError::new(AuthErrorCode::InvalidTokenFormat, "token failed to parse")
        }
        other => AuthError::new(
            AuthErrorCode::InvalidToken,
            format!("token rejected: {:?}", other),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCounterStore;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit-test-secret-key-of-decent-length";

    fn settings() -> JwtSettings {
        JwtSettings {
            secret: SECRET.to_string(),
            ..JwtSettings::default()
        }
    }

    fn claims(exp_offset_secs: i64) -> TokenClaims {
        let now = Utc::now().timestamp();
        TokenClaims {
            sub: "user-1".to_string(),
            iss: "nexus-platform".to_string(),
            aud: "nexus-gateway".to_string(),
            exp: now + exp_offset_secs,
            iat: now,
            jti: Some("jti-1".to_string()),
            name: Some("Test User".to_string()),
            tenant_id: Some("tenant-a".to_string()),
            client_id: Some("client-7".to_string()),
            roles: vec!["operator".to_string()],
            scope: Some("erp.read erp.write".to_string()),
            permissions: vec!["projects:read".to_string()],
        }
    }

    fn sign(claims: &TokenClaims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn validator() -> (CredentialValidator, Arc<MemoryCounterStore>) {
        let store = Arc::new(MemoryCounterStore::new());
        (
            CredentialValidator::new(settings(), Arc::clone(&store) as Arc<dyn CounterStore>),
            store,
        )
    }

    #[tokio::test]
    async fn test_valid_token_yields_principal() {
        let (validator, _) = validator();
        let principal = validator.validate_token(&sign(&claims(3600))).await.unwrap();

        assert_eq!(principal.subject, "user-1");
        assert_eq!(principal.auth_type, AuthType::Jwt);
        assert!(principal.has_role("operator"));
        assert!(principal.has_scope("erp.write"));
        assert!(principal.permissions.contains("projects:read"));
        assert_eq!(principal.claim("client_id"), Some("client-7"));
    }

    #[tokio::test]
    async fn test_expiry_with_skew_allowance() {
        let (validator, _) = validator();

        // 30 s past expiry sits inside the skew allowance
        assert!(validator.validate_token(&sign(&claims(-30))).await.is_ok());

        // Well past expiry fails with the expiry code
        let err = validator.validate_token(&sign(&claims(-3600))).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::TokenExpired);
    }

    #[tokio::test]
    async fn test_wrong_issuer_and_garbage_tokens() {
        let (validator, _) = validator();

        let mut bad_issuer = claims(3600);
        bad_issuer.iss = "somewhere-else".to_string();
        let err = validator.validate_token(&sign(&bad_issuer)).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidToken);

        let err = validator.validate_token("not-a-jwt").await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidTokenFormat);
    }

    #[tokio::test]
    async fn test_blacklisted_jti_is_revoked_even_when_valid() {
        let (validator, store) = validator();
        store
            .set("token:blacklist:jti-1", "revoked", Duration::from_secs(60))
            .await
            .unwrap();

        let err = validator.validate_token(&sign(&claims(3600))).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::TokenRevoked);
    }

    #[tokio::test]
    async fn test_revoke_refresh_blacklists_jti() {
        let (validator, _) = validator();
        let token = sign(&claims(3600));

        assert!(validator.validate_token(&token).await.is_ok());
        validator.revoke_refresh(&token).await.unwrap();
        let err = validator.validate_token(&token).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::TokenRevoked);
    }

    #[tokio::test]
    async fn test_api_key_lifecycle() {
        let (validator, store) = validator();
        let key = "svc-key-123";
        let hash = BASE64.encode(Sha256::digest(key.as_bytes()));

        // Unknown
        let err = validator.validate_key(key).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidApiKey);

        // Inactive
        let record = ApiKeyRecord {
            service_name: "erp-sync".to_string(),
            active: false,
            expires_at: None,
            scopes: vec!["erp.read".to_string()],
        };
        store
            .set(
                &format!("apikey:{}", hash),
                &serde_json::to_string(&record).unwrap(),
                Duration::from_secs(300),
            )
            .await
            .unwrap();
        let err = validator.validate_key(key).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InactiveApiKey);

        // Expired
        let record = ApiKeyRecord {
            active: true,
            expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
            ..record
        };
        store
            .set(
                &format!("apikey:{}", hash),
                &serde_json::to_string(&record).unwrap(),
                Duration::from_secs(300),
            )
            .await
            .unwrap();
        let err = validator.validate_key(key).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::ExpiredApiKey);

        // Valid
        let record = ApiKeyRecord {
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            ..record
        };
        store
            .set(
                &format!("apikey:{}", hash),
                &serde_json::to_string(&record).unwrap(),
                Duration::from_secs(300),
            )
            .await
            .unwrap();
        let principal = validator.validate_key(key).await.unwrap();
        assert_eq!(principal.subject, "erp-sync");
        assert_eq!(principal.auth_type, AuthType::ApiKey);
        assert!(principal.has_scope("erp.read"));
    }

    #[test]
    fn test_permission_satisfaction() {
        let (validator, _) = validator();
        let mut principal = principal_from_claims(claims(3600));
        principal.permissions =
            ["projects:read".to_string(), "orders:*".to_string()].into_iter().collect();

        assert!(validator.has_permission(&principal, "projects", "read"));
        assert!(!validator.has_permission(&principal, "projects", "delete"));
        assert!(validator.has_permission(&principal, "orders", "anything"));

        principal.permissions = ["*:*".to_string()].into_iter().collect();
        assert!(validator.has_permission(&principal, "whatever", "whenever"));
    }

    struct OperatorRoles;

    impl RolePermissionSource for OperatorRoles {
        fn permissions_for(&self, role: &str) -> Vec<String> {
            if role == "operator" {
                vec!["workorders:complete".to_string()]
            } else {
                Vec::new()
            }
        }
    }

    #[test]
    fn test_role_derived_permissions() {
        let (validator, _) = validator();
        let validator = validator.with_role_source(Arc::new(OperatorRoles));
        let principal = principal_from_claims(claims(3600));

        assert!(validator.has_permission(&principal, "workorders", "complete"));
        assert!(!validator.has_permission(&principal, "workorders", "delete"));
    }
}
