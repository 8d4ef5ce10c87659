//! Credential middleware
//!
//! Recognizes `Authorization: Bearer …`, `X-API-Key: …`, and `?api_key=…`.
//! A presented credential that fails validation is rejected with 401 here,
//! before the pipeline ever sees the request. A request with no credential
//! proceeds anonymously; per-route scope checks decide its fate later.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use tracing::debug;

use nexus_shared::Principal;

use crate::error::Result;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let credential = extract_credential(&request);

    if let Some(credential) = credential {
        let principal = match credential {
            Credential::Bearer(token) => state.credentials.validate_token(&token).await?,
            Credential::ApiKey(key) => state.credentials.validate_key(&key).await?,
        };
        debug!(subject = %principal.subject, auth_type = ?principal.auth_type, "Caller authenticated");
        request.extensions_mut().insert(principal);
    }

    Ok(next.run(request).await)
}

enum Credential {
    Bearer(String),
    ApiKey(String),
}

fn extract_credential(request: &Request) -> Option<Credential> {
    if let Some(value) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(Credential::Bearer(token.trim().to_string()));
        }
    }

    if let Some(key) = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return Some(Credential::ApiKey(key.to_string()));
    }

    if let Some(query) = request.uri().query() {
        for pair in query.split('&') {
            if let Some(key) = pair.strip_prefix("api_key=") {
                if !key.is_empty() {
                    return Some(Credential::ApiKey(key.to_string()));
                }
            }
        }
    }

    None
}

/// Principal attached by the middleware, if the caller authenticated
pub fn principal_of(request: &Request) -> Option<&Principal> {
    request.extensions().get::<Principal>()
}
