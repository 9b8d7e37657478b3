use axum::{
    extract::{FromRequestParts, Request},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::{config::POLYGATE_CONFIG, error::PolygateError};

/// The authenticated client API key, attached to the request for the
/// policy gate and the handlers.
#[derive(Debug, Clone)]
pub struct ClientKey(pub String);

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn x_api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Layer guarding the LLM endpoints: accepts the proxy key from the
/// Bearer header or `x-api-key` and records it as a request extension.
pub async fn require_client_auth(
    mut req: Request,
    next: Next,
) -> Result<Response, PolygateError> {
    let key = bearer_token(req.headers())
        .or_else(|| x_api_key(req.headers()))
        .ok_or(PolygateError::InvalidKey)?;
    if !POLYGATE_CONFIG.load().client_auth(&key) {
        warn!("Invalid client key");
        return Err(PolygateError::InvalidKey);
    }
    req.extensions_mut().insert(ClientKey(key));
    Ok(next.run(req).await)
}

/// Extractor guard for the management endpoints.
///
/// # Example
///
/// ```ignore
/// async fn admin_only_handler(
///     _: RequireAdminAuth,
///     // other extractors...
/// ) -> impl IntoResponse {
///     // runs only when admin authentication succeeds
/// }
/// ```
pub struct RequireAdminAuth;

impl<S> FromRequestParts<S> for RequireAdminAuth
where
    S: Sync,
{
    type Rejection = PolygateError;
    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _: &S,
    ) -> Result<Self, Self::Rejection> {
        let key = bearer_token(&parts.headers).ok_or(PolygateError::InvalidKey)?;
        if !POLYGATE_CONFIG.load().admin_auth(&key) {
            warn!("Invalid admin key");
            return Err(PolygateError::InvalidKey);
        }
        Ok(Self)
    }
}
