//! Authorization of API callers.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use lidar_protocol::ErrorCode;
use tracing::debug;

use crate::AppState;
use crate::api::ApiError;

/// Decides whether a caller presenting `token` may use the API.
pub trait IdentityCheck: Send + Sync + 'static {
    fn authorize(&self, token: Option<&str>) -> bool;
}

/// Accepts one fixed token. With no token configured every caller passes.
#[derive(Debug, Clone, Default)]
pub struct StaticToken {
    token: Option<String>,
}

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
        }
    }
}

impl IdentityCheck for StaticToken {
    fn authorize(&self, token: Option<&str>) -> bool {
        match &self.token {
            None => true,
            Some(expected) => token == Some(expected.as_str()),
        }
    }
}

fn strip_bearer(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("Bearer%20"))
        .unwrap_or(value)
        .trim()
}

/// Token from the `Authorization` header, or from an `Authorization` cookie
/// (browsers cannot set headers on WebSocket upgrades).
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        return Some(strip_bearer(value).to_string());
    }
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "Authorization")
        .map(|(_, value)| strip_bearer(value.trim_matches('"')).to_string())
}

pub async fn require_identity(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let token = bearer_token(request.headers());
    if !state.identity.authorize(token.as_deref()) {
        debug!(path = %request.uri().path(), "rejected unauthorized request");
        return ApiError::new(ErrorCode::Unauthorized, "unauthorized").into_response();
    }
    next.run(request).await
}
