//! Bearer API key middleware.
//!
//! Guards the signal and admin endpoints. `/health` and the therapist socket
//! are exempt; therapists authenticate inside the socket handshake.

use crate::routes::ErrorResponse;
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

const EXEMPT_PATHS: &[&str] = &["/health", "/api/v1/ws"];

#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    key_bytes: Vec<u8>,
}

impl ApiKeyConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key_bytes: key.into().into_bytes(),
        }
    }

    /// Constant-time comparison.
    fn verify(&self, provided: &[u8]) -> bool {
        if self.key_bytes.len() != provided.len() {
            return false;
        }
        self.key_bytes
            .iter()
            .zip(provided)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

pub async fn api_key_auth(config: ApiKeyConfig, request: Request<Body>, next: Next) -> Response {
    if EXEMPT_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    match extract_bearer_token(request.headers()) {
        Some(token) if config.verify(token.as_bytes()) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "Invalid API key provided");
            ErrorResponse::new(StatusCode::UNAUTHORIZED, "INVALID_API_KEY", "Invalid API key")
                .into_response()
        }
        None => {
            warn!(path = %request.uri().path(), "Missing Authorization header");
            ErrorResponse::new(
                StatusCode::UNAUTHORIZED,
                "MISSING_API_KEY",
                "Missing or invalid Authorization header. Use: Authorization: Bearer <key>",
            )
            .into_response()
        }
    }
}
