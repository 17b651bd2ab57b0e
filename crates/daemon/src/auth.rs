//! Pre-shared token authentication.
//!
//! A random token is generated once at startup and must accompany every HTTP
//! request, including the WebSocket upgrade. It is accepted from the `token`
//! query parameter or from an `Authorization: Token <t>` header; the query
//! parameter wins when both are present.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::server::AppState;

/// Length of generated tokens.
pub const TOKEN_LENGTH: usize = 128;

/// Scheme expected in the `Authorization` header.
const TOKEN_SCHEME: &str = "Token ";

/// Authentication failures. The display text is the response body.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("No token found.")]
    MissingToken,

    #[error("Invalid token found.")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
    }
}

/// Generates a random alphanumeric token.
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

/// Finds the presented token, preferring the query string.
///
/// A blank `token` query parameter counts as absent. The header value is
/// taken verbatim after `Token `.
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let from_query = query.unwrap_or("").split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        let value = parts.next()?;
        if key == "token" {
            urlencoding::decode(value)
                .ok()
                .map(|s| s.into_owned())
                .filter(|token| !token.trim().is_empty())
        } else {
            None
        }
    });
    if from_query.is_some() {
        return from_query;
    }

    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(TOKEN_SCHEME))
        .map(str::to_string)
}

/// Checks a presented token against the expected one.
pub fn verify_token(expected: &str, presented: Option<&str>) -> Result<(), AuthError> {
    match presented {
        None => Err(AuthError::MissingToken),
        Some(token) if constant_time_eq(expected.as_bytes(), token.as_bytes()) => Ok(()),
        Some(_) => Err(AuthError::InvalidToken),
    }
}

/// Compares two byte strings in time independent of where they differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Middleware rejecting requests without the session token.
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = extract_token(request.headers(), request.uri().query());
    match verify_token(&state.token, presented.as_deref()) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            debug!(path = %request.uri().path(), error = %e, "Rejected request");
            e.into_response()
        }
    }
}
