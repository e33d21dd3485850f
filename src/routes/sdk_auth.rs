use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Middleware to validate the SDK key sent in `x-sdk-key`
pub async fn require_sdk_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, impl IntoResponse> {
    let authorized = match req.headers().get("x-sdk-key").and_then(|v| v.to_str().ok()) {
        Some(key) => sdk_key_matches(key, &state.sdk_key),
        None => return Err((StatusCode::UNAUTHORIZED, "Missing X-SDK-Key header")),
    };

    if !authorized {
        return Err((StatusCode::UNAUTHORIZED, "Invalid SDK key"));
    }
    Ok(next.run(req).await)
}

// Constant time in the key contents; only the length can leak.
fn sdk_key_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}
