//! Bearer token authentication for operator endpoints
//!
//! Extracts the JWT from `Authorization: Bearer <token>`, validates it with the
//! relay's handshake key and makes the principal available to handlers via
//! request extensions.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use std::sync::Arc;
use tracing::debug;

use crate::models::ErrorResponse;
use crate::AppState;

/// Authenticated principal (the token's `sub` claim)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPrincipal(pub String);

/// Authentication middleware for bearer-protected routes
///
/// # Errors
/// - 401 when the Authorization header is missing or not `Bearer <token>`
/// - 403 when the token fails verification or has expired
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Missing Authorization header".to_string(),
                    code: Some("MISSING_AUTH".to_string()),
                }),
            )
        })?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid Authorization header format. Expected 'Bearer <token>'"
                        .to_string(),
                    code: Some("INVALID_AUTH_FORMAT".to_string()),
                }),
            )
        })?;

    let claims = state.validator.validate(token).map_err(|e| {
        debug!("Rejected bearer token: {}", e);
        (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: format!("Invalid or expired token: {}", e),
                code: Some("INVALID_TOKEN".to_string()),
            }),
        )
    })?;

    request.extensions_mut().insert(AuthPrincipal(claims.sub));

    Ok(next.run(request).await)
}
