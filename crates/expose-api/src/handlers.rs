//! HTTP handlers for the relay front door

use axum::{
    extract::{Path, State},
    Extension, Json,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use utoipa::OpenApi;

use crate::error::ApiError;
use crate::middleware::AuthPrincipal;
use crate::models::{AliasLookup, ErrorResponse};
use crate::{ApiDoc, AppState};

/// Landing page
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Relay is running", body = String)
    ),
    tag = "system"
)]
pub async fn index() -> &'static str {
    "expose relay is running\n"
}

/// List leased public ports
#[utoipa::path(
    get,
    path = "/ports",
    responses(
        (status = 200, description = "Leased ports in ascending order", body = Vec<u16>),
        (status = 401, description = "Missing or malformed Authorization header", body = ErrorResponse),
        (status = 403, description = "Token failed verification", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn list_ports(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<AuthPrincipal>,
) -> Json<Vec<u16>> {
    let ports = state.relay.leased_ports();
    debug!("{} listed {} leased port(s)", principal.0, ports.len());
    Json(ports)
}

/// Look up the port bound to an alias
#[utoipa::path(
    get,
    path = "/l/{alias}",
    params(
        ("alias" = String, Path, description = "Lease alias")
    ),
    responses(
        (status = 200, description = "Alias is leased", body = AliasLookup),
        (status = 404, description = "No lease with this alias", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn lookup_alias(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
) -> Result<Json<AliasLookup>, ApiError> {
    let port = state
        .relay
        .lookup_alias(&alias)
        .ok_or_else(|| ApiError::NotFound(format!("Alias {} not found", alias)))?;

    Ok(Json(AliasLookup { port, alias }))
}

/// Add an IP to a lease's allow-list
///
/// The body is the raw signed token; the lease's secret is the signing key.
#[utoipa::path(
    post,
    path = "/allow-list",
    request_body(content = String, content_type = "text/plain", description = "Token signed with the lease secret"),
    responses(
        (status = 200, description = "IP registered", body = String),
        (status = 400, description = "Missing or invalid token, or port no longer leased", body = ErrorResponse),
        (status = 403, description = "Signature does not match the lease secret", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn register_allow_list(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<String, ApiError> {
    let token = body.trim();
    if token.is_empty() {
        return Err(ApiError::BadRequest("Token is required".to_string()));
    }

    let registration = state.relay.allow_lists().register(token).map_err(|e| {
        warn!("Allow-list registration failed: {}", e);
        ApiError::from(e)
    })?;

    info!(
        "Allow-list registration for port {} from {}",
        registration.port, registration.ip
    );

    Ok(format!(
        "IP {} added to allow list for port {}",
        registration.ip, registration.port
    ))
}

/// OpenAPI document for this API
pub async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
