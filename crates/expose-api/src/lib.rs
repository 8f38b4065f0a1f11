//! HTTP front door and control-channel endpoint of the relay

pub mod control_channel;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;

use anyhow::Context;
use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use expose_auth::JwtValidator;
use expose_control::Relay;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

pub use error::ApiError;

/// Application state shared across handlers
pub struct AppState {
    pub relay: Arc<Relay>,
    pub validator: Arc<JwtValidator>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Expose Relay API",
        version = "0.1.0",
        description = "Front door of the expose TCP tunnel relay"
    ),
    paths(
        handlers::index,
        handlers::list_ports,
        handlers::lookup_alias,
        handlers::register_allow_list,
    ),
    components(schemas(models::ErrorResponse, models::AliasLookup)),
    tags(
        (name = "tunnels", description = "Lease inspection and allow-list registration"),
        (name = "system", description = "System endpoints")
    )
)]
pub struct ApiDoc;

/// PEM certificate and key for serving HTTPS/WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the front door
    pub bind_addr: SocketAddr,
    /// Serve TLS when set
    pub tls: Option<TlsConfig>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            tls: None,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, relay: Arc<Relay>, jwt_secret: &[u8]) -> Self {
        let state = Arc::new(AppState {
            relay,
            validator: Arc::new(JwtValidator::new(jwt_secret)),
        });

        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let public_router = Router::new()
            .route("/", get(handlers::index))
            .route("/l/{alias}", get(handlers::lookup_alias))
            .route("/allow-list", post(handlers::register_allow_list))
            .route("/tunnel", get(control_channel::tunnel_upgrade))
            .route("/openapi.json", get(handlers::openapi))
            .with_state(self.state.clone());

        let protected_router = Router::new()
            .route("/ports", get(handlers::list_ports))
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                middleware::require_auth,
            ));

        public_router
            .merge(protected_router)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until the process stops
    pub async fn start(self) -> Result<(), anyhow::Error> {
        let addr = self.config.bind_addr;

        match self.config.tls.clone() {
            Some(tls) => {
                let _ = rustls::crypto::ring::default_provider().install_default();

                let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                    .await
                    .with_context(|| {
                        format!(
                            "Failed to load TLS material from {} and {}",
                            tls.cert_path.display(),
                            tls.key_path.display()
                        )
                    })?;

                let router = self.build_router();
                info!("Relay listening on https://{} (control channel wss://{}/tunnel)", addr, addr);

                axum_server::bind_rustls(addr, rustls_config)
                    .serve(router.into_make_service())
                    .await
                    .map_err(|e| anyhow::anyhow!("Server error: {}", e))
            }
            None => {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind {}", addr))?;
                self.serve(listener).await
            }
        }
    }

    /// Serve plain HTTP on an already-bound listener
    pub async fn serve(self, listener: tokio::net::TcpListener) -> Result<(), anyhow::Error> {
        let addr = listener.local_addr()?;
        let router = self.build_router();

        info!("Relay listening on http://{} (control channel ws://{}/tunnel)", addr, addr);
        info!("OpenAPI document: http://{}/openapi.json", addr);

        axum::serve(listener, router)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.iter().any(|p| p.as_str() == "/allow-list"));
        assert!(paths.iter().any(|p| p.as_str() == "/l/{alias}"));
    }
}
