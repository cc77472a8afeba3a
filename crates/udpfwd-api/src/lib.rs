//! Control-plane HTTP API
//!
//! Thin adapter over [`RelayRegistry`]: every route decodes a rule, calls the
//! registry and encodes the outcome. Served on a Unix socket by default.

pub mod handlers;
pub mod models;

use axum::{
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use udpfwd_control::RelayRegistry;
use utoipa::OpenApi;

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<RelayRegistry>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "udpfwd API",
        version = "0.1.0",
        description = "Control API for UDP relay rules"
    ),
    paths(
        handlers::add_rule,
        handlers::remove_rule,
        handlers::rule_exists,
        handlers::list_rules,
        handlers::health_check,
    ),
    components(
        schemas(
            udpfwd_proto::RelayRule,
            models::RuleResponse,
            models::ExistsResponse,
            models::HealthResponse,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "relays", description = "Relay rule management endpoints"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// Where the API server listens
#[derive(Debug, Clone)]
pub enum ApiListen {
    /// Unix domain socket path
    Unix(PathBuf),
    /// TCP address
    Tcp(SocketAddr),
}

impl std::fmt::Display for ApiListen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiListen::Unix(path) => write!(f, "unix:{}", path.display()),
            ApiListen::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub listen: ApiListen,
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, registry: Arc<RelayRegistry>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { registry }),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/v1/proxy/add", post(handlers::add_rule))
            .route("/v1/proxy/remove", post(handlers::remove_rule))
            .route("/v1/proxy/exist", post(handlers::rule_exists))
            .route("/v1/proxy/list", get(handlers::list_rules))
            .route("/v1/health", get(handlers::health_check))
            .route("/v1/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.listen);

        match &self.config.listen {
            ApiListen::Tcp(addr) => {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
                    .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
            }
            #[cfg(unix)]
            ApiListen::Unix(path) => {
                let listener = bind_unix(path)?;
                let result = axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await;
                let _ = std::fs::remove_file(path);
                result.map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
            }
            #[cfg(not(unix))]
            ApiListen::Unix(path) => {
                anyhow::bail!("Unix sockets are not supported here: {}", path.display());
            }
        }

        info!("API server stopped");
        Ok(())
    }
}

/// Bind a Unix socket, creating its directory and clearing a stale socket file.
#[cfg(unix)]
fn bind_unix(path: &std::path::Path) -> Result<tokio::net::UnixListener, anyhow::Error> {
    use anyhow::Context;

    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    tokio::net::UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))
}
