use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::HeaderValue,
    routing::{any, get},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use super::websocket::{ws_handler, GatewayContext};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// HTTP surface of the relay: the WebSocket accept route and a health
/// endpoint.
pub struct GatewayServer {
    context: Arc<GatewayContext>,
}

impl GatewayServer {
    /// Create a server over shared gateway state.
    pub fn new(context: Arc<GatewayContext>) -> Self {
        Self { context }
    }

    /// Build the Axum router.
    pub fn router(&self) -> Router {
        let cors = if self.context.config.server.cors_enabled {
            let origins = &self.context.config.server.cors_origins;
            if origins.contains(&"*".to_string()) {
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
            } else {
                let origins: Vec<HeaderValue> =
                    origins.iter().filter_map(|o| o.parse().ok()).collect();
                CorsLayer::new()
                    .allow_origin(origins)
                    .allow_methods(Any)
                    .allow_headers(Any)
            }
        } else {
            CorsLayer::new()
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", any(ws_handler))
            .with_state(self.context.clone())
            .layer(cors)
    }

    /// The socket address to bind to.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.context.config.server.port))
    }

    /// Serve until the shutdown token fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), std::io::Error> {
        let addr = self.addr();
        let router = self.router();

        tracing::info!("gateway listening on {}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    }
}

/// Health check handler.
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
