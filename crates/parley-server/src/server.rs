//! `ParleyServer` — the axum HTTP + WebSocket front end.
//!
//! `GET /ws` upgrades a long-lived duplex connection; the identity
//! token and optional group arrive as query parameters and are verified
//! before the upgrade completes. `GET /health` and `GET /metrics`
//! expose liveness and Prometheus text.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use parley_core::ids::GroupId;

use crate::auth::TokenVerifier;
use crate::config::{ConfigError, ServerConfig};
use crate::health;
use crate::routing::handlers::DomainSink;
use crate::routing::router::{MessageRouter, RouterContext};
use crate::shutdown::ShutdownCoordinator;
use crate::ws::registry::ConnectionRegistry;
use crate::ws::session::run_session;

/// Startup failure.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configuration is inconsistent.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The listener could not be bound.
    #[error("bind failed: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared state for axum handlers.
#[derive(Clone)]
struct AppState {
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    ctx: Arc<RouterContext>,
    verifier: Arc<dyn TokenVerifier>,
    config: ServerConfig,
    start_time: Instant,
    metrics_handle: Option<PrometheusHandle>,
}

/// Query parameters of the upgrade request.
#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
    group: Option<String>,
}

/// The Parley server: registry + router behind an axum app.
pub struct ParleyServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    ctx: Arc<RouterContext>,
    verifier: Arc<dyn TokenVerifier>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics_handle: Option<PrometheusHandle>,
    server_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ParleyServer {
    /// Create a server from its parts.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        router: MessageRouter,
        verifier: Arc<dyn TokenVerifier>,
        domain: Arc<dyn DomainSink>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.clone()));
        let ctx = Arc::new(RouterContext {
            registry: Arc::clone(&registry),
            domain,
        });
        Self {
            config,
            registry,
            router: Arc::new(router),
            ctx,
            verifier,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics_handle: None,
            server_task: parking_lot::Mutex::new(None),
        }
    }

    /// Attach the Prometheus handle backing `GET /metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The shutdown coordinator.
    #[must_use]
    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the axum router.
    #[must_use]
    pub fn app(&self) -> Router {
        let state = AppState {
            registry: Arc::clone(&self.registry),
            router: Arc::clone(&self.router),
            ctx: Arc::clone(&self.ctx),
            verifier: Arc::clone(&self.verifier),
            config: self.config.clone(),
            start_time: self.start_time,
            metrics_handle: self.metrics_handle.clone(),
        };
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
    }

    /// Bind, start the background loops, and serve until shutdown.
    /// Returns the bound address (port 0 in the config auto-assigns).
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        self.config.validate()?;
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        self.registry.start_background_tasks();

        let app = self.app();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .ok();
        });
        *self.server_task.lock() = Some(handle);

        info!(addr = %local_addr, "parley server listening");
        Ok(local_addr)
    }

    /// Shut down in order: stop accepting, then let the registry stop
    /// its background loops, close every connection, and clear its
    /// indexes.
    pub async fn stop(&self) {
        // 1. Stop accepting new connections.
        self.shutdown.trigger();
        // 2–4. Stop the background loops, close every connection with a
        // going-away code, clear the indexes.
        self.registry.shutdown().await;
        // The accept loop can now finish: no live sockets remain.
        let task = self.server_task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(std::time::Duration::from_secs(5), task)
                .await
                .is_err()
            {
                warn!("accept loop did not stop in time");
            }
        }
        info!("parley server stopped");
    }
}

/// GET /ws — verify the token, then upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.token.unwrap_or_default();
    match state.verifier.verify(&token).await {
        Ok(identity) => {
            let group = params.group.map(GroupId::from);
            let registry = Arc::clone(&state.registry);
            let router = Arc::clone(&state.router);
            let ctx = Arc::clone(&state.ctx);
            let config = state.config.clone();
            ws.on_upgrade(move |socket| {
                run_session(socket, identity, group, registry, router, ctx, config)
            })
            .into_response()
        }
        Err(err) => {
            warn!(%err, "rejecting upgrade");
            (StatusCode::UNAUTHORIZED, err.to_string()).into_response()
        }
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Response {
    let connections = state.registry.connection_count().await;
    let groups = state.registry.group_count().await;
    Json(health::health_check(state.start_time, connections, groups)).into_response()
}

/// GET /metrics — Prometheus text, or 503 when no recorder is wired.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
