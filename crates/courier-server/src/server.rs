//! `CourierServer`: axum HTTP + WebSocket accept layer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use courier_core::{EventType, ManagerError, Payload, RunId, ThreadId, UserContext, UserId};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::dispatcher::SendReport;
use crate::websocket::manager::{ConnectionHub, ManagerStats};
use crate::websocket::session::{SessionConfig, run_ws_session};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection hub holding every user scope.
    pub hub: Arc<ConnectionHub>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus render handle.
    pub metrics: PrometheusHandle,
}

/// The courier server.
pub struct CourierServer {
    config: Arc<ServerConfig>,
    hub: Arc<ConnectionHub>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: PrometheusHandle,
    start_time: Instant,
}

impl CourierServer {
    /// Create a server over an existing hub.
    pub fn new(config: ServerConfig, hub: Arc<ConnectionHub>, metrics: PrometheusHandle) -> Self {
        Self {
            config: Arc::new(config),
            hub,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: Arc::clone(&self.hub),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/events", post(emit_handler))
            .route("/stats", get(stats_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown is signalled.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
        });
        info!(%addr, "courier server listening");
        Ok((addr, handle))
    }

    /// Get the connection hub.
    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// [`ManagerError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ManagerError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            ManagerError::MissingUserContext => StatusCode::UNAUTHORIZED,
            ManagerError::SyntheticContext => StatusCode::FORBIDDEN,
            ManagerError::InvalidConnection(_) | ManagerError::InvalidUserId => {
                StatusCode::BAD_REQUEST
            }
            ManagerError::ConnectionIdConflict { .. } | ManagerError::DuplicateConnection(_) => {
                StatusCode::CONFLICT
            }
        }
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!(code = self.0.code(), %status, "request refused");
        error_response(status, self.0.code(), &self.0.to_string())
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = json!({ "error": { "code": code, "message": message } });
    (status, Json(body)).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Query parameters of `GET /ws`.
#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    user_id: Option<String>,
    thread_id: Option<String>,
    run_id: Option<String>,
}

impl ConnectParams {
    fn into_context(self) -> Option<UserContext> {
        let user_id = self.user_id?;
        let mut context = UserContext::new(user_id);
        if let Some(thread) = self.thread_id.filter(|t| !t.trim().is_empty()) {
            context = context.with_thread(thread);
        }
        if let Some(run) = self.run_id.filter(|r| !r.trim().is_empty()) {
            context = context.with_run(RunId::from(run));
        }
        Some(context)
    }
}

/// Body of `POST /events`.
#[derive(Debug, Deserialize)]
struct EmitRequest {
    user_id: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(rename = "type")]
    event_type: EventType,
    #[serde(default)]
    data: Value,
}

/// GET /ws
///
/// Identity is checked before the upgrade; the facade is only attached
/// once the socket is live.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN", "server is shutting down");
    }
    let context = match state.hub.resolve_context(params.into_context()) {
        Ok(ctx) if ctx.synthetic => return ApiError(ManagerError::SyntheticContext).into_response(),
        Ok(ctx) => ctx,
        Err(e) => return ApiError(e).into_response(),
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let session = SessionConfig {
        heartbeat_interval: state.config.heartbeat_interval(),
        heartbeat_timeout: state.config.heartbeat_timeout(),
    };
    let hub = Arc::clone(&state.hub);
    upgrade
        .max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            match hub.open_session(context) {
                Ok(lease) => run_ws_session(socket, lease, session).await,
                Err(e) => warn!(error = %e, code = e.code(), "session refused after upgrade"),
            }
        })
}

/// POST /events
async fn emit_handler(
    State(state): State<AppState>,
    Json(request): Json<EmitRequest>,
) -> Result<Json<SendReport>, ApiError> {
    let user_id = UserId::from(request.user_id);
    let thread_id = request.thread_id.map(ThreadId::from);
    let report = state
        .hub
        .emit_in_thread(&user_id, thread_id.as_ref(), request.event_type, Payload::Json(request.data))
        .await?;
    Ok(Json(report))
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<ManagerStats> {
    Json(state.hub.stats())
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.connection_count(),
        state.hub.user_count(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
