use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use murmur_core::{CloseReason, CompletionClient};
use murmur_telemetry::MetricsRecorder;

use crate::config::ServerConfig;
use crate::observer::{self, MetricsObserver, SESSIONS_ACTIVE};
use crate::registry::SessionRegistry;
use crate::relay::Relay;
use crate::session::TransportSession;
use crate::socket;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub relay: Relay,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Option<Arc<MetricsRecorder>>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        client: Arc<dyn CompletionClient>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            relay: Relay::new(client),
            registry: Arc::new(SessionRegistry::new()),
            metrics,
        }
    }

    fn mode(&self) -> &'static str {
        if self.relay.is_demo() {
            "demo"
        } else {
            "live"
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    client: Arc<dyn CompletionClient>,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("0.0.0.0:{}", config.port);
    let state = AppState::new(config, client, metrics);
    let mode = state.mode();
    let registry = Arc::clone(&state.registry);

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), mode, "murmur server started");

    let shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "server terminated with error");
            }
        }
    });

    Ok(ServerHandle {
        local_addr,
        registry,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`; keeps the accept loop alive.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    /// Close every session with a normal close and stop accepting connections.
    pub async fn shutdown(self) {
        let closed = self.registry.close_all(CloseReason::Normal);
        tracing::info!(closed, "shutting down");
        self.shutdown.cancel();

        if tokio::time::timeout(SHUTDOWN_GRACE, self.server).await.is_err() {
            tracing::warn!("server did not stop within grace period");
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Run one connection from upgrade to teardown.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (session, outbound_rx) =
        TransportSession::new(state.config.max_send_queue, state.config.inbound_queue);
    let session_id = session.id().clone();
    state.registry.insert(Arc::clone(&session));
    tracing::info!(session_id = %session_id, "client connected");

    let _log_observer = observer::spawn_log_observer(session_id.clone(), session.subscribe());
    if let Some(metrics) = &state.metrics {
        metrics.gauge_inc(SESSIONS_ACTIVE, &[], 1.0);
        MetricsObserver::new(session_id.clone(), Arc::clone(metrics), state.mode())
            .spawn(session.subscribe());
    }

    let relay_task = tokio::spawn({
        let relay = state.relay.clone();
        let session = Arc::clone(&session);
        async move { relay.run(session).await }
    });

    socket::drive(socket, Arc::clone(&session), outbound_rx, state.config.heartbeat_interval).await;

    // The session is terminal here, so its token is cancelled and the relay exits.
    if let Err(e) = relay_task.await {
        tracing::warn!(session_id = %session_id, error = %e, "relay task failed");
    }

    state.registry.remove(&session_id);
    if let Some(metrics) = &state.metrics {
        metrics.gauge_inc(SESSIONS_ACTIVE, &[], -1.0);
    }
    tracing::info!(session_id = %session_id, state = %session.state(), "client disconnected");
}

/// Health check HTTP endpoint. Includes the metrics snapshot when recording.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = serde_json::json!({
        "status": "healthy",
        "mode": state.mode(),
        "sessions": state.registry.count(),
    });
    if let Some(metrics) = &state.metrics {
        body["metrics"] = serde_json::json!(metrics.snapshot());
    }
    Json(body)
}
