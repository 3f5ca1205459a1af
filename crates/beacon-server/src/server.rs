use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use beacon_core::PrincipalResolver;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::handler::HandlerMap;
use crate::hub::Hub;
use crate::socket;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub auth_deadline: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            max_send_queue: 256,
            auth_deadline: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Per-socket knobs handed to the connection plumbing.
#[derive(Clone, Copy)]
pub struct SocketOptions {
    pub queue_capacity: usize,
    pub auth_deadline: Duration,
    pub heartbeat_interval: Duration,
}

/// Shared application state passed to axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub resolver: Arc<dyn PrincipalResolver>,
    pub handlers: Arc<HandlerMap>,
    pub socket: SocketOptions,
}

/// Build the axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start serving. Returns a handle that keeps the
/// server task alive and can shut it down.
pub async fn start(
    config: ServerConfig,
    hub: Arc<Hub>,
    resolver: Arc<dyn PrincipalResolver>,
    handlers: Arc<HandlerMap>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        hub,
        resolver,
        handlers,
        socket: SocketOptions {
            queue_capacity: config.max_send_queue,
            auth_deadline: config.auth_deadline,
            heartbeat_interval: config.heartbeat_interval,
        },
    };

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let server_token = shutdown.clone();
    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(server_token.cancelled_owned())
            .await
            .ok();
    });

    tracing::info!(port = local_addr.port(), "server listening");

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        task,
    })
}

/// Handle returned by `start` — dropping it leaves the server running
/// detached; `shutdown` stops it.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

/// WebSocket upgrade endpoint. New connections are refused once the hub
/// leaves `Running`.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if !state.hub.is_running() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| socket::serve(socket, state))
        .into_response()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "state": state.hub.state().as_str(),
        "connections": state.hub.registry().len(),
        "relay": state.hub.relay_state_name(),
    }))
}
