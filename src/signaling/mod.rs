#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod outbox;
pub mod protocol;
pub mod relay;

use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use crate::room::registry::ConnectionRegistry;
use crate::room::{api, RoomManager};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use relay::Relay;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    room_manager: Arc<RoomManager>,
    relay: Relay,
    config: Arc<ServerConfig>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    /// Creates a server with empty room and connection state.
    pub fn new(config: ServerConfig) -> Self {
        let metrics = ServerMetrics::new();
        let registry = ConnectionRegistry::new();
        info!("Max connections: {}", config.max_connections);

        Self {
            room_manager: Arc::new(RoomManager::new(registry.clone(), metrics.clone())),
            relay: Relay::new(registry, metrics.clone()),
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            metrics,
        }
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        let cors = cors_layer(&self.config.cors_origins);

        let api_routes = Router::new()
            .route("/rooms", post(api::create_room))
            .route("/rooms/{room_id}", get(api::get_room))
            .route(
                "/rooms/{room_id}/check-participant/{participant_id}",
                get(api::check_participant),
            );

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .nest("/api", api_routes)
            .with_state(self)
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Binds the configured address and serves until the listener fails.
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the address
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.serve_on(listener).await
    }

    /// Serves on an already bound listener (ephemeral ports in tests).
    pub async fn serve_on(self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Starting signaling server on {}", listener.local_addr()?);
        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Drops all room state; open sockets close on their own.
    pub async fn shutdown(&self) {
        self.room_manager.shutdown().await;
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.room_manager.room_count();
    let participants = server.room_manager.total_participant_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "participants": participants,
    }))
}

/// Prometheus text exposition, behind `Bearer <METRICS_TOKEN>` when configured.
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = server.config.metrics_token.as_deref() {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if provided != Some(expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.room_manager.room_count();
    let participants = server.room_manager.total_participant_count().await;
    let body = server.metrics.render_prometheus(rooms, participants);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let max_message_size = server.config.max_message_size;
    ws.max_message_size(max_message_size)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, server, permit))
}
