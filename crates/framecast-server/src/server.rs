//! Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use framecast_core::config::HeartbeatSettings;
use framecast_core::RelayConfig;
use framecast_session::{BuiltinResolver, ManagerConfig, SessionManager};

use crate::control;
use crate::health::{self, HealthResponse};
use crate::registry::ConnectionRegistry;
use crate::router::MessageRouter;
use crate::shutdown::ShutdownCoordinator;
use crate::ws;

/// Frame rate reported by the synthetic `frame-test` source.
const FRAME_TEST_RATE: f64 = 30.0;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub sessions: Arc<SessionManager>,
    pub router: Arc<MessageRouter>,
    pub heartbeat: HeartbeatSettings,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: &RelayConfig) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let registry = Arc::new(ConnectionRegistry::new(
            config.server.max_connections,
            config.server.outbound_queue_capacity,
            shutdown.token(),
        ));
        let resolver = BuiltinResolver {
            default_test_frames: config.pacing.default_test_frames,
            frame_test_rate: FRAME_TEST_RATE,
        };
        let sessions = Arc::new(SessionManager::new(
            ManagerConfig::from(config),
            Arc::new(resolver),
            registry.clone(),
            shutdown.token().child_token(),
        ));
        let router = Arc::new(MessageRouter::new(registry.clone(), sessions.clone()));

        Self {
            registry,
            sessions,
            router,
            heartbeat: config.heartbeat.clone(),
            shutdown,
            start_time: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/control", post(control::control_handler))
        .route("/sessions", get(control::list_sessions))
        .route("/sessions/{id}", get(control::get_session))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns once the listener is bound.
pub async fn start(config: &RelayConfig) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(config);
    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    let addr = listener.local_addr()?;

    let router = build_router(state.clone());
    let token = state.shutdown.token();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(err) = result {
            error!(error = %err, "server exited with error");
        }
    });

    info!(%addr, "framecast relay listening");
    Ok(ServerHandle { addr, state, server })
}

/// Running server.
pub struct ServerHandle {
    pub addr: SocketAddr,
    state: AppState,
    server: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop all sessions, close all connections, and wait for the listener.
    pub async fn shutdown(self) {
        self.state.sessions.shutdown().await;
        self.state.shutdown.drain(vec![self.server], None).await;
        info!("framecast relay stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws::handle_socket(socket, state))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_shutting_down(),
        state.registry.len(),
        state.sessions.active_count(),
        state.registry.total_dropped(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_endpoint_reports_counters() {
        let app = build_router(AppState::new(&RelayConfig::default()));
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["active_sessions"], 0);
        assert_eq!(body["dropped_messages"], 0);
    }

    #[tokio::test]
    async fn health_reports_shutdown_in_progress() {
        let state = AppState::new(&RelayConfig::default());
        state.shutdown.shutdown();
        let (status, body) = get_json(build_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "shutting_down");
    }

    #[tokio::test]
    async fn control_play_then_query() {
        let state = AppState::new(&RelayConfig::default());
        let app = build_router(state.clone());

        let (status, body) = post_json(
            app.clone(),
            "/control",
            serde_json::json!({"action": "play", "mode": "second-test", "total_frames": 3}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        let id = body["session_id"].as_str().unwrap().to_string();

        let (status, body) = get_json(app.clone(), &format!("/sessions/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "second-test");
        assert_eq!(body["total_frames"], 3);

        let (_, list) = get_json(app.clone(), "/sessions").await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, body) = post_json(app, "/control", serde_json::json!({"action": "stop"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "stopped");
        state.sessions.shutdown().await;
    }

    #[tokio::test]
    async fn bare_play_resumes_paused_session() {
        let state = AppState::new(&RelayConfig::default());
        let app = build_router(state.clone());

        let (_, body) = post_json(
            app.clone(),
            "/control",
            serde_json::json!({"action": "play", "mode": "second-test", "total_frames": 30}),
        )
        .await;
        let id = body["session_id"].as_str().unwrap().to_string();
        let (status, body) = post_json(app.clone(), "/control", serde_json::json!({"action": "pause"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "paused");

        let (status, body) = post_json(app.clone(), "/control", serde_json::json!({"action": "play"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "active");
        assert_eq!(body["session_id"], id.as_str());

        let (_, list) = get_json(app.clone(), "/sessions").await;
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["state"], "active");

        // explicit id works too
        post_json(app.clone(), "/control", serde_json::json!({"action": "pause", "session_id": id})).await;
        let (status, body) = post_json(
            app,
            "/control",
            serde_json::json!({"action": "play", "session_id": id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "active");
        state.sessions.shutdown().await;
    }

    #[tokio::test]
    async fn control_errors_map_to_status_codes() {
        let app = build_router(AppState::new(&RelayConfig::default()));

        let (status, body) = post_json(
            app.clone(),
            "/control",
            serde_json::json!({"action": "pause", "session_id": "sess_missing"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], "unknown_session");

        let (status, body) = post_json(app.clone(), "/control", serde_json::json!({"action": "rewind"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_request");

        let (status, _) = post_json(app, "/control", serde_json::json!({"action": "play"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_session_route_is_404() {
        let app = build_router(AppState::new(&RelayConfig::default()));
        let (status, _) = get_json(app, "/sessions/sess_nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = build_router(AppState::new(&RelayConfig::default()));
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_binds_ephemeral_port_and_shuts_down() {
        let mut config = RelayConfig::default();
        config.server.port = 0;
        let handle = start(&config).await.unwrap();
        assert!(handle.port() > 0);

        let body: Value = reqwest::get(format!("{}/health", handle.http_url()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        handle.shutdown().await;
    }
}
