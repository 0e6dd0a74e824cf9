//! Relay gateway: axum HTTP/WebSocket server in front of the realtime model.
//!
//! The upstream credential lives only here. Clients connect to `/ws` and
//! speak the realtime event protocol plus one control message
//! (`set_direction`); see [`relay`].

pub mod relay;

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use crate::config::Config;
use crate::voice::transport::{self, WsConnector};
use relay::{RelayContext, RelayRegistry, Registration};

/// Timeout for plain HTTP requests. Upgraded sockets are not affected.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<RelayContext>,
    pub registry: Arc<RelayRegistry>,
}

impl AppState {
    pub fn from_config(config: &Config) -> Result<Self> {
        let upstream = WsConnector::new(config.upstream_transport()?);
        let ctx = RelayContext {
            upstream: Arc::new(upstream),
            table: Arc::new(config.direction_table()),
            settings: config.session.clone(),
            initial_direction: config.relay.initial_direction,
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            registry: Arc::new(RelayRegistry::new(config.relay.max_sessions)),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/ws", get(handle_ws))
        .route("/api/sessions", get(handle_sessions))
        .with_state(state)
        .layer(cors)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Run the relay until Ctrl-C.
pub async fn run_gateway(config: Config) -> Result<()> {
    let state = AppState::from_config(&config)?;

    let addr: SocketAddr = format!("{}:{}", config.relay.host, config.relay.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.relay.host, config.relay.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let local = listener.local_addr()?;

    tracing::info!(
        addr = %local,
        model = %config.upstream.model,
        max_sessions = config.relay.max_sessions,
        initial_direction = %config.relay.initial_direction,
        "Relay gateway listening"
    );
    println!("voxbridge relay listening on ws://{local}/ws");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Relay gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health: liveness plus the number of live relay pairs
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": state.registry.active_count(),
    }))
}

/// GET /api/sessions: live relay pairs, oldest first
async fn handle_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list())
}

/// GET /ws: WebSocket relay endpoint.
///
/// The slot is reserved before the upgrade so a full relay answers 503
/// instead of accepting and dropping the socket.
async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let registration = match admit(&state) {
        Ok(registration) => registration,
        Err(response) => return response,
    };
    let ctx = Arc::clone(&state.ctx);

    ws.on_upgrade(move |socket| async move {
        let stats = Arc::clone(registration.stats());
        relay::run_pair(transport::socket_transport(socket), ctx, stats).await;
        drop(registration);
    })
}

fn admit(state: &AppState) -> Result<Registration, Response> {
    state
        .registry
        .register(state.ctx.initial_direction)
        .map_err(|e| {
            tracing::warn!(
                active = state.registry.active_count(),
                "Rejecting relay connection: {e}"
            );
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::direction::{Direction, DirectionTable};
    use crate::voice::protocol::SessionSettings;
    use crate::voice::transport::{MemoryConnector, TransportMode};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state(max_sessions: usize) -> AppState {
        AppState {
            ctx: Arc::new(RelayContext {
                upstream: Arc::new(MemoryConnector::new(TransportMode::Direct)),
                table: Arc::new(DirectionTable::default()),
                settings: SessionSettings::default(),
                initial_direction: Direction::ThToEn,
            }),
            registry: Arc::new(RelayRegistry::new(max_sessions)),
        }
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[tokio::test]
    async fn health_reports_active_sessions() {
        let state = state(4);
        let _held = state.registry.register(Direction::EnToTh).unwrap();

        let (status, body) = get_json(build_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_sessions"], 1);
    }

    #[tokio::test]
    async fn sessions_lists_live_pairs() {
        let state = state(4);
        let held = state.registry.register(Direction::ThToEn).unwrap();

        let (status, body) = get_json(build_router(state.clone()), "/api/sessions").await;
        assert_eq!(status, StatusCode::OK);
        let sessions = body.as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["id"], held.stats().id());
        assert_eq!(sessions[0]["direction"], "th-en");
        assert_eq!(sessions[0]["upstream_connected"], false);

        drop(held);
        let (_, body) = get_json(build_router(state), "/api/sessions").await;
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ws_without_upgrade_headers_is_rejected() {
        let response = build_router(state(1))
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn full_relay_answers_503() {
        let state = state(1);
        let first = admit(&state).unwrap();
        assert_eq!(first.stats().direction(), Direction::ThToEn);

        let rejected = admit(&state).err().unwrap();
        assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);

        drop(first);
        assert!(admit(&state).is_ok());
    }

    #[test]
    fn from_config_requires_key() {
        let config = Config::default();
        assert!(AppState::from_config(&config).is_err());

        let mut config = Config::default();
        config.upstream.api_key = Some("sk-test".into());
        let state = AppState::from_config(&config).unwrap();
        assert_eq!(state.registry.active_count(), 0);
        assert_eq!(state.ctx.initial_direction, Direction::EnToTh);
    }
}
