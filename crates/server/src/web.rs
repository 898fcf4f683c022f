//! HTTP surface: the signaling WebSocket endpoint, a health probe, and the
//! static demo client.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use mediagate_protocol::GatewayConfig;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tracing::debug;
use uuid::Uuid;

use crate::backend::MediaClient;
use crate::session::Sessions;
use crate::signaling::handle_client_ws;

/// Cookie carrying the gateway session id, so reconnects from the same
/// browser reuse their session.
const SESSION_COOKIE: &str = "MEDIAGATE_SID";

const MAX_MESSAGE_BYTES: usize = 65_536;

pub struct AppState {
    pub config: GatewayConfig,
    pub backend: MediaClient,
    pub sessions: Sessions,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let backend = MediaClient::new(&config.backend);
        Arc::new(Self {
            config,
            backend,
            sessions: Sessions::new(),
            started_at: Instant::now(),
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let web_root = state.config.server.web_root.clone();
    Router::new()
        .route("/helloworld", get(client_ws_upgrade))
        .route("/api/health", get(health))
        .layer(RequestBodyLimitLayer::new(MAX_MESSAGE_BYTES))
        .with_state(state)
        .fallback_service(ServeDir::new(web_root))
}

/// Upgrade a browser connection to the signaling WebSocket, assigning (or
/// reusing) its session id via cookie.
async fn client_ws_upgrade(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    ws: WebSocketUpgrade,
) -> Response {
    let session_id = jar
        .get(SESSION_COOKIE)
        .and_then(|c| Uuid::parse_str(c.value()).ok())
        .unwrap_or_else(Uuid::new_v4);
    debug!(session = %session_id, "WebSocket upgrade");

    let jar = jar.add(
        Cookie::build((SESSION_COOKIE, session_id.to_string()))
            .path("/")
            .build(),
    );
    let response = ws
        .max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_client_ws(socket, session_id, state));
    (jar, response).into_response()
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

#[cfg(test)]
pub(crate) fn test_app_state(conn: Arc<crate::backend::BackendConn>) -> Arc<AppState> {
    let config: GatewayConfig = toml::from_str("").expect("empty config must parse");
    Arc::new(AppState {
        config,
        backend: MediaClient::preconnected(conn),
        sessions: Sessions::new(),
        started_at: Instant::now(),
    })
}
