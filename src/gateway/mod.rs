//! HTTP and WebSocket transport.
//!
//! `POST /mcp` is the single RPC endpoint, `GET /health` the composite
//! backend snapshot, `GET /mcp/ws` the WebSocket upgrade. Admission
//! middleware (body cap, CORS, security headers, API-key gate, rate
//! limiter) runs in front of the pipeline.

pub mod admission;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Router, middleware};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::backend::BackendPool;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::pipeline::{HttpOutcome, Pipeline};
use crate::session::SessionManager;

use admission::Admission;

/// Everything a request handler needs, assembled once at boot.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub sessions: Arc<SessionManager>,
    pub pool: Arc<BackendPool>,
    pub admission: Arc<Admission>,
    /// Cancelled on shutdown; WebSocket connections and background tasks
    /// watch it.
    pub shutdown: CancellationToken,
}

/// Build the gateway router. Public so integration tests can drive it with
/// axum-test.
pub fn create_app(state: AppState, config: &GatewayConfig) -> Router {
    let admission = Arc::clone(&state.admission);

    Router::new()
        .route("/mcp", post(mcp_post))
        .route("/mcp/ws", get(ws_upgrade))
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&admission),
            admission::rate_limit,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&admission),
            admission::api_key_gate,
        ))
        .layer(middleware::from_fn_with_state(
            admission,
            admission::security_headers,
        ))
        .layer(cors_layer(config))
        .layer(DefaultBodyLimit::max(config.max_request_size_bytes()))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A panicking handler still owes its caller a JSON-RPC error. Held backend
/// leases were already given back when the stack unwound.
fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| err.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "request handler panicked".to_string());
    tracing::error!("panic while handling request: {detail}");

    let body = crate::protocol::error_response(
        serde_json::Value::Null,
        crate::protocol::INTERNAL_ERROR,
        "Internal error",
        Some(detail),
    );
    (StatusCode::OK, Json(body)).into_response()
}

/// Bind and serve until a shutdown signal arrives, then drain.
pub async fn serve(state: AppState, config: &GatewayConfig) -> anyhow::Result<()> {
    let app = create_app(state.clone(), config);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
    .await?;

    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; draining");
    // Probes, the sweeper, and WebSocket connections all stop here;
    // in-flight forwards finish within their own timeouts.
    cancel.cancel();
}

fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    if config.allowed_origins.is_empty() {
        // Development default; production boot refuses an empty list.
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unparseable allowed origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-simulate-organization"),
        ])
        .allow_credentials(config.cors_credentials)
        .max_age(Duration::from_secs(3600))
}

/// POST /mcp — one JSON-RPC request in, one response out. Notifications
/// are acknowledged with 202 and no body. New sessions return their token
/// in `x-session-token`.
async fn mcp_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match state.pipeline.handle_http(&body, &headers).await {
        HttpOutcome::Reply {
            body,
            session_token,
        } => with_session_token((StatusCode::OK, Json(body)).into_response(), session_token),
        HttpOutcome::Accepted { session_token } => {
            with_session_token(StatusCode::ACCEPTED.into_response(), session_token)
        }
        HttpOutcome::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "No organization could be resolved from the provided credentials" })),
        )
            .into_response(),
    }
}

fn with_session_token(mut response: Response, token: Option<String>) -> Response {
    if let Some(token) = token
        && let Ok(value) = HeaderValue::from_str(&token)
    {
        response.headers_mut().insert("x-session-token", value);
    }
    response
}

/// GET /health — composite backend health snapshot.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.snapshot())
}

/// GET /mcp/ws — upgrade and bind (or create) a WebSocket session.
async fn ws_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
) -> Response {
    match state.sessions.session_for_websocket(&headers).await {
        Ok(session) => ws.on_upgrade(move |socket| ws::serve_socket(socket, state, session)),
        Err(GatewayError::SessionQuota) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Maximum concurrent sessions reached" })),
        )
            .into_response(),
        Err(_) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "No organization could be resolved from the provided credentials" })),
        )
            .into_response(),
    }
}
