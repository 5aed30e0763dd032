//! HTTP transport: `/health` (unauthenticated, cached) and `/mcp`
//! (bearer-authenticated JSON-RPC).
//!
//! Responses on `/mcp` are always plain `application/json`; notifications
//! are acknowledged with `202 Accepted` and an empty body. An
//! `Mcp-Session-Id` header is echoed when the client sends one, otherwise a
//! fresh id is issued per response — the server itself is stateless.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::BearerAuth;
use crate::config::Config;
use crate::dataset::DatasetManager;
use crate::engine::{HealthCache, ProductQuery, QueryEngine, HEALTH_CACHE_TTL};
use crate::mcp::McpDispatcher;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<McpDispatcher>,
    query: Arc<dyn ProductQuery>,
    auth: BearerAuth,
    health: Arc<HealthCache>,
    cancel: CancellationToken,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<McpDispatcher>,
        query: Arc<dyn ProductQuery>,
        auth: BearerAuth,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            query,
            auth,
            health: Arc::new(HealthCache::new(HEALTH_CACHE_TTL)),
            cancel,
        }
    }
}

/// Builds the route table. Exposed separately from [`serve`] so tests can
/// drive the router without binding a socket.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(handle_health))
        .route("/mcp", post(handle_mcp))
        .layer(cors)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

fn handle_panic(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %detail, "request handler panicked");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

async fn handle_health(State(state): State<AppState>) -> Response {
    let result = state
        .health
        .get_or_probe(|| async {
            state
                .query
                .health_check(&state.cancel)
                .await
                .map_err(|e| e.to_string())
        })
        .await;

    match result {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "healthy" }))).into_response(),
        Err(e) => {
            error!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "error": e })),
            )
                .into_response()
        }
    }
}

async fn handle_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !state.auth.is_authorized(auth_header) {
        warn!("unauthorized MCP request");
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            "Authentication failed",
        )
            .into_response();
    }

    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    match state.dispatcher.handle_message(&body).await {
        Some(response) => ([(SESSION_HEADER, session_id)], Json(response)).into_response(),
        None => (StatusCode::ACCEPTED, [(SESSION_HEADER, session_id)]).into_response(),
    }
}

/// Full HTTP-mode startup: ensure the snapshot, open the engine, verify it,
/// start the refresh loop, and serve until SIGINT/SIGTERM.
pub async fn serve(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    info!(
        port = config.port,
        health_endpoint = "/health (no auth)",
        mcp_endpoint = "/mcp (bearer auth)",
        "initializing Open Food Facts MCP server"
    );
    if config.is_development() {
        warn!(
            environment = %config.environment,
            "development mode enabled: detailed errors will be returned to clients"
        );
    }

    let manager = Arc::new(DatasetManager::new(&config));
    manager
        .ensure_snapshot(&cancel)
        .await
        .context("failed to ensure dataset")?;

    let engine = Arc::new(QueryEngine::new(&config.parquet_path, &config.duckdb));
    engine
        .connection_test(&cancel)
        .await
        .context("query engine connection test failed")?;

    if config.refresh_interval_secs > 0 {
        manager.clone().spawn_refresh_loop(
            Duration::from_secs(config.refresh_interval_secs),
            cancel.clone(),
        );
    }

    let query: Arc<dyn ProductQuery> = engine.clone();
    let dispatcher = Arc::new(McpDispatcher::new(
        query.clone(),
        config.is_development(),
        cancel.clone(),
    ));
    let state = AppState::new(
        dispatcher,
        query,
        BearerAuth::new(&config.auth_token),
        cancel.clone(),
    );
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "MCP HTTP server ready");

    // Trip the cancellation token on SIGINT/SIGTERM; the graceful-shutdown
    // future below watches it.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    let serve_fut = axum::serve(listener, app)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move { cancel.cancelled().await }
        })
        .into_future();
    tokio::pin!(serve_fut);

    tokio::select! {
        result = &mut serve_fut => result.context("http server error")?,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!("graceful shutdown timed out, abandoning in-flight requests");
        }
    }

    engine.close().await;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
