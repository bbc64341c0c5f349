//! REST/WebSocket front end for Lifeline crisis dispatch.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with alert and presence counters
//! - `POST /api/v1/signals` - Submit a crisis signal (202 + alert id)
//! - `GET /api/v1/alerts` - Pending alerts
//! - `GET /api/v1/alerts/{id}` - One alert in any state
//! - `POST /api/v1/alerts/{id}/withdraw` - Administrative withdrawal
//! - `WS /api/v1/ws` - Therapist alert channel
//!
//! # Security Features
//!
//! - Bearer API key on signal and admin routes
//! - Per-IP rate limit on signal submissions
//! - Per-IP cap on therapist sockets
//! - Request body size limit
//!
//! # Architecture
//!
//! ```text
//! Detection pipeline          Therapist dashboards
//!        │ POST /signals             ▲ │ WS
//!        ▼                           │ ▼
//! ┌──────────────────────────────────────────┐
//! │              API (Axum)                  │ ◄── This crate
//! └────────────────────┬─────────────────────┘
//!                      ▼
//!              ┌───────────────┐
//!              │ BroadcastHub  │ ──► SessionLauncher (webhook)
//!              └───────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod launcher;
pub mod rate_limit;
pub mod routes;
pub mod socket;
pub mod state;

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub use auth::ApiKeyConfig;
pub use config::{ServerConfig, WebhookConfig};
pub use launcher::WebhookLauncher;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use state::AppState;

/// Create the API router.
///
/// `cors_origins` of `None` allows no cross-origin requests; an entry of `*`
/// allows any origin.
pub fn create_router(state: Arc<AppState>, cors_origins: Option<Vec<String>>) -> Router {
    let mut router = Router::new()
        .route("/health", get(routes::health))
        .route("/api/v1/signals", post(routes::submit_signal))
        .route("/api/v1/alerts", get(routes::list_alerts))
        .route("/api/v1/alerts/{id}", get(routes::get_alert))
        .route("/api/v1/alerts/{id}/withdraw", post(routes::withdraw_alert))
        .route("/api/v1/ws", get(socket::websocket_handler));

    if let Some(api_key) = state.api_key.clone() {
        router = router.layer(middleware::from_fn(move |request: Request, next: Next| {
            auth::api_key_auth(api_key.clone(), request, next)
        }));
    }

    router
        .layer(RequestBodyLimitLayer::new(state.limiter.max_body_size()))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

fn cors_layer(origins: Option<Vec<String>>) -> CorsLayer {
    let Some(origins) = origins else {
        return CorsLayer::new();
    };

    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(parsed)
}

/// Serve the API on `addr` until Ctrl-C or SIGTERM.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    cors_origins: Option<Vec<String>>,
) -> anyhow::Result<()> {
    let hub = state.hub.clone();
    let router = create_router(state, cors_origins);

    info!(%addr, "Starting Lifeline API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        hub.drain_all();
    })
    .await?;

    info!("Lifeline API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
