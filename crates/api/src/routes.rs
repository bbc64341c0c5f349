//! HTTP route handlers for the API.

use crate::AppState;
use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lifeline_common::{Alert, AlertId, CrisisSignal};
use lifeline_dispatch::RegistryStats;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub alerts: RegistryStats,
    pub online_therapists: usize,
    pub live_connections: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stats = state.hub.stats();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        alerts: stats.alerts,
        online_therapists: stats.online_therapists,
        live_connections: stats.live_connections,
    })
}

/// API error response, rendered as `{error, code}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip)]
    pub status: StatusCode,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, code: &'static str, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
            status,
        }
    }

    fn alert_not_found(alert_id: &AlertId) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "ALERT_NOT_FOUND",
            format!("No alert with id {}", alert_id),
        )
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub alert_id: AlertId,
}

/// Accept a crisis signal from the detection pipeline.
///
/// Answers 202 as soon as the alert is registered; therapists are notified
/// asynchronously.
pub async fn submit_signal(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(signal): Json<CrisisSignal>,
) -> Result<(StatusCode, Json<SubmitResponse>), ErrorResponse> {
    if !state.limiter.check_signal(addr.ip()) {
        warn!(ip = %addr.ip(), "Signal submission rate limited");
        return Err(ErrorResponse::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "Too many signal submissions, retry later",
        ));
    }

    let alert_id = state.hub.submit_signal(signal).map_err(|e| {
        debug!(error = %e, "Rejected signal");
        ErrorResponse::new(StatusCode::BAD_REQUEST, "INVALID_SIGNAL", e.to_string())
    })?;

    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { alert_id })))
}

/// Currently pending alerts, oldest first.
pub async fn list_alerts(State(state): State<Arc<AppState>>) -> Json<Vec<Alert>> {
    Json(state.hub.registry().pending())
}

pub async fn get_alert(
    State(state): State<Arc<AppState>>,
    Path(alert_id): Path<AlertId>,
) -> Result<Json<Alert>, ErrorResponse> {
    state
        .hub
        .registry()
        .get(&alert_id)
        .map(Json)
        .ok_or_else(|| ErrorResponse::alert_not_found(&alert_id))
}

#[derive(Debug, Default, Deserialize)]
pub struct WithdrawRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn withdraw_alert(
    State(state): State<Arc<AppState>>,
    Path(alert_id): Path<AlertId>,
    Json(request): Json<WithdrawRequest>,
) -> Result<Json<Alert>, ErrorResponse> {
    let reason = request
        .reason
        .unwrap_or_else(|| "withdrawn by administrator".to_string());
    let withdrawn = state.hub.withdraw(&alert_id, &reason);

    match state.hub.registry().get(&alert_id) {
        None => Err(ErrorResponse::alert_not_found(&alert_id)),
        Some(alert) if withdrawn => {
            info!(alert_id = %alert_id, reason = %reason, "Alert withdrawn via API");
            Ok(Json(alert))
        }
        Some(alert) => Err(ErrorResponse::new(
            StatusCode::CONFLICT,
            "ALERT_NOT_PENDING",
            format!(
                "Alert {} is already {}",
                alert_id,
                format!("{:?}", alert.status).to_lowercase()
            ),
        )),
    }
}
