use crate::rest::AppState;
use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{instrument, warn};

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    fn to_http_status(self) -> StatusCode {
        match self {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
}

impl ComponentHealth {
    fn new(name: &str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
        }
    }
}

/// Readiness check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub checks: Vec<ComponentHealth>,
}

/// Liveness check response (simple)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Liveness probe: the process is up and serving HTTP
#[instrument]
pub async fn health_liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        alive: true,
        timestamp: current_timestamp(),
    })
}

/// Readiness probe.
///
/// Ready while the registry loops are running. The store is probed with a
/// read of the discovery root and reported alongside, but does not decide
/// readiness since the registry keeps retrying on its own.
#[instrument(skip(state))]
pub async fn health_readiness(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let registry = &state.registry;

    let registry_check = if !registry.is_started() {
        ComponentHealth::new("registry", HealthStatus::Unhealthy, "not started")
    } else if registry.is_closed() {
        ComponentHealth::new("registry", HealthStatus::Unhealthy, "shutting down")
    } else {
        ComponentHealth::new(
            "registry",
            HealthStatus::Healthy,
            format!("{} groups monitored", registry.get_workers().len()),
        )
    };
    let overall = registry_check.status;

    let root = registry.layout().root();
    let store_check = match registry.store().list_children(root, false).await {
        Ok(groups) => ComponentHealth::new(
            "store",
            HealthStatus::Healthy,
            format!("{} entries under {}", groups.len(), root),
        ),
        Err(e) if e.is_not_found() => ComponentHealth::new(
            "store",
            HealthStatus::Healthy,
            format!("{} not created yet", root),
        ),
        Err(e) => {
            warn!("Store readiness check failed: {}", e);
            ComponentHealth::new("store", HealthStatus::Unhealthy, e.to_string())
        }
    };

    let response = ReadinessResponse {
        ready: overall == HealthStatus::Healthy,
        timestamp: current_timestamp(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        checks: vec![registry_check, store_check],
    };

    (overall.to_http_status(), Json(response))
}
