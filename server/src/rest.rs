use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use keeper_cluster::{Exchange, Registry, WorkerSnapshot};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// REST API response wrapper
#[derive(Serialize)]
#[serde(bound(serialize = "T: Serialize"))]
pub struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

fn fail<T: Serialize>(status: StatusCode, message: impl Into<String>) -> ApiResult<T> {
    (status, Json(ApiResponse::error(message)))
}

/// Shared state behind every handler
pub struct AppState {
    pub registry: Arc<Registry>,
    /// Absent when no recorder was installed (tests, embedding)
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            registry,
            metrics,
            started_at: Instant::now(),
        }
    }
}

/// A monitored group as reported by the API
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerView {
    pub group: String,
    pub working_node: String,
    pub last_working_node: String,
    pub last_keepalive: Option<i64>,
    /// `last_keepalive` rendered as RFC 3339
    pub last_keepalive_at: Option<String>,
}

impl From<WorkerSnapshot> for WorkerView {
    fn from(snapshot: WorkerSnapshot) -> Self {
        let last_keepalive_at = snapshot
            .last_keepalive
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .map(|at| at.to_rfc3339());

        Self {
            group: snapshot.group,
            working_node: snapshot.working_node,
            last_working_node: snapshot.last_working_node,
            last_keepalive: snapshot.last_keepalive,
            last_keepalive_at,
        }
    }
}

/// Manual leader reassignment
#[derive(Deserialize, Debug)]
pub struct UpdateRequest {
    pub group: String,
    pub node: String,
}

#[derive(Serialize, Debug)]
pub struct UpdateResponse {
    pub group: String,
    pub from: String,
    pub to: String,
    pub message: String,
}

#[derive(Serialize, Debug)]
pub struct VersionResponse {
    pub name: String,
    pub version: String,
}

/// List monitored groups
#[instrument(skip(state))]
async fn list_workers(State(state): State<Arc<AppState>>) -> ApiResult<Vec<WorkerView>> {
    let mut workers: Vec<WorkerView> = state
        .registry
        .get_workers()
        .into_values()
        .map(WorkerView::from)
        .collect();
    workers.sort_by(|a, b| a.group.cmp(&b.group));
    ok(workers)
}

/// Get one monitored group
#[instrument(skip(state))]
async fn get_worker(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
) -> ApiResult<WorkerView> {
    match state.registry.get_worker(&group) {
        Some(snapshot) => ok(snapshot.into()),
        None => fail(StatusCode::NOT_FOUND, format!("group {} not found", group)),
    }
}

/// Queue a leader change for a group
#[instrument(skip(state))]
async fn update_worker(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<UpdateRequest>,
) -> ApiResult<UpdateResponse> {
    let group = payload.group.trim();
    let node = payload.node.trim();
    if group.is_empty() || node.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "group and node are required");
    }

    let Some(monitor) = state.registry.monitor(group) else {
        return fail(StatusCode::NOT_FOUND, format!("group {} not found", group));
    };

    match monitor.is_member(node).await {
        Ok(true) => {}
        Ok(false) => {
            return fail(
                StatusCode::NOT_FOUND,
                format!("node {} is not a member of group {}", node, group),
            )
        }
        Err(e) => {
            error!("Failed to read members of {}: {}", group, e);
            return fail(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    }

    let from = monitor.working_node();
    if from == node {
        return ok(UpdateResponse {
            group: group.to_string(),
            from: from.clone(),
            to: from,
            message: "Node is already the working node".to_string(),
        });
    }

    if let Err(e) = state
        .registry
        .submit(Exchange::update(group, from.clone(), node))
        .await
    {
        error!("Failed to queue manual update: {}", e);
        return fail(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
    }

    info!("Manual update queued: [{}] {} -> {}", group, from, node);
    counter!("keeper.failovers.manual").increment(1);

    ok(UpdateResponse {
        group: group.to_string(),
        from,
        to: node.to_string(),
        message: "Update queued".to_string(),
    })
}

#[instrument]
async fn version() -> ApiResult<VersionResponse> {
    ok(VersionResponse {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Prometheus text exposition
async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

/// Create REST API router
pub fn create_router(state: Arc<AppState>) -> Router {
    use crate::health;

    Router::new()
        .route("/workers", get(list_workers))
        .route("/workers/:group", get(get_worker))
        .route("/update", post(update_worker))
        .route("/version", get(version))
        .route("/metrics", get(render_metrics))
        .route("/health/live", get(health::health_liveness))
        .route("/health/ready", get(health::health_readiness))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the REST server and serve until `shutdown` resolves
pub async fn start_rest_server<F>(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    info!("Starting REST server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("REST server stopped");
    Ok(())
}
