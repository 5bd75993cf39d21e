// =============================================================================
// Orchestrator HTTP API — Axum 0.7
// =============================================================================
//
// Grounded on `services/orchestrator-api/app.py`. No endpoint in the
// original requires authentication, so — unlike the teacher's dashboard
// API — this router carries no bearer-token layer; CORS stays permissive
// the same way the teacher configures it for local/dev use.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::api::store::OrchestratorStore;
use crate::bus::EventBus;
use crate::config::AppSettings;
use crate::replay::{ReplayEngine, ReplayError, ReplayTask, ReplayWindowRequest, SubmitOutcome};
use crate::types::streams;

/// Shared state for every orchestrator endpoint.
pub struct OrchestratorState {
    pub settings: Arc<AppSettings>,
    pub bus: Arc<dyn EventBus>,
    pub store: Arc<dyn OrchestratorStore>,
    pub replay: Arc<ReplayEngine>,
}

pub fn router(state: Arc<OrchestratorState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/strategy/start", post(strategy_start))
        .route("/strategy/stop", post(strategy_stop))
        .route("/config/update", post(config_update))
        .route("/metrics/summary", get(metrics_summary))
        .route("/replay/news-window", post(replay_news_window))
        .route("/replay/tasks/:task_id", get(get_replay_task))
        .route("/replay/tasks", get(list_replay_tasks))
        .route("/replay/tasks/:task_id/cancel", post(cancel_replay_task))
        .route("/replay/tasks/:task_id/retry", post(retry_replay_task))
        .route("/replay/metrics", get(replay_metrics))
        .layer(cors)
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

fn error_response(status: StatusCode, detail: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "detail": detail.into() })))
}

impl From<ReplayError> for ApiError {
    fn from(err: ReplayError) -> Self {
        match err {
            ReplayError::InvalidWindow => error_response(StatusCode::BAD_REQUEST, err.to_string()),
            ReplayError::NotFound => error_response(StatusCode::NOT_FOUND, err.to_string()),
            ReplayError::NotCancellable(_) | ReplayError::UnsafeCancel | ReplayError::StillActive => {
                error_response(StatusCode::CONFLICT, err.to_string())
            }
            ReplayError::Other(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    redis: bool,
    env: String,
}

async fn health(State(state): State<Arc<OrchestratorState>>) -> impl IntoResponse {
    let redis = state.bus.ping().await;
    Json(HealthResponse {
        status: "ok",
        redis,
        env: state.settings.env.clone(),
    })
}

// =============================================================================
// Strategy toggle
// =============================================================================

#[derive(Serialize)]
struct StrategyResponse {
    active: bool,
}

async fn strategy_start(
    State(state): State<Arc<OrchestratorState>>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .set_strategy_active(true)
        .await
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(StrategyResponse { active: true }))
}

async fn strategy_stop(
    State(state): State<Arc<OrchestratorState>>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .set_strategy_active(false)
        .await
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(StrategyResponse { active: false }))
}

// =============================================================================
// Config update
// =============================================================================

#[derive(Deserialize)]
struct ConfigUpdateRequest {
    #[serde(default)]
    values: HashMap<String, Value>,
}

#[derive(Serialize)]
struct ConfigUpdateResponse {
    updated: bool,
    values: HashMap<String, String>,
}

async fn config_update(
    State(state): State<Arc<OrchestratorState>>,
    Json(req): Json<ConfigUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stringified: HashMap<String, String> = req
        .values
        .into_iter()
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, s)
        })
        .collect();

    let values = state
        .store
        .update_runtime_config(stringified)
        .await
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    Ok(Json(ConfigUpdateResponse {
        updated: true,
        values,
    }))
}

// =============================================================================
// Metrics summary
// =============================================================================

#[derive(Serialize)]
struct MetricsSummaryResponse {
    stream_lengths: HashMap<String, u64>,
    strategy_active: bool,
}

async fn metrics_summary(
    State(state): State<Arc<OrchestratorState>>,
) -> Result<impl IntoResponse, ApiError> {
    let mut stream_lengths = HashMap::new();
    for stream in streams::ALL {
        let len = state
            .bus
            .len(stream)
            .await
            .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
        stream_lengths.insert(stream.to_string(), len);
    }

    let strategy_active = state
        .store
        .get_strategy_active()
        .await
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    Ok(Json(MetricsSummaryResponse {
        stream_lengths,
        strategy_active,
    }))
}

// =============================================================================
// Replay
// =============================================================================

#[derive(Deserialize)]
struct ReplayWindowBody {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    #[serde(default = "default_news_stream")]
    source_stream: String,
    #[serde(default = "default_news_stream")]
    target_stream: String,
    #[serde(default = "default_max_scan")]
    max_scan: usize,
    #[serde(default = "default_max_publish")]
    max_publish: usize,
    #[serde(default)]
    dry_run: bool,
    #[serde(default = "default_true")]
    async_mode: bool,
}

fn default_news_stream() -> String {
    streams::NEWS_RAW.to_string()
}
fn default_max_scan() -> usize {
    5000
}
fn default_max_publish() -> usize {
    1000
}
fn default_true() -> bool {
    true
}

async fn replay_news_window(
    State(state): State<Arc<OrchestratorState>>,
    Json(body): Json<ReplayWindowBody>,
) -> Result<impl IntoResponse, ApiError> {
    let max_scan = body.max_scan.clamp(1, 50_000);
    let max_publish = body.max_publish.clamp(1, 10_000);

    let req = ReplayWindowRequest {
        start: body.start,
        end: body.end,
        source_stream: body.source_stream,
        target_stream: body.target_stream,
        max_scan,
        max_publish,
        dry_run: body.dry_run,
        async_mode: body.async_mode,
    };

    match state.replay.submit(req).await? {
        SubmitOutcome::Accepted { task_id, replay_id } => Ok(Json(serde_json::json!({
            "accepted": true,
            "async_mode": true,
            "task_id": task_id,
            "replay_id": replay_id,
            "status": "pending",
        }))),
        SubmitOutcome::Completed(task) => Ok(Json(serde_json::json!({
            "accepted": true,
            "async_mode": false,
            "task": task,
        }))),
    }
}

async fn get_replay_task(
    State(state): State<Arc<OrchestratorState>>,
    Path(task_id): Path<String>,
) -> Result<Json<ReplayTask>, ApiError> {
    Ok(Json(state.replay.get_task(&task_id).await?))
}

#[derive(Deserialize)]
struct ListTasksQuery {
    #[serde(default = "default_list_limit")]
    limit: usize,
}

fn default_list_limit() -> usize {
    20
}

async fn list_replay_tasks(
    State(state): State<Arc<OrchestratorState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<ReplayTask>>, ApiError> {
    let limit = query.limit.clamp(1, 200);
    let tasks = state
        .replay
        .list_tasks(limit)
        .await
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(tasks))
}

async fn cancel_replay_task(
    State(state): State<Arc<OrchestratorState>>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.replay.cancel(&task_id).await?;
    Ok(Json(serde_json::json!({ "canceled": true, "task": task })))
}

#[derive(Deserialize, Default)]
struct ReplayRetryBody {
    #[serde(default = "default_true")]
    async_mode: bool,
}

async fn retry_replay_task(
    State(state): State<Arc<OrchestratorState>>,
    Path(task_id): Path<String>,
    Json(body): Json<ReplayRetryBody>,
) -> Result<impl IntoResponse, ApiError> {
    let (retry_of, outcome) = state.replay.retry(&task_id, body.async_mode).await?;

    match outcome {
        SubmitOutcome::Accepted { task_id, replay_id } => Ok(Json(serde_json::json!({
            "accepted": true,
            "async_mode": true,
            "task_id": task_id,
            "replay_id": replay_id,
            "status": "pending",
            "retry_of": retry_of,
        }))),
        SubmitOutcome::Completed(task) => Ok(Json(serde_json::json!({
            "accepted": true,
            "async_mode": false,
            "retry_of": retry_of,
            "task": task,
        }))),
    }
}

#[derive(Deserialize)]
struct ReplayMetricsQuery {
    #[serde(default = "default_metrics_limit")]
    limit: usize,
}

fn default_metrics_limit() -> usize {
    200
}

async fn replay_metrics(
    State(state): State<Arc<OrchestratorState>>,
    Query(query): Query<ReplayMetricsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.clamp(1, 1000);
    let metrics = state
        .replay
        .metrics(limit)
        .await
        .map_err(|err| error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    let counts: HashMap<String, usize> = metrics
        .counts
        .into_iter()
        .map(|(status, count)| (status.to_string(), count))
        .collect();

    Ok(Json(serde_json::json!({
        "sample_size": metrics.sample_size,
        "counts": counts,
        "avg_duration_sec": metrics.avg_duration_sec,
        "success_rate": metrics.success_rate,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::store::MemoryOrchestratorStore;
    use crate::bus::InMemoryEventBus;
    use crate::replay::MemoryReplayStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> Arc<OrchestratorState> {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let store: Arc<dyn OrchestratorStore> = Arc::new(MemoryOrchestratorStore::new());
        let replay = ReplayEngine::new(bus.clone(), Arc::new(MemoryReplayStore::new()));
        Arc::new(OrchestratorState {
            settings: Arc::new(AppSettings::from_env()),
            bus,
            store,
            replay,
        })
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn strategy_start_returns_ok() {
        let state = test_state();
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/strategy/start")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_replay_task_returns_404() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/replay/tasks/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
