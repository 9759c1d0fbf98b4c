use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{QuotaSentryError, Result};
use crate::history::{HistoryRecord, HistoryStore};
use crate::interfaces::accounts::{AccountDirectory, ModelCatalog};
use crate::interfaces::probe::WakeupProbe;
use crate::interfaces::refresh::QuotaRefresh;
use crate::orchestrator::{SchedulerDeps, WakeupScheduler};
use crate::reset::{ResetGate, ResetStore};
use crate::runner::{BatchSummary, TaskRunner};
use crate::tasks::{ScheduleConfig, TaskDraft, TaskStore, TriggerConfig, WakeupTask};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: WakeupScheduler,
    pub token: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct TaskListResponse {
    enabled: bool,
    tasks: Vec<WakeupTask>,
}

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

#[derive(Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

#[derive(Deserialize)]
struct PreviewRequest {
    trigger: TriggerConfig,
    count: Option<usize>,
}

#[derive(Serialize)]
struct PreviewResponse {
    runs: Vec<String>,
}

#[derive(Deserialize)]
struct TestRequest {
    name: Option<String>,
    schedule: ScheduleConfig,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HistoryResponse {
    records: Vec<HistoryRecord>,
}

#[derive(Serialize)]
struct ClearHistoryResponse {
    cleared: usize,
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

#[derive(Serialize)]
struct EnabledResponse {
    enabled: bool,
}

#[derive(Serialize)]
struct RunResponse {
    started: bool,
    summary: Option<BatchSummary>,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn authorize(headers: &HeaderMap, token: &str) -> std::result::Result<(), HandlerError> {
    let expected_token = token.trim();
    if expected_token.is_empty() {
        return Err(unauthorized());
    }

    let header = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let bearer = header.strip_prefix("Bearer ").unwrap_or("").trim();
    let api_key = api_key.trim();

    if bearer == expected_token || api_key == expected_token {
        return Ok(());
    }
    Err(unauthorized())
}

fn unauthorized() -> HandlerError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "Unauthorized".to_string(),
        }),
    )
}

fn map_error(err: QuotaSentryError) -> HandlerError {
    let status = match &err {
        QuotaSentryError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<TaskListResponse>, HandlerError> {
    authorize(&headers, &state.token)?;
    let enabled = state.scheduler.global_enabled().await.map_err(map_error)?;
    let tasks = state.scheduler.list_tasks().await.map_err(map_error)?;
    Ok(Json(TaskListResponse { enabled, tasks }))
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<TaskDraft>,
) -> std::result::Result<Json<WakeupTask>, HandlerError> {
    authorize(&headers, &state.token)?;
    let task = state.scheduler.create_task(draft).await.map_err(map_error)?;
    Ok(Json(task))
}

async fn update_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i32>,
    Json(draft): Json<TaskDraft>,
) -> std::result::Result<Json<WakeupTask>, HandlerError> {
    authorize(&headers, &state.token)?;
    let task = state
        .scheduler
        .update_task(id, draft)
        .await
        .map_err(map_error)?;
    Ok(Json(task))
}

async fn toggle_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i32>,
    Json(request): Json<ToggleRequest>,
) -> std::result::Result<Json<WakeupTask>, HandlerError> {
    authorize(&headers, &state.token)?;
    let task = state
        .scheduler
        .toggle_task(id, request.enabled)
        .await
        .map_err(map_error)?;
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i32>,
) -> std::result::Result<Json<DeleteResponse>, HandlerError> {
    authorize(&headers, &state.token)?;
    let deleted = state.scheduler.delete_task(id).await.map_err(map_error)?;
    Ok(Json(DeleteResponse { deleted }))
}

async fn run_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i32>,
) -> std::result::Result<Json<RunResponse>, HandlerError> {
    authorize(&headers, &state.token)?;
    let summary = state.scheduler.run_task_now(id).await.map_err(map_error)?;
    Ok(Json(RunResponse {
        started: summary.is_some(),
        summary,
    }))
}

async fn set_enabled(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<EnabledRequest>,
) -> std::result::Result<Json<EnabledResponse>, HandlerError> {
    authorize(&headers, &state.token)?;
    state
        .scheduler
        .set_global_enabled(request.enabled)
        .await
        .map_err(map_error)?;
    Ok(Json(EnabledResponse {
        enabled: request.enabled,
    }))
}

async fn run_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TestRequest>,
) -> std::result::Result<Json<BatchSummary>, HandlerError> {
    authorize(&headers, &state.token)?;
    let name = request.name.unwrap_or_else(|| "wakeup test".to_string());
    let summary = state
        .scheduler
        .run_test(&name, &request.schedule)
        .await
        .map_err(map_error)?;
    Ok(Json(summary))
}

async fn preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PreviewRequest>,
) -> std::result::Result<Json<PreviewResponse>, HandlerError> {
    authorize(&headers, &state.token)?;
    let count = request.count.unwrap_or(5).min(50);
    let runs = state
        .scheduler
        .preview(&request.trigger, count)
        .into_iter()
        .map(|run| run.format("%Y-%m-%d %H:%M").to_string())
        .collect();
    Ok(Json(PreviewResponse { runs }))
}

async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> std::result::Result<Json<HistoryResponse>, HandlerError> {
    authorize(&headers, &state.token)?;
    let records = state
        .scheduler
        .history(query.limit.unwrap_or(0))
        .await
        .map_err(map_error)?;
    Ok(Json(HistoryResponse { records }))
}

async fn clear_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<ClearHistoryResponse>, HandlerError> {
    authorize(&headers, &state.token)?;
    let cleared = state.scheduler.clear_history().await.map_err(map_error)?;
    Ok(Json(ClearHistoryResponse { cleared }))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/wakeup/tasks", get(list_tasks).post(create_task))
        .route("/wakeup/tasks/{id}", put(update_task).delete(delete_task))
        .route("/wakeup/tasks/{id}/toggle", post(toggle_task))
        .route("/wakeup/tasks/{id}/run", post(run_task))
        .route("/wakeup/enabled", post(set_enabled))
        .route("/wakeup/test", post(run_test))
        .route("/wakeup/preview", post(preview))
        .route("/wakeup/history", get(history))
        .route("/wakeup/clear_history", post(clear_history))
        .with_state(state)
}

pub async fn bootstrap(
    config: &Config,
    directory: Arc<dyn AccountDirectory>,
    catalog: Arc<dyn ModelCatalog>,
    probe: Arc<dyn WakeupProbe>,
    refresh: Arc<dyn QuotaRefresh>,
) -> Result<WakeupScheduler> {
    let db_path = config.effective_db_path();
    let tasks = Arc::new(TaskStore::new(&db_path).await?);
    let resets = Arc::new(ResetStore::new(&db_path).await?);
    let history = Arc::new(HistoryStore::new(&db_path, config.effective_history_cap()).await?);
    let runner = Arc::new(TaskRunner::new(
        directory.clone(),
        catalog.clone(),
        probe,
        tasks.clone(),
        history.clone(),
        config.effective_prompt(),
        config.effective_max_output_tokens(),
    ));
    let gate = ResetGate {
        margin_seconds: config.effective_margin_seconds(),
        cooldown_seconds: config.effective_cooldown_seconds(),
    };
    Ok(WakeupScheduler::new(SchedulerDeps {
        tasks,
        resets,
        history,
        runner,
        directory,
        catalog,
        refresh,
        gate,
        poll_interval: Duration::from_secs(config.effective_poll_seconds()),
    }))
}

pub async fn run(host: &str, port: u16, state: AppState) -> Result<()> {
    run_with_shutdown(host, port, state, futures::future::pending::<()>()).await
}

pub async fn run_with_shutdown<F>(host: &str, port: u16, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let scheduler = state.scheduler.clone();
    scheduler.start().await?;

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|e| QuotaSentryError::Runtime(e.to_string()))?;
    tracing::info!(host, port, "quota-sentry daemon listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| QuotaSentryError::Runtime(e.to_string()));
    scheduler.stop().await;
    served
}
