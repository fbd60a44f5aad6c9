//! HTTP API
//!
//! ```text
//! POST   /api/tasks                      create
//! GET    /api/tasks                      list
//! GET    /api/tasks/{id}                 overview
//! DELETE /api/tasks/{id}                 soft delete
//! POST   /api/tasks/{id}/start|retry     spawn provisioning (202)
//! POST   /api/tasks/{id}/stop|complete   terminal transition + VM teardown
//! POST   /api/tasks/{id}/reconnect       manual reconnect
//! POST   /api/tasks/{id}/touch           record activity
//! POST   /api/tasks/{id}/instructions    {text}
//! POST   /api/tasks/{id}/resize          {cols, rows}
//! GET    /api/tasks/{id}/transcript      ?lines=N | ?offset=N
//! GET    /api/tasks/{id}/stream          SSE: output, status, connection
//! GET    /metrics                        Prometheus text format
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::connection::{ConnectionStatus, SessionError};
use crate::orchestrator::{Orchestrator, OverviewError, TaskOverview};
use crate::provision::ProvisionError;
use crate::tasks::{AgentKind, JsonTaskStore, Task, TaskMetadata, TaskStatus, TaskStoreError};
use crate::transcript::{TranscriptChunk, TranscriptError};

/// How often a stream polls the transcript and task status
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Task records owned by this binary
    pub store: Arc<JsonTaskStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route("/api/tasks/{id}", get(get_task).delete(delete_task))
        .route("/api/tasks/{id}/start", post(start_task))
        .route("/api/tasks/{id}/stop", post(stop_task))
        .route("/api/tasks/{id}/complete", post(complete_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/tasks/{id}/reconnect", post(reconnect))
        .route("/api/tasks/{id}/touch", post(touch))
        .route("/api/tasks/{id}/instructions", post(send_instruction))
        .route("/api/tasks/{id}/resize", post(resize))
        .route("/api/tasks/{id}/transcript", get(transcript))
        .route("/api/tasks/{id}/stream", get(stream))
        .route("/metrics", get(metrics))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TaskStoreError> for ApiError {
    fn from(e: TaskStoreError) -> Self {
        match e {
            TaskStoreError::NotFound(_) => ApiError::NotFound(e.to_string()),
            TaskStoreError::InvalidId(_) => ApiError::BadRequest(e.to_string()),
            TaskStoreError::Io(_) | TaskStoreError::Serde(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<TranscriptError> for ApiError {
    fn from(e: TranscriptError) -> Self {
        match e {
            TranscriptError::InvalidId(_) => ApiError::BadRequest(e.to_string()),
            TranscriptError::Io(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NoActiveConnection(_)
            | SessionError::TaskInactive(_)
            | SessionError::MissingVm(_)
            | SessionError::InstanceMissing(_) => ApiError::Conflict(e.to_string()),
            SessionError::Transport(_) => ApiError::Upstream(e.to_string()),
            SessionError::Store(e) => e.into(),
            SessionError::Transcript(e) => e.into(),
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(e: ProvisionError) -> Self {
        match e {
            ProvisionError::InvalidState { .. } | ProvisionError::Cancelled { .. } => {
                ApiError::Conflict(e.to_string())
            }
            ProvisionError::Store(e) => e.into(),
            ProvisionError::Transcript(e) => e.into(),
            ProvisionError::Session(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<OverviewError> for ApiError {
    fn from(e: OverviewError) -> Self {
        match e {
            OverviewError::Store(e) => e.into(),
            OverviewError::Transcript(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub description: String,
    #[serde(default)]
    pub agent: AgentKind,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    if req.description.trim().is_empty() {
        return Err(ApiError::BadRequest("description must not be empty".into()));
    }
    let mut task = Task::new(req.description, req.agent);
    task.metadata = req.metadata;
    state.store.create(&task)?;
    state.orchestrator.transcripts().init(&task.id)?;
    debug!(task_id = %task.id, "Task created");
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.store.list()?))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskOverview>, ApiError> {
    Ok(Json(state.orchestrator.overview(&id).await?))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.soft_delete(&id)?;
    state.orchestrator.sessions().disconnect(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let task = state.orchestrator.tasks().get_task(&id).await?;
    if task.deleted || task.status != TaskStatus::Pending {
        return Err(ApiError::Conflict(format!("task {} is {}", id, task.status)));
    }
    state.orchestrator.spawn_start(&id);
    Ok(StatusCode::ACCEPTED)
}

async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let task = state.orchestrator.tasks().get_task(&id).await?;
    if task.deleted || !task.status.is_terminal() {
        return Err(ApiError::Conflict(format!("task {} is {}", id, task.status)));
    }
    state.orchestrator.spawn_retry(&id);
    Ok(StatusCode::ACCEPTED)
}

async fn stop_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskOverview>, ApiError> {
    state.orchestrator.stop_task(&id).await?;
    Ok(Json(state.orchestrator.overview(&id).await?))
}

async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskOverview>, ApiError> {
    state.orchestrator.complete_task(&id).await?;
    Ok(Json(state.orchestrator.overview(&id).await?))
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ConnectionResponse {
    connection: Option<ConnectionStatus>,
}

async fn reconnect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let status = state.orchestrator.manual_reconnect(&id).await?;
    Ok(Json(ConnectionResponse {
        connection: Some(status),
    }))
}

async fn touch(State(state): State<AppState>, Path(id): Path<String>) -> Json<serde_json::Value> {
    let touched = state.orchestrator.update_activity(&id);
    Json(json!({ "touched": touched }))
}

#[derive(Debug, Deserialize)]
pub struct InstructionRequest {
    pub text: String,
}

async fn send_instruction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<InstructionRequest>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.send_instruction(&id, &req.text).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub cols: u16,
    pub rows: u16,
}

async fn resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.cols == 0 || req.rows == 0 {
        return Err(ApiError::BadRequest("cols and rows must be positive".into()));
    }
    let applied = state.orchestrator.resize_terminal(&id, req.cols, req.rows).await?;
    Ok(Json(json!({ "applied": applied })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Transcript
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct TranscriptQuery {
    pub lines: Option<usize>,
    pub offset: Option<u64>,
}

async fn transcript(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TranscriptQuery>,
) -> Result<Json<TranscriptChunk>, ApiError> {
    let orchestrator = &state.orchestrator;
    let chunk = match (query.offset, query.lines) {
        (Some(_), Some(_)) => {
            return Err(ApiError::BadRequest("use either lines or offset, not both".into()))
        }
        (Some(offset), None) => orchestrator.read_transcript_from(&id, offset)?,
        (None, lines) => {
            // Length first: content read afterwards may be longer, never shorter
            let length = orchestrator.transcripts().len(&id)?;
            let content = orchestrator.read_transcript(&id, lines)?;
            TranscriptChunk { content, length }
        }
    };
    Ok(Json(chunk))
}

#[derive(Debug, Serialize)]
struct OutputEvent<'a> {
    content: &'a str,
    offset: u64,
}

fn sse_event(name: &str, payload: &impl Serialize) -> Option<Event> {
    match Event::default().event(name).json_data(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(event = name, error = %e, "Failed to serialize stream event");
            None
        }
    }
}

/// Push transcript growth and status changes to the client. Each poll reads
/// from the last delivered offset, so a slow client never skips output.
async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TranscriptQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let orchestrator = state.orchestrator.clone();
    orchestrator.tasks().get_task(&id).await?;

    let stream = async_stream::stream! {
        let mut offset = query.offset.unwrap_or(0);
        let mut last_status: Option<TaskStatus> = None;
        let mut last_connection: Option<Option<ConnectionStatus>> = None;
        let mut ticker = tokio::time::interval(STREAM_POLL_INTERVAL);

        loop {
            ticker.tick().await;

            match orchestrator.read_transcript_from(&id, offset) {
                Ok(chunk) if !chunk.content.is_empty() => {
                    offset = chunk.length;
                    let payload = OutputEvent { content: &chunk.content, offset };
                    if let Some(event) = sse_event("output", &payload) {
                        yield Ok::<Event, Infallible>(event);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Transcript stream read failed");
                    break;
                }
            }

            match orchestrator.tasks().get_task(&id).await {
                Ok(task) if last_status != Some(task.status) => {
                    last_status = Some(task.status);
                    if let Some(event) = sse_event("status", &json!({ "status": task.status })) {
                        yield Ok(event);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(task_id = %id, error = %e, "Task vanished, closing stream");
                    break;
                }
            }

            let connection = orchestrator.connection_status(&id);
            if last_connection != Some(connection) {
                last_connection = Some(connection);
                if let Some(event) = sse_event("connection", &ConnectionResponse { connection }) {
                    yield Ok(event);
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let body = crate::metrics::gather_text().map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrchestratorConfig, SettleDelays};
    use crate::transcript::TranscriptStore;
    use crate::transport::{
        EventStream, ExecOutput, InstanceInfo, InstanceProvider, InstanceSpec, OutputChunk, RemoteShell,
        ShellSession, TransportError, VmTarget,
    };
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    /// Cloud that refuses every call
    struct Offline;

    #[async_trait]
    impl RemoteShell for Offline {
        async fn open(&self, _: &VmTarget) -> Result<(Arc<dyn ShellSession>, EventStream), TransportError> {
            Err(TransportError::Closed)
        }
        async fn exec(&self, _: &VmTarget, _: &str) -> Result<ExecOutput, TransportError> {
            Err(TransportError::Closed)
        }
        async fn exec_streaming(
            &self,
            _: &VmTarget,
            _: &str,
            _: mpsc::UnboundedSender<OutputChunk>,
            _: Duration,
        ) -> Result<i32, TransportError> {
            Err(TransportError::Closed)
        }
        async fn copy_to(&self, _: &VmTarget, _: &std::path::Path, _: &str) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }
    }

    #[async_trait]
    impl InstanceProvider for Offline {
        async fn create_instance(&self, _: &InstanceSpec) -> Result<InstanceInfo, TransportError> {
            Err(TransportError::Closed)
        }
        async fn delete_instance(&self, _: &VmTarget) -> Result<(), TransportError> {
            Ok(())
        }
        async fn instance_exists(&self, _: &VmTarget) -> Result<bool, TransportError> {
            Ok(false)
        }
    }

    fn app() -> (tempfile::TempDir, AppState, Router) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonTaskStore::new(dir.path().join("tasks")).unwrap());
        let transcripts = Arc::new(TranscriptStore::new(dir.path().join("transcripts")).unwrap());
        let mut config = OrchestratorConfig::default();
        config.project = "test-project".into();
        config.settle = SettleDelays::none();
        let offline = Arc::new(Offline);
        let orchestrator = Arc::new(Orchestrator::new(
            offline.clone(),
            offline,
            store.clone(),
            transcripts,
            config,
        ));
        let state = AppState { orchestrator, store };
        (dir, state.clone(), router(state))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let (_dir, _state, app) = app();
        let response = app
            .clone()
            .oneshot(post_json("/api/tasks", json!({ "description": "fix the flaky test", "agent": "codex" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["status"], "pending");

        let response = app
            .oneshot(Request::get(format!("/api/tasks/{}", id)).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let overview = body_json(response).await;
        assert_eq!(overview["status"], "pending");
        assert_eq!(overview["connection"], serde_json::Value::Null);
        assert_eq!(overview["needs_attention"], false);
    }

    #[tokio::test]
    async fn test_unknown_task_is_404() {
        let (_dir, _state, app) = app();
        let response = app
            .oneshot(Request::get("/api/tasks/does-not-exist").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_instruction_without_connection_is_409() {
        let (_dir, state, app) = app();
        let mut task = Task::new("idle", AgentKind::ClaudeCode);
        task.status = TaskStatus::Running;
        state.store.create(&task).unwrap();

        let response = app
            .oneshot(post_json(
                &format!("/api/tasks/{}/instructions", task.id),
                json!({ "text": "run the tests" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(state.orchestrator.read_transcript(&task.id, None).unwrap(), "");
    }

    #[tokio::test]
    async fn test_resize_without_connection_is_noop() {
        let (_dir, state, app) = app();
        let task = Task::new("resize", AgentKind::ClaudeCode);
        state.store.create(&task).unwrap();

        let response = app
            .oneshot(post_json(
                &format!("/api/tasks/{}/resize", task.id),
                json!({ "cols": 100, "rows": 30 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["applied"], false);
    }

    #[tokio::test]
    async fn test_transcript_offset_query() {
        let (_dir, state, app) = app();
        let task = Task::new("read", AgentKind::ClaudeCode);
        state.store.create(&task).unwrap();
        state.orchestrator.transcripts().append(&task.id, "hello ").unwrap();
        state.orchestrator.transcripts().append(&task.id, "world").unwrap();

        let response = app
            .oneshot(
                Request::get(format!("/api/tasks/{}/transcript?offset=6", task.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let chunk = body_json(response).await;
        assert_eq!(chunk["content"], "world");
        assert_eq!(chunk["length"], 11);
    }

    #[tokio::test]
    async fn test_start_requires_pending() {
        let (_dir, state, app) = app();
        let mut task = Task::new("done", AgentKind::ClaudeCode);
        task.status = TaskStatus::Completed;
        state.store.create(&task).unwrap();

        let response = app
            .oneshot(post_json(&format!("/api/tasks/{}/start", task.id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (_dir, _state, app) = app();
        crate::metrics::HEALTH_SWEEPS.inc();
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("agentvisor_health_sweeps_total"));
    }
}
