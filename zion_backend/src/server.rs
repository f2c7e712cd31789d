use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::agent::{AgentController, AgentEvent, AgentSnapshot, InterruptHandle, RunOutcome};
use crate::runtime::BackendRuntime;
use crate::tools::ToolDef;
use crate::versioning::{BackupEntry, TaskSummary, VersionStore};

pub struct ServerState {
    pub controller: Mutex<AgentController>,
    pub interrupt: InterruptHandle,
    pub versions: Arc<VersionStore>,
    pub tools: Vec<ToolDef>,
    pub auth: BackendAuthConfig,
}

impl ServerState {
    pub fn new(controller: AgentController, auth: BackendAuthConfig) -> Self {
        Self {
            interrupt: controller.interrupt_handle(),
            versions: controller.versions(),
            tools: controller.registry().tool_definitions(),
            controller: Mutex::new(controller),
            auth,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct StateResponse {
    busy: bool,
    #[serde(flatten)]
    snapshot: Option<AgentSnapshot>,
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    instruction: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct UndoRequest {
    task_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct UndoResponse {
    restored: Vec<BackupEntry>,
}

#[derive(Debug, Serialize)]
struct InterruptResponse {
    interrupted: bool,
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    status: &'static str,
}

type ApiError = (StatusCode, String);

pub async fn serve_backend(
    runtime: BackendRuntime,
    event_rx: flume::Receiver<AgentEvent>,
    bind_addr: SocketAddr,
) -> Result<()> {
    let auth = load_auth_config()?;
    let state = Arc::new(ServerState::new(runtime.controller, auth));

    spawn_event_log(event_rx);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Zion backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/state", get(get_state))
        .route("/tools", get(list_tools))
        .route("/submit", post(submit))
        .route("/approve", post(approve))
        .route("/reject", post(reject))
        .route("/reset", post(reset))
        .route("/interrupt", post(interrupt))
        .route("/history", get(history))
        .route("/undo", post(undo))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new().nest("/v1", protected)
}

/// Nobody else consumes events in service mode; keep the channel drained and log them.
fn spawn_event_log(event_rx: flume::Receiver<AgentEvent>) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            match event {
                AgentEvent::Error(error) => tracing::warn!("agent error: {}", error),
                AgentEvent::CommandOutput { .. } | AgentEvent::Thinking { .. } => {}
                other => tracing::debug!("agent event: {:?}", other),
            }
        }
    });
}

pub fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("ZION_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("ZION_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "ZION_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid ZION_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if auth_value.trim() != format!("Bearer {}", token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Does not wait for a running loop; a busy controller reports `busy: true`.
async fn get_state(State(state): State<Arc<ServerState>>) -> Json<StateResponse> {
    match state.controller.try_lock() {
        Ok(controller) => Json(StateResponse {
            busy: false,
            snapshot: Some(controller.snapshot()),
        }),
        Err(_) => Json(StateResponse {
            busy: true,
            snapshot: None,
        }),
    }
}

async fn list_tools(State(state): State<Arc<ServerState>>) -> Json<Vec<ToolDef>> {
    Json(state.tools.clone())
}

async fn submit(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<RunOutcome>, ApiError> {
    let mut controller = state.controller.lock().await;
    controller
        .submit(&request.instruction)
        .await
        .map(Json)
        .map_err(conflict)
}

async fn approve(State(state): State<Arc<ServerState>>) -> Result<Json<RunOutcome>, ApiError> {
    let mut controller = state.controller.lock().await;
    controller.approve().await.map(Json).map_err(conflict)
}

async fn reject(State(state): State<Arc<ServerState>>) -> Result<Json<RunOutcome>, ApiError> {
    let mut controller = state.controller.lock().await;
    controller.reject().await.map(Json).map_err(conflict)
}

async fn reset(State(state): State<Arc<ServerState>>) -> Json<ResetResponse> {
    state.controller.lock().await.reset();
    Json(ResetResponse { status: "reset" })
}

async fn interrupt(State(state): State<Arc<ServerState>>) -> Json<InterruptResponse> {
    state.interrupt.interrupt();
    Json(InterruptResponse { interrupted: true })
}

async fn history(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<TaskSummary>>, ApiError> {
    let limit = query.limit.unwrap_or(10).clamp(1, 100);
    state
        .versions
        .history(limit)
        .map(Json)
        .map_err(internal)
}

async fn undo(
    State(state): State<Arc<ServerState>>,
    body: Option<Json<UndoRequest>>,
) -> Result<Json<UndoResponse>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    // Hold the controller so an undo never interleaves with a running action.
    let _guard = state.controller.lock().await;
    state
        .versions
        .undo_task(request.task_id.as_deref())
        .map(|restored| Json(UndoResponse { restored }))
        .map_err(conflict)
}

fn conflict(error: anyhow::Error) -> ApiError {
    (StatusCode::CONFLICT, format!("{:#}", error))
}

fn internal(error: anyhow::Error) -> ApiError {
    tracing::error!("API error: {:#}", error);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn authorize_accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert!(authorize(
            &headers,
            &BackendAuthConfig {
                mode: AuthMode::Required,
                token: Some("token-123".to_string()),
            }
        )
        .is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_invalid_token() {
        let auth = BackendAuthConfig {
            mode: AuthMode::Required,
            token: Some("token-123".to_string()),
        };
        assert!(authorize(&HeaderMap::new(), &auth).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert!(authorize(&headers, &auth).is_err());
    }

    #[test]
    fn authorize_allows_when_auth_mode_disabled() {
        assert!(authorize(
            &HeaderMap::new(),
            &BackendAuthConfig {
                mode: AuthMode::Disabled,
                token: None,
            }
        )
        .is_ok());
    }

    #[test]
    fn auth_mode_parsing() {
        assert_eq!(parse_auth_mode(None).unwrap(), AuthMode::Required);
        assert_eq!(
            parse_auth_mode(Some(" Disabled ".into())).unwrap(),
            AuthMode::Disabled
        );
        assert!(parse_auth_mode(Some("sometimes".into())).is_err());
    }

    #[tokio::test]
    async fn undo_restores_through_the_shared_store() {
        use crate::config::AgentConfig;
        use crate::gateway::ScriptedGateway;

        let dir = tempfile::tempdir().unwrap();
        let controller = AgentController::new(
            AgentConfig::default(),
            dir.path(),
            Arc::new(ScriptedGateway::default()),
        )
        .unwrap();
        let state = Arc::new(ServerState::new(
            controller,
            BackendAuthConfig {
                mode: AuthMode::Disabled,
                token: None,
            },
        ));

        let file = dir.path().join("a.txt");
        std::fs::write(&file, "before\n").unwrap();
        state.versions.set_task("edit a").unwrap();
        state.versions.backup(&file, "edit").unwrap();
        std::fs::write(&file, "after\n").unwrap();

        let Json(response) = undo(State(state.clone()), None).await.unwrap();
        assert_eq!(response.restored.len(), 1);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "before\n");

        let Json(tasks) = history(State(state), Query(HistoryQuery { limit: None }))
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].message, "edit a");
    }
}
