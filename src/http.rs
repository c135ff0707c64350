//! HTTP surface: start workflows, raise events, answer chat buttons, query status.

use std::sync::Arc;

use axum::extract::rejection::FormRejection;
use axum::extract::{Form, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::workflows::approval::RUN_APPROVAL_ORCHESTRATOR;
use crate::workflows::greeting::{RUN_ORCHESTRATOR, RUN_TIMER_ORCHESTRATOR};
use crate::workflows::notify::SlackActionRequest;
use crate::{Runtime, RuntimeError};

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub config: Arc<AppConfig>,
}

/// Links returned when an instance is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckStatus {
    pub id: String,
    pub status_query_get_uri: String,
    pub send_event_post_uri: String,
}

#[derive(Debug, Deserialize)]
pub struct RaiseParams {
    #[serde(alias = "instanceId")]
    pub instanceid: Option<String>,
    pub event: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InteractionForm {
    pub payload: String,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(e: RuntimeError) -> Self {
        let status = match &e {
            RuntimeError::UnknownInstance(_) => StatusCode::NOT_FOUND,
            RuntimeError::InstanceAlreadyExists(_) => StatusCode::CONFLICT,
            RuntimeError::UnknownOrchestration(_) | RuntimeError::Codec(_) => StatusCode::BAD_REQUEST,
            RuntimeError::Store(_) => {
                error!(error=%e, "store failure while serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub fn router(runtime: Arc<Runtime>, config: Arc<AppConfig>) -> Router {
    Router::new()
        .route("/api/HttpOrchestrationStart", get(start_greeting).post(start_greeting))
        .route(
            "/api/HttpTimerOrchestrationStart",
            get(start_timer_greeting).post(start_timer_greeting),
        )
        .route(
            "/api/HttpInteractionOrchestrationStart",
            get(start_approval).post(start_approval),
        )
        .route("/api/HttpRaiseEvent", get(raise_event).post(raise_event))
        .route("/api/SlackInteraction", post(slack_interaction))
        .route("/api/status/:instance", get(instance_status))
        .with_state(AppState { runtime, config })
}

/// Public base URL: the configured host over https, else the request's Host header.
fn base_url(config: &AppConfig, headers: &HeaderMap) -> String {
    if let Some(host) = config.host_name.as_deref() {
        return format!("https://{host}");
    }
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

async fn start(state: &AppState, headers: &HeaderMap, orchestration: &str, input: String) -> Result<Response, ApiError> {
    let id = Uuid::new_v4().simple().to_string();
    state.runtime.clone().start_instance(&id, orchestration, input).await?;
    let base = base_url(&state.config, headers);
    let body = CheckStatus {
        status_query_get_uri: format!("{base}/api/status/{id}"),
        send_event_post_uri: format!("{base}/api/HttpRaiseEvent?instanceid={id}&event={{eventName}}"),
        id,
    };
    info!(instance = %body.id, orchestration, "started via http");
    let location = body.status_query_get_uri.clone();
    Ok((StatusCode::ACCEPTED, [(header::LOCATION, location)], Json(body)).into_response())
}

async fn start_greeting(State(state): State<AppState>, headers: HeaderMap, body: String) -> Result<Response, ApiError> {
    start(&state, &headers, RUN_ORCHESTRATOR, body).await
}

async fn start_timer_greeting(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ApiError> {
    start(&state, &headers, RUN_TIMER_ORCHESTRATOR, body).await
}

async fn start_approval(State(state): State<AppState>, headers: HeaderMap, body: String) -> Result<Response, ApiError> {
    state
        .config
        .require_slack_hook()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    start(&state, &headers, RUN_APPROVAL_ORCHESTRATOR, body).await
}

async fn raise_event(
    State(state): State<AppState>,
    Query(params): Query<RaiseParams>,
    body: String,
) -> Result<&'static str, ApiError> {
    let (Some(instance), Some(event)) = (params.instanceid, params.event) else {
        return Err(ApiError::bad_request("instanceid and event query parameters are required"));
    };
    state.runtime.raise_event(&instance, &event, body).await?;
    Ok("OK")
}

async fn slack_interaction(
    State(state): State<AppState>,
    form: Result<Form<InteractionForm>, FormRejection>,
) -> Result<&'static str, ApiError> {
    let Form(form) = form.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let request: SlackActionRequest =
        serde_json::from_str(&form.payload).map_err(|e| ApiError::bad_request(format!("invalid payload: {e}")))?;
    let token = request.callback_token().map_err(|e| {
        warn!(error=%e, "unusable interaction payload");
        ApiError::bad_request(e.to_string())
    })?;
    let who = request
        .user
        .as_ref()
        .map(|u| u.name.clone().unwrap_or_else(|| u.id.clone()))
        .unwrap_or_default();
    state
        .runtime
        .raise_event(&token.instance_id, &token.event_name, who)
        .await?;
    Ok("OK")
}

async fn instance_status(State(state): State<AppState>, Path(instance): Path<String>) -> Result<Response, ApiError> {
    let status = state.runtime.get_orchestration_status(&instance).await?;
    Ok(Json(status).into_response())
}
