//! HTTP surface: task REST endpoints, provider webhooks, OAuth state.
//!
//! Every mutation goes through [`TaskEngine`]; handlers only translate
//! requests and map [`TaskError`] onto status codes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channels::channel::{ChannelAdapter, ChannelKind};
use crate::channels::ingest::{IngestOutcome, Ingestor};
use crate::channels::oauth::OAuthStates;
use crate::channels::whatsapp::{WebhookSignature, message_from_webhook};
use crate::error::TaskError;
use crate::tasks::engine::TaskEngine;
use crate::tasks::model::{
    LogFilter, NewTask, Page, Priority, TaskFilter, TaskPatch, TaskStatus,
};

/// Shared handler state.
#[derive(Clone)]
pub struct WebState {
    pub engine: Arc<TaskEngine>,
    pub ingestor: Arc<Ingestor>,
    pub oauth: Arc<OAuthStates>,
    /// Present when the WhatsApp channel is configured.
    pub whatsapp: Option<Arc<dyn ChannelAdapter>>,
    /// When set, WhatsApp webhooks must carry a valid Twilio signature.
    pub whatsapp_signature: Option<WebhookSignature>,
}

/// Build the router.
pub fn routes(state: WebState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/api/tasks/{id}/approve", post(approve_task))
        .route("/api/tasks/{id}/reject", post(reject_task))
        .route("/api/tasks/{id}/complete", post(complete_task))
        .route("/api/tasks/{id}/reprocess", post(reprocess_task))
        .route("/api/tasks/{id}/approvals", get(task_approvals))
        .route("/api/approvals", get(list_approvals))
        .route("/api/logs", get(list_logs))
        .route("/api/settings/autonomy", get(get_autonomy).put(set_autonomy))
        .route("/api/oauth/{channel}/state", post(issue_oauth_state))
        .route("/webhooks/whatsapp", post(whatsapp_webhook))
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn task_error(e: TaskError) -> Response {
    match &e {
        TaskError::NotFound { .. } => error_body(StatusCode::NOT_FOUND, e.to_string()),
        TaskError::InvalidTransition { .. } => error_body(StatusCode::CONFLICT, e.to_string()),
        TaskError::Database(_) => {
            error!(error = %e, "Task operation failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid task ID"))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<TaskStatus>,
    priority: Option<Priority>,
    source: Option<String>,
    #[serde(default)]
    offset: u32,
    limit: Option<u32>,
}

async fn list_tasks(State(state): State<WebState>, Query(q): Query<ListQuery>) -> Response {
    let filter = TaskFilter {
        status: q.status,
        priority: q.priority,
        source: q.source,
    };
    let page = Page::new(q.offset, q.limit.unwrap_or(Page::default().limit));
    match state.engine.list_tasks(&filter, page).await {
        Ok((tasks, total)) => Json(json!({ "tasks": tasks, "total": total })).into_response(),
        Err(e) => task_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    priority: Option<Priority>,
}

async fn create_task(State(state): State<WebState>, Json(req): Json<CreateRequest>) -> Response {
    if req.title.trim().is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "title must not be empty");
    }
    let mut new = NewTask::new(req.title, req.body);
    if let Some(priority) = req.priority {
        new = new.with_priority(priority);
    }
    match state.engine.create(new).await {
        Ok(task) => (StatusCode::CREATED, Json(json!(task))).into_response(),
        Err(e) => task_error(e),
    }
}

async fn get_task(State(state): State<WebState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.get_task(id).await {
        Ok(task) => Json(json!(task)).into_response(),
        Err(e) => task_error(e),
    }
}

async fn update_task(
    State(state): State<WebState>,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.update(id, patch).await {
        Ok(task) => Json(json!(task)).into_response(),
        Err(e) => task_error(e),
    }
}

async fn delete_task(State(state): State<WebState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.delete(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_body(StatusCode::NOT_FOUND, format!("Task {id} not found")),
        Err(e) => task_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct DecisionRequest {
    #[serde(default)]
    reason: String,
    #[serde(default = "default_decider")]
    decided_by: String,
}

fn default_decider() -> String {
    "api".to_string()
}

impl DecisionRequest {
    /// A missing body means "no reason given".
    fn or_default(body: Option<Json<Self>>) -> Self {
        body.map(|Json(req)| req).unwrap_or_else(|| Self {
            reason: String::new(),
            decided_by: default_decider(),
        })
    }
}

async fn approve_task(
    State(state): State<WebState>,
    Path(id): Path<String>,
    body: Option<Json<DecisionRequest>>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let req = DecisionRequest::or_default(body);
    match state.engine.approve(id, &req.reason, &req.decided_by).await {
        Ok(task) => Json(json!(task)).into_response(),
        Err(e) => task_error(e),
    }
}

async fn reject_task(
    State(state): State<WebState>,
    Path(id): Path<String>,
    body: Option<Json<DecisionRequest>>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let req = DecisionRequest::or_default(body);
    match state.engine.reject(id, &req.reason, &req.decided_by).await {
        Ok(task) => Json(json!(task)).into_response(),
        Err(e) => task_error(e),
    }
}

async fn complete_task(State(state): State<WebState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.complete(id).await {
        Ok(task) => Json(json!(task)).into_response(),
        Err(e) => task_error(e),
    }
}

async fn reprocess_task(State(state): State<WebState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.reprocess(id).await {
        Ok(task) => Json(json!(task)).into_response(),
        Err(e) => task_error(e),
    }
}

async fn task_approvals(State(state): State<WebState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.engine.list_approvals(Some(id)).await {
        Ok(approvals) => Json(json!(approvals)).into_response(),
        Err(e) => task_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ApprovalQuery {
    task_id: Option<Uuid>,
}

async fn list_approvals(
    State(state): State<WebState>,
    Query(q): Query<ApprovalQuery>,
) -> Response {
    match state.engine.list_approvals(q.task_id).await {
        Ok(approvals) => Json(json!(approvals)).into_response(),
        Err(e) => task_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    task_id: Option<Uuid>,
    action: Option<String>,
    #[serde(default)]
    offset: u32,
    limit: Option<u32>,
}

async fn list_logs(State(state): State<WebState>, Query(q): Query<LogQuery>) -> Response {
    let filter = LogFilter {
        task_id: q.task_id,
        action: q.action,
    };
    let page = Page::new(q.offset, q.limit.unwrap_or(Page::default().limit));
    match state.engine.list_logs(&filter, page).await {
        Ok(logs) => Json(json!(logs)).into_response(),
        Err(e) => task_error(e),
    }
}

// ── Settings ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AutonomyRequest {
    enabled: bool,
}

async fn get_autonomy(State(state): State<WebState>) -> impl IntoResponse {
    Json(json!({ "enabled": state.engine.autonomy_override() }))
}

async fn set_autonomy(
    State(state): State<WebState>,
    Json(req): Json<AutonomyRequest>,
) -> Response {
    match state.engine.set_autonomy_override(req.enabled).await {
        Ok(()) => Json(json!({ "enabled": req.enabled })).into_response(),
        Err(e) => task_error(e),
    }
}

// ── OAuth ───────────────────────────────────────────────────────────

async fn issue_oauth_state(State(state): State<WebState>, Path(channel): Path<String>) -> Response {
    let Ok(channel) = channel.parse::<ChannelKind>() else {
        return error_body(StatusCode::NOT_FOUND, format!("Unknown channel {channel}"));
    };
    match state.oauth.issue(channel).await {
        Ok(issued) => Json(json!({
            "state": issued.state,
            "channel": issued.channel,
            "expires_at": issued.expires_at,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to issue OAuth state");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// ── Webhooks ────────────────────────────────────────────────────────

const EMPTY_TWIML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>";

const TWILIO_SIGNATURE: &str = "x-twilio-signature";

async fn whatsapp_webhook(
    State(state): State<WebState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let Some(adapter) = state.whatsapp.as_ref() else {
        return error_body(StatusCode::NOT_FOUND, "WhatsApp channel is not configured");
    };
    if let Some(signature) = &state.whatsapp_signature {
        let received = headers
            .get(TWILIO_SIGNATURE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !signature.verify(&form, received) {
            warn!("Rejected WhatsApp webhook with a bad signature");
            return error_body(StatusCode::FORBIDDEN, "invalid signature");
        }
    }
    let message = match message_from_webhook(&form, state.engine.now()) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Rejected WhatsApp webhook payload");
            return error_body(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    match state.ingestor.ingest_push(adapter.as_ref(), message).await {
        Ok(IngestOutcome::Created { task, .. }) => {
            info!(task_id = %task.id, "Task created from WhatsApp webhook");
        }
        Ok(IngestOutcome::Duplicate) => {}
        Err(e) => {
            error!(error = %e, "WhatsApp webhook ingestion failed");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "ingestion failed");
        }
    }
    ([(header::CONTENT_TYPE, "text/xml")], EMPTY_TWIML).into_response()
}
