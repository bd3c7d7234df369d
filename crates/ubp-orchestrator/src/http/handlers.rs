// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ubp-project.org

//! HTTP request handlers for the admin API.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use ubp_persistence::{BotDefinitionRecord, TaskRecord, TaskState};
use ubp_protocol::CommandStatus;

use crate::credentials::BotSpec;
use crate::server::{DispatchError, Orchestrator};
use crate::tasks::CancelOutcome;

/// API error carried to the client as `{error_code, message}`.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    InvalidArgument(String),
    NotFound(String),
    Conflict(String),
    NoCapableInstance,
    InstanceGone,
    Timeout,
    ExecutionError(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NoCapableInstance | Self::InstanceGone => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ExecutionError(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "AuthError",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::NoCapableInstance => "NoCapableInstance",
            Self::InstanceGone => "InstanceGone",
            Self::Timeout => "Timeout",
            Self::ExecutionError(_) => "ExecutionError",
            Self::Internal(_) => "Internal",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Unauthorized => "invalid admin credential".into(),
            Self::InvalidArgument(m) | Self::NotFound(m) | Self::Conflict(m) => m.clone(),
            Self::NoCapableInstance => "no capable instance".into(),
            Self::InstanceGone => "instance gone".into(),
            Self::Timeout => "deadline exceeded".into(),
            Self::ExecutionError(m) => m.clone(),
            Self::Internal(m) => m.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error_code": self.error_code(),
            "message": self.message(),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::NoCapableInstance => Self::NoCapableInstance,
            DispatchError::InstanceGone => Self::InstanceGone,
            DispatchError::Timeout => Self::Timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Request/response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BotRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub adapter_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub configuration: Option<Value>,
}

impl BotRequest {
    fn into_spec(self) -> Result<BotSpec, ApiError> {
        if self.name.is_empty() {
            return Err(ApiError::InvalidArgument("name must not be empty".into()));
        }
        if self.adapter_type.is_empty() {
            return Err(ApiError::InvalidArgument(
                "adapter_type must not be empty".into(),
            ));
        }
        Ok(BotSpec {
            name: self.name,
            description: self.description,
            adapter_type: self.adapter_type,
            capabilities: self.capabilities,
            configuration: self.configuration.unwrap_or_else(|| Value::Object(Default::default())),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RegistrationResponse {
    pub bot_id: String,
    pub one_time_registration_token: String,
    pub created_at_ms: u64,
}

/// Definition view; never carries credentials.
#[derive(Debug, Serialize)]
pub struct BotView {
    pub bot_id: String,
    pub name: String,
    pub description: Option<String>,
    pub adapter_type: String,
    pub capabilities: Vec<String>,
    pub configuration: Value,
    pub created_at_ms: u64,
}

impl From<BotDefinitionRecord> for BotView {
    fn from(def: BotDefinitionRecord) -> Self {
        Self {
            bot_id: def.bot_id,
            name: def.name,
            description: def.description,
            adapter_type: def.adapter_type,
            capabilities: def.declared_capabilities,
            configuration: def.configuration,
            created_at_ms: def.created_at_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InstanceView {
    pub instance_id: String,
    pub connected_at_ms: u64,
    pub runtime_capabilities: Vec<String>,
    pub last_heartbeat_at_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct TaskView {
    pub task_id: String,
    pub bot_id: String,
    pub command_name: String,
    pub state: TaskState,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
}

impl From<TaskRecord> for TaskView {
    fn from(task: TaskRecord) -> Self {
        Self {
            task_id: task.task_id,
            bot_id: task.bot_id,
            command_name: task.command_name,
            state: task.state,
            progress: task.progress,
            result: task.result.as_deref().map(blob_to_json),
            error: task.error,
            submitted_at_ms: task.submitted_at_ms,
            started_at_ms: task.started_at_ms,
            completed_at_ms: task.completed_at_ms,
        }
    }
}

/// Command results are JSON by convention; anything else is surfaced as a
/// lossy string rather than dropped.
fn blob_to_json(blob: &[u8]) -> Value {
    serde_json::from_slice(blob)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(blob).into_owned()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRequest {
    pub ttl_seconds: u64,
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// Bot lifecycle
// ---------------------------------------------------------------------------

/// POST /v1/bots
pub async fn create_bot(
    State(orch): State<Orchestrator>,
    Json(body): Json<BotRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = orch.credentials().create_definition(body.into_spec()?)?;
    Ok((
        StatusCode::CREATED,
        Json(RegistrationResponse {
            bot_id: created.definition.bot_id,
            one_time_registration_token: created.one_time_token,
            created_at_ms: created.definition.created_at_ms,
        }),
    ))
}

/// GET /v1/bots
pub async fn list_bots(
    State(orch): State<Orchestrator>,
) -> Result<Json<Vec<BotView>>, ApiError> {
    let bots = orch.credentials().list_definitions()?;
    Ok(Json(bots.into_iter().map(BotView::from).collect()))
}

/// GET /v1/bots/{bot_id}
pub async fn get_bot(
    State(orch): State<Orchestrator>,
    Path(bot_id): Path<String>,
) -> Result<Json<BotView>, ApiError> {
    let def = orch
        .credentials()
        .get_definition(&bot_id)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown bot: {}", bot_id)))?;
    Ok(Json(def.into()))
}

/// PUT /v1/bots/{bot_id}
pub async fn update_bot(
    State(orch): State<Orchestrator>,
    Path(bot_id): Path<String>,
    Json(body): Json<BotRequest>,
) -> Result<Json<BotView>, ApiError> {
    let updated = orch
        .credentials()
        .update_definition(&bot_id, body.into_spec()?)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown bot: {}", bot_id)))?;
    Ok(Json(updated.into()))
}

/// DELETE /v1/bots/{bot_id}
pub async fn delete_bot(
    State(orch): State<Orchestrator>,
    Path(bot_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if orch.delete_bot(&bot_id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("unknown bot: {}", bot_id)))
    }
}

/// GET /v1/bots/{bot_id}/instances
pub async fn list_instances(
    State(orch): State<Orchestrator>,
    Path(bot_id): Path<String>,
) -> Result<Json<Vec<InstanceView>>, ApiError> {
    if orch.credentials().get_definition(&bot_id)?.is_none() {
        return Err(ApiError::NotFound(format!("unknown bot: {}", bot_id)));
    }
    let grace = orch.config().heartbeat_grace_factor;
    let instances = orch
        .registry()
        .list_by_bot(&bot_id, grace)
        .into_iter()
        .map(|h| {
            let mut caps: Vec<String> = h.capabilities.iter().cloned().collect();
            caps.sort();
            InstanceView {
                instance_id: h.instance_id.clone(),
                connected_at_ms: h.connected_at_ms,
                runtime_capabilities: caps,
                last_heartbeat_at_ms: crate::telemetry::now_ms()
                    .saturating_sub(h.last_heartbeat_age().as_millis() as u64),
            }
        })
        .collect();
    Ok(Json(instances))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// POST /v1/bots/{bot_id}/actions/{command_name}
pub async fn submit_action(
    State(orch): State<Orchestrator>,
    Path((bot_id, command_name)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Result<impl IntoResponse, ApiError> {
    if orch.credentials().get_definition(&bot_id)?.is_none() {
        return Err(ApiError::NotFound(format!("unknown bot: {}", bot_id)));
    }
    let arguments = match body {
        Some(Json(value)) => serde_json::to_vec(&value)
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?,
        None => b"{}".to_vec(),
    };

    let task = orch.tasks().submit(bot_id, command_name, arguments)?;
    let location = format!("/v1/tasks/{}", task.task_id);
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, location)],
        Json(serde_json::json!({
            "task_id": task.task_id,
            "state": task.state,
        })),
    ))
}

/// POST /v1/bots/{bot_id}/commands/{command_name}
///
/// Synchronous dispatch: suspends until the instance answers or the
/// default deadline elapses.
pub async fn dispatch_command(
    State(orch): State<Orchestrator>,
    Path((bot_id, command_name)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    if orch.credentials().get_definition(&bot_id)?.is_none() {
        return Err(ApiError::NotFound(format!("unknown bot: {}", bot_id)));
    }
    let arguments = match body {
        Some(Json(value)) => serde_json::to_vec(&value)
            .map_err(|e| ApiError::InvalidArgument(e.to_string()))?,
        None => b"{}".to_vec(),
    };

    let resp = orch
        .dispatcher()
        .dispatch(
            &bot_id,
            &command_name,
            arguments,
            orch.config().default_deadline(),
            Uuid::new_v4(),
        )
        .await?;

    match resp.status {
        CommandStatus::Success => Ok(Json(serde_json::json!({
            "status": "SUCCESS",
            "result": blob_to_json(&resp.result),
        }))),
        CommandStatus::ExecutionError => Err(ApiError::ExecutionError(
            resp.error_message.unwrap_or_else(|| "execution error".into()),
        )),
        CommandStatus::InvalidArguments => Err(ApiError::InvalidArgument(
            resp.error_message.unwrap_or_else(|| "invalid arguments".into()),
        )),
    }
}

/// GET /v1/tasks?state=PENDING
pub async fn list_tasks(
    State(orch): State<Orchestrator>,
    axum::extract::Query(query): axum::extract::Query<TaskListQuery>,
) -> Result<Json<Vec<TaskView>>, ApiError> {
    let filter = match query.state.as_deref() {
        None => None,
        Some(raw) => Some(TaskState::parse(raw).ok_or_else(|| {
            ApiError::InvalidArgument(format!("unknown task state: {}", raw))
        })?),
    };
    let tasks = orch.tasks().list(filter)?;
    Ok(Json(tasks.into_iter().map(TaskView::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    #[serde(default)]
    pub state: Option<String>,
}

/// GET /v1/tasks/{task_id}
pub async fn get_task(
    State(orch): State<Orchestrator>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let task = orch
        .tasks()
        .get(&task_id)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown task: {}", task_id)))?;

    let terminal = task.state.is_terminal();
    let body = Json(TaskView::from(task));
    if terminal {
        Ok(body.into_response())
    } else {
        Ok(([(header::RETRY_AFTER, "1")], body).into_response())
    }
}

/// DELETE /v1/tasks/{task_id} - cancel
pub async fn cancel_task(
    State(orch): State<Orchestrator>,
    Path(task_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match orch.tasks().cancel(&task_id)? {
        CancelOutcome::Cancelled => Ok(StatusCode::NO_CONTENT),
        CancelOutcome::AlreadyTerminal => Err(ApiError::Conflict(format!(
            "task already terminal: {}",
            task_id
        ))),
        CancelOutcome::NotFound => {
            Err(ApiError::NotFound(format!("unknown task: {}", task_id)))
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// POST /v1/context/{session_id}/{namespace}
pub async fn put_context(
    State(orch): State<Orchestrator>,
    Path((session_id, namespace)): Path<(String, String)>,
    Json(body): Json<ContextRequest>,
) -> Result<StatusCode, ApiError> {
    if body.ttl_seconds == 0 {
        return Err(ApiError::InvalidArgument(
            "ttlSeconds must be greater than 0".into(),
        ));
    }
    orch.context().upsert(
        &session_id,
        &namespace,
        body.payload,
        Duration::from_secs(body.ttl_seconds),
    );
    Ok(StatusCode::CREATED)
}

/// GET /v1/context/{session_id}/{namespace}
pub async fn get_context(
    State(orch): State<Orchestrator>,
    Path((session_id, namespace)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    orch.context()
        .get(&session_id, &namespace)
        .map(Json)
        .ok_or_else(|| {
            ApiError::NotFound(format!("no context for {}/{}", session_id, namespace))
        })
}

/// DELETE /v1/context/{session_id}/{namespace}
pub async fn delete_context(
    State(orch): State<Orchestrator>,
    Path((session_id, namespace)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if orch.context().delete(&session_id, &namespace) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!(
            "no context for {}/{}",
            session_id, namespace
        )))
    }
}

// ---------------------------------------------------------------------------
// Health & metrics
// ---------------------------------------------------------------------------

/// GET /v1/health
pub async fn health(State(orch): State<Orchestrator>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "active_instances": orch.metrics().active_instances(),
    }))
}

/// GET /v1/metrics
pub async fn metrics(State(orch): State<Orchestrator>) -> Json<crate::telemetry::MetricsSnapshot> {
    Json(orch.metrics().snapshot())
}
