use super::{ApiError, ApiResult};
use crate::config::AppState;
use adpilot_core::{
    EngineError, Execution, ExecutionId, ExecutionSummary, TriggerId, WorkflowId,
    WorkflowTemplate,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

fn parse_execution_id(raw: &str) -> ApiResult<ExecutionId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid execution ID: {}", raw)))
}

// --- Workflows ---

/// List all registered workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListWorkflowsResponse>> {
    let workflows = state.engine.list_workflows().await;
    Ok(Json(ListWorkflowsResponse { workflows }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<WorkflowTemplate>,
}

/// Register a new workflow
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(template): Json<WorkflowTemplate>,
) -> ApiResult<(StatusCode, Json<WorkflowResponse>)> {
    let workflow_id = state.engine.register_workflow(template).await?;
    Ok((StatusCode::CREATED, Json(WorkflowResponse { workflow_id })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowResponse {
    pub workflow_id: WorkflowId,
}

/// Get a workflow definition
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowTemplate>> {
    let workflow_id = WorkflowId::new(workflow_id);
    let template = state
        .engine
        .get_workflow(&workflow_id)
        .await
        .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
    Ok(Json(template))
}

/// Replace a workflow definition
pub async fn update_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(template): Json<WorkflowTemplate>,
) -> ApiResult<Json<WorkflowResponse>> {
    if template.id.0 != workflow_id {
        return Err(ApiError::bad_request(format!(
            "Workflow ID in body ({}) does not match path ({})",
            template.id, workflow_id
        )));
    }

    let workflow_id = template.id.clone();
    state.engine.update_workflow(template).await?;
    Ok(Json(WorkflowResponse { workflow_id }))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteWorkflowQuery {
    #[serde(default)]
    pub cancel_inflight: bool,
}

/// Remove a workflow, optionally cancelling its unfinished runs
pub async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Query(query): Query<DeleteWorkflowQuery>,
) -> ApiResult<Json<DeleteWorkflowResponse>> {
    let workflow_id = WorkflowId::new(workflow_id);
    let cancelled = state
        .engine
        .remove_workflow(&workflow_id, query.cancel_inflight)
        .await?;
    Ok(Json(DeleteWorkflowResponse {
        workflow_id,
        cancelled,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteWorkflowResponse {
    pub workflow_id: WorkflowId,
    pub cancelled: Vec<ExecutionId>,
}

#[derive(Debug, Deserialize)]
pub struct SetTriggerRequest {
    pub enabled: bool,
}

/// Enable or disable one trigger
pub async fn set_trigger_enabled(
    State(state): State<Arc<AppState>>,
    Path((workflow_id, trigger_id)): Path<(String, String)>,
    Json(req): Json<SetTriggerRequest>,
) -> ApiResult<Json<SetTriggerResponse>> {
    let workflow_id = WorkflowId::new(workflow_id);
    let trigger_id = TriggerId::new(trigger_id);
    state
        .engine
        .set_trigger_enabled(&workflow_id, &trigger_id, req.enabled)
        .await?;

    Ok(Json(SetTriggerResponse {
        workflow_id,
        trigger_id,
        enabled: req.enabled,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetTriggerResponse {
    pub workflow_id: WorkflowId,
    pub trigger_id: TriggerId,
    pub enabled: bool,
}

// --- Executions ---

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteWorkflowRequest {
    #[serde(default)]
    pub trigger_data: Value,
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Block until the run finishes
    #[serde(default)]
    pub wait: bool,
}

/// Start a manual run
pub async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(req): Json<ExecuteWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<ExecuteWorkflowResponse>)> {
    let workflow_id = WorkflowId::new(workflow_id);
    let execution_id = state
        .engine
        .start_workflow(&workflow_id, req.trigger_data, req.variables)
        .await?;

    if !req.wait {
        return Ok((
            StatusCode::ACCEPTED,
            Json(ExecuteWorkflowResponse {
                execution_id,
                summary: None,
            }),
        ));
    }

    let execution = state.engine.wait_for_execution(&execution_id).await?;
    Ok((
        StatusCode::OK,
        Json(ExecuteWorkflowResponse {
            execution_id,
            summary: Some(execution.summary()),
        }),
    ))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteWorkflowResponse {
    pub execution_id: ExecutionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ExecutionSummary>,
}

/// List executions of one workflow
pub async fn list_workflow_executions(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<ListExecutionsResponse>> {
    let workflow_id = WorkflowId::new(workflow_id);
    let executions = state.engine.list_executions(Some(&workflow_id)).await;
    Ok(Json(ListExecutionsResponse { executions }))
}

/// List all tracked executions
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ListExecutionsResponse>> {
    let executions = state.engine.list_executions(None).await;
    Ok(Json(ListExecutionsResponse { executions }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<Execution>,
}

/// Get the full record of an execution
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<Execution>> {
    let execution_id = parse_execution_id(&execution_id)?;
    let execution = state
        .engine
        .get_execution(&execution_id)
        .await
        .ok_or(EngineError::ExecutionNotFound(execution_id))?;
    Ok(Json(execution))
}

/// Get the per-action summary of an execution
pub async fn get_execution_status(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionSummary>> {
    let execution_id = parse_execution_id(&execution_id)?;
    let summary = state.engine.get_execution_status(&execution_id).await?;
    Ok(Json(summary))
}

/// Request cancellation of a run
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<CancelExecutionResponse>> {
    let execution_id = parse_execution_id(&execution_id)?;
    let cancelled = state.engine.cancel_execution(&execution_id).await?;
    Ok(Json(CancelExecutionResponse {
        execution_id,
        cancelled,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelExecutionResponse {
    pub execution_id: ExecutionId,
    pub cancelled: bool,
}

/// Drop a finished execution from memory
pub async fn evict_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<ExecutionSummary>> {
    let execution_id = parse_execution_id(&execution_id)?;
    let execution = state.engine.evict_execution(&execution_id).await?;
    Ok(Json(execution.summary()))
}

// --- Events ---

/// Publish an event on the engine's bus. The body is optional; an event
/// sent without one carries a null payload.
pub async fn emit_event(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    payload: Option<Json<Value>>,
) -> ApiResult<Json<EmitEventResponse>> {
    let payload = payload.map(|Json(value)| value).unwrap_or(Value::Null);
    let subscribers = state.engine.emit_event(&name, payload).await;
    Ok(Json(EmitEventResponse { name, subscribers }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EmitEventResponse {
    pub name: String,
    pub subscribers: usize,
}
