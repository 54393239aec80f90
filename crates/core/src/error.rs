use crate::types::{ActionId, ActionKind, ExecutionId, TriggerId, WorkflowId};

/// Result alias used across the engine API
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the workflow engine.
///
/// Only configuration problems (`InvalidWorkflow`, unknown IDs, busy workflows)
/// are returned from API calls. Action-level errors are recorded on the
/// execution instead of being propagated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Template rejected at registration time.
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// The action dependency graph contains a cycle.
    #[error("Cyclic dependency between actions: {}", join_ids(.0))]
    CyclicDependency(Vec<ActionId>),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Workflow {workflow_id} has no trigger {trigger_id}")]
    TriggerNotFound {
        workflow_id: WorkflowId,
        trigger_id: TriggerId,
    },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// No handler registered for the action kind.
    #[error("No handler registered for action type '{0}'")]
    UnknownActionType(ActionKind),

    #[error("Action {action_id} timed out after {timeout_ms}ms")]
    ActionTimeout { action_id: ActionId, timeout_ms: u64 },

    #[error("Action {action_id} failed: {message}")]
    ActionFailed { action_id: ActionId, message: String },

    #[error("Execution {0} was cancelled")]
    ExecutionCancelled(ExecutionId),

    /// Single-flight mode refused a second concurrent run.
    #[error("Workflow {0} already has a run in flight")]
    WorkflowBusy(WorkflowId),

    #[error("Execution {0} is still running")]
    ExecutionStillRunning(ExecutionId),
}

fn join_ids(ids: &[ActionId]) -> String {
    ids.iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
