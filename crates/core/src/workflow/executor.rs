use super::action_executor::{ActionExecutor, ActionOutcome};
use super::dag::ActionGraph;
use crate::events::{self, EventBus};
use crate::handlers::ActionContext;
use crate::tracker::{self, ExecutionTracker};
use crate::types::{
    Action, ActionId, ActionStatus, BranchOutcome, BranchRecord, ExecutionId, ExecutionStatus,
    WorkflowTemplate,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Everything needed to drive one execution
pub struct RunRequest {
    pub execution_id: ExecutionId,
    pub template: Arc<WorkflowTemplate>,
    pub graph: Arc<ActionGraph>,
    pub variables: Map<String, Value>,
    pub trigger_data: Value,
    pub cancel: CancellationToken,
}

enum TaskResult {
    Finished(ActionOutcome),
    /// Cancelled while waiting for a concurrency slot
    NotStarted(ActionId),
}

/// Drives a run through the action graph, running every ready action
/// concurrently up to the configured limit
pub struct WorkflowExecutor {
    action_executor: Arc<ActionExecutor>,
    tracker: Arc<ExecutionTracker>,
    event_bus: Arc<EventBus>,
    max_concurrent_actions: usize,
    publish_completion_events: bool,
}

impl WorkflowExecutor {
    pub fn new(
        action_executor: Arc<ActionExecutor>,
        tracker: Arc<ExecutionTracker>,
        event_bus: Arc<EventBus>,
        max_concurrent_actions: usize,
        publish_completion_events: bool,
    ) -> Self {
        Self {
            action_executor,
            tracker,
            event_bus,
            max_concurrent_actions: max_concurrent_actions.max(1),
            publish_completion_events,
        }
    }

    /// Execute the run to a terminal state and return that state
    pub async fn execute(&self, request: RunRequest) -> ExecutionStatus {
        let RunRequest {
            execution_id,
            template,
            graph,
            variables,
            trigger_data,
            cancel,
        } = request;
        let workflow_id = template.id.clone();

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %workflow_id,
            "Starting workflow execution"
        );
        self.update(&execution_id, |e| tracker::set_status(e, ExecutionStatus::Running))
            .await;

        let actions: HashMap<ActionId, Arc<Action>> = template
            .actions
            .iter()
            .map(|a| (a.id.clone(), Arc::new(a.clone())))
            .collect();
        let mut states: HashMap<ActionId, ActionStatus> = graph
            .topological_order()
            .iter()
            .map(|id| (id.clone(), ActionStatus::Pending))
            .collect();
        let mut results: HashMap<ActionId, Value> = HashMap::new();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_actions));
        let mut join_set: JoinSet<TaskResult> = JoinSet::new();
        let mut interrupted = false;

        loop {
            let has_pending = states.values().any(|s| *s == ActionStatus::Pending);

            if cancel.is_cancelled() {
                interrupted |= has_pending;
            } else {
                let (ready, skipped) = plan(&graph, &mut states);

                for (id, reason) in skipped {
                    tracing::info!(
                        execution_id = %execution_id,
                        action_id = %id,
                        "Skipping action: {}",
                        reason
                    );
                    self.mark_skipped(&execution_id, &id, reason).await;
                }

                for id in ready {
                    let Some(action) = actions.get(&id).cloned() else {
                        continue;
                    };
                    let ctx = ActionContext {
                        execution_id,
                        workflow_id: workflow_id.clone(),
                        action_id: id.clone(),
                        attempt: 0,
                        trigger_data: trigger_data.clone(),
                        results: results.clone(),
                        cancellation: cancel.clone(),
                    };
                    let action_vars = action_variables(&variables, &ctx);
                    let executor = self.action_executor.clone();
                    let semaphore = semaphore.clone();
                    let cancel = cancel.clone();

                    join_set.spawn(async move {
                        let permit = tokio::select! {
                            _ = cancel.cancelled() => None,
                            permit = semaphore.acquire_owned() => permit.ok(),
                        };
                        let Some(_permit) = permit else {
                            return TaskResult::NotStarted(action.id.clone());
                        };
                        TaskResult::Finished(executor.run(&action, &action_vars, ctx).await)
                    });
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            match joined {
                Ok(TaskResult::Finished(outcome)) => {
                    interrupted |= outcome.was_cancelled();
                    states.insert(outcome.action_id.clone(), outcome.status);
                    if let Some(result) = &outcome.result {
                        results.insert(outcome.action_id.clone(), result.clone());
                    }
                    let action = actions.get(&outcome.action_id).cloned();
                    self.record_outcome(&execution_id, action.as_deref(), outcome).await;
                }
                Ok(TaskResult::NotStarted(id)) => {
                    interrupted = true;
                    states.insert(id.clone(), ActionStatus::Skipped);
                    self.mark_skipped(&execution_id, &id, "execution cancelled".to_string())
                        .await;
                }
                Err(join_err) => {
                    tracing::error!(execution_id = %execution_id, "Action task aborted: {}", join_err);
                }
            }
        }

        // Whatever never got to run was cut off by cancellation
        let leftovers: Vec<(ActionId, ActionStatus)> = states
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, s)| (id.clone(), *s))
            .collect();
        for (id, status) in leftovers {
            if status == ActionStatus::Running {
                states.insert(id.clone(), ActionStatus::Failed);
                self.update(&execution_id, |e| {
                    let state = e.action_states.entry(id.clone()).or_default();
                    state.status = ActionStatus::Failed;
                    state.completed_at = Some(Utc::now());
                })
                .await;
            } else {
                interrupted = true;
                states.insert(id.clone(), ActionStatus::Skipped);
                self.mark_skipped(&execution_id, &id, "execution cancelled".to_string())
                    .await;
            }
        }

        let failed = states.values().filter(|s| **s == ActionStatus::Failed).count();
        let settle = |interrupted: bool| {
            if interrupted {
                ExecutionStatus::Cancelled
            } else if failed > 0 {
                ExecutionStatus::Failed
            } else {
                ExecutionStatus::Completed
            }
        };

        // The tracker cancels under the same lock, so a cancel accepted while
        // the last actions were in flight is always seen here
        let status = match self
            .tracker
            .update(&execution_id, |e| {
                let status = settle(interrupted || cancel.is_cancelled());
                tracker::set_status(e, status);
                status
            })
            .await
        {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(execution_id = %execution_id, "Failed to update execution: {}", e);
                settle(interrupted || cancel.is_cancelled())
            }
        };

        match status {
            ExecutionStatus::Completed => tracing::info!(
                execution_id = %execution_id,
                workflow_id = %workflow_id,
                "Workflow execution completed"
            ),
            ExecutionStatus::Cancelled => tracing::warn!(
                execution_id = %execution_id,
                workflow_id = %workflow_id,
                "Workflow execution cancelled"
            ),
            _ => tracing::error!(
                execution_id = %execution_id,
                workflow_id = %workflow_id,
                failed_actions = failed,
                "Workflow execution failed"
            ),
        }

        if self.publish_completion_events {
            let name = match status {
                ExecutionStatus::Completed => events::WORKFLOW_COMPLETED,
                ExecutionStatus::Cancelled => events::WORKFLOW_CANCELLED,
                _ => events::WORKFLOW_FAILED,
            };
            self.event_bus
                .publish(
                    name,
                    json!({
                        "workflow_id": workflow_id,
                        "execution_id": execution_id,
                        "status": status,
                        "failed_actions": failed,
                    }),
                )
                .await;
        }

        status
    }

    async fn update<F>(&self, execution_id: &ExecutionId, mutator: F)
    where
        F: FnOnce(&mut crate::types::Execution),
    {
        if let Err(e) = self.tracker.update(execution_id, mutator).await {
            tracing::warn!(execution_id = %execution_id, "Failed to update execution: {}", e);
        }
    }

    async fn mark_skipped(&self, execution_id: &ExecutionId, action_id: &ActionId, reason: String) {
        self.update(execution_id, |e| {
            let state = e.action_states.entry(action_id.clone()).or_default();
            state.status = ActionStatus::Skipped;
            state.skip_reason = Some(reason);
            state.completed_at = Some(Utc::now());
        })
        .await;
    }

    async fn record_outcome(&self, execution_id: &ExecutionId, action: Option<&Action>, outcome: ActionOutcome) {
        let branch = action.and_then(|a| match outcome.status {
            ActionStatus::Completed => a.on_success.clone().map(|to| (to, BranchOutcome::Success)),
            ActionStatus::Failed => a.on_failure.clone().map(|to| (to, BranchOutcome::Failure)),
            _ => None,
        });

        self.update(execution_id, |e| {
            let state = e.action_states.entry(outcome.action_id.clone()).or_default();
            state.status = outcome.status;
            state.attempts = outcome.attempts;
            state.completed_at = Some(Utc::now());

            if let Some(result) = outcome.result {
                e.results.insert(outcome.action_id.clone(), result);
            }

            if let Some((to, outcome_kind)) = branch {
                e.branches.push(BranchRecord {
                    from: outcome.action_id.clone(),
                    to,
                    outcome: outcome_kind,
                    at: Utc::now(),
                });
            }
        })
        .await;
    }
}

/// Settle every pending action whose prerequisites are terminal.
///
/// Returns the actions to start now (marked running) and the actions that
/// will never run, with the reason. Skips cascade within a single call.
fn plan(
    graph: &ActionGraph,
    states: &mut HashMap<ActionId, ActionStatus>,
) -> (Vec<ActionId>, Vec<(ActionId, String)>) {
    let mut ready = Vec::new();
    let mut skipped = Vec::new();

    loop {
        let mut changed = false;

        for id in graph.topological_order() {
            if states.get(id) != Some(&ActionStatus::Pending) {
                continue;
            }

            let dependencies = graph.dependencies(id);
            let fallback_sources = graph.fallback_sources(id);
            let status_of = |dep: &ActionId| states.get(dep).copied().unwrap_or(ActionStatus::Skipped);

            if dependencies
                .iter()
                .chain(fallback_sources.iter())
                .any(|dep| !status_of(dep).is_terminal())
            {
                continue;
            }

            let blocked_by = dependencies
                .iter()
                .find(|dep| status_of(*dep) != ActionStatus::Completed)
                .map(|dep| (dep.clone(), status_of(dep)));

            let verdict = match blocked_by {
                Some((dep, ActionStatus::Failed)) => Some(format!("dependency {} failed", dep)),
                Some((dep, _)) => Some(format!("dependency {} was skipped", dep)),
                None if !fallback_sources.is_empty()
                    && !fallback_sources
                        .iter()
                        .any(|s| status_of(s) == ActionStatus::Failed) =>
                {
                    Some("fallback not needed".to_string())
                }
                None => None,
            };

            match verdict {
                Some(reason) => {
                    states.insert(id.clone(), ActionStatus::Skipped);
                    skipped.push((id.clone(), reason));
                    changed = true;
                }
                None => {
                    states.insert(id.clone(), ActionStatus::Running);
                    ready.push(id.clone());
                }
            }
        }

        if !changed {
            break;
        }
    }

    (ready, skipped)
}

/// Variables visible to one action: the run variables plus `trigger`,
/// `results`, `workflow_id` and `execution_id` unless the run defines them
fn action_variables(variables: &Map<String, Value>, ctx: &ActionContext) -> Map<String, Value> {
    let mut vars = variables.clone();
    vars.entry("trigger")
        .or_insert_with(|| ctx.trigger_data.clone());
    vars.entry("workflow_id")
        .or_insert_with(|| json!(ctx.workflow_id));
    vars.entry("execution_id")
        .or_insert_with(|| json!(ctx.execution_id));
    vars.entry("results").or_insert_with(|| {
        Value::Object(
            ctx.results
                .iter()
                .map(|(id, v)| (id.0.clone(), v.clone()))
                .collect(),
        )
    });
    vars
}
