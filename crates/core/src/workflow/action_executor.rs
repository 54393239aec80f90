use crate::error::EngineError;
use crate::handlers::{ActionContext, HandlerRegistry};
use crate::tracker::ExecutionTracker;
use crate::types::{Action, ActionErrorRecord, ActionId, ActionStatus, ExecutionId};
use crate::variables;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Final result of running one action (all attempts included)
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub action_id: ActionId,
    pub status: ActionStatus,
    pub result: Option<Value>,
    pub attempts: u32,
    /// Last error, or `ExecutionCancelled` when the run was cancelled
    /// before the action could succeed
    pub error: Option<EngineError>,
}

impl ActionOutcome {
    fn completed(action_id: ActionId, result: Value, attempts: u32) -> Self {
        Self {
            action_id,
            status: ActionStatus::Completed,
            result: Some(result),
            attempts,
            error: None,
        }
    }

    fn failed(action_id: ActionId, error: EngineError, attempts: u32) -> Self {
        Self {
            action_id,
            status: ActionStatus::Failed,
            result: None,
            attempts,
            error: Some(error),
        }
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(self.error, Some(EngineError::ExecutionCancelled(_)))
    }
}

/// Runs a single action with timeout and retry, recording every attempt on
/// the execution
pub struct ActionExecutor {
    handlers: Arc<HandlerRegistry>,
    tracker: Arc<ExecutionTracker>,
    default_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(handlers: Arc<HandlerRegistry>, tracker: Arc<ExecutionTracker>, default_timeout: Duration) -> Self {
        Self {
            handlers,
            tracker,
            default_timeout,
        }
    }

    /// Execute an action until it succeeds or its retries are exhausted.
    ///
    /// `ctx` carries the run context; its `attempt` is overwritten per try.
    pub async fn run(&self, action: &Action, variables: &Map<String, Value>, mut ctx: ActionContext) -> ActionOutcome {
        let execution_id = ctx.execution_id;

        let Some(handler) = self.handlers.get(&action.kind) else {
            let error = EngineError::UnknownActionType(action.kind.clone());
            tracing::error!(
                execution_id = %execution_id,
                action_id = %action.id,
                "{}",
                error
            );
            self.record_attempt_failure(&execution_id, &action.id, 1, &error).await;
            return ActionOutcome::failed(action.id.clone(), error, 1);
        };

        let parameters = variables::substitute_params(&action.parameters, variables);
        let deadline = action
            .timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let max_attempts = action.retry.max_attempts();

        let mut attempt = 1;
        loop {
            self.mark_started(&execution_id, &action.id, attempt).await;
            ctx.attempt = attempt;

            tracing::info!(
                execution_id = %execution_id,
                action_id = %action.id,
                kind = %action.kind,
                attempt,
                "Executing action"
            );

            // Run the handler on its own task so a panic stays contained and
            // a timed-out attempt can be aborted.
            let call = {
                let handler = handler.clone();
                let parameters = parameters.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move { handler.handle(parameters, &ctx).await })
            };
            let abort = call.abort_handle();

            let result = match timeout(deadline, call).await {
                Ok(Ok(Ok(output))) => Ok(Value::Object(output)),
                Ok(Ok(Err(e))) => Err(EngineError::ActionFailed {
                    action_id: action.id.clone(),
                    message: format!("{:#}", e),
                }),
                Ok(Err(join_err)) => Err(EngineError::ActionFailed {
                    action_id: action.id.clone(),
                    message: format!("handler panicked: {}", join_err),
                }),
                Err(_) => {
                    abort.abort();
                    Err(EngineError::ActionTimeout {
                        action_id: action.id.clone(),
                        timeout_ms: deadline.as_millis() as u64,
                    })
                }
            };

            let error = match result {
                Ok(output) => {
                    tracing::info!(
                        execution_id = %execution_id,
                        action_id = %action.id,
                        attempt,
                        "Action completed"
                    );
                    return ActionOutcome::completed(action.id.clone(), output, attempt);
                }
                Err(error) => error,
            };

            self.record_attempt_failure(&execution_id, &action.id, attempt, &error).await;

            if ctx.cancellation.is_cancelled() {
                tracing::info!(
                    execution_id = %execution_id,
                    action_id = %action.id,
                    "Run cancelled, not retrying action"
                );
                return ActionOutcome::failed(
                    action.id.clone(),
                    EngineError::ExecutionCancelled(execution_id),
                    attempt,
                );
            }

            if attempt >= max_attempts {
                tracing::error!(
                    execution_id = %execution_id,
                    action_id = %action.id,
                    attempts = attempt,
                    "Action failed after exhausting retries: {}",
                    error
                );
                return ActionOutcome::failed(action.id.clone(), error, attempt);
            }

            let delay = action.retry.delay_after(attempt);
            tracing::warn!(
                execution_id = %execution_id,
                action_id = %action.id,
                attempt,
                "Action attempt failed, retrying after {:?}: {}",
                delay,
                error
            );

            tokio::select! {
                _ = ctx.cancellation.cancelled() => {
                    return ActionOutcome::failed(
                        action.id.clone(),
                        EngineError::ExecutionCancelled(execution_id),
                        attempt,
                    );
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    async fn mark_started(&self, execution_id: &ExecutionId, action_id: &ActionId, attempt: u32) {
        let result = self
            .tracker
            .update(execution_id, |execution| {
                let state = execution.action_states.entry(action_id.clone()).or_default();
                state.status = ActionStatus::Running;
                state.attempts = attempt;
                state.started_at.get_or_insert_with(Utc::now);
            })
            .await;

        if let Err(e) = result {
            tracing::warn!(execution_id = %execution_id, "Failed to record action start: {}", e);
        }
    }

    async fn record_attempt_failure(
        &self,
        execution_id: &ExecutionId,
        action_id: &ActionId,
        attempt: u32,
        error: &EngineError,
    ) {
        let record = ActionErrorRecord {
            action_id: action_id.clone(),
            message: error.to_string(),
            timestamp: Utc::now(),
            attempt,
        };

        let result = self
            .tracker
            .update(execution_id, |execution| {
                let state = execution.action_states.entry(action_id.clone()).or_default();
                state.attempts = state.attempts.max(attempt);
                execution.errors.push(record);
            })
            .await;

        if let Err(e) = result {
            tracing::warn!(execution_id = %execution_id, "Failed to record action error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::handler_fn;
    use crate::types::{ActionKind, Execution, WorkflowId};
    use anyhow::anyhow;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        tracker: Arc<ExecutionTracker>,
        executor: ActionExecutor,
        execution: Execution,
    }

    async fn fixture(kind: ActionKind, handler: Arc<dyn crate::handlers::ActionHandler>) -> Fixture {
        let mut handlers = HandlerRegistry::new();
        handlers.register(kind, handler);

        let tracker = Arc::new(ExecutionTracker::new());
        let execution = tracker
            .create(
                WorkflowId::new("wf"),
                Value::Null,
                Map::new(),
                [ActionId::new("act")],
                false,
            )
            .await
            .unwrap();
        let executor = ActionExecutor::new(Arc::new(handlers), tracker.clone(), Duration::from_secs(5));

        Fixture {
            tracker,
            executor,
            execution,
        }
    }

    fn context(execution: &Execution) -> ActionContext {
        ActionContext {
            execution_id: execution.id,
            workflow_id: execution.workflow_id.clone(),
            action_id: ActionId::new("act"),
            attempt: 0,
            trigger_data: Value::Null,
            results: HashMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    fn failing_n_times(failures: u32, calls: Arc<AtomicU32>) -> Arc<dyn crate::handlers::ActionHandler> {
        handler_fn(move |_, _| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= failures {
                    Err(anyhow!("attempt {} failed", n))
                } else {
                    let mut out = Map::new();
                    out.insert("ok".to_string(), json!(true));
                    Ok(out)
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_action_attempted_max_retries_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let f = fixture(ActionKind::Notify, failing_n_times(u32::MAX, calls.clone())).await;
        let action = Action::new("act", ActionKind::Notify).with_retry(3, 100);

        let outcome = f.executor.run(&action, &Map::new(), context(&f.execution)).await;

        assert_eq!(outcome.status, ActionStatus::Failed);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let execution = f.tracker.get(&f.execution.id).await.unwrap();
        let attempts: Vec<u32> = execution.errors.iter().map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_once_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let f = fixture(ActionKind::Notify, failing_n_times(1, calls.clone())).await;
        let action = Action::new("act", ActionKind::Notify).with_retry(2, 100);

        let outcome = f.executor.run(&action, &Map::new(), context(&f.execution)).await;

        assert_eq!(outcome.status, ActionStatus::Completed);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result, Some(json!({ "ok": true })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure_and_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = {
            let calls = calls.clone();
            handler_fn(move |_, _| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    }
                    Ok(Map::new())
                }
            })
        };
        let f = fixture(ActionKind::ExportReport, handler).await;
        let action = Action::new("act", ActionKind::ExportReport)
            .with_retry(1, 10)
            .with_timeout_ms(500);

        let outcome = f.executor.run(&action, &Map::new(), context(&f.execution)).await;

        assert_eq!(outcome.status, ActionStatus::Completed);
        let execution = f.tracker.get(&f.execution.id).await.unwrap();
        assert_eq!(execution.errors.len(), 1);
        assert!(execution.errors[0].message.contains("timed out after 500ms"));
    }

    #[tokio::test]
    async fn test_unknown_action_type_is_not_retried() {
        let f = fixture(ActionKind::Notify, failing_n_times(0, Arc::new(AtomicU32::new(0)))).await;
        let action = Action::new("act", ActionKind::Custom("teleport".to_string())).with_retry(5, 10);

        let outcome = f.executor.run(&action, &Map::new(), context(&f.execution)).await;

        assert_eq!(outcome.status, ActionStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            outcome.error,
            Some(EngineError::UnknownActionType(ActionKind::Custom("teleport".to_string())))
        );
    }

    #[tokio::test]
    async fn test_parameters_are_substituted() {
        let handler = handler_fn(|params, _| async move { Ok(params) });
        let f = fixture(ActionKind::UpdateCampaign, handler).await;
        let action = Action::new("act", ActionKind::UpdateCampaign)
            .with_parameters(json!({ "budget": "${total_budget}", "note": "${missing}" }));

        let mut vars = Map::new();
        vars.insert("total_budget".to_string(), json!(500));
        let outcome = f.executor.run(&action, &vars, context(&f.execution)).await;

        assert_eq!(
            outcome.result,
            Some(json!({ "budget": 500, "note": "${missing}" }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let f = fixture(ActionKind::Notify, failing_n_times(u32::MAX, calls.clone())).await;
        let action = Action::new("act", ActionKind::Notify).with_retry(10, 1_000);

        let ctx = context(&f.execution);
        let token = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            token.cancel();
        });

        let outcome = f.executor.run(&action, &Map::new(), ctx).await;
        assert!(outcome.was_cancelled());
        assert_eq!(outcome.error, Some(EngineError::ExecutionCancelled(f.execution.id)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Both real failures are on record; the cancellation is not an attempt
        let execution = f.tracker.get(&f.execution.id).await.unwrap();
        assert_eq!(execution.errors.len(), 2);
    }
}
