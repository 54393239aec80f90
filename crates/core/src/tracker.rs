use crate::error::{EngineError, EngineResult};
use crate::types::{ActionId, Execution, ExecutionId, ExecutionStatus, WorkflowId};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// One tracked run. Mutation of the record is serialized by its own lock so
/// concurrent actions of the same run never race each other.
struct TrackedExecution {
    state: Mutex<Execution>,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

/// Owns the state of in-flight and finished executions
#[derive(Default)]
pub struct ExecutionTracker {
    executions: RwLock<HashMap<ExecutionId, Arc<TrackedExecution>>>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending execution.
    ///
    /// With `single_flight` set, refuses when another run of the same workflow
    /// has not reached a terminal state yet.
    pub async fn create(
        &self,
        workflow_id: WorkflowId,
        trigger_data: Value,
        variables: Map<String, Value>,
        action_ids: impl IntoIterator<Item = ActionId>,
        single_flight: bool,
    ) -> EngineResult<Execution> {
        let execution = Execution::new(workflow_id.clone(), trigger_data, variables, action_ids);
        let (finished, _) = watch::channel(false);

        let tracked = Arc::new(TrackedExecution {
            state: Mutex::new(execution.clone()),
            cancel: CancellationToken::new(),
            finished,
        });

        let mut executions = self.executions.write().await;
        if single_flight {
            for other in executions.values() {
                let other = other.state.lock().await;
                if other.workflow_id == workflow_id && !other.status.is_terminal() {
                    return Err(EngineError::WorkflowBusy(workflow_id));
                }
            }
        }
        executions.insert(execution.id, tracked);

        Ok(execution)
    }

    async fn tracked(&self, id: &ExecutionId) -> EngineResult<Arc<TrackedExecution>> {
        self.executions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(EngineError::ExecutionNotFound(*id))
    }

    /// Snapshot of an execution
    pub async fn get(&self, id: &ExecutionId) -> Option<Execution> {
        let tracked = self.tracked(id).await.ok()?;
        let state = tracked.state.lock().await;
        Some(state.clone())
    }

    /// Apply a mutation to an execution under its lock.
    ///
    /// Waiters are released once the mutation leaves the record terminal.
    pub async fn update<F, R>(&self, id: &ExecutionId, mutator: F) -> EngineResult<R>
    where
        F: FnOnce(&mut Execution) -> R,
    {
        let tracked = self.tracked(id).await?;
        let mut state = tracked.state.lock().await;
        let out = mutator(&mut state);

        if state.status.is_terminal() {
            tracked.finished.send_replace(true);
        }

        Ok(out)
    }

    pub async fn cancellation_token(&self, id: &ExecutionId) -> EngineResult<CancellationToken> {
        Ok(self.tracked(id).await?.cancel.clone())
    }

    /// Request cancellation. Returns false if the run had already finished.
    pub async fn cancel(&self, id: &ExecutionId) -> EngineResult<bool> {
        let tracked = self.tracked(id).await?;
        let state = tracked.state.lock().await;
        if state.status.is_terminal() {
            return Ok(false);
        }

        tracked.cancel.cancel();
        tracing::info!(execution_id = %id, "Cancellation requested");
        Ok(true)
    }

    /// Cancel every unfinished run of a workflow, returning their IDs
    pub async fn cancel_workflow(&self, workflow_id: &WorkflowId) -> Vec<ExecutionId> {
        let tracked: Vec<Arc<TrackedExecution>> = self.executions.read().await.values().cloned().collect();

        let mut cancelled = Vec::new();
        for entry in tracked {
            let state = entry.state.lock().await;
            if &state.workflow_id == workflow_id && !state.status.is_terminal() {
                entry.cancel.cancel();
                cancelled.push(state.id);
            }
        }
        cancelled
    }

    /// Wait until the execution reaches a terminal state
    pub async fn wait(&self, id: &ExecutionId) -> EngineResult<Execution> {
        let tracked = self.tracked(id).await?;
        let mut finished = tracked.finished.subscribe();

        // The sender lives in `tracked`, so the channel cannot close under us
        let _ = finished.wait_for(|done| *done).await;

        let state = tracked.state.lock().await;
        Ok(state.clone())
    }

    /// Executions, optionally filtered by workflow, oldest first
    pub async fn list(&self, workflow_id: Option<&WorkflowId>) -> Vec<Execution> {
        let tracked: Vec<Arc<TrackedExecution>> = self.executions.read().await.values().cloned().collect();

        let mut out = Vec::with_capacity(tracked.len());
        for entry in tracked {
            let state = entry.state.lock().await;
            if workflow_id.map_or(true, |wf| &state.workflow_id == wf) {
                out.push(state.clone());
            }
        }
        out.sort_by_key(|e| e.created_at);
        out
    }

    /// Runs of a workflow that have not reached a terminal state
    pub async fn running_count(&self, workflow_id: &WorkflowId) -> usize {
        self.list(Some(workflow_id))
            .await
            .iter()
            .filter(|e| !e.status.is_terminal())
            .count()
    }

    /// Drop a finished execution from memory
    pub async fn evict(&self, id: &ExecutionId) -> EngineResult<Execution> {
        let mut executions = self.executions.write().await;
        let tracked = executions
            .get(id)
            .cloned()
            .ok_or(EngineError::ExecutionNotFound(*id))?;

        let state = tracked.state.lock().await;
        if !state.status.is_terminal() {
            return Err(EngineError::ExecutionStillRunning(*id));
        }
        executions.remove(id);

        Ok(state.clone())
    }

    /// Cancel everything still running
    pub async fn cancel_all(&self) {
        for entry in self.executions.read().await.values() {
            entry.cancel.cancel();
        }
    }
}

/// Convenience used when a status change is the whole mutation
pub(crate) fn set_status(execution: &mut Execution, status: ExecutionStatus) {
    execution.status = status;
    match status {
        ExecutionStatus::Running => {
            execution.started_at.get_or_insert_with(chrono::Utc::now);
        }
        s if s.is_terminal() => {
            execution.completed_at = Some(chrono::Utc::now());
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn create(tracker: &ExecutionTracker, workflow: &str, single_flight: bool) -> EngineResult<Execution> {
        tracker
            .create(
                WorkflowId::new(workflow),
                Value::Null,
                Map::new(),
                [ActionId::new("a")],
                single_flight,
            )
            .await
    }

    #[tokio::test]
    async fn test_create_get_update() {
        let tracker = ExecutionTracker::new();
        let execution = create(&tracker, "wf", false).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Pending);

        tracker
            .update(&execution.id, |e| set_status(e, ExecutionStatus::Running))
            .await
            .unwrap();

        let snapshot = tracker.get(&execution.id).await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Running);
        assert!(snapshot.started_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let tracker = ExecutionTracker::new();
        let id = ExecutionId::new();
        assert!(tracker.get(&id).await.is_none());
        assert_eq!(
            tracker.update(&id, |_| ()).await.unwrap_err(),
            EngineError::ExecutionNotFound(id)
        );
    }

    #[tokio::test]
    async fn test_wait_returns_after_terminal_update() {
        let tracker = Arc::new(ExecutionTracker::new());
        let execution = create(&tracker, "wf", false).await.unwrap();

        let waiter = {
            let tracker = tracker.clone();
            let id = execution.id;
            tokio::spawn(async move { tracker.wait(&id).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tracker
            .update(&execution.id, |e| set_status(e, ExecutionStatus::Completed))
            .await
            .unwrap();

        let finished = waiter.await.unwrap().unwrap();
        assert_eq!(finished.status, ExecutionStatus::Completed);
        assert!(finished.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_single_flight_refuses_second_run() {
        let tracker = ExecutionTracker::new();
        let first = create(&tracker, "wf", true).await.unwrap();

        assert_eq!(
            create(&tracker, "wf", true).await.unwrap_err(),
            EngineError::WorkflowBusy(WorkflowId::new("wf"))
        );
        // Other workflows are unaffected
        create(&tracker, "other", true).await.unwrap();

        tracker
            .update(&first.id, |e| set_status(e, ExecutionStatus::Failed))
            .await
            .unwrap();
        create(&tracker, "wf", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_evict_only_finished() {
        let tracker = ExecutionTracker::new();
        let execution = create(&tracker, "wf", false).await.unwrap();

        assert_eq!(
            tracker.evict(&execution.id).await.unwrap_err(),
            EngineError::ExecutionStillRunning(execution.id)
        );

        tracker
            .update(&execution.id, |e| set_status(e, ExecutionStatus::Completed))
            .await
            .unwrap();
        tracker.evict(&execution.id).await.unwrap();
        assert!(tracker.get(&execution.id).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_sets_token() {
        let tracker = ExecutionTracker::new();
        let execution = create(&tracker, "wf", false).await.unwrap();
        let token = tracker.cancellation_token(&execution.id).await.unwrap();

        assert!(tracker.cancel(&execution.id).await.unwrap());
        assert!(token.is_cancelled());

        let ids = tracker.cancel_workflow(&WorkflowId::new("wf")).await;
        assert_eq!(ids, vec![execution.id]);
    }
}
