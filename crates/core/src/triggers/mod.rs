//! Background monitors that turn trigger conditions into executions

pub mod event;
pub mod poll;
pub mod schedule;

use crate::clock::Clock;
use crate::collaborators::{MetricsSource, TrendingSource};
use crate::config::BackoffPolicy;
use crate::error::EngineResult;
use crate::events::EventBus;
use crate::types::{Trigger, TriggerCondition, TriggerId, WorkflowId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use poll::EdgeDetector;
pub use schedule::parse_schedule;

/// Receives trigger fires from the monitors
#[async_trait::async_trait]
pub trait TriggerSink: Send + Sync {
    async fn fire(&self, workflow_id: &WorkflowId, trigger_id: &TriggerId, trigger_data: Value);
}

/// Shared dependencies handed to every monitor task
#[derive(Clone)]
pub struct MonitorContext {
    /// Held weakly so running monitors never keep the engine alive
    pub sink: Weak<dyn TriggerSink>,
    pub event_bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<dyn MetricsSource>,
    pub trending: Arc<dyn TrendingSource>,
    pub backoff: BackoffPolicy,
}

impl MonitorContext {
    /// Deliver a fire. Returns false once the sink is gone and the monitor
    /// should exit.
    pub(crate) async fn fire(&self, workflow_id: &WorkflowId, trigger_id: &TriggerId, trigger_data: Value) -> bool {
        match self.sink.upgrade() {
            Some(sink) => {
                sink.fire(workflow_id, trigger_id, trigger_data).await;
                true
            }
            None => {
                tracing::debug!(
                    workflow_id = %workflow_id,
                    trigger_id = %trigger_id,
                    "Trigger sink dropped, stopping monitor"
                );
                false
            }
        }
    }
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type MonitorKey = (WorkflowId, TriggerId);

/// The set of running monitors, one per enabled monitored trigger
pub struct TriggerMonitors {
    context: MonitorContext,
    monitors: Mutex<HashMap<MonitorKey, MonitorHandle>>,
}

impl TriggerMonitors {
    pub fn new(context: MonitorContext) -> Self {
        Self {
            context,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Start the monitor for a trigger, replacing any running one.
    ///
    /// Returns false for trigger kinds that have no monitor (manual, webhook).
    pub async fn start(&self, workflow_id: &WorkflowId, trigger: &Trigger) -> EngineResult<bool> {
        if !trigger.kind().is_monitored() {
            return Ok(false);
        }

        self.stop(workflow_id, &trigger.id).await;

        let ctx = self.context.clone();
        let cancel = CancellationToken::new();
        let wf = workflow_id.clone();
        let tid = trigger.id.clone();

        let task = match &trigger.condition {
            TriggerCondition::Scheduled { cron } => {
                let schedule = parse_schedule(cron)?;
                tokio::spawn(schedule::run(ctx, wf, tid, schedule, cancel.clone()))
            }
            TriggerCondition::Event { event_name } => {
                event::start(&ctx, wf, tid, event_name, cancel.clone()).await
            }
            TriggerCondition::PerformanceThreshold {
                metric,
                comparator,
                threshold,
                poll_interval_seconds,
            } => {
                let target = poll::PollTarget::Metric {
                    metric: metric.clone(),
                    comparator: *comparator,
                    threshold: *threshold,
                };
                let interval = Duration::from_secs(*poll_interval_seconds);
                tokio::spawn(poll::run(ctx, wf, tid, target, interval, cancel.clone()))
            }
            TriggerCondition::ExternalSignal {
                source_query,
                score_threshold,
                poll_interval_seconds,
            } => {
                let target = poll::PollTarget::Trending {
                    query: source_query.clone(),
                    score_threshold: *score_threshold,
                };
                let interval = Duration::from_secs(*poll_interval_seconds);
                tokio::spawn(poll::run(ctx, wf, tid, target, interval, cancel.clone()))
            }
            TriggerCondition::Manual | TriggerCondition::Webhook => return Ok(false),
        };

        tracing::info!(
            workflow_id = %workflow_id,
            trigger_id = %trigger.id,
            kind = trigger.kind().as_str(),
            "Started trigger monitor"
        );

        let displaced = self
            .monitors
            .lock()
            .await
            .insert((workflow_id.clone(), trigger.id.clone()), MonitorHandle { cancel, task });

        // A concurrent start for the same trigger got in between the stop
        // above and this insert
        if let Some(handle) = displaced {
            Self::shut(handle).await;
        }

        Ok(true)
    }

    /// Stop one monitor and wait for its task to exit
    pub async fn stop(&self, workflow_id: &WorkflowId, trigger_id: &TriggerId) -> bool {
        let handle = self
            .monitors
            .lock()
            .await
            .remove(&(workflow_id.clone(), trigger_id.clone()));

        match handle {
            Some(handle) => {
                Self::shut(handle).await;
                tracing::info!(
                    workflow_id = %workflow_id,
                    trigger_id = %trigger_id,
                    "Stopped trigger monitor"
                );
                true
            }
            None => false,
        }
    }

    /// Stop every monitor of a workflow. Returns how many were stopped.
    pub async fn stop_workflow(&self, workflow_id: &WorkflowId) -> usize {
        let handles: Vec<MonitorHandle> = {
            let mut monitors = self.monitors.lock().await;
            let keys: Vec<MonitorKey> = monitors
                .keys()
                .filter(|(wf, _)| wf == workflow_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| monitors.remove(k)).collect()
        };

        let count = handles.len();
        for handle in handles {
            Self::shut(handle).await;
        }

        if count > 0 {
            tracing::info!(workflow_id = %workflow_id, monitors = count, "Stopped workflow monitors");
        }
        count
    }

    pub async fn is_running(&self, workflow_id: &WorkflowId, trigger_id: &TriggerId) -> bool {
        self.monitors
            .lock()
            .await
            .get(&(workflow_id.clone(), trigger_id.clone()))
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Number of monitors whose task is still alive
    pub async fn running_count(&self) -> usize {
        self.monitors
            .lock()
            .await
            .values()
            .filter(|h| !h.task.is_finished())
            .count()
    }

    pub async fn shutdown(&self) {
        let handles: Vec<MonitorHandle> = self.monitors.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            Self::shut(handle).await;
        }
    }

    async fn shut(handle: MonitorHandle) {
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            if !e.is_cancelled() {
                tracing::warn!("Trigger monitor exited abnormally: {}", e);
            }
        }
    }
}
