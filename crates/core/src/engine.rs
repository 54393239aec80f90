use crate::clock::{Clock, SystemClock};
use crate::collaborators::{Collaborators, MetricsSource, StaticMetricsSource, StaticTrendingSource, TrendingSource};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventHandler, SubscriptionId};
use crate::handlers::{register_builtin_handlers, ActionHandler, HandlerRegistry};
use crate::registry::WorkflowRegistry;
use crate::tracker::ExecutionTracker;
use crate::triggers::{MonitorContext, TriggerMonitors, TriggerSink};
use crate::types::{
    ActionKind, Execution, ExecutionId, ExecutionSummary, TriggerId, WorkflowId, WorkflowTemplate,
};
use crate::workflow::{ActionExecutor, RunRequest, WorkflowExecutor};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Weak};

/// Assembles a [`WorkflowEngine`] from its collaborators
pub struct EngineBuilder {
    config: EngineConfig,
    collaborators: Option<Collaborators>,
    handlers: Vec<(ActionKind, Arc<dyn ActionHandler>)>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<dyn MetricsSource>>,
    trending: Option<Arc<dyn TrendingSource>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            collaborators: None,
            handlers: Vec::new(),
            clock: None,
            metrics: None,
            trending: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Collaborators behind the built-in handlers. Defaults to the
    /// in-memory implementations.
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    /// Register a handler, overriding any built-in handler for the kind
    pub fn handler(mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.push((kind, handler));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn metrics_source(mut self, metrics: Arc<dyn MetricsSource>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn trending_source(mut self, trending: Arc<dyn TrendingSource>) -> Self {
        self.trending = Some(trending);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let collaborators = self.collaborators.unwrap_or_else(Collaborators::in_memory);
        let mut handlers = HandlerRegistry::new();
        register_builtin_handlers(&mut handlers, &collaborators);
        for (kind, handler) in self.handlers {
            handlers.register(kind, handler);
        }
        let handlers = Arc::new(handlers);

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(StaticMetricsSource::new()));
        let trending = self
            .trending
            .unwrap_or_else(|| Arc::new(StaticTrendingSource::new()));

        let config = self.config;
        let event_bus = Arc::new(EventBus::new());
        let tracker = Arc::new(ExecutionTracker::new());
        let action_executor = Arc::new(ActionExecutor::new(
            handlers.clone(),
            tracker.clone(),
            config.default_action_timeout(),
        ));
        let executor = Arc::new(WorkflowExecutor::new(
            action_executor,
            tracker.clone(),
            event_bus.clone(),
            config.max_concurrent_actions,
            config.publish_completion_events,
        ));

        let inner = Arc::new_cyclic(|weak: &Weak<EngineInner>| {
            let sink: Weak<dyn TriggerSink> = weak.clone();
            let monitors = TriggerMonitors::new(MonitorContext {
                sink,
                event_bus: event_bus.clone(),
                clock: clock.clone(),
                metrics,
                trending,
                backoff: config.monitor_backoff(),
            });

            EngineInner {
                registry: WorkflowRegistry::new(monitors),
                tracker,
                event_bus,
                executor,
                handlers,
                clock,
                config,
            }
        });

        tracing::info!(
            handlers = inner.handlers.kinds().len(),
            max_concurrent_actions = inner.config.max_concurrent_actions,
            single_flight = inner.config.single_flight,
            "Workflow engine ready"
        );

        WorkflowEngine { inner }
    }
}

struct EngineInner {
    config: EngineConfig,
    registry: WorkflowRegistry,
    tracker: Arc<ExecutionTracker>,
    event_bus: Arc<EventBus>,
    executor: Arc<WorkflowExecutor>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
}

impl EngineInner {
    /// Create an execution and spawn its run. A firing trigger is stamped
    /// before the run starts.
    async fn start_run(
        &self,
        workflow_id: &WorkflowId,
        fired_by: Option<&TriggerId>,
        trigger_data: Value,
        overrides: Map<String, Value>,
    ) -> EngineResult<ExecutionId> {
        let registered = self.registry.resolve(workflow_id).await?;
        let template = registered.template;

        let mut variables = template.variables.clone();
        variables.extend(overrides);

        let execution = self
            .tracker
            .create(
                workflow_id.clone(),
                trigger_data.clone(),
                variables.clone(),
                template.actions.iter().map(|a| a.id.clone()),
                self.config.single_flight,
            )
            .await?;
        let cancel = self.tracker.cancellation_token(&execution.id).await?;

        if let Some(trigger_id) = fired_by {
            self.registry
                .record_fired(workflow_id, trigger_id, self.clock.now())
                .await;
        }

        let request = RunRequest {
            execution_id: execution.id,
            template,
            graph: registered.graph,
            variables,
            trigger_data,
            cancel,
        };
        let executor = self.executor.clone();
        tokio::spawn(async move {
            executor.execute(request).await;
        });

        Ok(execution.id)
    }
}

#[async_trait::async_trait]
impl TriggerSink for EngineInner {
    async fn fire(&self, workflow_id: &WorkflowId, trigger_id: &TriggerId, trigger_data: Value) {
        match self
            .start_run(workflow_id, Some(trigger_id), trigger_data, Map::new())
            .await
        {
            Ok(execution_id) => {
                tracing::info!(
                    workflow_id = %workflow_id,
                    trigger_id = %trigger_id,
                    execution_id = %execution_id,
                    "Trigger started execution"
                );
            }
            Err(EngineError::WorkflowBusy(_)) => {
                tracing::info!(
                    workflow_id = %workflow_id,
                    trigger_id = %trigger_id,
                    "Workflow already running, dropping trigger"
                );
            }
            Err(e) => {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    trigger_id = %trigger_id,
                    "Trigger could not start execution: {}",
                    e
                );
            }
        }
    }
}

/// Entry point for registering workflows and running them.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Engine with in-memory collaborators and the system clock
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder::new().config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.event_bus
    }

    pub fn handler_kinds(&self) -> Vec<ActionKind> {
        self.inner.handlers.kinds()
    }

    // --- Workflows ---

    pub async fn register_workflow(&self, template: WorkflowTemplate) -> EngineResult<WorkflowId> {
        self.inner.registry.register(template).await
    }

    pub async fn update_workflow(&self, template: WorkflowTemplate) -> EngineResult<()> {
        self.inner.registry.update(template).await
    }

    /// Stop a workflow's monitors and remove it. With `cancel_inflight`, its
    /// unfinished runs are cancelled too; their IDs are returned.
    pub async fn remove_workflow(
        &self,
        workflow_id: &WorkflowId,
        cancel_inflight: bool,
    ) -> EngineResult<Vec<ExecutionId>> {
        self.inner.registry.remove(workflow_id).await?;

        if !cancel_inflight {
            return Ok(Vec::new());
        }
        let cancelled = self.inner.tracker.cancel_workflow(workflow_id).await;
        if !cancelled.is_empty() {
            tracing::info!(
                workflow_id = %workflow_id,
                executions = cancelled.len(),
                "Cancelled in-flight executions of removed workflow"
            );
        }
        Ok(cancelled)
    }

    pub async fn get_workflow(&self, workflow_id: &WorkflowId) -> Option<WorkflowTemplate> {
        self.inner.registry.get(workflow_id).await
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowTemplate> {
        self.inner.registry.list().await
    }

    pub async fn set_trigger_enabled(
        &self,
        workflow_id: &WorkflowId,
        trigger_id: &TriggerId,
        enabled: bool,
    ) -> EngineResult<()> {
        self.inner
            .registry
            .set_trigger_enabled(workflow_id, trigger_id, enabled)
            .await
    }

    /// Number of trigger monitors currently running
    pub async fn active_monitors(&self) -> usize {
        self.inner.registry.monitors().running_count().await
    }

    // --- Executions ---

    /// Run a workflow and wait for it to reach a terminal state.
    ///
    /// `overrides` are layered over the template's variables.
    pub async fn execute_workflow(
        &self,
        workflow_id: &WorkflowId,
        trigger_data: Value,
        overrides: Map<String, Value>,
    ) -> EngineResult<Execution> {
        let execution_id = self.start_workflow(workflow_id, trigger_data, overrides).await?;
        self.inner.tracker.wait(&execution_id).await
    }

    /// Start a run and return its ID without waiting
    pub async fn start_workflow(
        &self,
        workflow_id: &WorkflowId,
        trigger_data: Value,
        overrides: Map<String, Value>,
    ) -> EngineResult<ExecutionId> {
        let trigger_data = match trigger_data {
            Value::Null => json!({ "trigger": "manual" }),
            data => data,
        };
        self.inner
            .start_run(workflow_id, None, trigger_data, overrides)
            .await
    }

    /// Wait for a run started with [`start_workflow`](Self::start_workflow)
    pub async fn wait_for_execution(&self, execution_id: &ExecutionId) -> EngineResult<Execution> {
        self.inner.tracker.wait(execution_id).await
    }

    pub async fn get_execution_status(&self, execution_id: &ExecutionId) -> EngineResult<ExecutionSummary> {
        self.get_execution(execution_id)
            .await
            .map(|e| e.summary())
            .ok_or(EngineError::ExecutionNotFound(*execution_id))
    }

    pub async fn get_execution(&self, execution_id: &ExecutionId) -> Option<Execution> {
        self.inner.tracker.get(execution_id).await
    }

    /// Executions, optionally of one workflow, oldest first
    pub async fn list_executions(&self, workflow_id: Option<&WorkflowId>) -> Vec<Execution> {
        self.inner.tracker.list(workflow_id).await
    }

    /// Request cancellation. Returns false if the run had already finished.
    pub async fn cancel_execution(&self, execution_id: &ExecutionId) -> EngineResult<bool> {
        self.inner.tracker.cancel(execution_id).await
    }

    /// Drop a finished execution from memory
    pub async fn evict_execution(&self, execution_id: &ExecutionId) -> EngineResult<Execution> {
        self.inner.tracker.evict(execution_id).await
    }

    // --- Events ---

    /// Publish an event. Returns how many subscribers were notified.
    pub async fn emit_event(&self, name: &str, payload: Value) -> usize {
        self.inner.event_bus.publish(name, payload).await
    }

    pub async fn subscribe(&self, name: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        self.inner.event_bus.subscribe(name, handler).await
    }

    pub async fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.inner.event_bus.unsubscribe(subscription).await
    }

    /// Stop every monitor, cancel unfinished runs and wait for them to settle
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down workflow engine");
        self.inner.registry.shutdown().await;
        self.inner.tracker.cancel_all().await;

        for execution in self.inner.tracker.list(None).await {
            if !execution.status.is_terminal() {
                let _ = self.inner.tracker.wait(&execution.id).await;
            }
        }
        tracing::info!("Workflow engine stopped");
    }
}
