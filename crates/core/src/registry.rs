use crate::error::{EngineError, EngineResult};
use crate::triggers::{parse_schedule, TriggerMonitors};
use crate::types::{TriggerCondition, TriggerId, WorkflowId, WorkflowTemplate};
use crate::workflow::ActionGraph;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A validated template together with its resolved action graph
#[derive(Clone)]
pub(crate) struct RegisteredWorkflow {
    pub template: Arc<WorkflowTemplate>,
    pub graph: Arc<ActionGraph>,
}

/// Registered workflow templates and the monitors watching their triggers
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<WorkflowId, RegisteredWorkflow>>,
    monitors: TriggerMonitors,
    /// Held across register, update, remove and trigger toggles, so the
    /// monitor set always matches the stored templates once each returns.
    /// Firing triggers only touch `workflows` and never wait on it.
    lifecycle: Mutex<()>,
}

impl WorkflowRegistry {
    pub fn new(monitors: TriggerMonitors) -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            monitors,
            lifecycle: Mutex::new(()),
        }
    }

    /// Check a template and build its action graph
    pub fn validate(template: &WorkflowTemplate) -> EngineResult<ActionGraph> {
        if template.id.0.trim().is_empty() {
            return Err(EngineError::InvalidWorkflow("workflow id is empty".to_string()));
        }

        let mut trigger_ids = HashSet::new();
        for trigger in &template.triggers {
            if trigger.id.0.trim().is_empty() {
                return Err(EngineError::InvalidWorkflow("trigger with empty id".to_string()));
            }
            if !trigger_ids.insert(&trigger.id) {
                return Err(EngineError::InvalidWorkflow(format!(
                    "duplicate trigger id {}",
                    trigger.id
                )));
            }

            match &trigger.condition {
                TriggerCondition::Scheduled { cron } => {
                    parse_schedule(cron)?;
                }
                TriggerCondition::Event { event_name } if event_name.trim().is_empty() => {
                    return Err(EngineError::InvalidWorkflow(format!(
                        "trigger {} has an empty event name",
                        trigger.id
                    )));
                }
                TriggerCondition::PerformanceThreshold {
                    poll_interval_seconds: 0,
                    ..
                }
                | TriggerCondition::ExternalSignal {
                    poll_interval_seconds: 0,
                    ..
                } => {
                    return Err(EngineError::InvalidWorkflow(format!(
                        "trigger {} needs a poll interval above zero",
                        trigger.id
                    )));
                }
                _ => {}
            }
        }

        match ActionGraph::build(&template.actions) {
            Err(cycle @ EngineError::CyclicDependency(_)) => {
                Err(EngineError::InvalidWorkflow(cycle.to_string()))
            }
            built => built,
        }
    }

    /// Validate and store a new template, then start its trigger monitors
    pub async fn register(&self, template: WorkflowTemplate) -> EngineResult<WorkflowId> {
        let graph = Self::validate(&template)?;
        let workflow_id = template.id.clone();
        let template = Arc::new(template);
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut workflows = self.workflows.write().await;
            if workflows.contains_key(&workflow_id) {
                return Err(EngineError::InvalidWorkflow(format!(
                    "workflow {} is already registered",
                    workflow_id
                )));
            }
            workflows.insert(
                workflow_id.clone(),
                RegisteredWorkflow {
                    template: template.clone(),
                    graph: Arc::new(graph),
                },
            );
        }

        let monitors = self.start_monitors(&template).await;
        tracing::info!(
            workflow_id = %workflow_id,
            actions = template.actions.len(),
            triggers = template.triggers.len(),
            monitors,
            "Registered workflow"
        );

        Ok(workflow_id)
    }

    /// Replace a registered template, restarting its monitors.
    ///
    /// `last_fired` is carried over for triggers that keep their ID.
    pub async fn update(&self, mut template: WorkflowTemplate) -> EngineResult<()> {
        let graph = Self::validate(&template)?;
        let workflow_id = template.id.clone();
        let _lifecycle = self.lifecycle.lock().await;

        let previous = self.resolve(&workflow_id).await?;
        for trigger in &mut template.triggers {
            if trigger.last_fired.is_none() {
                trigger.last_fired = previous.template.trigger(&trigger.id).and_then(|t| t.last_fired);
            }
        }

        self.monitors.stop_workflow(&workflow_id).await;

        let template = Arc::new(template);
        {
            let mut workflows = self.workflows.write().await;
            if !workflows.contains_key(&workflow_id) {
                return Err(EngineError::WorkflowNotFound(workflow_id));
            }
            workflows.insert(
                workflow_id.clone(),
                RegisteredWorkflow {
                    template: template.clone(),
                    graph: Arc::new(graph),
                },
            );
        }

        self.start_monitors(&template).await;
        tracing::info!(workflow_id = %workflow_id, "Updated workflow");
        Ok(())
    }

    /// Stop the workflow's monitors, then forget the template
    pub async fn remove(&self, workflow_id: &WorkflowId) -> EngineResult<Arc<WorkflowTemplate>> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.workflows.read().await.contains_key(workflow_id) {
            return Err(EngineError::WorkflowNotFound(workflow_id.clone()));
        }

        // Template lock not held here: a monitor mid-fire may need it
        self.monitors.stop_workflow(workflow_id).await;

        let removed = self
            .workflows
            .write()
            .await
            .remove(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.clone()))?;

        tracing::info!(workflow_id = %workflow_id, "Removed workflow");
        Ok(removed.template)
    }

    pub async fn get(&self, workflow_id: &WorkflowId) -> Option<WorkflowTemplate> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .map(|w| w.template.as_ref().clone())
    }

    pub(crate) async fn resolve(&self, workflow_id: &WorkflowId) -> EngineResult<RegisteredWorkflow> {
        self.workflows
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.clone()))
    }

    /// All templates, ordered by ID
    pub async fn list(&self) -> Vec<WorkflowTemplate> {
        let mut templates: Vec<WorkflowTemplate> = self
            .workflows
            .read()
            .await
            .values()
            .map(|w| w.template.as_ref().clone())
            .collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    /// Enable or disable one trigger, starting or stopping its monitor
    pub async fn set_trigger_enabled(
        &self,
        workflow_id: &WorkflowId,
        trigger_id: &TriggerId,
        enabled: bool,
    ) -> EngineResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let trigger = {
            let mut workflows = self.workflows.write().await;
            let registered = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.clone()))?;

            let template = Arc::make_mut(&mut registered.template);
            let trigger = template
                .triggers
                .iter_mut()
                .find(|t| &t.id == trigger_id)
                .ok_or_else(|| EngineError::TriggerNotFound {
                    workflow_id: workflow_id.clone(),
                    trigger_id: trigger_id.clone(),
                })?;

            if trigger.enabled == enabled {
                return Ok(());
            }
            trigger.enabled = enabled;
            trigger.clone()
        };

        if enabled {
            self.monitors.start(workflow_id, &trigger).await?;
        } else {
            self.monitors.stop(workflow_id, trigger_id).await;
        }

        tracing::info!(
            workflow_id = %workflow_id,
            trigger_id = %trigger_id,
            enabled,
            "Trigger toggled"
        );
        Ok(())
    }

    /// Note that a trigger fired. Unknown workflows or triggers are ignored.
    pub async fn record_fired(&self, workflow_id: &WorkflowId, trigger_id: &TriggerId, at: DateTime<Utc>) {
        let mut workflows = self.workflows.write().await;
        if let Some(registered) = workflows.get_mut(workflow_id) {
            let template = Arc::make_mut(&mut registered.template);
            if let Some(trigger) = template.triggers.iter_mut().find(|t| &t.id == trigger_id) {
                trigger.last_fired = Some(at);
            }
        }
    }

    pub fn monitors(&self) -> &TriggerMonitors {
        &self.monitors
    }

    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.monitors.shutdown().await;
    }

    async fn start_monitors(&self, template: &WorkflowTemplate) -> usize {
        let mut started = 0;
        for trigger in template.triggers.iter().filter(|t| t.enabled) {
            match self.monitors.start(&template.id, trigger).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(
                    workflow_id = %template.id,
                    trigger_id = %trigger.id,
                    "Failed to start trigger monitor: {}",
                    e
                ),
            }
        }
        started
    }
}
