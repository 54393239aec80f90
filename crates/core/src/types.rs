use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a registered workflow template
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a trigger within a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerId(pub String);

impl TriggerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TriggerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an action within a workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub String);

impl ActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for one run of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// A reusable definition of triggers and actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    pub actions: Vec<Action>,
    /// Default variables, overridable per run
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl WorkflowTemplate {
    pub fn action(&self, id: &ActionId) -> Option<&Action> {
        self.actions.iter().find(|a| &a.id == id)
    }

    pub fn trigger(&self, id: &TriggerId) -> Option<&Trigger> {
        self.triggers.iter().find(|t| &t.id == id)
    }
}

/// Trigger kinds understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Event,
    PerformanceThreshold,
    ExternalSignal,
    Manual,
    Webhook,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Event => "event",
            TriggerKind::PerformanceThreshold => "performance_threshold",
            TriggerKind::ExternalSignal => "external_signal",
            TriggerKind::Manual => "manual",
            TriggerKind::Webhook => "webhook",
        }
    }

    /// Whether triggers of this kind need a background monitor
    pub fn is_monitored(&self) -> bool {
        !matches!(self, TriggerKind::Manual | TriggerKind::Webhook)
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that starts a new run of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    #[serde(flatten)]
    pub condition: TriggerCondition,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_fired: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl Trigger {
    pub fn new(id: impl Into<String>, condition: TriggerCondition) -> Self {
        Self {
            id: TriggerId::new(id),
            condition,
            enabled: true,
            last_fired: None,
        }
    }

    pub fn kind(&self) -> TriggerKind {
        self.condition.kind()
    }
}

/// Kind-specific trigger condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Fires on a cron schedule (5-field minute-first or 6/7-field seconds-first)
    Scheduled { cron: String },
    /// Fires whenever the named event is published on the bus
    Event { event_name: String },
    /// Fires when a metric crosses a threshold
    PerformanceThreshold {
        metric: String,
        comparator: Comparator,
        threshold: f64,
        #[serde(default = "default_poll_interval")]
        poll_interval_seconds: u64,
    },
    /// Fires when a trending score for a query reaches a threshold
    ExternalSignal {
        source_query: String,
        score_threshold: f64,
        #[serde(default = "default_poll_interval")]
        poll_interval_seconds: u64,
    },
    Manual,
    Webhook,
}

fn default_poll_interval() -> u64 {
    300
}

impl TriggerCondition {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerCondition::Scheduled { .. } => TriggerKind::Scheduled,
            TriggerCondition::Event { .. } => TriggerKind::Event,
            TriggerCondition::PerformanceThreshold { .. } => TriggerKind::PerformanceThreshold,
            TriggerCondition::ExternalSignal { .. } => TriggerKind::ExternalSignal,
            TriggerCondition::Manual => TriggerKind::Manual,
            TriggerCondition::Webhook => TriggerKind::Webhook,
        }
    }
}

/// Comparison used by threshold triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">", alias = "gt")]
    GreaterThan,
    #[serde(rename = ">=", alias = "gte")]
    GreaterOrEqual,
    #[serde(rename = "<", alias = "lt")]
    LessThan,
    #[serde(rename = "<=", alias = "lte")]
    LessOrEqual,
    #[serde(rename = "=", alias = "==", alias = "eq")]
    Equal,
    #[serde(rename = "!=", alias = "ne")]
    NotEqual,
}

impl Comparator {
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::GreaterThan => value > threshold,
            Comparator::GreaterOrEqual => value >= threshold,
            Comparator::LessThan => value < threshold,
            Comparator::LessOrEqual => value <= threshold,
            Comparator::Equal => (value - threshold).abs() < f64::EPSILON,
            Comparator::NotEqual => (value - threshold).abs() >= f64::EPSILON,
        }
    }
}

/// Action kinds. Built-in kinds map onto the collaborator handlers; any other
/// string is a custom kind that needs its own registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateCampaign,
    UpdateCampaign,
    PauseCampaign,
    ResumeCampaign,
    ScaleCampaign,
    CloneCampaign,
    GenerateContent,
    RunExperiment,
    OptimizeTargeting,
    Notify,
    ExportReport,
    #[serde(untagged)]
    Custom(String),
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::CreateCampaign => "create_campaign",
            ActionKind::UpdateCampaign => "update_campaign",
            ActionKind::PauseCampaign => "pause_campaign",
            ActionKind::ResumeCampaign => "resume_campaign",
            ActionKind::ScaleCampaign => "scale_campaign",
            ActionKind::CloneCampaign => "clone_campaign",
            ActionKind::GenerateContent => "generate_content",
            ActionKind::RunExperiment => "run_experiment",
            ActionKind::OptimizeTargeting => "optimize_targeting",
            ActionKind::Notify => "notify",
            ActionKind::ExportReport => "export_report",
            ActionKind::Custom(name) => name,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work within a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    /// Handler parameters; string values may contain `${var}` placeholders
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<ActionId>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-attempt deadline; the engine default applies when unset
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Recorded as a branch hint when the action succeeds
    #[serde(default)]
    pub on_success: Option<ActionId>,
    /// Fallback action, run only when this action exhausts its retries
    #[serde(default)]
    pub on_failure: Option<ActionId>,
}

impl Action {
    pub fn new(id: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            id: ActionId::new(id),
            kind,
            parameters: Map::new(),
            depends_on: Vec::new(),
            retry: RetryPolicy::default(),
            timeout_ms: None,
            on_success: None,
            on_failure: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        if let Value::Object(map) = parameters {
            self.parameters = map;
        }
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(ActionId::new(id));
        self
    }

    pub fn with_retry(mut self, max_retries: u32, delay_ms: u64) -> Self {
        self.retry = RetryPolicy {
            max_retries,
            delay_ms,
            backoff: Backoff::Fixed,
        };
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn on_failure(mut self, id: impl Into<String>) -> Self {
        self.on_failure = Some(ActionId::new(id));
        self
    }

    pub fn on_success(mut self, id: impl Into<String>) -> Self {
        self.on_success = Some(ActionId::new(id));
        self
    }
}

/// Retry policy for an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: default_retry_delay_ms(),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the attempt following `failed_attempt` (1-based)
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let millis = match self.backoff {
            Backoff::Fixed => self.delay_ms,
            Backoff::Exponential => {
                let shift = failed_attempt.saturating_sub(1).min(16);
                self.delay_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Status of one action within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Skipped
        )
    }
}

/// Per-run state of one action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionState {
    pub status: ActionStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl Default for ActionState {
    fn default() -> Self {
        Self {
            status: ActionStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            skip_reason: None,
        }
    }
}

/// One failed attempt of an action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionErrorRecord {
    pub action_id: ActionId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchOutcome {
    Success,
    Failure,
}

/// An on_success / on_failure hint that was taken during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRecord {
    pub from: ActionId,
    pub to: ActionId,
    pub outcome: BranchOutcome,
    pub at: DateTime<Utc>,
}

/// One run of a workflow template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub trigger_data: Value,
    /// Effective variables: template defaults merged with run overrides
    pub variables: Map<String, Value>,
    pub results: HashMap<ActionId, Value>,
    pub action_states: HashMap<ActionId, ActionState>,
    pub errors: Vec<ActionErrorRecord>,
    pub branches: Vec<BranchRecord>,
}

impl Execution {
    pub fn new(
        workflow_id: WorkflowId,
        trigger_data: Value,
        variables: Map<String, Value>,
        action_ids: impl IntoIterator<Item = ActionId>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow_id,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            trigger_data,
            variables,
            results: HashMap::new(),
            action_states: action_ids
                .into_iter()
                .map(|id| (id, ActionState::default()))
                .collect(),
            errors: Vec::new(),
            branches: Vec::new(),
        }
    }

    pub fn actions_with_status(&self, status: ActionStatus) -> Vec<ActionId> {
        let mut ids: Vec<ActionId> = self
            .action_states
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn metrics(&self) -> ExecutionMetrics {
        let count = |status| {
            self.action_states
                .values()
                .filter(|s| s.status == status)
                .count()
        };

        ExecutionMetrics {
            duration_ms: match (self.started_at, self.completed_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                _ => None,
            },
            succeeded: count(ActionStatus::Completed),
            failed: count(ActionStatus::Failed),
            skipped: count(ActionStatus::Skipped),
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        let metrics = self.metrics();
        let outcome = match self.status {
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Paused => {
                ExecutionOutcome::InProgress
            }
            ExecutionStatus::Completed => ExecutionOutcome::Succeeded,
            ExecutionStatus::Failed => ExecutionOutcome::CompletedWithFailures {
                failed_actions: metrics.failed,
            },
            ExecutionStatus::Cancelled => ExecutionOutcome::Cancelled,
        };

        ExecutionSummary {
            execution_id: self.id,
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            outcome,
            completed: self.actions_with_status(ActionStatus::Completed),
            failed: self.actions_with_status(ActionStatus::Failed),
            skipped: self.actions_with_status(ActionStatus::Skipped),
            running: self.actions_with_status(ActionStatus::Running),
            pending: self.actions_with_status(ActionStatus::Pending),
            errors: self.errors.clone(),
            metrics,
        }
    }
}

/// Derived counters for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub duration_ms: Option<i64>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    InProgress,
    Succeeded,
    CompletedWithFailures { failed_actions: usize },
    Cancelled,
}

/// Point-in-time view of a run returned by status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub outcome: ExecutionOutcome,
    pub completed: Vec<ActionId>,
    pub failed: Vec<ActionId>,
    pub skipped: Vec<ActionId>,
    pub running: Vec<ActionId>,
    pub pending: Vec<ActionId>,
    pub errors: Vec<ActionErrorRecord>,
    pub metrics: ExecutionMetrics,
}
