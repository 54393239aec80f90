use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on actions running at once within a single execution
    #[serde(default = "default_max_concurrent_actions")]
    pub max_concurrent_actions: usize,

    /// Deadline for actions that do not set `timeout_ms`
    #[serde(default = "default_action_timeout_ms")]
    pub default_action_timeout_ms: u64,

    /// Refuse to start a run while another run of the same workflow is active
    #[serde(default)]
    pub single_flight: bool,

    /// Publish `workflow.completed` / `workflow.failed` / `workflow.cancelled`
    /// on the event bus when a run finishes
    #[serde(default = "default_publish_completion_events")]
    pub publish_completion_events: bool,

    #[serde(default = "default_monitor_backoff_base_ms")]
    pub monitor_backoff_base_ms: u64,

    #[serde(default = "default_monitor_backoff_max_ms")]
    pub monitor_backoff_max_ms: u64,
}

fn default_max_concurrent_actions() -> usize {
    8
}

fn default_action_timeout_ms() -> u64 {
    30_000
}

fn default_publish_completion_events() -> bool {
    true
}

fn default_monitor_backoff_base_ms() -> u64 {
    1_000
}

fn default_monitor_backoff_max_ms() -> u64 {
    60_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_actions: default_max_concurrent_actions(),
            default_action_timeout_ms: default_action_timeout_ms(),
            single_flight: false,
            publish_completion_events: default_publish_completion_events(),
            monitor_backoff_base_ms: default_monitor_backoff_base_ms(),
            monitor_backoff_max_ms: default_monitor_backoff_max_ms(),
        }
    }
}

impl EngineConfig {
    pub fn default_action_timeout(&self) -> Duration {
        Duration::from_millis(self.default_action_timeout_ms)
    }

    pub fn monitor_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.monitor_backoff_base_ms),
            max: Duration::from_millis(self.monitor_backoff_max_ms),
        }
    }
}

/// Capped exponential backoff used by polling monitors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay after `failures` consecutive errors (1-based)
    pub fn delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}
