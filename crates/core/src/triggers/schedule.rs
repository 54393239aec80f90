use super::MonitorContext;
use crate::error::{EngineError, EngineResult};
use crate::types::{TriggerId, WorkflowId};
use cron::Schedule;
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Parse a cron expression.
///
/// Accepts the classic 5-field form (minute first) as well as the 6/7-field
/// form with leading seconds and optional trailing year. All times are UTC.
pub fn parse_schedule(expr: &str) -> EngineResult<Schedule> {
    let trimmed = expr.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {}", trimmed),
        6 | 7 => trimmed.to_string(),
        n => {
            return Err(EngineError::InvalidWorkflow(format!(
                "cron expression '{}' has {} fields, expected 5, 6 or 7",
                expr, n
            )))
        }
    };

    Schedule::from_str(&normalized).map_err(|e| {
        EngineError::InvalidWorkflow(format!("invalid cron expression '{}': {}", expr, e))
    })
}

/// Sleep until each upcoming time of the schedule and fire.
///
/// Ticks missed while a fire was being delivered are skipped rather than
/// replayed.
pub(crate) async fn run(
    ctx: MonitorContext,
    workflow_id: WorkflowId,
    trigger_id: TriggerId,
    schedule: Schedule,
    cancel: CancellationToken,
) {
    let mut cursor = ctx.clock.now();

    loop {
        let Some(next) = schedule.after(&cursor).next() else {
            tracing::info!(
                workflow_id = %workflow_id,
                trigger_id = %trigger_id,
                "Schedule has no upcoming times, stopping monitor"
            );
            return;
        };

        let wait = (next - ctx.clock.now()).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!(
            workflow_id = %workflow_id,
            trigger_id = %trigger_id,
            next = %next,
            "Waiting for next scheduled run"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        tracing::info!(
            workflow_id = %workflow_id,
            trigger_id = %trigger_id,
            scheduled_for = %next,
            "Scheduled trigger fired"
        );

        let data = json!({
            "trigger": "scheduled",
            "trigger_id": trigger_id,
            "scheduled_for": next,
        });
        if !ctx.fire(&workflow_id, &trigger_id, data).await {
            return;
        }

        cursor = next.max(ctx.clock.now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::test_support::harness;
    use crate::triggers::TriggerMonitors;
    use crate::types::{Trigger, TriggerCondition};
    use chrono::{TimeZone, Timelike, Utc};

    #[test]
    fn test_five_field_expression() {
        let schedule = parse_schedule("30 9 * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let next = schedule.after(&start).next().unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (9, 30, 0));
    }

    #[test]
    fn test_six_field_expression() {
        let schedule = parse_schedule("*/10 * * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 1).unwrap();
        let next = schedule.after(&start).next().unwrap();
        assert_eq!(next.second(), 10);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(
            parse_schedule("* * *"),
            Err(EngineError::InvalidWorkflow(_))
        ));
        assert!(matches!(
            parse_schedule("61 * * * *"),
            Err(EngineError::InvalidWorkflow(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_each_tick_until_stopped() {
        let mut h = harness();
        let monitors = TriggerMonitors::new(h.context.clone());
        let wf = WorkflowId::new("wf");
        let trigger = Trigger::new(
            "every_minute",
            TriggerCondition::Scheduled {
                cron: "* * * * *".to_string(),
            },
        );
        monitors.start(&wf, &trigger).await.unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;
        let mut fired = Vec::new();
        while let Ok(fire) = h.fires.try_recv() {
            fired.push(fire);
        }
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].2["trigger"], json!("scheduled"));
        assert!(fired[0].2["scheduled_for"].is_string());

        monitors.stop(&wf, &trigger.id).await;
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(h.fires.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exits_when_sink_dropped() {
        let h = harness();
        let monitors = TriggerMonitors::new(h.context.clone());
        let wf = WorkflowId::new("wf");
        let trigger = Trigger::new(
            "tick",
            TriggerCondition::Scheduled {
                cron: "* * * * * *".to_string(),
            },
        );
        monitors.start(&wf, &trigger).await.unwrap();
        drop(h.sink);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!monitors.is_running(&wf, &trigger.id).await);
    }
}
