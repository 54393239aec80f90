use super::MonitorContext;
use crate::types::{Comparator, TriggerId, WorkflowId};
use anyhow::Result;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a polling monitor watches
#[derive(Debug, Clone)]
pub(crate) enum PollTarget {
    Metric {
        metric: String,
        comparator: Comparator,
        threshold: f64,
    },
    Trending {
        query: String,
        score_threshold: f64,
    },
}

impl PollTarget {
    /// Sample the collaborator. Returns whether the condition holds and the
    /// trigger data to fire with if it does.
    async fn sample(&self, ctx: &MonitorContext, trigger_id: &TriggerId) -> Result<(bool, Value)> {
        match self {
            PollTarget::Metric {
                metric,
                comparator,
                threshold,
            } => {
                let value = ctx.metrics.current_value(metric).await?;
                Ok((
                    comparator.evaluate(value, *threshold),
                    json!({
                        "trigger": "performance_threshold",
                        "trigger_id": trigger_id,
                        "metric": metric,
                        "value": value,
                        "comparator": comparator,
                        "threshold": threshold,
                    }),
                ))
            }
            PollTarget::Trending {
                query,
                score_threshold,
            } => {
                let score = ctx.trending.top_score(query).await?;
                Ok((
                    score >= *score_threshold,
                    json!({
                        "trigger": "external_signal",
                        "trigger_id": trigger_id,
                        "source_query": query,
                        "score": score,
                        "threshold": score_threshold,
                    }),
                ))
            }
        }
    }
}

/// Reports false→true transitions of a polled condition.
///
/// The first observation counts as a transition when it is true. A condition
/// that stays true fires once; it must go false before it can fire again.
#[derive(Debug, Default, Clone, Copy)]
pub struct EdgeDetector {
    previous: bool,
}

impl EdgeDetector {
    pub fn observe(&mut self, holds: bool) -> bool {
        let rising = holds && !self.previous;
        self.previous = holds;
        rising
    }
}

/// Poll every `interval`, firing on rising edges. Collaborator errors back
/// off exponentially and leave the edge state untouched.
pub(crate) async fn run(
    ctx: MonitorContext,
    workflow_id: WorkflowId,
    trigger_id: TriggerId,
    target: PollTarget,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut edge = EdgeDetector::default();
    let mut failures: u32 = 0;

    loop {
        let sampled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sampled = target.sample(&ctx, &trigger_id) => sampled,
        };

        let delay = match sampled {
            Ok((holds, data)) => {
                if failures > 0 {
                    tracing::info!(
                        workflow_id = %workflow_id,
                        trigger_id = %trigger_id,
                        failures,
                        "Trigger source recovered"
                    );
                }
                failures = 0;

                if edge.observe(holds) {
                    tracing::info!(
                        workflow_id = %workflow_id,
                        trigger_id = %trigger_id,
                        "Trigger condition met"
                    );
                    if !ctx.fire(&workflow_id, &trigger_id, data).await {
                        return;
                    }
                }
                interval
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = ctx.backoff.delay(failures);
                tracing::warn!(
                    workflow_id = %workflow_id,
                    trigger_id = %trigger_id,
                    failures,
                    "Trigger source unavailable, retrying in {:?}: {:#}",
                    delay,
                    e
                );
                delay
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
