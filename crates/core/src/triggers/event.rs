use super::MonitorContext;
use crate::events::{event_handler, Event};
use crate::types::{TriggerId, WorkflowId};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Subscribe to the event and spawn the task that owns the subscription.
///
/// The subscription is in place before this returns, so events published
/// right after registration are not missed. Cancelling the token drops it.
pub(crate) async fn start(
    ctx: &MonitorContext,
    workflow_id: WorkflowId,
    trigger_id: TriggerId,
    event_name: &str,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let handler = {
        let sink = ctx.sink.clone();
        let workflow_id = workflow_id.clone();
        let trigger_id = trigger_id.clone();
        let cancel = cancel.clone();

        event_handler(move |event: Event| {
            let sink = sink.clone();
            let workflow_id = workflow_id.clone();
            let trigger_id = trigger_id.clone();
            let cancel = cancel.clone();

            async move {
                // Deliveries already in flight when the monitor stopped
                if cancel.is_cancelled() {
                    return;
                }
                let Some(sink) = sink.upgrade() else {
                    return;
                };

                tracing::info!(
                    workflow_id = %workflow_id,
                    trigger_id = %trigger_id,
                    event = %event.name,
                    "Event trigger fired"
                );

                let data = json!({
                    "trigger": "event",
                    "trigger_id": trigger_id,
                    "name": event.name,
                    "payload": event.payload,
                    "event_id": event.id,
                });
                sink.fire(&workflow_id, &trigger_id, data).await;
            }
        })
    };

    let bus = ctx.event_bus.clone();
    let subscription = bus.subscribe(event_name, handler).await;

    tokio::spawn(async move {
        cancel.cancelled().await;
        bus.unsubscribe(subscription).await;
        tracing::debug!(
            workflow_id = %workflow_id,
            trigger_id = %trigger_id,
            subscription = %subscription,
            "Event trigger unsubscribed"
        );
    })
}

#[cfg(test)]
mod tests {
    use crate::triggers::test_support::harness;
    use crate::triggers::TriggerMonitors;
    use crate::types::{Trigger, TriggerCondition, WorkflowId};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_event_fires_with_payload() {
        let mut h = harness();
        let monitors = TriggerMonitors::new(h.context.clone());
        let wf = WorkflowId::new("wf");
        let trigger = Trigger::new(
            "on_upload",
            TriggerCondition::Event {
                event_name: "new_creative_uploaded".to_string(),
            },
        );
        monitors.start(&wf, &trigger).await.unwrap();

        h.context
            .event_bus
            .publish("unrelated", json!({}))
            .await;
        h.context
            .event_bus
            .publish("new_creative_uploaded", json!({ "creative_id": "cr_42" }))
            .await;

        let (fired_wf, _, data) = tokio::time::timeout(Duration::from_secs(1), h.fires.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fired_wf, wf);
        assert_eq!(data["name"], json!("new_creative_uploaded"));
        assert_eq!(data["payload"]["creative_id"], json!("cr_42"));
        assert!(h.fires.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_unsubscribes() {
        let mut h = harness();
        let monitors = TriggerMonitors::new(h.context.clone());
        let wf = WorkflowId::new("wf");
        let trigger = Trigger::new(
            "on_upload",
            TriggerCondition::Event {
                event_name: "new_creative_uploaded".to_string(),
            },
        );
        monitors.start(&wf, &trigger).await.unwrap();
        assert!(monitors.stop(&wf, &trigger.id).await);

        assert_eq!(
            h.context
                .event_bus
                .subscriber_count("new_creative_uploaded")
                .await,
            0
        );
        assert_eq!(
            h.context
                .event_bus
                .publish("new_creative_uploaded", json!({}))
                .await,
            0
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.fires.try_recv().is_err());
    }
}
