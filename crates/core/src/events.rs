use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Event names published by the engine when a run finishes
pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
pub const WORKFLOW_FAILED: &str = "workflow.failed";
pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";

/// A named payload broadcast through the [`EventBus`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            payload,
            emitted_at: Utc::now(),
        }
    }
}

/// Receives events for the names it subscribed to
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event);
}

struct FnEventHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> EventHandler for FnEventHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, event: Event) {
        (self.0)(event).await
    }
}

/// Wrap an async closure as an event handler
pub fn event_handler<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnEventHandler(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

/// In-memory publish/subscribe bus.
///
/// Delivery is best-effort and at-most-once: each handler runs on its own
/// task, the publisher never waits for it, and subscribers that join after a
/// publish never see that event.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, name: impl Into<String>, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let name = name.into();
        let id = SubscriptionId(Uuid::new_v4());

        self.subscribers
            .write()
            .await
            .entry(name.clone())
            .or_default()
            .push(Subscription { id, handler });

        tracing::debug!(event = %name, subscription = %id, "Subscribed to event");
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let mut removed = false;

        subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
            !subs.is_empty()
        });

        removed
    }

    /// Hand the event to every current subscriber. Returns how many were notified.
    pub async fn publish(&self, name: impl Into<String>, payload: Value) -> usize {
        let event = Event::new(name, payload);

        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .get(&event.name)
                .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default()
        };

        tracing::debug!(
            event = %event.name,
            event_id = %event.id,
            subscribers = handlers.len(),
            "Publishing event"
        );

        for handler in &handlers {
            let handler = handler.clone();
            let event = event.clone();
            tokio::spawn(async move {
                handler.handle(event).await;
            });
        }

        handlers.len()
    }

    pub async fn subscriber_count(&self, name: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn forwarding_handler(tx: mpsc::UnboundedSender<Event>) -> Arc<dyn EventHandler> {
        event_handler(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe("creative.uploaded", forwarding_handler(tx.clone())).await;
        bus.subscribe("creative.uploaded", forwarding_handler(tx.clone())).await;
        bus.subscribe("budget.exhausted", forwarding_handler(tx)).await;

        let notified = bus.publish("creative.uploaded", json!({ "asset": "hero.mp4" })).await;
        assert_eq!(notified, 2);

        for _ in 0..2 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.name, "creative.uploaded");
            assert_eq!(event.payload["asset"], json!("hero.mp4"));
        }
    }

    #[tokio::test]
    async fn test_unsubscribed_handler_not_called() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = bus.subscribe("ping", forwarding_handler(tx)).await;
        assert!(bus.unsubscribe(id).await);
        assert!(!bus.unsubscribe(id).await);
        assert_eq!(bus.subscriber_count("ping").await, 0);

        assert_eq!(bus.publish("ping", Value::Null).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_publisher() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        bus.subscribe(
            "tick",
            event_handler(|_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }),
        )
        .await;
        bus.subscribe("tick", forwarding_handler(tx)).await;

        let published = tokio::time::timeout(Duration::from_secs(1), bus.publish("tick", Value::Null)).await;
        assert_eq!(published.unwrap(), 2);

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(event.unwrap().name, "tick");
    }
}
