// Action handler registry
//
// Action kinds are dispatched through registered `ActionHandler`s, so adding a
// kind means registering a handler rather than touching the executor.

pub mod builtin;

use crate::types::{ActionId, ActionKind, ExecutionId, WorkflowId};
use anyhow::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use builtin::register_builtin_handlers;

/// Context handed to a handler for one attempt of one action
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub action_id: ActionId,
    pub attempt: u32,
    pub trigger_data: Value,
    /// Results of actions that completed earlier in the same run
    pub results: HashMap<ActionId, Value>,
    /// Cancelled when the run is cancelled; honouring it is best-effort
    pub cancellation: CancellationToken,
}

impl ActionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Executes one kind of action against an external collaborator
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, parameters: Map<String, Value>, ctx: &ActionContext) -> Result<Map<String, Value>>;
}

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>, ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Map<String, Value>>> + Send + 'static,
{
    async fn handle(&self, parameters: Map<String, Value>, ctx: &ActionContext) -> Result<Map<String, Value>> {
        (self.0)(parameters, ctx.clone()).await
    }
}

/// Wrap an async closure as an action handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActionHandler>
where
    F: Fn(Map<String, Value>, ActionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Map<String, Value>>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Maps action kinds to their handlers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous handler for the kind
    pub fn register(&mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) {
        if self.handlers.insert(kind.clone(), handler).is_some() {
            tracing::debug!(kind = %kind, "Replaced action handler");
        }
    }

    pub fn get(&self, kind: &ActionKind) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &ActionKind) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<ActionKind> = self.handlers.keys().cloned().collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context() -> ActionContext {
        ActionContext {
            execution_id: ExecutionId::new(),
            workflow_id: WorkflowId::new("wf"),
            action_id: ActionId::new("a"),
            attempt: 1,
            trigger_data: Value::Null,
            results: HashMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_dispatch_custom_kind() {
        let mut registry = HandlerRegistry::new();
        let kind = ActionKind::Custom("sync_crm".to_string());
        registry.register(
            kind.clone(),
            handler_fn(|params, ctx| async move {
                let mut out = Map::new();
                out.insert("echo".to_string(), Value::Object(params));
                out.insert("attempt".to_string(), json!(ctx.attempt));
                Ok(out)
            }),
        );

        assert!(registry.contains(&kind));
        assert!(!registry.contains(&ActionKind::Notify));

        let handler = registry.get(&kind).unwrap();
        let mut params = Map::new();
        params.insert("list".to_string(), json!("vip"));
        let result = handler.handle(params, &test_context()).await.unwrap();

        assert_eq!(result["echo"], json!({ "list": "vip" }));
        assert_eq!(result["attempt"], json!(1));
    }
}
