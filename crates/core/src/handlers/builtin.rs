use super::{ActionContext, ActionHandler, HandlerRegistry};
use crate::collaborators::{Analytics, CampaignManager, CampaignStatus, Collaborators, ContentGenerator, Notifier};
use crate::types::ActionKind;
use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Register handlers for every built-in action kind
pub fn register_builtin_handlers(registry: &mut HandlerRegistry, collaborators: &Collaborators) {
    registry.register(
        ActionKind::CreateCampaign,
        Arc::new(CreateCampaignHandler {
            campaigns: collaborators.campaigns.clone(),
        }),
    );

    let campaign_ops = [
        (ActionKind::UpdateCampaign, CampaignOp::Update),
        (ActionKind::PauseCampaign, CampaignOp::Pause),
        (ActionKind::ResumeCampaign, CampaignOp::Resume),
        (ActionKind::ScaleCampaign, CampaignOp::Scale),
        (ActionKind::CloneCampaign, CampaignOp::Clone),
    ];
    for (kind, op) in campaign_ops {
        registry.register(
            kind,
            Arc::new(CampaignHandler {
                campaigns: collaborators.campaigns.clone(),
                op,
            }),
        );
    }

    registry.register(
        ActionKind::GenerateContent,
        Arc::new(ContentHandler {
            content: collaborators.content.clone(),
        }),
    );

    let analytics_ops = [
        (ActionKind::RunExperiment, AnalyticsOp::Experiment),
        (ActionKind::OptimizeTargeting, AnalyticsOp::Targeting),
        (ActionKind::ExportReport, AnalyticsOp::Report),
    ];
    for (kind, op) in analytics_ops {
        registry.register(
            kind,
            Arc::new(AnalyticsHandler {
                analytics: collaborators.analytics.clone(),
                op,
            }),
        );
    }

    registry.register(
        ActionKind::Notify,
        Arc::new(NotifyHandler {
            notifier: collaborators.notifier.clone(),
        }),
    );
}

struct CreateCampaignHandler {
    campaigns: Arc<dyn CampaignManager>,
}

#[async_trait::async_trait]
impl ActionHandler for CreateCampaignHandler {
    async fn handle(&self, parameters: Map<String, Value>, _ctx: &ActionContext) -> Result<Map<String, Value>> {
        self.campaigns.create(parameters).await
    }
}

/// Operations on an existing campaign, addressed by `campaign_id`
#[derive(Debug, Clone, Copy)]
enum CampaignOp {
    Update,
    Pause,
    Resume,
    Scale,
    Clone,
}

struct CampaignHandler {
    campaigns: Arc<dyn CampaignManager>,
    op: CampaignOp,
}

#[async_trait::async_trait]
impl ActionHandler for CampaignHandler {
    async fn handle(&self, mut parameters: Map<String, Value>, ctx: &ActionContext) -> Result<Map<String, Value>> {
        tracing::debug!(
            execution_id = %ctx.execution_id,
            action_id = %ctx.action_id,
            op = ?self.op,
            "Dispatching campaign operation"
        );

        let campaign_id = required_str(&parameters, "campaign_id")?;

        match self.op {
            CampaignOp::Update => {
                parameters.remove("campaign_id");
                self.campaigns.update(&campaign_id, parameters).await
            }
            CampaignOp::Pause => self.campaigns.set_status(&campaign_id, CampaignStatus::Paused).await,
            CampaignOp::Resume => self.campaigns.set_status(&campaign_id, CampaignStatus::Active).await,
            CampaignOp::Scale => {
                let factor = parameters
                    .get("factor")
                    .and_then(as_number)
                    .ok_or_else(|| anyhow!("Missing numeric parameter 'factor'"))?;
                self.campaigns.scale(&campaign_id, factor).await
            }
            CampaignOp::Clone => {
                let overrides = match parameters.remove("overrides") {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                self.campaigns.clone_campaign(&campaign_id, overrides).await
            }
        }
    }
}

struct ContentHandler {
    content: Arc<dyn ContentGenerator>,
}

#[async_trait::async_trait]
impl ActionHandler for ContentHandler {
    async fn handle(&self, parameters: Map<String, Value>, _ctx: &ActionContext) -> Result<Map<String, Value>> {
        self.content.generate(parameters).await
    }
}

#[derive(Debug, Clone, Copy)]
enum AnalyticsOp {
    Experiment,
    Targeting,
    Report,
}

struct AnalyticsHandler {
    analytics: Arc<dyn Analytics>,
    op: AnalyticsOp,
}

#[async_trait::async_trait]
impl ActionHandler for AnalyticsHandler {
    async fn handle(&self, parameters: Map<String, Value>, _ctx: &ActionContext) -> Result<Map<String, Value>> {
        match self.op {
            AnalyticsOp::Experiment => self.analytics.run_experiment(parameters).await,
            AnalyticsOp::Targeting => self.analytics.optimize_targeting(parameters).await,
            AnalyticsOp::Report => self.analytics.export_report(parameters).await,
        }
    }
}

struct NotifyHandler {
    notifier: Arc<dyn Notifier>,
}

#[async_trait::async_trait]
impl ActionHandler for NotifyHandler {
    async fn handle(&self, parameters: Map<String, Value>, ctx: &ActionContext) -> Result<Map<String, Value>> {
        let message = required_str(&parameters, "message")?;
        let channel = parameters
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();
        let payload = json!({
            "workflow_id": ctx.workflow_id,
            "execution_id": ctx.execution_id,
            "data": parameters.get("data").cloned().unwrap_or(Value::Null),
        });

        self.notifier.notify(&channel, &message, &payload).await?;

        let mut out = Map::new();
        out.insert("channel".to_string(), json!(channel));
        out.insert("delivered".to_string(), json!(true));
        Ok(out)
    }
}

fn required_str(parameters: &Map<String, Value>, key: &str) -> Result<String> {
    match parameters.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(anyhow!("Missing parameter '{}'", key)),
    }
}

// Numbers may arrive as strings after placeholder splicing
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryCampaigns, LogNotifier, StaticAnalytics, TemplateContentGenerator};
    use crate::types::{ActionId, ExecutionId, WorkflowId};
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ActionContext {
        ActionContext {
            execution_id: ExecutionId::new(),
            workflow_id: WorkflowId::new("wf"),
            action_id: ActionId::new("act"),
            attempt: 1,
            trigger_data: Value::Null,
            results: HashMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn registry_with(campaigns: Arc<InMemoryCampaigns>, notifier: Arc<LogNotifier>) -> HandlerRegistry {
        let collaborators = Collaborators {
            campaigns,
            content: Arc::new(TemplateContentGenerator),
            analytics: Arc::new(StaticAnalytics),
            notifier,
        };
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry, &collaborators);
        registry
    }

    #[test]
    fn test_all_builtin_kinds_registered() {
        let registry = registry_with(Arc::new(InMemoryCampaigns::new()), Arc::new(LogNotifier::new()));
        assert_eq!(registry.kinds().len(), 11);
        assert!(registry.contains(&ActionKind::ExportReport));
    }

    #[tokio::test]
    async fn test_create_then_scale_campaign() {
        let campaigns = Arc::new(InMemoryCampaigns::new());
        let registry = registry_with(campaigns.clone(), Arc::new(LogNotifier::new()));

        let create = registry.get(&ActionKind::CreateCampaign).unwrap();
        let created = create
            .handle(params(json!({ "name": "Launch", "budget": 200 })), &ctx())
            .await
            .unwrap();
        let id = created["campaign_id"].as_str().unwrap().to_string();

        let scale = registry.get(&ActionKind::ScaleCampaign).unwrap();
        let scaled = scale
            .handle(params(json!({ "campaign_id": id, "factor": "0.5" })), &ctx())
            .await
            .unwrap();
        assert_eq!(scaled["budget"], json!(100.0));
    }

    #[tokio::test]
    async fn test_pause_requires_campaign_id() {
        let registry = registry_with(Arc::new(InMemoryCampaigns::new()), Arc::new(LogNotifier::new()));
        let pause = registry.get(&ActionKind::PauseCampaign).unwrap();
        let err = pause.handle(Map::new(), &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("campaign_id"));
    }

    #[tokio::test]
    async fn test_notify_goes_to_notifier() {
        let notifier = Arc::new(LogNotifier::new());
        let registry = registry_with(Arc::new(InMemoryCampaigns::new()), notifier.clone());

        let notify = registry.get(&ActionKind::Notify).unwrap();
        notify
            .handle(params(json!({ "channel": "slack", "message": "Budget scaled" })), &ctx())
            .await
            .unwrap();

        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "slack");
        assert_eq!(sent[0].message, "Budget scaled");
    }
}
