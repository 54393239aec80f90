//! Interfaces to the systems the engine drives but does not own: campaign
//! management, content generation, analytics, notifications, and the data
//! sources polled by threshold triggers.
//!
//! The in-memory implementations back the default server and the tests.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Lifecycle status of a managed campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignStatus {
    Active,
    Paused,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
        }
    }
}

#[async_trait::async_trait]
pub trait CampaignManager: Send + Sync {
    async fn create(&self, spec: Map<String, Value>) -> Result<Map<String, Value>>;
    async fn update(&self, campaign_id: &str, changes: Map<String, Value>) -> Result<Map<String, Value>>;
    async fn set_status(&self, campaign_id: &str, status: CampaignStatus) -> Result<Map<String, Value>>;
    async fn scale(&self, campaign_id: &str, factor: f64) -> Result<Map<String, Value>>;
    async fn clone_campaign(&self, campaign_id: &str, overrides: Map<String, Value>) -> Result<Map<String, Value>>;
}

#[async_trait::async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: Map<String, Value>) -> Result<Map<String, Value>>;
}

#[async_trait::async_trait]
pub trait Analytics: Send + Sync {
    async fn run_experiment(&self, params: Map<String, Value>) -> Result<Map<String, Value>>;
    async fn optimize_targeting(&self, params: Map<String, Value>) -> Result<Map<String, Value>>;
    async fn export_report(&self, params: Map<String, Value>) -> Result<Map<String, Value>>;
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: &str, message: &str, payload: &Value) -> Result<()>;
}

/// Source of current performance metrics for threshold triggers
#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    async fn current_value(&self, metric: &str) -> Result<f64>;
}

/// Source of trending scores for external-signal triggers
#[async_trait::async_trait]
pub trait TrendingSource: Send + Sync {
    async fn top_score(&self, query: &str) -> Result<f64>;
}

/// Bundle of collaborators used by the built-in handlers
#[derive(Clone)]
pub struct Collaborators {
    pub campaigns: Arc<dyn CampaignManager>,
    pub content: Arc<dyn ContentGenerator>,
    pub analytics: Arc<dyn Analytics>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    pub fn in_memory() -> Self {
        Self {
            campaigns: Arc::new(InMemoryCampaigns::new()),
            content: Arc::new(TemplateContentGenerator),
            analytics: Arc::new(StaticAnalytics),
            notifier: Arc::new(LogNotifier::new()),
        }
    }
}

/// Campaign store kept in process memory
#[derive(Default)]
pub struct InMemoryCampaigns {
    campaigns: RwLock<HashMap<String, Map<String, Value>>>,
}

impl InMemoryCampaigns {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, campaign_id: &str) -> Option<Map<String, Value>> {
        self.campaigns.read().await.get(campaign_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.campaigns.read().await.len()
    }

    async fn modify<F>(&self, campaign_id: &str, f: F) -> Result<Map<String, Value>>
    where
        F: FnOnce(&mut Map<String, Value>) -> Result<()>,
    {
        let mut campaigns = self.campaigns.write().await;
        let campaign = campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| anyhow!("Campaign {} not found", campaign_id))?;
        f(campaign)?;
        campaign.insert("updated_at".to_string(), json!(Utc::now()));
        Ok(campaign.clone())
    }
}

#[async_trait::async_trait]
impl CampaignManager for InMemoryCampaigns {
    async fn create(&self, mut spec: Map<String, Value>) -> Result<Map<String, Value>> {
        let campaign_id = format!("cmp_{}", uuid::Uuid::new_v4().simple());
        spec.insert("campaign_id".to_string(), json!(campaign_id));
        spec.insert("status".to_string(), json!(CampaignStatus::Active.as_str()));
        spec.insert("created_at".to_string(), json!(Utc::now()));

        self.campaigns
            .write()
            .await
            .insert(campaign_id.clone(), spec.clone());

        tracing::info!(campaign_id = %campaign_id, "Created campaign");
        Ok(spec)
    }

    async fn update(&self, campaign_id: &str, changes: Map<String, Value>) -> Result<Map<String, Value>> {
        self.modify(campaign_id, |campaign| {
            for (key, value) in changes {
                if key != "campaign_id" {
                    campaign.insert(key, value);
                }
            }
            Ok(())
        })
        .await
    }

    async fn set_status(&self, campaign_id: &str, status: CampaignStatus) -> Result<Map<String, Value>> {
        self.modify(campaign_id, |campaign| {
            campaign.insert("status".to_string(), json!(status.as_str()));
            Ok(())
        })
        .await
    }

    async fn scale(&self, campaign_id: &str, factor: f64) -> Result<Map<String, Value>> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(anyhow!("Scale factor must be positive, got {}", factor));
        }

        self.modify(campaign_id, |campaign| {
            let budget = campaign
                .get("budget")
                .and_then(Value::as_f64)
                .ok_or_else(|| anyhow!("Campaign {} has no numeric budget", campaign_id))?;
            campaign.insert("budget".to_string(), json!(budget * factor));
            Ok(())
        })
        .await
    }

    async fn clone_campaign(&self, campaign_id: &str, overrides: Map<String, Value>) -> Result<Map<String, Value>> {
        let mut copy = self
            .get(campaign_id)
            .await
            .ok_or_else(|| anyhow!("Campaign {} not found", campaign_id))?;
        copy.insert("cloned_from".to_string(), json!(campaign_id));
        copy.extend(overrides);
        self.create(copy).await
    }
}

/// Produces placeholder creative descriptors from the request fields
pub struct TemplateContentGenerator;

#[async_trait::async_trait]
impl ContentGenerator for TemplateContentGenerator {
    async fn generate(&self, request: Map<String, Value>) -> Result<Map<String, Value>> {
        let product = request
            .get("product")
            .and_then(Value::as_str)
            .unwrap_or("product");
        let format = request
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("video");

        let mut out = Map::new();
        out.insert(
            "content_id".to_string(),
            json!(format!("cnt_{}", uuid::Uuid::new_v4().simple())),
        );
        out.insert("format".to_string(), json!(format));
        out.insert("headline".to_string(), json!(format!("Discover {}", product)));
        Ok(out)
    }
}

/// Deterministic analytics answers, enough to drive workflows end to end
pub struct StaticAnalytics;

#[async_trait::async_trait]
impl Analytics for StaticAnalytics {
    async fn run_experiment(&self, params: Map<String, Value>) -> Result<Map<String, Value>> {
        let variants = params
            .get("variants")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_else(|| vec![json!("A"), json!("B")]);
        let winner = variants
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("Experiment needs at least one variant"))?;

        let mut out = Map::new();
        out.insert(
            "experiment_id".to_string(),
            json!(format!("exp_{}", uuid::Uuid::new_v4().simple())),
        );
        out.insert("variants".to_string(), Value::Array(variants));
        out.insert("winner".to_string(), winner);
        Ok(out)
    }

    async fn optimize_targeting(&self, params: Map<String, Value>) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        out.insert(
            "campaign_id".to_string(),
            params.get("campaign_id").cloned().unwrap_or(Value::Null),
        );
        out.insert("audiences".to_string(), json!(["lookalike_1pct", "engaged_30d"]));
        out.insert("expected_lift".to_string(), json!(0.12));
        Ok(out)
    }

    async fn export_report(&self, params: Map<String, Value>) -> Result<Map<String, Value>> {
        let format = params
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("csv");

        let mut out = Map::new();
        out.insert(
            "report_id".to_string(),
            json!(format!("rpt_{}", uuid::Uuid::new_v4().simple())),
        );
        out.insert("format".to_string(), json!(format));
        out.insert("generated_at".to_string(), json!(Utc::now()));
        Ok(out)
    }
}

/// A notification that went through [`LogNotifier`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub channel: String,
    pub message: String,
    pub payload: Value,
}

/// Logs notifications and keeps them for inspection
#[derive(Default)]
pub struct LogNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel: &str, message: &str, payload: &Value) -> Result<()> {
        tracing::info!(channel = %channel, "Notification: {}", message);
        self.sent.lock().await.push(SentNotification {
            channel: channel.to_string(),
            message: message.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

/// Metric values set by hand; unknown metrics are an error
#[derive(Default)]
pub struct StaticMetricsSource {
    values: RwLock<HashMap<String, f64>>,
}

impl StaticMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, metric: impl Into<String>, value: f64) {
        self.values.write().await.insert(metric.into(), value);
    }

    pub async fn clear(&self, metric: &str) {
        self.values.write().await.remove(metric);
    }
}

#[async_trait::async_trait]
impl MetricsSource for StaticMetricsSource {
    async fn current_value(&self, metric: &str) -> Result<f64> {
        self.values
            .read()
            .await
            .get(metric)
            .copied()
            .ok_or_else(|| anyhow!("Metric {} unavailable", metric))
    }
}

/// Trending scores set by hand; unknown queries are an error
#[derive(Default)]
pub struct StaticTrendingSource {
    scores: RwLock<HashMap<String, f64>>,
}

impl StaticTrendingSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, query: impl Into<String>, score: f64) {
        self.scores.write().await.insert(query.into(), score);
    }
}

#[async_trait::async_trait]
impl TrendingSource for StaticTrendingSource {
    async fn top_score(&self, query: &str) -> Result<f64> {
        self.scores
            .read()
            .await
            .get(query)
            .copied()
            .ok_or_else(|| anyhow!("No trending data for '{}'", query))
    }
}
