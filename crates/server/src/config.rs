use adpilot_core::{EngineConfig, WorkflowEngine, WorkflowTemplate};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Directory of workflow templates (`*.toml` / `*.json`) registered at startup
    #[serde(default)]
    pub workflows_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        if !config_path.exists() {
            tracing::info!("Configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read configuration file {}", config_path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Read every workflow template under `dir`, in path order
pub fn load_workflows(dir: &Path) -> Result<Vec<WorkflowTemplate>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        let is_template = matches!(
            entry.path().extension().and_then(|e| e.to_str()),
            Some("toml") | Some("json")
        );
        if entry.file_type().is_file() && is_template {
            paths.push(entry.into_path());
        }
    }
    paths.sort();

    paths.iter().map(|path| load_workflow(path)).collect()
}

fn load_workflow(path: &Path) -> Result<WorkflowTemplate> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow {}", path.display()))?;

    let template = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse workflow {}", path.display()))?,
        _ => toml::from_str(&content)
            .with_context(|| format!("Failed to parse workflow {}", path.display()))?,
    };
    Ok(template)
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: WorkflowEngine,
}

impl AppState {
    /// Build the engine and register the templates found in `workflows_dir`
    pub async fn new(config: &ServerConfig) -> Result<Self> {
        let engine = WorkflowEngine::new(config.engine.clone());

        if let Some(dir) = &config.workflows_dir {
            for template in load_workflows(dir)? {
                let id = template.id.clone();
                engine
                    .register_workflow(template)
                    .await
                    .with_context(|| format!("Failed to register workflow {}", id))?;
            }
            tracing::info!(
                workflows = engine.list_workflows().await.len(),
                "Loaded workflows from {}",
                dir.display()
            );
        }

        Ok(Self { engine })
    }
}
