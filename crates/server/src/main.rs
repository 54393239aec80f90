use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod api;
mod config;

use config::{AppState, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "adpilot")]
#[command(about = "Marketing workflow automation engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "ADPILOT_CONFIG", default_value = "adpilot.toml")]
    config: PathBuf,

    /// Host to bind to (overrides the config file)
    #[arg(long, env = "ADPILOT_HOST")]
    host: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "ADPILOT_PORT")]
    port: Option<u16>,

    /// Directory of workflow templates to register at startup
    #[arg(short, long, env = "ADPILOT_WORKFLOWS_DIR")]
    workflows_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "ADPILOT_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("ADPILOT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| "adpilot=info,adpilot_core=info,tower_http=debug".into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    tracing::info!("Starting Adpilot workflow engine");

    // Load configuration, then apply command-line overrides
    let mut config = ServerConfig::load(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.workflows_dir.is_some() {
        config.workflows_dir = args.workflows_dir;
    }

    let state = AppState::new(&config).await?;
    let engine = state.engine.clone();

    let addr = config.listen_addr();
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, state, shutdown_signal()).await?;

    engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
