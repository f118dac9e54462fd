//! # Main Entry Point
//!
//! Wires the layers together:
//! - Domain: configuration, message model, error taxonomy
//! - Infrastructure: OneBot HTTP client, inbound webhook
//! - Application: sessions, tasks, command router
//! - Interface: built-in command handlers

mod application;
mod domain;
mod infrastructure;
mod interface;
mod strings;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::application::dispatcher::CommandRouter;
use crate::application::session::SessionManager;
use crate::domain::config::AppConfig;
use crate::domain::traits::Gateway;
use crate::infrastructure::onebot::OneBotClient;
use crate::infrastructure::webhook;
use crate::interface::commands::builtin_commands;

#[derive(Parser)]
#[command(name = "herald", about = "Session-oriented chat command bot")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "data/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load Configuration
    let config_content = fs::read_to_string(&cli.config)
        .with_context(|| format!("failed to read {}", cli.config.display()))?;
    let config: Arc<AppConfig> =
        Arc::new(serde_yaml::from_str(&config_content).context("failed to parse configuration")?);

    // 2. Logging Setup
    if !std::path::Path::new("data").exists() {
        fs::create_dir("data").context("failed to create data directory")?;
    }
    let file_appender = tracing_appender::rolling::never("data", "herald.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hyper=warn,reqwest=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        started = %chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        gateway = %config.gateway.host,
        "herald starting"
    );

    // 3. Wire Services
    let gateway: Arc<dyn Gateway> = Arc::new(OneBotClient::new(&config)?);
    let sessions = SessionManager::new(config.clone(), gateway.clone());
    let router = Arc::new(CommandRouter::new(
        config.clone(),
        gateway,
        sessions,
        builtin_commands(),
    ));

    // 4. Serve the Event Webhook
    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    webhook::serve(listener, router).await
}
