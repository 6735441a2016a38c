// src/main.rs

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use code_bridge::agent::{AgentInjector, CommandInjector};
use code_bridge::bridge::{BridgeRouter, ResponseWatcher};
use code_bridge::config::BridgeConfig;
use code_bridge::telegram::TelegramClient;
use code_bridge::terminal::SessionRegistry;

/// Chat-driven remote control for a local dev workspace.
#[derive(Parser, Debug)]
#[command(name = "code-bridge", version)]
struct Args {
    /// Workspace root the bridge operates in.
    #[arg(long, env = "BRIDGE_WORKSPACE_ROOT", default_value = ".")]
    workspace_root: PathBuf,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, env = "BRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = BridgeConfig::from_env();
    if config.bot_token.is_empty() {
        anyhow::bail!("BRIDGE_BOT_TOKEN is not set");
    }
    if config.allowed_chat_ids.is_empty() {
        warn!("BRIDGE_ALLOWED_CHAT_IDS is empty; every incoming chat will be rejected");
    }

    let workspace_root = std::fs::canonicalize(&args.workspace_root)?;
    info!("Starting code-bridge in {}", workspace_root.display());
    info!(
        "Sessions: max {}, command timeout {}s",
        config.max_sessions, config.command_timeout_sec
    );

    let watcher = ResponseWatcher::start(&workspace_root, &config.response_dir_name).await?;
    let registry = SessionRegistry::new(workspace_root.clone(), config.max_sessions);

    let telegram = Arc::new(TelegramClient::new(
        &config.bot_token,
        config.allowed_chat_ids.clone(),
        config.poll_timeout_sec,
    )?);

    let injector: Option<Arc<dyn AgentInjector>> = if config.agent_inject_command.is_empty() {
        info!("Agent bridge disabled (BRIDGE_AGENT_INJECT_COMMAND not set)");
        None
    } else {
        Some(Arc::new(CommandInjector::new(
            config.agent_inject_command.clone(),
        )))
    };

    let router = BridgeRouter::new(
        telegram.clone(),
        watcher.clone(),
        registry,
        injector,
        config.clone(),
        workspace_root,
    );

    let (msg_tx, mut msg_rx) = mpsc::channel(64);
    let poller = telegram.clone();
    let poll_task = tokio::spawn(async move {
        poller.poll_updates(msg_tx).await;
    });

    // Messages are routed one at a time so command handling stays ordered.
    let route_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            router.handle_message(msg).await;
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
        result = poll_task => {
            error!("Telegram poll loop terminated: {:?}", result);
        }
        result = route_task => {
            error!("Message routing loop terminated: {:?}", result);
        }
    }

    watcher.dispose();
    Ok(())
}
