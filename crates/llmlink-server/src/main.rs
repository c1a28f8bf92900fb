use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use llmlink_broker::BrokerConfig;
use llmlink_protocol::{DiscoveryFile, paths};
use llmlink_server::{Daemon, DaemonOptions};

#[derive(Parser, Debug)]
#[command(author, version, about = "llmlink broker daemon")]
struct Args {
    /// Path to the broker config document.
    #[arg(long)]
    config: Option<PathBuf>,

    /// IPC listener port (0 picks a free port). Overrides the config.
    #[arg(long)]
    ipc_port: Option<u16>,

    /// HTTP API port. Overrides the config.
    #[arg(long)]
    api_port: Option<u16>,

    /// Where to publish the IPC port.
    #[arg(long)]
    discovery_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(paths::config_path);
    init_tracing(&config_path);

    let mut options = DaemonOptions::new(&config_path);
    options.ipc_port = args.ipc_port;
    options.api_port = args.api_port;
    if let Some(path) = args.discovery_file {
        options.discovery = DiscoveryFile::new(path);
    }

    let daemon = Daemon::start(options).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = daemon.stopped() => {}
    }

    daemon.shutdown().await;
    Ok(())
}

/// `RUST_LOG` wins; otherwise the config document's `log_level`. Config
/// warnings from this early read go nowhere; startup logs them again.
fn init_tracing(config_path: &std::path::Path) {
    let level = std::fs::read_to_string(config_path)
        .map(|text| BrokerConfig::parse(&text).config.log_level)
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directives(&level).into()),
        )
        .init();
}

fn default_directives(level: &str) -> String {
    ["llmlinkd", "llmlink_server", "llmlink_broker", "llmlink_ipc", "llmlink_protocol"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}
