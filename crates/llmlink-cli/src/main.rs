use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use llmlink_ipc::{ConnectorConfig, IpcConnector, SendOptions};
use llmlink_protocol::{BROKER_ROLE, DiscoveryFile, Envelope, MessageType, Payload};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_LOG: &str = "llmlink=warn,llmlink_ipc=warn,llmlink_protocol=warn";

#[derive(Parser)]
#[command(name = "llmlink", version, about = "llmlink broker CLI")]
struct Cli {
    /// Host the broker daemon listens on.
    #[arg(long, global = true, default_value = "127.0.0.1")]
    host: String,

    /// IPC port. Defaults to the port the daemon published.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Discovery file to read the port from.
    #[arg(long, global = true)]
    discovery_file: Option<PathBuf>,

    /// Seconds to wait for a reply.
    #[arg(long, global = true, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show endpoint health as reported by the daemon.
    Status,
    /// Measure IPC round trips.
    Ping {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Send an envelope of any type.
    Send {
        /// Envelope type, e.g. show_window or auth_status.
        kind: String,
        /// Payload as a JSON object.
        #[arg(long)]
        payload: Option<String>,
        /// Ask the daemon to acknowledge and wait for it.
        #[arg(long)]
        ack: bool,
        /// Wait for and print the first correlated reply.
        #[arg(long)]
        wait: bool,
    },
    /// Print every envelope the daemon pushes until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG.into()),
        )
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout.max(1));
    let reconnect = matches!(cli.command, Command::Watch);
    let connector = connect(&cli, timeout, reconnect).await?;

    match cli.command {
        Command::Status => {
            let reply = connector
                .send(Envelope::new(MessageType::HealthCheck), SendOptions::wait())
                .await
                .context("daemon did not answer health_check")?;
            print_reply(reply);
            Ok(())
        }
        Command::Ping { count } => {
            for seq in 1..=count.max(1) {
                let rtt = connector.ping().await.context("ping failed")?;
                println!("pong from {}: seq={seq} time={:.2}ms", server_name(&connector), rtt.as_secs_f64() * 1000.0);
            }
            Ok(())
        }
        Command::Send {
            kind,
            payload,
            ack,
            wait,
        } => {
            let envelope = build_envelope(&kind, payload.as_deref())?.with_ack_required(ack);
            let options = SendOptions {
                wait_for_response: wait,
                timeout: Some(timeout),
            };
            let id = envelope.id().to_string();
            let reply = connector.send(envelope, options).await.context("send failed")?;
            match reply {
                Some(reply) => print_reply(Some(reply)),
                None => println!("sent {kind} ({id})"),
            }
            Ok(())
        }
        Command::Watch => watch(&connector).await,
    }
}

async fn connect(cli: &Cli, timeout: Duration, reconnect: bool) -> Result<IpcConnector> {
    let config = ConnectorConfig {
        connect_timeout: timeout,
        request_timeout: timeout,
        max_reconnect_attempts: if reconnect { u32::MAX } else { 0 },
        ..ConnectorConfig::default()
    };
    let connector = IpcConnector::new(config);
    let connected = match cli.port {
        Some(port) => connector.connect(&cli.host, port).await,
        None => {
            let discovery = cli
                .discovery_file
                .clone()
                .map(DiscoveryFile::new)
                .unwrap_or_else(|| DiscoveryFile::for_role(BROKER_ROLE));
            connector.connect_discovered(&cli.host, discovery).await
        }
    };
    connected.context("failed to reach the broker daemon. Is llmlinkd running?")?;
    Ok(connector)
}

/// Build an envelope from a type tag and an optional JSON object payload,
/// validating the payload for known types.
fn build_envelope(kind: &str, payload: Option<&str>) -> Result<Envelope> {
    let payload = match payload {
        None => Payload::new(),
        Some(text) => match serde_json::from_str::<Value>(text).context("--payload is not valid JSON")? {
            Value::Object(map) => map,
            _ => bail!("--payload must be a JSON object"),
        },
    };
    let envelope = Envelope::new(MessageType::from(kind)).with_payload(payload);
    envelope
        .body()
        .with_context(|| format!("invalid payload for {kind}"))?;
    Ok(envelope)
}

async fn watch(connector: &IpcConnector) -> Result<()> {
    let mut inbound = connector.subscribe();
    let mut state = connector.watch_state();
    eprintln!("watching {} (ctrl-c to stop)", server_name(connector));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = *state.borrow_and_update();
                eprintln!("connection: {current:?}");
            }
            next = inbound.recv() => match next {
                Ok(envelope) => println!("{}", envelope.encode()?),
                Err(RecvError::Lagged(n)) => eprintln!("skipped {n} envelopes"),
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn server_name(connector: &IpcConnector) -> String {
    connector.server_id().unwrap_or_else(|| BROKER_ROLE.to_string())
}

fn print_reply(reply: Option<Envelope>) {
    let Some(reply) = reply else {
        return;
    };
    let rendered = serde_json::to_string_pretty(&serde_json::json!({
        "type": reply.kind().as_str(),
        "payload": reply.payload(),
    }));
    match rendered {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("unprintable reply: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_command_needs_no_payload() {
        let envelope = build_envelope("show_window", None).unwrap();
        assert_eq!(envelope.kind(), &MessageType::ShowWindow);
        assert!(envelope.payload().is_empty());
    }

    #[test]
    fn payload_is_validated_for_known_types() {
        let envelope = build_envelope("auth_status", Some(r#"{"authenticated": true, "token": "t"}"#)).unwrap();
        assert_eq!(envelope.payload()["token"], "t");

        let err = build_envelope("auth_status", Some(r#"{"token": "t"}"#)).unwrap_err();
        assert!(format!("{err:#}").contains("invalid payload for auth_status"));
    }

    #[test]
    fn payload_must_be_an_object() {
        assert!(build_envelope("show_window", Some("[1, 2]")).is_err());
        assert!(build_envelope("show_window", Some("{not json")).is_err());
    }

    #[test]
    fn default_log_filter_includes_discovery_warnings() {
        assert!(DEFAULT_LOG.contains("llmlink_protocol=warn"));
        assert!(DEFAULT_LOG.parse::<tracing_subscriber::EnvFilter>().is_ok());
    }

    #[test]
    fn unknown_types_pass_through() {
        let envelope = build_envelope("update_tooltip", Some(r#"{"text": "hi"}"#)).unwrap();
        assert_eq!(envelope.kind().as_str(), "update_tooltip");
    }
}
