use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use llmlink_broker::{BrokerConfig, ConnectionBroker};
use llmlink_ipc::IpcListener;
use llmlink_protocol::{BROKER_ROLE, DiscoveryFile};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState};
use crate::dispatch::{self, Dispatcher};
use crate::reload;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config_path: PathBuf,
    pub discovery: DiscoveryFile,
    /// Overrides `ipc.port` from the config document.
    pub ipc_port: Option<u16>,
    /// Overrides `api.port` from the config document.
    pub api_port: Option<u16>,
    pub reload_interval: Duration,
    pub metrics_interval: Duration,
}

impl DaemonOptions {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            discovery: DiscoveryFile::for_role(BROKER_ROLE),
            ipc_port: None,
            api_port: None,
            reload_interval: Duration::from_secs(2),
            metrics_interval: Duration::from_secs(5),
        }
    }
}

/// A running broker daemon.
///
/// Startup order: load config, bind the IPC listener, bind the API port,
/// start the broker, publish the discovery file. Either bind failing aborts
/// startup; everything else is logged and recovered.
pub struct Daemon {
    broker: ConnectionBroker,
    listener: IpcListener,
    discovery: DiscoveryFile,
    ipc_port: u16,
    api_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub async fn start(options: DaemonOptions) -> Result<Self> {
        let mut config = BrokerConfig::load(&options.config_path)
            .with_context(|| format!("failed to load config {}", options.config_path.display()))?
            .config;
        if let Some(port) = options.ipc_port {
            config.ipc.port = port;
        }
        if let Some(port) = options.api_port {
            config.api.port = port;
        }
        let cors = api::build_cors(&config.api.cors_origins)?;

        let listener = IpcListener::new(BROKER_ROLE);
        for kind in dispatch::TYPED_REPLIES {
            listener.replies_to(kind);
        }
        let ipc_port = listener
            .start(&config.ipc.host, config.ipc.port)
            .await
            .with_context(|| {
                format!("failed to bind IPC listener on {}:{}", config.ipc.host, config.ipc.port)
            })?;

        let api_listener = tokio::net::TcpListener::bind((config.api.host.as_str(), config.api.port))
            .await
            .with_context(|| {
                format!("failed to bind API listener on {}:{}", config.api.host, config.api.port)
            })?;
        let api_addr = api_listener.local_addr()?;

        let broker = ConnectionBroker::new(config.clone());
        broker.start().context("failed to start connection broker")?;

        if let Err(e) = options.discovery.publish(ipc_port) {
            tracing::warn!(err = %e, "failed to publish discovery file; peers need --port");
        }

        let shutdown = CancellationToken::new();
        let state = Arc::new(AppState {
            broker: broker.clone(),
            listener: listener.clone(),
            metrics_interval: options.metrics_interval,
            shutdown: shutdown.clone(),
        });
        let app = api::router(state).layer(cors);

        let mut tasks = Vec::new();
        let stop = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let served = axum::serve(api_listener, app)
                .with_graceful_shutdown(stop.cancelled_owned())
                .await;
            if let Err(e) = served {
                tracing::error!(err = %e, "API server failed");
            }
        }));
        tasks.push(tokio::spawn(
            Dispatcher::new(broker.clone(), listener.clone(), shutdown.clone()).run(),
        ));
        tasks.push(tokio::spawn(dispatch::push_status(
            broker.clone(),
            listener.clone(),
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(reload::watch_config(
            options.config_path.clone(),
            broker.clone(),
            options.reload_interval,
            shutdown.clone(),
        )));

        tracing::info!(ipc_port, api = %api_addr, "llmlinkd started");
        Ok(Self {
            broker,
            listener,
            discovery: options.discovery,
            ipc_port,
            api_addr,
            shutdown,
            tasks,
        })
    }

    pub fn ipc_port(&self) -> u16 {
        self.ipc_port
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn broker(&self) -> &ConnectionBroker {
        &self.broker
    }

    pub fn listener(&self) -> &IpcListener {
        &self.listener
    }

    /// Resolves once something requested shutdown, e.g. a `quit_application`
    /// envelope.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await;
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.listener.stop();
        self.broker.stop();
        if let Err(e) = self.discovery.unpublish() {
            tracing::warn!(err = %e, "failed to remove discovery file");
        }
        for task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("background task did not stop in time");
            }
        }
        tracing::info!("llmlinkd shut down");
    }
}
