use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Instant;

use futures_util::StreamExt;
use reqwest::Method;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::health::{ConnectionHealth, EndpointKind, EndpointState, Quality};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::upstream::{ChatStream, Target, Upstream};

const EVENT_CAPACITY: usize = 64;

/// Pushed to subscribers whenever an endpoint record changes meaningfully.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrokerEvent {
    StatusChanged {
        kind: EndpointKind,
        previous: EndpointState,
        current: EndpointState,
        health: ConnectionHealth,
    },
    ModelsChanged {
        kind: EndpointKind,
        models: BTreeSet<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub enabled: bool,
    pub state: EndpointState,
    pub quality: Quality,
    #[serde(flatten)]
    pub health: ConnectionHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatus {
    pub running: bool,
    /// Quality of the preferred endpoint, `critical` when there is none.
    pub status: Quality,
    pub preferred: Option<EndpointKind>,
    pub authenticated: bool,
    pub endpoints: BTreeMap<EndpointKind, EndpointStatus>,
}

struct Records {
    local: watch::Sender<ConnectionHealth>,
    cloud: watch::Sender<ConnectionHealth>,
}

impl Records {
    fn get(&self, kind: EndpointKind) -> &watch::Sender<ConnectionHealth> {
        match kind {
            EndpointKind::Local => &self.local,
            EndpointKind::Cloud => &self.cloud,
        }
    }
}

struct Inner {
    config: RwLock<BrokerConfig>,
    token: RwLock<Option<String>>,
    records: Records,
    metrics: StdMutex<MetricsAggregator>,
    events: broadcast::Sender<BrokerEvent>,
    upstream: StdMutex<Option<Upstream>>,
    monitor: StdMutex<Option<CancellationToken>>,
    wake: Notify,
}

/// Monitors the local and cloud endpoints and routes requests between them.
///
/// Health records are published through `watch` channels and replaced whole
/// on every update. Stopping the broker cancels the health-check loop and
/// drops the HTTP client; metrics survive until [`reset_metrics`].
///
/// [`reset_metrics`]: ConnectionBroker::reset_metrics
#[derive(Clone)]
pub struct ConnectionBroker {
    inner: Arc<Inner>,
}

impl ConnectionBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let (local, _) = watch::channel(ConnectionHealth::new(
            EndpointKind::Local,
            config.base_url(EndpointKind::Local),
        ));
        let (cloud, _) = watch::channel(ConnectionHealth::new(
            EndpointKind::Cloud,
            config.base_url(EndpointKind::Cloud),
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                token: RwLock::new(None),
                records: Records { local, cloud },
                metrics: StdMutex::new(MetricsAggregator::new()),
                events,
                upstream: StdMutex::new(None),
                monitor: StdMutex::new(None),
                wake: Notify::new(),
            }),
        }
    }

    /// Create the HTTP client and start the periodic health checks.
    /// Starting a running broker is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut monitor = lock(&self.inner.monitor);
        if monitor.is_some() {
            return Ok(());
        }
        *lock(&self.inner.upstream) = Some(Upstream::new()?);
        let token = CancellationToken::new();
        *monitor = Some(token.clone());
        drop(monitor);

        tracing::info!(
            interval_secs = self.config().health_check_interval_secs,
            "connection broker started"
        );
        tokio::spawn(monitor_loop(self.clone(), token));
        Ok(())
    }

    /// Cancel health checks and close the HTTP client. Metrics are kept.
    pub fn stop(&self) {
        let Some(token) = lock(&self.inner.monitor).take() else {
            return;
        };
        token.cancel();
        lock(&self.inner.upstream).take();
        tracing::info!("connection broker stopped");
    }

    pub fn restart(&self) -> Result<()> {
        self.stop();
        self.start()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.monitor).is_some()
    }

    pub fn config(&self) -> BrokerConfig {
        read(&self.inner.config).clone()
    }

    pub fn health(&self, kind: EndpointKind) -> ConnectionHealth {
        self.inner.records.get(kind).borrow().clone()
    }

    /// Follow one endpoint's record as it is replaced.
    pub fn watch(&self, kind: EndpointKind) -> watch::Receiver<ConnectionHealth> {
        self.inner.records.get(kind).subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        read(&self.inner.token).is_some()
    }

    fn enabled(&self, kind: EndpointKind) -> bool {
        read(&self.inner.config).enabled(kind)
    }

    /// Local if enabled and connected, else cloud under the same rule.
    pub fn best_endpoint(&self) -> Option<EndpointKind> {
        EndpointKind::ALL
            .into_iter()
            .find(|&kind| self.enabled(kind) && self.health(kind).is_connected)
    }

    fn target(&self, kind: EndpointKind) -> Target {
        let config = read(&self.inner.config);
        Target {
            kind,
            base_url: config.base_url(kind),
            token: read(&self.inner.token).clone(),
            timeout: config.timeout(kind),
        }
    }

    fn upstream(&self) -> Result<Upstream> {
        lock(&self.inner.upstream)
            .clone()
            .ok_or(BrokerError::NotRunning)
    }

    /// Probe one endpoint now and publish the new record. Disabled endpoints
    /// and a stopped broker leave the record untouched.
    pub async fn check_endpoint(&self, kind: EndpointKind) -> ConnectionHealth {
        if !self.enabled(kind) {
            return self.health(kind);
        }
        let Ok(upstream) = self.upstream() else {
            return self.health(kind);
        };
        let target = self.target(kind);
        let probe = match kind {
            EndpointKind::Local => upstream.probe_local(&target).await,
            EndpointKind::Cloud => upstream.probe_cloud(&target).await,
        };
        match probe {
            Ok(probe) => {
                lock(&self.inner.metrics).record_success(kind, probe.latency_ms);
                self.update(kind, |h| {
                    h.with_check_success(probe.latency_ms, probe.version, probe.models)
                })
            }
            Err(e) => {
                tracing::debug!(endpoint = %kind, err = %e, "health check failed");
                lock(&self.inner.metrics).record_failure(kind, e.label(), None);
                self.update(kind, |h| h.with_check_failure(e.to_string()))
            }
        }
    }

    pub async fn check_all(&self) {
        for kind in EndpointKind::ALL {
            self.check_endpoint(kind).await;
        }
    }

    /// Forward one JSON request to `preferred`, or to the best endpoint.
    ///
    /// Transient failures (connection errors, timeouts, 5xx) are retried per
    /// the retry policy. Every attempt updates the endpoint record and metrics.
    pub async fn proxy_request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        preferred: Option<EndpointKind>,
    ) -> Result<Value> {
        let kind = self.route(preferred)?;
        let upstream = self.upstream()?;
        let target = self.target(kind);
        let retry = self.config().retry;
        let attempts = retry.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = upstream
                .request(&target, method.clone(), path, body.as_ref())
                .await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            match result {
                Ok(value) => {
                    self.record_request_success(kind, latency_ms);
                    return Ok(value);
                }
                Err(e) => {
                    self.record_request_failure(kind, &e, latency_ms);
                    if !e.is_transient() {
                        return Err(e);
                    }
                    if attempt >= attempts {
                        return Err(if attempts > 1 {
                            BrokerError::RetryExhausted {
                                attempts,
                                last_error: e.to_string(),
                            }
                        } else {
                            e
                        });
                    }
                    tracing::warn!(endpoint = %kind, attempt, err = %e, "proxied request failed, retrying");
                    tokio::time::sleep(retry.delay()).await;
                }
            }
        }
    }

    /// Start a streaming chat on `preferred` or the best endpoint. The
    /// outcome is recorded once the stream ends or fails.
    pub fn stream_chat<M: Serialize>(
        &self,
        model: &str,
        messages: &[M],
        preferred: Option<EndpointKind>,
    ) -> Result<ChatStream> {
        let kind = self.route(preferred)?;
        let body = json!({ "model": model, "messages": messages, "stream": true });
        let chunks = self.upstream()?.stream_chat(&self.target(kind), body)?;
        Ok(Box::pin(observed(self.clone(), kind, chunks)))
    }

    fn route(&self, preferred: Option<EndpointKind>) -> Result<EndpointKind> {
        match preferred {
            Some(kind) if !self.enabled(kind) => Err(BrokerError::EndpointDisabled(kind)),
            Some(kind) => Ok(kind),
            None => self.best_endpoint().ok_or(BrokerError::NoHealthyEndpoint),
        }
    }

    fn record_request_success(&self, kind: EndpointKind, latency_ms: f64) {
        lock(&self.inner.metrics).record_success(kind, latency_ms);
        self.update(kind, |h| h.with_request_success(latency_ms));
    }

    fn record_request_failure(&self, kind: EndpointKind, error: &BrokerError, latency_ms: f64) {
        let reachable = error.endpoint_reachable();
        lock(&self.inner.metrics).record_failure(
            kind,
            error.label(),
            reachable.then_some(latency_ms),
        );
        self.update(kind, |h| h.with_request_failure(error.to_string(), reachable));
    }

    /// Replace the record for `kind` and emit events for what changed.
    fn update(
        &self,
        kind: EndpointKind,
        next: impl FnOnce(&ConnectionHealth) -> ConnectionHealth,
    ) -> ConnectionHealth {
        let mut change = None;
        self.inner.records.get(kind).send_modify(|current| {
            let replacement = next(current);
            let previous = std::mem::replace(current, replacement);
            change = Some((previous, current.clone()));
        });
        let Some((previous, current)) = change else {
            return self.health(kind);
        };

        let (was, now) = (previous.state(), current.state());
        if was != now {
            tracing::info!(endpoint = %kind, from = ?was, to = ?now, "endpoint state changed");
            let _ = self.inner.events.send(BrokerEvent::StatusChanged {
                kind,
                previous: was,
                current: now,
                health: current.clone(),
            });
        }
        if previous.models != current.models {
            let _ = self.inner.events.send(BrokerEvent::ModelsChanged {
                kind,
                models: current.models.clone(),
            });
        }
        current
    }

    fn connected_fraction(&self) -> f64 {
        let enabled: Vec<EndpointKind> = EndpointKind::ALL
            .into_iter()
            .filter(|&kind| self.enabled(kind))
            .collect();
        if enabled.is_empty() {
            return 0.0;
        }
        let connected = enabled
            .iter()
            .filter(|&&kind| self.health(kind).is_connected)
            .count();
        connected as f64 / enabled.len() as f64
    }

    pub fn status(&self) -> BrokerStatus {
        let endpoints: BTreeMap<EndpointKind, EndpointStatus> = EndpointKind::ALL
            .into_iter()
            .map(|kind| {
                let health = self.health(kind);
                let status = EndpointStatus {
                    enabled: self.enabled(kind),
                    state: health.state(),
                    quality: health.quality(),
                    health,
                };
                (kind, status)
            })
            .collect();
        let preferred = self.best_endpoint();
        BrokerStatus {
            running: self.is_running(),
            status: preferred
                .and_then(|kind| endpoints.get(&kind))
                .map_or(Quality::Critical, |e| e.quality),
            preferred,
            authenticated: self.is_authenticated(),
            endpoints,
        }
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let fraction = self.connected_fraction();
        lock(&self.inner.metrics).snapshot(fraction)
    }

    pub fn reset_metrics(&self) {
        lock(&self.inner.metrics).reset();
        tracing::info!("metrics reset");
    }

    /// Apply an authentication push. A token enables the cloud endpoint and
    /// checks it right away; no token disables it.
    pub fn update_auth_token(&self, token: Option<String>) {
        let token = token.filter(|t| !t.is_empty());
        let authenticated = token.is_some();
        *write(&self.inner.token) = token;
        write(&self.inner.config).cloud.enabled = authenticated;
        tracing::info!(authenticated, "auth status updated");

        if authenticated {
            if self.is_running() {
                let broker = self.clone();
                tokio::spawn(async move {
                    broker.check_endpoint(EndpointKind::Cloud).await;
                });
            }
        } else {
            let base_url = self.config().base_url(EndpointKind::Cloud);
            self.update(EndpointKind::Cloud, |h| ConnectionHealth {
                is_connected: false,
                endpoint: base_url,
                error: Some(BrokerError::Unauthenticated.to_string()),
                ..h.clone()
            });
        }
    }

    /// Swap in a new configuration document. Endpoints whose address changed
    /// restart as unchecked; the health-check loop picks up the new interval.
    pub fn apply_config(&self, mut config: BrokerConfig) {
        if self.is_authenticated() {
            config.cloud.enabled = true;
        }
        let previous = std::mem::replace(&mut *write(&self.inner.config), config.clone());

        for kind in EndpointKind::ALL {
            let url = config.base_url(kind);
            if previous.base_url(kind) != url {
                tracing::info!(endpoint = %kind, url = %url, "endpoint address changed");
                self.update(kind, |_| ConnectionHealth::new(kind, url));
            }
        }
        self.inner.wake.notify_one();
    }
}

fn observed(
    broker: ConnectionBroker,
    kind: EndpointKind,
    chunks: ChatStream,
) -> impl futures_util::Stream<Item = Result<Value>> + Send {
    async_stream::try_stream! {
        let started = Instant::now();
        let mut chunks = chunks;
        while let Some(item) = chunks.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                    broker.record_request_failure(kind, &e, elapsed);
                    Err(e)?
                }
            };
            yield chunk;
        }
        broker.record_request_success(kind, started.elapsed().as_secs_f64() * 1000.0);
    }
}

async fn monitor_loop(broker: ConnectionBroker, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = broker.check_all() => {}
        }
        let interval = broker.config().health_check_interval();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = broker.inner.wake.notified() => {
                tracing::debug!("config changed, checking endpoints early");
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
    tracing::debug!("health-check loop exited");
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
