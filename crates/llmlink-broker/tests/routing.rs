use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use futures_util::StreamExt;
use llmlink_broker::{BrokerConfig, BrokerError, ConnectionBroker, EndpointKind, EndpointState, Quality};
use reqwest::Method;
use serde_json::{Value, json};

const TOKEN: &str = "secret-token";

#[derive(Clone, Default)]
struct Hits {
    health: Arc<AtomicUsize>,
    flaky: Arc<AtomicUsize>,
    missing: Arc<AtomicUsize>,
}

fn tags() -> Value {
    json!({"models": [{"name": "llama3:8b"}, {"name": "qwen2:7b"}]})
}

async fn flaky(State(hits): State<Hits>) -> (StatusCode, Json<Value>) {
    let n = hits.flaky.fetch_add(1, Ordering::SeqCst);
    if n < 2 {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "warming up"})))
    } else {
        (StatusCode::OK, Json(json!({"ok": true, "attempt": n + 1})))
    }
}

async fn missing(State(hits): State<Hits>) -> (StatusCode, &'static str) {
    hits.missing.fetch_add(1, Ordering::SeqCst);
    (StatusCode::NOT_FOUND, "no such model")
}

async fn chat() -> String {
    [
        json!({"message": {"role": "assistant", "content": "Hel"}, "done": false}),
        json!({"message": {"role": "assistant", "content": "lo"}, "done": false}),
        json!({"done": true}),
    ]
    .iter()
    .map(|v| format!("{v}\n"))
    .collect::<Vec<_>>()
    .join("\nnot json\n")
}

async fn cloud_health(State(hits): State<Hits>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    hits.health.fetch_add(1, Ordering::SeqCst);
    let expected = format!("Bearer {TOKEN}");
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(auth) if auth == expected => (StatusCode::OK, Json(json!({"status": "ok", "version": "bridge-2"}))),
        _ => (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))),
    }
}

/// Serves the local inference API and the cloud proxy API side by side.
async fn mock_upstream() -> (u16, Hits) {
    let hits = Hits::default();
    let app = Router::new()
        .route("/api/version", get(|| async { Json(json!({"version": "0.5.1"})) }))
        .route("/api/tags", get(|| async { Json(tags()) }))
        .route("/api/chat", post(chat))
        .route("/api/flaky", get(flaky))
        .route("/api/missing", get(missing))
        .route("/health", get(cloud_health))
        .route("/api/proxy/status", get(|| async { Json(json!({"version": "cloud"})) }))
        .route("/api/ollama/api/tags", get(|| async { Json(tags()) }))
        .with_state(hits.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, hits)
}

fn closed_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap().port()
}

fn config(local_port: u16, cloud_port: u16) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.local.host = "127.0.0.1".to_string();
    config.local.port = local_port;
    config.local.timeout_secs = 2;
    config.cloud.base_url = format!("http://127.0.0.1:{cloud_port}");
    config.cloud.timeout_secs = 2;
    config.health_check_interval_secs = 3600;
    config.retry.delay_ms = 10;
    config
}

#[tokio::test]
async fn local_check_records_version_models_and_latency() {
    let (port, _) = mock_upstream().await;
    let broker = ConnectionBroker::new(config(port, port));
    broker.start().unwrap();

    let local = broker.check_endpoint(EndpointKind::Local).await;
    assert!(local.is_connected);
    assert_eq!(local.version.as_deref(), Some("0.5.1"));
    assert!(local.models.contains("llama3:8b"));
    assert_eq!(local.models.len(), 2);
    assert!(local.latency_ms > 0.0);
    assert!(local.last_check.is_some());
    assert_eq!(local.quality(), Quality::Excellent);
    assert_eq!(local.state(), EndpointState::Healthy);

    assert_eq!(broker.best_endpoint(), Some(EndpointKind::Local));
    let status = broker.status();
    assert_eq!(status.preferred, Some(EndpointKind::Local));
    assert_eq!(status.status, Quality::Excellent);
    assert!(broker.metrics_snapshot().total_requests >= 1);
    broker.stop();
}

#[tokio::test]
async fn unreachable_local_falls_back_to_cloud() {
    let (cloud_port, hits) = mock_upstream().await;
    let broker = ConnectionBroker::new(config(closed_port(), cloud_port));
    broker.start().unwrap();
    broker.update_auth_token(Some(TOKEN.to_string()));
    broker.check_all().await;

    let local = broker.health(EndpointKind::Local);
    assert!(!local.is_connected);
    assert!(local.error.is_some());
    assert_eq!(local.quality(), Quality::Critical);

    let cloud = broker.health(EndpointKind::Cloud);
    assert!(cloud.is_connected, "{cloud:?}");
    assert_eq!(cloud.version.as_deref(), Some("bridge-2"));
    assert!(hits.health.load(Ordering::SeqCst) >= 1);
    assert_eq!(broker.best_endpoint(), Some(EndpointKind::Cloud));

    // Routed to /api/ollama/api/tags on the cloud side.
    let models = broker
        .proxy_request(Method::GET, "/api/tags", None, None)
        .await
        .unwrap();
    assert_eq!(models, tags());
    broker.stop();
}

#[tokio::test]
async fn cloud_without_token_is_not_contacted() {
    let (port, hits) = mock_upstream().await;
    let mut config = config(port, port);
    config.cloud.enabled = true;
    let broker = ConnectionBroker::new(config);
    broker.start().unwrap();

    let cloud = broker.check_endpoint(EndpointKind::Cloud).await;
    assert!(!cloud.is_connected);
    assert_eq!(cloud.error.as_deref(), Some("No authentication token"));
    assert_eq!(hits.health.load(Ordering::SeqCst), 0);
    broker.stop();
}

#[tokio::test]
async fn rejected_token_marks_cloud_unreachable() {
    let (port, _) = mock_upstream().await;
    let broker = ConnectionBroker::new(config(closed_port(), port));
    broker.start().unwrap();
    broker.update_auth_token(Some("wrong".to_string()));

    let cloud = broker.check_endpoint(EndpointKind::Cloud).await;
    assert!(!cloud.is_connected);
    assert!(cloud.error.as_deref().unwrap_or_default().contains("401"));
    assert_eq!(broker.status().status, Quality::Critical);
    broker.stop();
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let (port, hits) = mock_upstream().await;
    let broker = ConnectionBroker::new(config(port, port));
    broker.start().unwrap();

    let value = broker
        .proxy_request(Method::GET, "/api/flaky", None, Some(EndpointKind::Local))
        .await
        .unwrap();
    assert_eq!(value["attempt"], 3);
    assert_eq!(hits.flaky.load(Ordering::SeqCst), 3);

    let metrics = broker.metrics_snapshot();
    assert!(metrics.failed_requests >= 2);
    assert_eq!(metrics.endpoints[&EndpointKind::Local].errors["server_error"], 2);
    assert!(broker.health(EndpointKind::Local).error_count >= 2);
    broker.stop();
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (port, hits) = mock_upstream().await;
    let broker = ConnectionBroker::new(config(port, port));
    broker.start().unwrap();

    let err = broker
        .proxy_request(Method::GET, "/api/missing", None, Some(EndpointKind::Local))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Upstream { status: 404, ref body, .. } if body == "no such model"));
    assert_eq!(hits.missing.load(Ordering::SeqCst), 1);
    broker.stop();
}

#[tokio::test]
async fn exhausted_retries_report_the_last_error() {
    let broker = ConnectionBroker::new(config(closed_port(), closed_port()));
    broker.start().unwrap();

    let err = broker
        .proxy_request(Method::GET, "/api/tags", None, Some(EndpointKind::Local))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::RetryExhausted { attempts: 3, .. }), "{err}");
    let local = broker.health(EndpointKind::Local);
    assert!(!local.is_connected);
    assert!(local.error_count >= 3);
    broker.stop();
}

#[tokio::test]
async fn chat_streams_json_lines() {
    let (port, _) = mock_upstream().await;
    let broker = ConnectionBroker::new(config(port, port));
    broker.start().unwrap();
    broker.check_endpoint(EndpointKind::Local).await;

    let messages = [json!({"role": "user", "content": "hi"})];
    let stream = broker.stream_chat("llama3:8b", &messages[..], None).unwrap();
    let chunks: Vec<Value> = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .unwrap()
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0]["message"]["content"], "Hel");
    assert_eq!(chunks[2]["done"], true);
    broker.stop();
}

#[tokio::test]
async fn stop_keeps_metrics_until_reset() {
    let (port, _) = mock_upstream().await;
    let broker = ConnectionBroker::new(config(port, port));
    broker.start().unwrap();
    broker.check_endpoint(EndpointKind::Local).await;
    broker.stop();
    assert!(!broker.is_running());

    let before = broker.metrics_snapshot().total_requests;
    assert!(before >= 1);
    let err = broker
        .proxy_request(Method::GET, "/api/tags", None, Some(EndpointKind::Local))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::NotRunning));
    assert_eq!(broker.metrics_snapshot().total_requests, before);

    broker.restart().unwrap();
    assert!(broker.is_running());
    broker.reset_metrics();
    let after = broker.metrics_snapshot();
    assert_eq!(after.failed_requests, 0);
    broker.stop();
}

#[tokio::test]
async fn monitor_publishes_fresh_records() {
    let (port, _) = mock_upstream().await;
    let broker = ConnectionBroker::new(config(port, port));
    let mut local = broker.watch(EndpointKind::Local);
    let mut events = broker.subscribe();
    broker.start().unwrap();

    tokio::time::timeout(Duration::from_secs(5), local.wait_for(|h| h.is_connected))
        .await
        .unwrap()
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event"], "status_changed");
    assert_eq!(json["kind"], "local");
    broker.stop();
}
