use std::collections::BTreeSet;
use std::pin::Pin;
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use crate::error::{BrokerError, Result};
use crate::health::EndpointKind;

/// Upper bound for a capability probe, whatever the endpoint timeout is.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CHUNK_BYTES: usize = 1024 * 1024;

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// Resolved address and credentials for one request.
#[derive(Debug, Clone)]
pub struct Target {
    pub kind: EndpointKind,
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Target {
    /// Cloud speaks the same API behind a proxy prefix.
    pub fn url(&self, path: &str) -> String {
        match self.kind {
            EndpointKind::Local => format!("{}{path}", self.base_url),
            EndpointKind::Cloud => format!("{}{}", self.base_url, map_cloud_path(path)),
        }
    }
}

/// Map a local inference API path to its cloud proxy equivalent.
pub fn map_cloud_path(path: &str) -> String {
    match path {
        "/api/version" => "/api/proxy/status".to_string(),
        other => format!("/api/ollama{other}"),
    }
}

/// Result of a successful capability probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub latency_ms: f64,
    pub version: Option<String>,
    /// `None` when the model list could not be fetched.
    pub models: Option<BTreeSet<String>>,
}

#[derive(Deserialize)]
struct VersionResponse {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}

/// Thin HTTP client shared by probes, proxied requests, and chat streams.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: reqwest::Client,
}

impl Upstream {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("llmlink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(BrokerError::Client)?;
        Ok(Self { client })
    }

    fn build(&self, target: &Target, method: Method, path: &str) -> Result<RequestBuilder> {
        let mut request = self.client.request(method, target.url(path));
        if target.kind == EndpointKind::Cloud {
            let token = target.token.as_deref().ok_or(BrokerError::Unauthenticated)?;
            request = request.bearer_auth(token);
        }
        Ok(request)
    }

    /// `GET /api/version` then `GET /api/tags`. Only the version call decides
    /// success; a failed model listing is logged and reported as `None`.
    pub async fn probe_local(&self, target: &Target) -> Result<Probe> {
        let kind = target.kind;
        let timeout = target.timeout.min(PROBE_TIMEOUT);
        let started = Instant::now();
        let response = send(kind, self.build(target, Method::GET, "/api/version")?.timeout(timeout)).await?;
        let version: VersionResponse = decode(kind, response).await?;
        let latency_ms = elapsed_ms(started);

        let models = match self.fetch_models(target, timeout).await {
            Ok(models) => Some(models),
            Err(e) => {
                tracing::warn!(endpoint = %kind, err = %e, "failed to list models");
                None
            }
        };
        Ok(Probe {
            latency_ms,
            version: version.version,
            models,
        })
    }

    async fn fetch_models(&self, target: &Target, timeout: Duration) -> Result<BTreeSet<String>> {
        let response = send(
            target.kind,
            self.build(target, Method::GET, "/api/tags")?.timeout(timeout),
        )
        .await?;
        let tags: TagsResponse = decode(target.kind, response).await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// `GET /health` with the bearer token. No token means no request.
    pub async fn probe_cloud(&self, target: &Target) -> Result<Probe> {
        let token = target.token.as_deref().ok_or(BrokerError::Unauthenticated)?;
        let started = Instant::now();
        let request = self
            .client
            .get(format!("{}/health", target.base_url))
            .bearer_auth(token)
            .timeout(target.timeout.min(PROBE_TIMEOUT));
        let response = send(target.kind, request).await?;
        let latency_ms = elapsed_ms(started);
        let version = response
            .json::<VersionResponse>()
            .await
            .ok()
            .and_then(|v| v.version);
        Ok(Probe {
            latency_ms,
            version,
            models: None,
        })
    }

    /// One proxied JSON request; non-2xx answers become `Upstream` errors.
    pub async fn request(
        &self,
        target: &Target,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut request = self.build(target, method, path)?.timeout(target.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = send(target.kind, request).await?;
        decode(target.kind, response).await
    }

    /// `POST /api/chat` with streaming on; yields one JSON value per line.
    pub fn stream_chat(&self, target: &Target, body: Value) -> Result<ChatStream> {
        let request = self.build(target, Method::POST, "/api/chat")?.json(&body);
        Ok(Box::pin(ndjson_stream(target.kind, request)))
    }
}

fn ndjson_stream(kind: EndpointKind, request: RequestBuilder) -> impl Stream<Item = Result<Value>> + Send {
    async_stream::try_stream! {
        let response = send(kind, request).await?;
        let bytes = Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other)));
        let mut lines = FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_CHUNK_BYTES),
        );
        while let Some(line) = lines.next().await {
            let line = line.map_err(|e| BrokerError::Decode { kind, message: e.to_string() })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(chunk) => yield chunk,
                Err(e) => tracing::debug!(endpoint = %kind, err = %e, "skipping non-JSON stream line"),
            }
        }
    }
}

async fn send(kind: EndpointKind, request: RequestBuilder) -> Result<Response> {
    let response = request
        .send()
        .await
        .map_err(|source| BrokerError::Http { kind, source })?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BrokerError::Upstream {
        kind,
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: serde::de::DeserializeOwned>(kind: EndpointKind, response: Response) -> Result<T> {
    response.json::<T>().await.map_err(|e| BrokerError::Decode {
        kind,
        message: e.to_string(),
    })
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
