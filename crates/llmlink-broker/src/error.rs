use thiserror::Error;

use crate::health::EndpointKind;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no healthy endpoint available")]
    NoHealthyEndpoint,

    #[error("{0} endpoint is disabled")]
    EndpointDisabled(EndpointKind),

    #[error("request to {kind} failed: {source}")]
    Http {
        kind: EndpointKind,
        #[source]
        source: reqwest::Error,
    },

    #[error("{kind} answered HTTP {status}: {body}")]
    Upstream {
        kind: EndpointKind,
        status: u16,
        body: String,
    },

    #[error("No authentication token")]
    Unauthenticated,

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("broker is not running")]
    NotRunning,

    #[error("undecodable response from {kind}: {message}")]
    Decode { kind: EndpointKind, message: String },

    #[error("retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
}

impl BrokerError {
    /// Failures worth retrying: connection trouble, timeouts, and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { source, .. } => {
                source.is_connect() || source.is_timeout() || source.is_request()
            }
            Self::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the endpoint was reachable when this error occurred.
    pub fn endpoint_reachable(&self) -> bool {
        matches!(self, Self::Upstream { .. } | Self::Decode { .. })
    }

    /// Bucket used by the metrics error histogram.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoHealthyEndpoint => "no_healthy_endpoint",
            Self::EndpointDisabled(_) => "endpoint_disabled",
            Self::Http { source, .. } if source.is_timeout() => "timeout",
            Self::Http { source, .. } if source.is_connect() => "connection",
            Self::Http { .. } => "http",
            Self::Upstream { status, .. } if *status >= 500 => "server_error",
            Self::Upstream { .. } => "client_error",
            Self::Unauthenticated => "unauthenticated",
            Self::Client(_) => "client",
            Self::NotRunning => "not_running",
            Self::Decode { .. } => "decode",
            Self::RetryExhausted { .. } => "retry_exhausted",
        }
    }
}
