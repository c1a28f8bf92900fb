use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::payload::Body;

/// String-keyed payload carried by every envelope.
pub type Payload = Map<String, Value>;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("empty line")]
    Empty,

    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Closed set of envelope type tags, plus a fallback for tags this build
/// does not know about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Ping,
    Pong,
    Ack,
    Error,
    Welcome,
    ShowWindow,
    HideWindow,
    ToggleWindow,
    OpenSettings,
    QuitApplication,
    AuthStatus,
    StreamRequest,
    StreamResponse,
    StreamComplete,
    StreamError,
    ServiceStatus,
    HealthCheck,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::Welcome => "welcome",
            Self::ShowWindow => "show_window",
            Self::HideWindow => "hide_window",
            Self::ToggleWindow => "toggle_window",
            Self::OpenSettings => "open_settings",
            Self::QuitApplication => "quit_application",
            Self::AuthStatus => "auth_status",
            Self::StreamRequest => "stream_request",
            Self::StreamResponse => "stream_response",
            Self::StreamComplete => "stream_complete",
            Self::StreamError => "stream_error",
            Self::ServiceStatus => "service_status",
            Self::HealthCheck => "health_check",
            Self::Other(tag) => tag,
        }
    }

    /// True for tags outside the known vocabulary.
    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Other(_))
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        match tag {
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "ack" => Self::Ack,
            "error" => Self::Error,
            "welcome" => Self::Welcome,
            "show_window" => Self::ShowWindow,
            "hide_window" => Self::HideWindow,
            "toggle_window" => Self::ToggleWindow,
            "open_settings" => Self::OpenSettings,
            "quit_application" => Self::QuitApplication,
            "auth_status" => Self::AuthStatus,
            "stream_request" => Self::StreamRequest,
            "stream_response" => Self::StreamResponse,
            "stream_complete" => Self::StreamComplete,
            "stream_error" => Self::StreamError,
            "service_status" => Self::ServiceStatus,
            "health_check" => Self::HealthCheck,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        Self::from(tag.as_str())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit exchanged over the IPC transport: one JSON object per line.
///
/// Envelopes are immutable once built. Responses and acks are derived with
/// [`Envelope::create_response`] and [`Envelope::create_ack`], which swap the
/// routing fields and point back at the original through
/// `payload.original_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: MessageType,
    id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: Payload,
    #[serde(default)]
    ack_required: bool,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    target: Option<String>,
}

impl Envelope {
    /// A fresh envelope with a random id and the current time.
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload: Payload::new(),
            ack_required: false,
            source: None,
            target: None,
        }
    }

    /// Build an envelope from a typed body.
    pub fn from_body(body: Body) -> Self {
        let kind = body.message_type();
        Self::new(kind).with_payload(body.into_payload())
    }

    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_ack_required(mut self, ack_required: bool) -> Self {
        self.ack_required = ack_required;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn kind(&self) -> &MessageType {
        &self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn ack_required(&self) -> bool {
        self.ack_required
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// The id this envelope answers, if it is a response or ack.
    pub fn original_id(&self) -> Option<&str> {
        self.payload.get("original_id").and_then(Value::as_str)
    }

    /// Serialize to a single JSON line. The framing layer appends `\n`.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Encode)
    }

    /// Parse one line and validate the payload of known message types.
    pub fn decode(line: &str) -> Result<Self, EnvelopeError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(EnvelopeError::Empty);
        }
        let envelope: Self = serde_json::from_str(line).map_err(EnvelopeError::Malformed)?;
        envelope.body()?;
        Ok(envelope)
    }

    /// Typed view of the payload.
    pub fn body(&self) -> Result<Body, EnvelopeError> {
        Body::from_parts(&self.kind, &self.payload)
    }

    /// Derive a response envelope of `kind` addressed back to the sender.
    ///
    /// `payload.original_id` is filled in unless the caller already set it.
    pub fn create_response(&self, kind: MessageType, payload: Payload, ack_required: bool) -> Self {
        let now = Utc::now();
        let mut payload = payload;
        payload
            .entry("original_id")
            .or_insert_with(|| Value::String(self.id.clone()));
        Self {
            kind,
            id: format!("{}_response_{}", self.id, now.timestamp_millis()),
            timestamp: now,
            payload,
            ack_required,
            source: self.target.clone(),
            target: self.source.clone(),
        }
    }

    /// Derive the acknowledgement for this envelope.
    pub fn create_ack(&self, success: bool, error: Option<String>) -> Self {
        let body = crate::payload::AckPayload {
            original_id: self.id.clone(),
            success,
            error,
        };
        Self {
            kind: MessageType::Ack,
            id: format!("{}_ack", self.id),
            timestamp: Utc::now(),
            payload: Body::Ack(body).into_payload(),
            ack_required: false,
            source: self.target.clone(),
            target: self.source.clone(),
        }
    }
}
