use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{EnvelopeError, MessageType, Payload};

// ---------------------------------------------------------------------------
// Payload structs for the known message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub original_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
}

/// Sent by a listener to every peer right after accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub server_id: String,
    pub client_id: String,
    #[serde(default)]
    pub protocol_version: u32,
}

/// Authentication state pushed by the UI process. The token is opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatusPayload {
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequestPayload {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Force `local` or `cloud` instead of the broker's preference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResponsePayload {
    pub original_id: String,
    pub chunk: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCompletePayload {
    pub original_id: String,
    pub chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamErrorPayload {
    pub original_id: String,
    pub message: String,
}

/// Broker status push. `connections` mirrors `GET /api/connections`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatusPayload {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred: Option<String>,
    #[serde(default)]
    pub connections: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Body
// ---------------------------------------------------------------------------

/// Typed view of an envelope: one variant per message type.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Ping,
    Pong(PongPayload),
    Ack(AckPayload),
    Error(ErrorPayload),
    Welcome(WelcomePayload),
    ShowWindow,
    HideWindow,
    ToggleWindow,
    OpenSettings,
    QuitApplication,
    AuthStatus(AuthStatusPayload),
    StreamRequest(StreamRequestPayload),
    StreamResponse(StreamResponsePayload),
    StreamComplete(StreamCompletePayload),
    StreamError(StreamErrorPayload),
    ServiceStatus(ServiceStatusPayload),
    HealthCheck,
    /// Forward-compatible fallback for tags this build does not know.
    Other { kind: String, payload: Payload },
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Ping => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
            Self::Ack(_) => MessageType::Ack,
            Self::Error(_) => MessageType::Error,
            Self::Welcome(_) => MessageType::Welcome,
            Self::ShowWindow => MessageType::ShowWindow,
            Self::HideWindow => MessageType::HideWindow,
            Self::ToggleWindow => MessageType::ToggleWindow,
            Self::OpenSettings => MessageType::OpenSettings,
            Self::QuitApplication => MessageType::QuitApplication,
            Self::AuthStatus(_) => MessageType::AuthStatus,
            Self::StreamRequest(_) => MessageType::StreamRequest,
            Self::StreamResponse(_) => MessageType::StreamResponse,
            Self::StreamComplete(_) => MessageType::StreamComplete,
            Self::StreamError(_) => MessageType::StreamError,
            Self::ServiceStatus(_) => MessageType::ServiceStatus,
            Self::HealthCheck => MessageType::HealthCheck,
            Self::Other { kind, .. } => MessageType::Other(kind.clone()),
        }
    }

    pub(crate) fn from_parts(kind: &MessageType, payload: &Payload) -> Result<Self, EnvelopeError> {
        let body = match kind {
            MessageType::Ping => Self::Ping,
            MessageType::Pong => Self::Pong(parse(kind, payload)?),
            MessageType::Ack => Self::Ack(parse(kind, payload)?),
            MessageType::Error => Self::Error(parse(kind, payload)?),
            MessageType::Welcome => Self::Welcome(parse(kind, payload)?),
            MessageType::ShowWindow => Self::ShowWindow,
            MessageType::HideWindow => Self::HideWindow,
            MessageType::ToggleWindow => Self::ToggleWindow,
            MessageType::OpenSettings => Self::OpenSettings,
            MessageType::QuitApplication => Self::QuitApplication,
            MessageType::AuthStatus => Self::AuthStatus(parse(kind, payload)?),
            MessageType::StreamRequest => Self::StreamRequest(parse(kind, payload)?),
            MessageType::StreamResponse => Self::StreamResponse(parse(kind, payload)?),
            MessageType::StreamComplete => Self::StreamComplete(parse(kind, payload)?),
            MessageType::StreamError => Self::StreamError(parse(kind, payload)?),
            MessageType::ServiceStatus => Self::ServiceStatus(parse(kind, payload)?),
            MessageType::HealthCheck => Self::HealthCheck,
            MessageType::Other(tag) => Self::Other {
                kind: tag.clone(),
                payload: payload.clone(),
            },
        };
        Ok(body)
    }

    /// Flatten the typed payload into the envelope's string-keyed map.
    pub fn into_payload(self) -> Payload {
        match self {
            Self::Ping
            | Self::ShowWindow
            | Self::HideWindow
            | Self::ToggleWindow
            | Self::OpenSettings
            | Self::QuitApplication
            | Self::HealthCheck => Payload::new(),
            Self::Pong(p) => to_map(&p),
            Self::Ack(p) => to_map(&p),
            Self::Error(p) => to_map(&p),
            Self::Welcome(p) => to_map(&p),
            Self::AuthStatus(p) => to_map(&p),
            Self::StreamRequest(p) => to_map(&p),
            Self::StreamResponse(p) => to_map(&p),
            Self::StreamComplete(p) => to_map(&p),
            Self::StreamError(p) => to_map(&p),
            Self::ServiceStatus(p) => to_map(&p),
            Self::Other { payload, .. } => payload,
        }
    }
}

fn parse<T: DeserializeOwned>(kind: &MessageType, payload: &Payload) -> Result<T, EnvelopeError> {
    serde_json::from_value(Value::Object(payload.clone())).map_err(|source| {
        EnvelopeError::InvalidPayload {
            kind: kind.clone(),
            source,
        }
    })
}

fn to_map<T: Serialize>(payload: &T) -> Payload {
    // Payload structs are plain field bags and always serialize to objects.
    match serde_json::to_value(payload) {
        Ok(Value::Object(map)) => map,
        _ => Payload::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Envelope;
    use serde_json::json;

    #[test]
    fn welcome_body_survives_the_wire() {
        let envelope = Envelope::from_body(Body::Welcome(WelcomePayload {
            server_id: "tray".to_string(),
            client_id: "peer-1".to_string(),
            protocol_version: 1,
        }));
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        match decoded.body().unwrap() {
            Body::Welcome(w) => {
                assert_eq!(w.server_id, "tray");
                assert_eq!(w.client_id, "peer-1");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn stream_request_requires_model_and_messages() {
        let mut payload = Payload::new();
        payload.insert("model".to_string(), json!("llama3"));
        let err = Body::from_parts(&MessageType::StreamRequest, &payload).unwrap_err();
        assert!(err.to_string().contains("stream_request"));

        payload.insert(
            "messages".to_string(),
            json!([{"role": "user", "content": "hi"}]),
        );
        let body = Body::from_parts(&MessageType::StreamRequest, &payload).unwrap();
        assert!(matches!(body, Body::StreamRequest(ref r) if r.messages.len() == 1));
    }

    #[test]
    fn window_commands_ignore_payload() {
        let mut payload = Payload::new();
        payload.insert("anything".to_string(), json!(42));
        assert_eq!(
            Body::from_parts(&MessageType::ToggleWindow, &payload).unwrap(),
            Body::ToggleWindow
        );
        assert!(Body::QuitApplication.into_payload().is_empty());
    }

    #[test]
    fn auth_status_token_is_optional() {
        let envelope = Envelope::from_body(Body::AuthStatus(AuthStatusPayload {
            authenticated: false,
            token: None,
        }));
        assert!(!envelope.payload().contains_key("token"));
        assert_eq!(envelope.kind(), &MessageType::AuthStatus);
    }

    #[test]
    fn other_keeps_payload_verbatim() {
        let mut payload = Payload::new();
        payload.insert("text".to_string(), json!("tooltip"));
        let body = Body::from_parts(&MessageType::from("update_tooltip"), &payload).unwrap();
        assert_eq!(body.message_type().as_str(), "update_tooltip");
        assert_eq!(body.into_payload(), payload);
    }
}
