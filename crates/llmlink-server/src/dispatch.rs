use futures_util::StreamExt;
use llmlink_broker::{ConnectionBroker, EndpointKind};
use llmlink_ipc::{InboundEnvelope, IpcListener};
use llmlink_protocol::payload::{
    ServiceStatusPayload, StreamCompletePayload, StreamErrorPayload, StreamRequestPayload,
    StreamResponsePayload,
};
use llmlink_protocol::{Body, Envelope, MessageType};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Request types the dispatcher answers with a typed response, so the
/// listener must not ack them as well.
pub const TYPED_REPLIES: [MessageType; 2] = [MessageType::HealthCheck, MessageType::StreamRequest];

/// Routes envelopes from IPC peers to the broker and answers them.
#[derive(Clone)]
pub struct Dispatcher {
    broker: ConnectionBroker,
    listener: IpcListener,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// `shutdown` is cancelled when a peer asks the application to quit.
    pub fn new(broker: ConnectionBroker, listener: IpcListener, shutdown: CancellationToken) -> Self {
        Self {
            broker,
            listener,
            shutdown,
        }
    }

    /// Consume inbound envelopes until shutdown.
    pub async fn run(self) {
        let mut inbound = self.listener.subscribe();
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = inbound.recv() => next,
            };
            match next {
                Ok(message) => self.handle(message).await,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "dispatcher lagged, inbound envelopes dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("dispatcher exited");
    }

    pub async fn handle(&self, message: InboundEnvelope) {
        let InboundEnvelope { peer_id, envelope } = message;
        let body = match envelope.body() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(peer = %peer_id, err = %e, "dropping envelope with invalid payload");
                return;
            }
        };

        match body {
            // Pings were already answered by the listener.
            Body::Ping | Body::Pong(_) | Body::Ack(_) | Body::Welcome(_) => {}
            Body::AuthStatus(auth) => {
                let token = auth.token.filter(|_| auth.authenticated);
                self.broker.update_auth_token(token);
            }
            Body::HealthCheck => {
                let payload = Body::ServiceStatus(service_status(&self.broker)).into_payload();
                let reply = envelope.create_response(MessageType::ServiceStatus, payload, false);
                self.listener.send_to(&peer_id, &reply).await;
            }
            Body::StreamRequest(request) => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.stream_reply(peer_id, envelope, request).await;
                });
            }
            Body::ShowWindow | Body::HideWindow | Body::ToggleWindow | Body::OpenSettings => {
                self.relay(&peer_id, &envelope).await;
            }
            Body::QuitApplication => {
                self.relay(&peer_id, &envelope).await;
                tracing::info!(peer = %peer_id, "quit requested over IPC");
                self.shutdown.cancel();
            }
            Body::Error(error) => {
                tracing::warn!(peer = %peer_id, message = %error.message, "peer reported an error");
            }
            Body::StreamResponse(_)
            | Body::StreamComplete(_)
            | Body::StreamError(_)
            | Body::ServiceStatus(_) => {
                tracing::debug!(peer = %peer_id, kind = %envelope.kind(), "ignoring broker-bound reply");
            }
            Body::Other { kind, .. } => {
                tracing::warn!(peer = %peer_id, kind = %kind, "dropping envelope of unknown type");
            }
        }
    }

    /// Forward a window command to every other peer.
    async fn relay(&self, from: &str, envelope: &Envelope) {
        let mut delivered = 0;
        for peer in self.listener.peer_ids() {
            if peer == from {
                continue;
            }
            let forwarded = envelope.clone().with_target(peer.clone());
            if self.listener.send_to(&peer, &forwarded).await {
                delivered += 1;
            }
        }
        tracing::debug!(kind = %envelope.kind(), delivered, "relayed window command");
    }

    async fn stream_reply(&self, peer_id: String, request: Envelope, payload: StreamRequestPayload) {
        let original_id = request.id().to_string();
        let reply = |body: Body| {
            Envelope::from_body(body)
                .with_source(self.listener.server_id())
                .with_target(peer_id.clone())
        };
        let fail = |message: String| {
            reply(Body::StreamError(StreamErrorPayload {
                original_id: original_id.clone(),
                message,
            }))
        };

        let preferred = match payload.endpoint.as_deref().map(str::parse::<EndpointKind>) {
            None => None,
            Some(Ok(kind)) => Some(kind),
            Some(Err(message)) => {
                self.listener.send_to(&peer_id, &fail(message)).await;
                return;
            }
        };

        let mut stream = match self
            .broker
            .stream_chat(&payload.model, payload.messages.as_slice(), preferred)
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(peer = %peer_id, err = %e, "stream request rejected");
                self.listener.send_to(&peer_id, &fail(e.to_string())).await;
                return;
            }
        };

        let mut chunks = 0u64;
        while let Some(item) = stream.next().await {
            let envelope = match item {
                Ok(chunk) => {
                    chunks += 1;
                    reply(Body::StreamResponse(StreamResponsePayload {
                        original_id: original_id.clone(),
                        chunk,
                    }))
                }
                Err(e) => {
                    tracing::warn!(peer = %peer_id, err = %e, "chat stream failed");
                    self.listener.send_to(&peer_id, &fail(e.to_string())).await;
                    return;
                }
            };
            if !self.listener.send_to(&peer_id, &envelope).await {
                tracing::debug!(peer = %peer_id, "peer left mid-stream");
                return;
            }
        }

        let complete = reply(Body::StreamComplete(StreamCompletePayload {
            original_id,
            chunks,
        }));
        self.listener.send_to(&peer_id, &complete).await;
    }
}

/// Current broker state as a `service_status` payload.
pub fn service_status(broker: &ConnectionBroker) -> ServiceStatusPayload {
    let status = broker.status();
    ServiceStatusPayload {
        status: status.status.to_string(),
        preferred: status.preferred.map(|kind| kind.to_string()),
        connections: serde_json::to_value(&status.endpoints).unwrap_or_default(),
        original_id: None,
    }
}

/// Broadcast a `service_status` to every peer whenever an endpoint changes.
pub async fn push_status(broker: ConnectionBroker, listener: IpcListener, shutdown: CancellationToken) {
    let mut events = broker.subscribe();
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = events.recv() => next,
        };
        match next {
            Ok(_) | Err(RecvError::Lagged(_)) => {
                let envelope = Envelope::from_body(Body::ServiceStatus(service_status(&broker)))
                    .with_source(listener.server_id());
                let delivered = listener.broadcast(&envelope).await;
                tracing::debug!(peers = delivered, "pushed service status");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
