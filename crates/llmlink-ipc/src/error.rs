use std::time::Duration;

use llmlink_protocol::EnvelopeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IpcError>;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {message}")]
    Connect { addr: String, message: String },

    #[error("listener already running on port {port}")]
    AlreadyRunning { port: u16 },

    #[error("not connected")]
    NotConnected,

    #[error("no response to {id} within {}ms", timeout.as_millis())]
    Timeout { id: String, timeout: Duration },

    #[error("connection dropped before {id} was answered")]
    Disconnected { id: String },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    /// Errors that the reconnect machinery recovers from on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::NotConnected | Self::Disconnected { .. } | Self::Io(_)
        )
    }
}
