//! IPC transport for llmlink: a TCP [`IpcListener`] that tracks peers and
//! answers pings, and an [`IpcConnector`] that correlates requests with
//! responses, sends heartbeats, and reconnects with linear backoff.

pub mod connector;
pub mod error;
mod framing;
pub mod listener;

pub use connector::{ConnectionState, ConnectorConfig, IpcConnector, PortSource, SendOptions};
pub use error::{IpcError, Result};
pub use listener::{InboundEnvelope, IpcListener};
