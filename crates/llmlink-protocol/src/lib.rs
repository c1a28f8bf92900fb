pub mod discovery;
pub mod envelope;
pub mod paths;
pub mod payload;

pub use discovery::{DiscoveryError, DiscoveryFile};
pub use envelope::{Envelope, EnvelopeError, MessageType, Payload};
pub use payload::Body;

/// Maximum size of a single JSON-lines frame on the IPC socket (1 MiB).
///
/// Stream chunks relayed from the inference endpoints are the largest
/// envelopes on the wire; anything beyond this is treated as a protocol error.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Protocol revision advertised in `welcome` envelopes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Discovery role published by the broker daemon.
pub const BROKER_ROLE: &str = "tray";
