//! The llmlink broker daemon.
//!
//! Hosts the connection broker, the IPC listener sibling processes connect
//! to, and the HTTP/WebSocket surface operators query. [`Daemon`] wires them
//! together; `llmlinkd` is a thin binary around it.

pub mod api;
pub mod daemon;
pub mod dispatch;
pub mod reload;
pub mod ws;

pub use api::AppState;
pub use daemon::{Daemon, DaemonOptions};
