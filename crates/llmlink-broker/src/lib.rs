//! Connection broker for the local and cloud inference endpoints.
//!
//! [`ConnectionBroker`] owns one [`ConnectionHealth`] record per endpoint,
//! refreshes them on a fixed interval, routes proxied requests by preference
//! (local first, then cloud), and feeds every outcome into the
//! [`MetricsAggregator`].

pub mod broker;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod upstream;

pub use broker::{BrokerEvent, BrokerStatus, ConnectionBroker, EndpointStatus};
pub use config::{BrokerConfig, ConfigError, LoadedConfig};
pub use error::{BrokerError, Result};
pub use health::{ConnectionHealth, EndpointKind, EndpointState, Quality};
pub use metrics::{MetricsAggregator, MetricsSnapshot, Percentiles};
