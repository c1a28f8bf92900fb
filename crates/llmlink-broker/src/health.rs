use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Local,
    Cloud,
}

impl EndpointKind {
    /// In preference order.
    pub const ALL: [Self; 2] = [Self::Local, Self::Cloud];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "cloud" => Ok(Self::Cloud),
            other => Err(format!("unknown endpoint '{other}' (expected local or cloud)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Excellent,
    Good,
    Poor,
    Critical,
}

impl Quality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Unchecked,
    Healthy,
    Degraded,
    Unreachable,
}

/// Snapshot of one upstream endpoint.
///
/// Never mutated in place: every check or request outcome produces a new
/// record via the `with_*` methods and the broker publishes it whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub kind: EndpointKind,
    pub is_connected: bool,
    pub endpoint: String,
    pub version: Option<String>,
    pub models: BTreeSet<String>,
    pub error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
    pub latency_ms: f64,
    pub request_count: u64,
    pub error_count: u64,
    pub last_error: Option<DateTime<Utc>>,
}

impl ConnectionHealth {
    pub fn new(kind: EndpointKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            is_connected: false,
            endpoint: endpoint.into(),
            version: None,
            models: BTreeSet::new(),
            error: None,
            last_check: None,
            latency_ms: 0.0,
            request_count: 0,
            error_count: 0,
            last_error: None,
        }
    }

    /// Successful probe. `models` of `None` keeps the previous list.
    pub fn with_check_success(
        &self,
        latency_ms: f64,
        version: Option<String>,
        models: Option<BTreeSet<String>>,
    ) -> Self {
        Self {
            is_connected: true,
            version: version.or_else(|| self.version.clone()),
            models: models.unwrap_or_else(|| self.models.clone()),
            error: None,
            last_check: Some(Utc::now()),
            latency_ms,
            request_count: self.request_count + 1,
            ..self.clone()
        }
    }

    pub fn with_check_failure(&self, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            is_connected: false,
            error: Some(error.into()),
            last_check: Some(now),
            request_count: self.request_count + 1,
            error_count: self.error_count + 1,
            last_error: Some(now),
            ..self.clone()
        }
    }

    pub fn with_request_success(&self, latency_ms: f64) -> Self {
        Self {
            is_connected: true,
            error: None,
            latency_ms,
            request_count: self.request_count + 1,
            ..self.clone()
        }
    }

    /// Failed request. `reachable` is false when the endpoint could not be
    /// contacted at all, which also marks it disconnected.
    pub fn with_request_failure(&self, error: impl Into<String>, reachable: bool) -> Self {
        Self {
            is_connected: self.is_connected && reachable,
            error: Some(error.into()),
            request_count: self.request_count + 1,
            error_count: self.error_count + 1,
            last_error: Some(Utc::now()),
            ..self.clone()
        }
    }

    /// Fraction of requests that failed, 0.0 when nothing was sent yet.
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }

    pub fn quality(&self) -> Quality {
        let error_rate = self.error_rate();
        if !self.is_connected || error_rate > 0.10 {
            Quality::Critical
        } else if self.latency_ms > 5000.0 {
            Quality::Poor
        } else if self.latency_ms > 1000.0 || error_rate > 0.05 {
            Quality::Good
        } else {
            Quality::Excellent
        }
    }

    pub fn state(&self) -> EndpointState {
        if self.last_check.is_none() && self.request_count == 0 {
            EndpointState::Unchecked
        } else if !self.is_connected {
            EndpointState::Unreachable
        } else if self.quality() == Quality::Excellent {
            EndpointState::Healthy
        } else {
            EndpointState::Degraded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(latency_ms: f64, requests: u64, errors: u64) -> ConnectionHealth {
        ConnectionHealth {
            is_connected: true,
            latency_ms,
            request_count: requests,
            error_count: errors,
            ..ConnectionHealth::new(EndpointKind::Local, "http://localhost:11434")
        }
    }

    #[test]
    fn new_record_is_unchecked_and_critical() {
        let health = ConnectionHealth::new(EndpointKind::Cloud, "https://example.invalid");
        assert_eq!(health.state(), EndpointState::Unchecked);
        assert_eq!(health.quality(), Quality::Critical);
        assert_eq!(health.error_rate(), 0.0);
    }

    #[test]
    fn disconnected_is_always_critical() {
        for (latency, requests, errors) in [(0.0, 0, 0), (10.0, 1000, 0), (9000.0, 5, 5)] {
            let health = ConnectionHealth {
                is_connected: false,
                ..connected(latency, requests, errors)
            };
            assert_eq!(health.quality(), Quality::Critical);
        }
    }

    #[test]
    fn quality_thresholds() {
        assert_eq!(connected(50.0, 100, 0).quality(), Quality::Excellent);
        assert_eq!(connected(1000.0, 100, 5).quality(), Quality::Excellent);
        assert_eq!(connected(1000.1, 100, 0).quality(), Quality::Good);
        assert_eq!(connected(50.0, 100, 6).quality(), Quality::Good);
        assert_eq!(connected(5000.1, 100, 0).quality(), Quality::Poor);
        assert_eq!(connected(50.0, 100, 11).quality(), Quality::Critical);
    }

    #[test]
    fn failing_checks_on_a_noisy_endpoint_are_critical() {
        let mut health = connected(120.0, 100, 12);
        for _ in 0..3 {
            health = health.with_check_failure("connection refused");
        }
        assert_eq!(health.request_count, 103);
        assert_eq!(health.error_count, 15);
        assert!(health.last_error.is_some());
        assert_eq!(health.quality(), Quality::Critical);
        assert_eq!(health.state(), EndpointState::Unreachable);
    }

    #[test]
    fn error_rate_alone_makes_a_connected_endpoint_critical() {
        let health = connected(120.0, 100, 12);
        assert!(health.is_connected);
        assert_eq!(health.quality(), Quality::Critical);
        assert_eq!(health.state(), EndpointState::Degraded);
    }

    #[test]
    fn check_success_replaces_rather_than_mutates() {
        let before = ConnectionHealth::new(EndpointKind::Local, "http://localhost:11434")
            .with_check_failure("refused");
        let models: BTreeSet<String> = ["llama3".to_string()].into();
        let after = before.with_check_success(42.0, Some("0.5.1".into()), Some(models.clone()));

        assert!(!before.is_connected);
        assert!(before.error.is_some());
        assert!(after.is_connected);
        assert_eq!(after.error, None);
        assert_eq!(after.models, models);
        assert_eq!(after.version.as_deref(), Some("0.5.1"));
        assert_eq!(after.error_count, 1);
        assert_eq!(after.last_error, before.last_error);
        assert_eq!(after.state(), EndpointState::Degraded);
    }

    #[test]
    fn unreachable_request_failure_disconnects() {
        let health = connected(10.0, 10, 0);
        let refused = health.with_request_failure("connection refused", false);
        assert!(!refused.is_connected);
        let status = health.with_request_failure("HTTP 404", true);
        assert!(status.is_connected);
        assert_eq!(status.error_count, 1);
    }

    #[test]
    fn kind_parsing() {
        assert_eq!("Local".parse::<EndpointKind>().unwrap(), EndpointKind::Local);
        assert_eq!(" cloud ".parse::<EndpointKind>().unwrap(), EndpointKind::Cloud);
        assert!("remote".parse::<EndpointKind>().is_err());
        assert_eq!(serde_json::to_string(&EndpointKind::Cloud).unwrap(), "\"cloud\"");
    }
}
