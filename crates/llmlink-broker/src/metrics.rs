use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::health::EndpointKind;

/// Latency samples kept across all endpoints.
pub const GLOBAL_WINDOW: usize = 1000;
/// Latency samples kept per endpoint kind.
pub const PER_KIND_WINDOW: usize = 100;

/// Insertion-ordered latency samples; evicts oldest-first at capacity.
#[derive(Debug, Clone)]
struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, latency_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Nearest-rank percentile over a sorted copy: index `ceil(n * p) - 1`,
    /// clamped to the sample range.
    fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        Some(sorted[rank_index(sorted.len(), p)])
    }

    fn percentiles(&self) -> Percentiles {
        Percentiles {
            p50: self.percentile(0.50).unwrap_or(0.0),
            p95: self.percentile(0.95).unwrap_or(0.0),
            p99: self.percentile(0.99).unwrap_or(0.0),
        }
    }
}

fn rank_index(len: usize, p: f64) -> usize {
    let rank = (len as f64 * p.clamp(0.0, 1.0)).ceil() as usize;
    rank.saturating_sub(1).min(len - 1)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EndpointMetrics {
    pub samples: usize,
    pub average_latency_ms: f64,
    pub latency: Percentiles,
    pub errors: BTreeMap<String, u64>,
}

/// Everything `GET /api/metrics` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Percentages, 0-100.
    pub success_rate: f64,
    pub error_rate: f64,
    pub requests_per_second: f64,
    pub average_latency_ms: f64,
    pub latency: Percentiles,
    pub endpoints: BTreeMap<EndpointKind, EndpointMetrics>,
    pub last_error: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
    pub health_score: f64,
}

/// Rolling request statistics for one broker.
#[derive(Debug)]
pub struct MetricsAggregator {
    started: Instant,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    latencies: LatencyWindow,
    per_kind: BTreeMap<EndpointKind, LatencyWindow>,
    errors: BTreeMap<EndpointKind, BTreeMap<String, u64>>,
    last_error: Option<DateTime<Utc>>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            latencies: LatencyWindow::new(GLOBAL_WINDOW),
            per_kind: BTreeMap::new(),
            errors: BTreeMap::new(),
            last_error: None,
        }
    }

    pub fn record_success(&mut self, kind: EndpointKind, latency_ms: f64) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.record_latency(kind, latency_ms);
    }

    /// `latency_ms` is `None` when the request never got a response.
    pub fn record_failure(&mut self, kind: EndpointKind, error_type: &str, latency_ms: Option<f64>) {
        self.total_requests += 1;
        self.failed_requests += 1;
        *self
            .errors
            .entry(kind)
            .or_default()
            .entry(error_type.to_string())
            .or_insert(0) += 1;
        self.last_error = Some(Utc::now());
        if let Some(latency_ms) = latency_ms {
            self.record_latency(kind, latency_ms);
        }
    }

    fn record_latency(&mut self, kind: EndpointKind, latency_ms: f64) {
        self.latencies.push(latency_ms);
        self.per_kind
            .entry(kind)
            .or_insert_with(|| LatencyWindow::new(PER_KIND_WINDOW))
            .push(latency_ms);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn percentile(&self, p: f64) -> Option<f64> {
        self.latencies.percentile(p)
    }

    pub fn percentiles(&self) -> Percentiles {
        self.latencies.percentiles()
    }

    pub fn endpoint_percentiles(&self, kind: EndpointKind) -> Option<Percentiles> {
        self.per_kind.get(&kind).map(LatencyWindow::percentiles)
    }

    pub fn average_latency(&self) -> f64 {
        self.latencies.average().unwrap_or(0.0)
    }

    /// Percentage of requests that succeeded; 100 before any request.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            100.0
        } else {
            self.successful_requests as f64 * 100.0 / self.total_requests as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 * 100.0 / self.total_requests as f64
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn requests_per_second(&self) -> f64 {
        let secs = self.uptime().as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.total_requests as f64 / secs
        }
    }

    /// 0-100: 100 minus the error percentage, minus 10 for average latency
    /// above 1s (20 above 5s), scaled by the fraction of connected endpoints.
    pub fn health_score(&self, connected_fraction: f64) -> f64 {
        let mut score = 100.0 - self.error_rate();
        let average = self.average_latency();
        if average > 5000.0 {
            score -= 20.0;
        } else if average > 1000.0 {
            score -= 10.0;
        }
        let fraction = if connected_fraction.is_finite() {
            connected_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        (score * fraction).clamp(0.0, 100.0)
    }

    pub fn snapshot(&self, connected_fraction: f64) -> MetricsSnapshot {
        let kinds = self.per_kind.keys().chain(self.errors.keys()).copied();
        let endpoints = kinds
            .map(|kind| {
                let window = self.per_kind.get(&kind);
                let metrics = EndpointMetrics {
                    samples: window.map_or(0, |w| w.samples.len()),
                    average_latency_ms: window.and_then(LatencyWindow::average).unwrap_or(0.0),
                    latency: window.map(LatencyWindow::percentiles).unwrap_or_default(),
                    errors: self.errors.get(&kind).cloned().unwrap_or_default(),
                };
                (kind, metrics)
            })
            .collect();

        MetricsSnapshot {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            success_rate: self.success_rate(),
            error_rate: self.error_rate(),
            requests_per_second: self.requests_per_second(),
            average_latency_ms: self.average_latency(),
            latency: self.percentiles(),
            endpoints,
            last_error: self.last_error,
            uptime_secs: self.uptime().as_secs(),
            health_score: self.health_score(connected_fraction),
        }
    }

    /// Clear every counter and window; uptime restarts too.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_over_ten_samples() {
        let mut metrics = MetricsAggregator::new();
        for latency in (1..=10).map(|i| f64::from(i) * 100.0) {
            metrics.record_success(EndpointKind::Local, latency);
        }
        assert_eq!(metrics.percentile(0.50), Some(500.0));
        assert_eq!(metrics.percentile(0.99), Some(1000.0));
        assert_eq!(metrics.percentile(0.95), Some(1000.0));
        assert_eq!(metrics.percentile(0.0), Some(100.0));
    }

    #[test]
    fn percentiles_sort_a_copy() {
        let mut metrics = MetricsAggregator::new();
        for latency in [900.0, 100.0, 500.0] {
            metrics.record_success(EndpointKind::Cloud, latency);
        }
        assert_eq!(metrics.percentile(0.5), Some(500.0));
        let order: Vec<f64> = metrics.latencies.samples.iter().copied().collect();
        assert_eq!(order, vec![900.0, 100.0, 500.0]);
    }

    #[test]
    fn percentiles_are_monotonic() {
        let mut metrics = MetricsAggregator::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for n in 1..300 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            metrics.record_success(EndpointKind::Local, (seed % 10_000) as f64);
            let p = metrics.percentiles();
            assert!(p.p50 <= p.p95 && p.p95 <= p.p99, "n={n}: {p:?}");
        }
    }

    #[test]
    fn empty_window_has_no_percentiles() {
        let metrics = MetricsAggregator::new();
        assert_eq!(metrics.percentile(0.5), None);
        assert_eq!(metrics.percentiles(), Percentiles::default());
        assert_eq!(metrics.success_rate(), 100.0);
    }

    #[test]
    fn windows_evict_oldest_first() {
        let mut metrics = MetricsAggregator::new();
        for i in 0..(GLOBAL_WINDOW + 5) {
            metrics.record_success(EndpointKind::Local, i as f64);
        }
        assert_eq!(metrics.latencies.samples.len(), GLOBAL_WINDOW);
        assert_eq!(metrics.latencies.samples.front(), Some(&5.0));
        let local = &metrics.per_kind[&EndpointKind::Local];
        assert_eq!(local.samples.len(), PER_KIND_WINDOW);
        assert_eq!(local.samples.front(), Some(&((GLOBAL_WINDOW + 5 - PER_KIND_WINDOW) as f64)));
        assert_eq!(metrics.total_requests(), (GLOBAL_WINDOW + 5) as u64);
    }

    #[test]
    fn health_score_components() {
        let mut metrics = MetricsAggregator::new();
        assert_eq!(metrics.health_score(1.0), 100.0);
        assert_eq!(metrics.health_score(0.5), 50.0);

        for _ in 0..9 {
            metrics.record_success(EndpointKind::Local, 2000.0);
        }
        metrics.record_failure(EndpointKind::Local, "timeout", None);
        // 10% errors and 2s average latency.
        assert!((metrics.health_score(1.0) - 80.0).abs() < 1e-9);

        metrics.record_success(EndpointKind::Local, 60_000.0);
        let score = metrics.health_score(1.0);
        assert!(score < 80.0);
    }

    #[test]
    fn health_score_is_bounded() {
        let mut metrics = MetricsAggregator::new();
        for _ in 0..50 {
            metrics.record_failure(EndpointKind::Cloud, "connection", Some(9000.0));
        }
        for fraction in [-1.0, 0.0, 0.5, 1.0, 3.0, f64::NAN, f64::INFINITY] {
            let score = metrics.health_score(fraction);
            assert!((0.0..=100.0).contains(&score), "{fraction} -> {score}");
        }
    }

    #[test]
    fn snapshot_groups_errors_per_endpoint() {
        let mut metrics = MetricsAggregator::new();
        metrics.record_success(EndpointKind::Local, 10.0);
        metrics.record_failure(EndpointKind::Cloud, "unauthenticated", None);
        metrics.record_failure(EndpointKind::Cloud, "unauthenticated", None);
        metrics.record_failure(EndpointKind::Cloud, "timeout", None);

        let snapshot = metrics.snapshot(0.5);
        assert_eq!(snapshot.total_requests, 4);
        assert_eq!(snapshot.failed_requests, 3);
        assert_eq!(snapshot.error_rate, 75.0);
        let cloud = &snapshot.endpoints[&EndpointKind::Cloud];
        assert_eq!(cloud.errors["unauthenticated"], 2);
        assert_eq!(cloud.samples, 0);
        assert!(snapshot.last_error.is_some());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["endpoints"]["cloud"]["errors"]["timeout"].is_number());
        assert!(json["latency"]["p99"].is_number());
    }

    #[test]
    fn reset_clears_everything() {
        let mut metrics = MetricsAggregator::new();
        metrics.record_failure(EndpointKind::Local, "timeout", Some(5.0));
        metrics.reset();
        let snapshot = metrics.snapshot(1.0);
        assert_eq!(snapshot.total_requests, 0);
        assert!(snapshot.endpoints.is_empty());
        assert_eq!(snapshot.last_error, None);
        assert_eq!(snapshot.health_score, 100.0);
    }
}
