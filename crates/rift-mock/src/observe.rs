//! Observability hooks: counters and the recent-request log.
//!
//! The engine reports through [`Observer`] and [`RequestTracker`] and never
//! waits on them. Exposition of the counters belongs to whoever embeds the
//! engine; [`gather_metrics`] renders them in the Prometheus text format.

use crate::error::ScriptError;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use prometheus::{register_counter, register_counter_vec, Counter, CounterVec, Encoder, TextEncoder};
use serde::Serialize;
use std::collections::VecDeque;

lazy_static! {
    /// Requests answered by a rule
    pub static ref MATCHES_TOTAL: CounterVec = register_counter_vec!(
        "rift_mock_matches_total",
        "Total number of requests matched by a rule",
        &["rule"]
    )
    .unwrap();

    /// Requests no rule matched
    pub static ref NO_MATCH_TOTAL: Counter = register_counter!(
        "rift_mock_no_match_total",
        "Total number of requests that matched no rule"
    )
    .unwrap();

    /// Chaos failures injected
    pub static ref CHAOS_TOTAL: CounterVec = register_counter_vec!(
        "rift_mock_chaos_total",
        "Total number of chaos failures injected",
        &["rule", "status"]
    )
    .unwrap();

    /// Callbacks that failed to deliver
    pub static ref CALLBACK_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "rift_mock_callback_failures_total",
        "Total number of failed callback deliveries",
        &["rule"]
    )
    .unwrap();

    /// Script runtime failures
    pub static ref SCRIPT_ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "rift_mock_script_errors_total",
        "Total number of script execution errors",
        &["rule"]
    )
    .unwrap();
}

/// Receiver of engine events. Every method has a no-op default.
pub trait Observer: Send + Sync {
    fn on_match(&self, _rule: &str) {}
    fn on_no_match(&self, _method: &str, _uri: &str) {}
    fn on_chaos(&self, _rule: &str, _status: u16) {}
    fn on_callback_failure(&self, _rule: &str, _error: &str) {}
    fn on_script_error(&self, _rule: &str, _error: &ScriptError) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Observer backed by the process-wide Prometheus registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusObserver;

impl Observer for PrometheusObserver {
    fn on_match(&self, rule: &str) {
        MATCHES_TOTAL.with_label_values(&[rule]).inc();
    }

    fn on_no_match(&self, _method: &str, _uri: &str) {
        NO_MATCH_TOTAL.inc();
    }

    fn on_chaos(&self, rule: &str, status: u16) {
        CHAOS_TOTAL
            .with_label_values(&[rule, &status.to_string()])
            .inc();
    }

    fn on_callback_failure(&self, rule: &str, _error: &str) {
        CALLBACK_FAILURES_TOTAL.with_label_values(&[rule]).inc();
    }

    fn on_script_error(&self, rule: &str, _error: &ScriptError) {
        SCRIPT_ERRORS_TOTAL.with_label_values(&[rule]).inc();
    }
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// One handled request, as kept for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub uri: String,
    /// Matched rule, None when nothing matched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub status: u16,
    pub chaos: bool,
    pub duration_ms: u64,
}

/// Sink for request summaries. Must not block.
pub trait RequestTracker: Send + Sync {
    fn record(&self, summary: RequestSummary);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracker;

impl RequestTracker for NoopTracker {
    fn record(&self, _summary: RequestSummary) {}
}

/// Bounded in-memory ring of the most recent requests.
#[derive(Debug)]
pub struct RequestLog {
    capacity: usize,
    entries: Mutex<VecDeque<RequestSummary>>,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<RequestSummary> {
        self.entries.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RequestTracker for RequestLog {
    fn record(&self, summary: RequestSummary) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(uri: &str) -> RequestSummary {
        RequestSummary {
            timestamp: Utc::now(),
            method: "GET".to_string(),
            uri: uri.to_string(),
            rule: Some("r".to_string()),
            status: 200,
            chaos: false,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_request_log_is_bounded() {
        let log = RequestLog::new(2);
        log.record(summary("/a"));
        log.record(summary("/b"));
        log.record(summary("/c"));
        assert_eq!(log.len(), 2);
        let uris: Vec<String> = log.recent(10).into_iter().map(|s| s.uri).collect();
        assert_eq!(uris, vec!["/c".to_string(), "/b".to_string()]);
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let log = RequestLog::new(0);
        log.record(summary("/a"));
        assert!(log.is_empty());
    }

    #[test]
    fn test_prometheus_observer_counts() {
        let observer = PrometheusObserver;
        let before = MATCHES_TOTAL.with_label_values(&["observe-test"]).get();
        observer.on_match("observe-test");
        observer.on_chaos("observe-test", 503);
        assert_eq!(
            MATCHES_TOTAL.with_label_values(&["observe-test"]).get(),
            before + 1.0
        );
        let text = gather_metrics();
        assert!(text.contains("rift_mock_matches_total"));
        assert!(text.contains("rift_mock_chaos_total"));
    }
}
