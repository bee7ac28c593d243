//! Metrics instrumentation for kubedock-dns.
//!
//! All metrics are prefixed with `kubedock_dns.`

use metrics::{counter, gauge, histogram};
use std::time::Instant;

/// Record a DNS query.
pub fn record_query(record_type: &str, result: QueryResult, duration: std::time::Duration) {
    let result_str = match result {
        QueryResult::Answered => "answered",
        QueryResult::Forwarded => "forwarded",
        QueryResult::NotFound => "not_found",
        QueryResult::UpstreamFailed => "upstream_failed",
    };

    counter!("kubedock_dns.query.count", "type" => record_type.to_string(), "result" => result_str)
        .increment(1);
    histogram!("kubedock_dns.query.duration.seconds", "type" => record_type.to_string())
        .record(duration.as_secs_f64());
}

/// Query result type for metrics.
#[derive(Debug, Clone, Copy)]
pub enum QueryResult {
    /// Answered from the network snapshot.
    Answered,
    /// Delegated to the upstream resolver.
    Forwarded,
    /// Internal name still unknown when the retry window closed.
    NotFound,
    /// The upstream exchange failed.
    UpstreamFailed,
}

/// Record one iteration of the internal-name retry loop.
pub fn record_lookup_retry() {
    counter!("kubedock_dns.query.retry.count").increment(1);
}

/// Record a watch event by kind ("apply", "delete", "error").
pub fn record_watch_event(event: &str) {
    counter!("kubedock_dns.watch.event.count", "event" => event.to_string()).increment(1);
}

/// Record an admission decision.
pub fn record_admission(operation: &str, allowed: bool) {
    let result = if allowed { "allowed" } else { "denied" };
    counter!("kubedock_dns.admission.count", "operation" => operation.to_string(), "result" => result)
        .increment(1);
}

/// Record a snapshot rebuild and the resulting state counts.
pub fn record_snapshot(pods: usize, networks: usize, errors: usize) {
    counter!("kubedock_dns.snapshot.rebuild.count").increment(1);
    gauge!("kubedock_dns.state.pods.count").set(pods as f64);
    gauge!("kubedock_dns.state.networks.count").set(networks as f64);
    gauge!("kubedock_dns.state.pod_errors.count").set(errors as f64);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
