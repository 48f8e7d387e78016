//! Request statistics with Prometheus text export
//!
//! Requests are classified by forward type (`host-http`, `blacklist`, ...)
//! and by the status recorded for statistics. Forwards that reached an
//! upstream are recorded as 200, DNS failures as 404 and other transport
//! failures as 521, whatever the upstream itself answered. Per-endpoint
//! counts use the key of the matched endpoint; requests that matched none
//! share the `other` label so client-chosen Host values never become labels.

use crate::forwarder::{ForwardType, TransportFailure};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Endpoint label for requests that did not match a registered endpoint
pub const UNMATCHED_ENDPOINT: &str = "other";

const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

pub struct MetricsRegistry {
    pub requests_total: Counter,
    pub requests_by_forward_type: CounterVec,
    pub requests_by_status: CounterVec,
    pub requests_by_endpoint: CounterVec,
    pub request_duration: Histogram,
    pub active_requests: Gauge,
    pub captcha_sessions: Gauge,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            requests_total: Counter::default(),
            requests_by_forward_type: CounterVec::default(),
            requests_by_status: CounterVec::default(),
            requests_by_endpoint: CounterVec::default(),
            request_duration: Histogram::new(DURATION_BUCKETS),
            active_requests: Gauge::default(),
            captcha_sessions: Gauge::default(),
            start_time: Instant::now(),
        }
    }

    /// Record one finished request
    pub fn record(&self, endpoint: Option<&str>, forward_type: ForwardType, status: u16, elapsed: Duration) {
        self.requests_total.inc();
        self.requests_by_forward_type.inc(forward_type.as_str());
        self.requests_by_status.inc(&status.to_string());
        self.requests_by_endpoint.inc(endpoint.unwrap_or(UNMATCHED_ENDPOINT));
        self.request_duration.observe(elapsed.as_secs_f64());
    }

    pub fn export(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP gatehouse_uptime_seconds Gateway uptime in seconds\n");
        out.push_str("# TYPE gatehouse_uptime_seconds gauge\n");
        out.push_str(&format!("gatehouse_uptime_seconds {}\n\n", self.start_time.elapsed().as_secs()));

        out.push_str("# HELP gatehouse_requests_total Requests handled\n");
        out.push_str("# TYPE gatehouse_requests_total counter\n");
        out.push_str(&format!("gatehouse_requests_total {}\n\n", self.requests_total.get()));

        write_labelled(
            &mut out,
            "gatehouse_requests_by_forward_type_total",
            "Requests by how they were handled",
            "forward_type",
            &self.requests_by_forward_type,
        );
        write_labelled(
            &mut out,
            "gatehouse_requests_by_status_total",
            "Requests by recorded status",
            "status",
            &self.requests_by_status,
        );
        write_labelled(
            &mut out,
            "gatehouse_requests_by_endpoint_total",
            "Requests by matched endpoint",
            "endpoint",
            &self.requests_by_endpoint,
        );

        out.push_str("# HELP gatehouse_request_duration_seconds Request duration in seconds\n");
        out.push_str("# TYPE gatehouse_request_duration_seconds histogram\n");
        let (buckets, sum, count) = self.request_duration.snapshot();
        for (le, n) in buckets {
            out.push_str(&format!("gatehouse_request_duration_seconds_bucket{{le=\"{le}\"}} {n}\n"));
        }
        out.push_str(&format!("gatehouse_request_duration_seconds_bucket{{le=\"+Inf\"}} {count}\n"));
        out.push_str(&format!("gatehouse_request_duration_seconds_sum {sum}\n"));
        out.push_str(&format!("gatehouse_request_duration_seconds_count {count}\n\n"));

        out.push_str("# HELP gatehouse_active_requests Requests currently in flight\n");
        out.push_str("# TYPE gatehouse_active_requests gauge\n");
        out.push_str(&format!("gatehouse_active_requests {}\n\n", self.active_requests.get()));

        out.push_str("# HELP gatehouse_captcha_sessions Live CAPTCHA sessions\n");
        out.push_str("# TYPE gatehouse_captcha_sessions gauge\n");
        out.push_str(&format!("gatehouse_captcha_sessions {}\n", self.captcha_sessions.get()));

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn write_labelled(out: &mut String, name: &str, help: &str, label: &str, values: &CounterVec) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} counter\n"));
    for (value, count) in values.snapshot() {
        out.push_str(&format!("{name}{{{label}=\"{}\"}} {count}\n", escape_label(&value)));
    }
    out.push('\n');
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Status recorded for a forward attempt
pub fn forward_status(failure: Option<TransportFailure>) -> u16 {
    failure.map(|f| f.status()).unwrap_or(200)
}

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counter keyed by one label value
#[derive(Debug, Default)]
pub struct CounterVec(DashMap<String, AtomicU64>);

impl CounterVec {
    pub fn inc(&self, label: &str) {
        if let Some(counter) = self.0.get(label) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.0
            .entry(label.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, label: &str) -> u64 {
        self.0
            .get(label)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Values sorted by label
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut values: Vec<_> = self
            .0
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        values.sort();
        values
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cumulative histogram; the sum is kept in microseconds
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [f64],
    counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            counts: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
        for (bound, count) in self.bounds.iter().zip(&self.counts) {
            if seconds <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// (bucket bounds with counts, sum in seconds, total count)
    pub fn snapshot(&self) -> (Vec<(f64, u64)>, f64, u64) {
        let buckets = self
            .bounds
            .iter()
            .zip(&self.counts)
            .map(|(b, c)| (*b, c.load(Ordering::Relaxed)))
            .collect();
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        (buckets, sum, self.count.load(Ordering::Relaxed))
    }
}

static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

pub fn metrics() -> &'static Arc<MetricsRegistry> {
    &METRICS
}

/// Block until no request is in flight or `timeout` passes.
/// Returns whether everything drained.
pub fn wait_for_requests_drain(timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        let active = metrics().active_requests.get();
        if active == 0 {
            return true;
        }
        if start.elapsed() >= timeout {
            tracing::warn!(active_requests = active, "Grace period expired with requests in flight");
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_export() {
        let registry = MetricsRegistry::new();
        registry.record(Some("app.example.com"), ForwardType::HostHttp, 200, Duration::from_millis(20));
        registry.record(Some("app.example.com"), ForwardType::HostHttp, 521, Duration::from_millis(30));
        registry.record(None, ForwardType::Blacklist, 403, Duration::from_millis(1));

        assert_eq!(registry.requests_total.get(), 3);
        assert_eq!(registry.requests_by_forward_type.get("host-http"), 2);
        assert_eq!(registry.requests_by_endpoint.get("app.example.com"), 2);
        assert_eq!(registry.requests_by_endpoint.get(UNMATCHED_ENDPOINT), 1);

        let out = registry.export();
        assert!(out.contains("gatehouse_requests_total 3"));
        assert!(out.contains("gatehouse_requests_by_forward_type_total{forward_type=\"blacklist\"} 1"));
        assert!(out.contains("gatehouse_requests_by_status_total{status=\"521\"} 1"));
        assert!(out.contains("gatehouse_request_duration_seconds_count 3"));
    }

    #[test]
    fn test_forward_status() {
        assert_eq!(forward_status(None), 200);
        assert_eq!(forward_status(Some(TransportFailure::Dns)), 404);
        assert_eq!(forward_status(Some(TransportFailure::Other)), 521);
    }

    #[test]
    fn test_gauge_never_underflows() {
        let gauge = Gauge::default();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::new(&[0.1, 0.5, 1.0]);
        for v in [0.05, 0.3, 0.8, 2.0] {
            histogram.observe(v);
        }
        let (buckets, sum, count) = histogram.snapshot();
        assert_eq!(count, 4);
        assert!((sum - 3.15).abs() < 0.001);
        assert_eq!(buckets.iter().map(|b| b.1).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_label_escaping() {
        let counter = CounterVec::default();
        counter.inc("a\"b");
        let mut out = String::new();
        write_labelled(&mut out, "x_total", "x", "host", &counter);
        assert!(out.contains("x_total{host=\"a\\\"b\"} 1"));
    }
}
