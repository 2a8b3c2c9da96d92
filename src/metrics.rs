use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Once;
use std::time::{Duration, Instant};

use crate::bus::BusTransaction;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Counter for committed cycles
    pub static ref CYCLES_TOTAL: Counter = Counter::new(
        "trace8_cycles_total", "Total number of committed machine cycles"
    ).expect("Failed to create cycles counter");

    /// Counter for operations executed by kind
    pub static ref OPERATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("trace8_operations_total", "Total number of operations executed by kind"),
        &["kind"]
    ).expect("Failed to create operations counter");

    /// Histogram for cycle execution time
    pub static ref CYCLE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("trace8_cycle_duration_seconds", "Time spent executing one cycle")
            .buckets(vec![0.000001, 0.000005, 0.00001, 0.00005, 0.0001, 0.0005, 0.001]),
        &["kind"]
    ).expect("Failed to create cycle duration histogram");

    /// Counter for runtime faults by kind
    pub static ref FAULTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("trace8_faults_total", "Total number of runtime faults"),
        &["kind"]
    ).expect("Failed to create faults counter");

    /// Counter for recorded bus transactions
    pub static ref BUS_TRANSACTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("trace8_bus_transactions_total", "Total bus transactions recorded"),
        &["bus", "direction"]
    ).expect("Failed to create bus transactions counter");

    /// Counter for API requests by endpoint and method
    pub static ref API_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("trace8_api_requests_total", "Total number of API requests"),
        &["method", "endpoint", "status"]
    ).expect("Failed to create API requests counter");

    /// Histogram for API request duration
    pub static ref API_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("trace8_api_request_duration_seconds", "API request duration")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["method", "endpoint"]
    ).expect("Failed to create API request duration histogram");

    /// Gauge for live sessions
    pub static ref ACTIVE_SESSIONS: Gauge = Gauge::new(
        "trace8_active_sessions", "Number of live execution sessions"
    ).expect("Failed to create active sessions gauge");
}

static INIT: Once = Once::new();

/// Registers every metric with the global registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(CYCLES_TOTAL.clone()))
            .expect("Failed to register cycles counter");

        REGISTRY
            .register(Box::new(OPERATIONS_TOTAL.clone()))
            .expect("Failed to register operations counter");

        REGISTRY
            .register(Box::new(CYCLE_DURATION.clone()))
            .expect("Failed to register cycle duration histogram");

        REGISTRY
            .register(Box::new(FAULTS_TOTAL.clone()))
            .expect("Failed to register faults counter");

        REGISTRY
            .register(Box::new(BUS_TRANSACTIONS_TOTAL.clone()))
            .expect("Failed to register bus transactions counter");

        REGISTRY
            .register(Box::new(API_REQUESTS_TOTAL.clone()))
            .expect("Failed to register API requests counter");

        REGISTRY
            .register(Box::new(API_REQUEST_DURATION.clone()))
            .expect("Failed to register API request duration histogram");

        REGISTRY
            .register(Box::new(ACTIVE_SESSIONS.clone()))
            .expect("Failed to register active sessions gauge");
    });
}

/// Record one committed cycle
pub fn record_operation(kind: &str, duration: Duration) {
    OPERATIONS_TOTAL.with_label_values(&[kind]).inc();

    CYCLES_TOTAL.inc();

    CYCLE_DURATION
        .with_label_values(&[kind])
        .observe(duration.as_secs_f64());
}

pub fn record_fault(kind: &str) {
    FAULTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_bus_transactions(transactions: &[BusTransaction]) {
    for t in transactions {
        BUS_TRANSACTIONS_TOTAL
            .with_label_values(&[t.bus.label(), t.direction.label()])
            .inc();
    }
}

/// Record an API request
pub fn record_api_request(method: &str, endpoint: &str, status: u16, duration: Duration) {
    API_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, &status.to_string()])
        .inc();

    API_REQUEST_DURATION
        .with_label_values(&[method, endpoint])
        .observe(duration.as_secs_f64());
}

pub fn set_active_sessions(count: usize) {
    ACTIVE_SESSIONS.set(count as f64);
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics();
        init_metrics();
        record_fault("division_by_zero");
        let families = REGISTRY.gather();
        assert!(families.iter().any(|f| f.get_name() == "trace8_faults_total"));
    }
}
