//! Lightweight metrics helpers for Junction.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is embedded; the
//! embedding application installs whichever recorder it prefers.
//!
//! Provided metrics (labels vary by family):
//! * `junction_requests_total` (counter: method, verb, status)
//! * `junction_request_duration_seconds` (histogram: method, verb)
//! * `junction_dispatch_total` (counter: dispatcher, outcome)
//! * `junction_upstream_request_duration_seconds` (histogram: dispatcher)
//! * `junction_active_tunnels` (gauge)
//! * `junction_audit_events_dropped_total` (counter: reason)
//! * `junction_audit_batches_total` (counter: backend, outcome)
//!
//! The timer structs use `Drop` so durations are recorded on every exit path.
use std::time::Instant;

use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::Lazy;

pub const JUNCTION_REQUESTS_TOTAL: &str = "junction_requests_total";
pub const JUNCTION_REQUEST_DURATION_SECONDS: &str = "junction_request_duration_seconds";
pub const JUNCTION_DISPATCH_TOTAL: &str = "junction_dispatch_total";
pub const JUNCTION_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "junction_upstream_request_duration_seconds";
pub const JUNCTION_ACTIVE_TUNNELS: &str = "junction_active_tunnels";
pub const JUNCTION_AUDIT_EVENTS_DROPPED_TOTAL: &str = "junction_audit_events_dropped_total";
pub const JUNCTION_AUDIT_BATCHES_TOTAL: &str = "junction_audit_batches_total";

static DESCRIBED: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        JUNCTION_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        JUNCTION_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        JUNCTION_DISPATCH_TOTAL,
        Unit::Count,
        "Dispatcher decisions, by dispatcher and outcome (handled, declined, reroute)."
    );
    describe_histogram!(
        JUNCTION_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests forwarded to upstreams, until response headers arrive."
    );
    describe_gauge!(
        JUNCTION_ACTIVE_TUNNELS,
        "Number of upgraded connections currently being tunnelled."
    );
    describe_counter!(
        JUNCTION_AUDIT_EVENTS_DROPPED_TOTAL,
        Unit::Count,
        "Audit events dropped before delivery, by reason."
    );
    describe_counter!(
        JUNCTION_AUDIT_BATCHES_TOTAL,
        Unit::Count,
        "Audit batches handed to backends, by backend and outcome."
    );
});

/// Register metric descriptions (idempotent).
pub fn init_metrics() {
    Lazy::force(&DESCRIBED);
    tracing::debug!("Junction metric descriptions registered");
}

pub fn increment_request_total(method: &str, verb: &str, status: u16) {
    counter!(
        JUNCTION_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "verb" => verb.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(method: &str, verb: &str, duration: std::time::Duration) {
    histogram!(
        JUNCTION_REQUEST_DURATION_SECONDS,
        "method" => method.to_string(),
        "verb" => verb.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_dispatch(dispatcher: &'static str, outcome: &'static str) {
    counter!(JUNCTION_DISPATCH_TOTAL, "dispatcher" => dispatcher, "outcome" => outcome)
        .increment(1);
}

pub fn record_upstream_duration(dispatcher: &str, duration: std::time::Duration) {
    histogram!(
        JUNCTION_UPSTREAM_REQUEST_DURATION_SECONDS,
        "dispatcher" => dispatcher.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn tunnel_opened() {
    gauge!(JUNCTION_ACTIVE_TUNNELS).increment(1.0);
}

pub fn tunnel_closed() {
    gauge!(JUNCTION_ACTIVE_TUNNELS).decrement(1.0);
}

pub fn increment_audit_events_dropped(reason: &'static str) {
    counter!(JUNCTION_AUDIT_EVENTS_DROPPED_TOTAL, "reason" => reason).increment(1);
}

pub fn increment_audit_batches(backend: &str, outcome: &'static str) {
    counter!(
        JUNCTION_AUDIT_BATCHES_TOTAL,
        "backend" => backend.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// RAII helper measuring inbound request duration. The verb is filled in once known.
pub struct RequestTimer {
    start: Instant,
    method: String,
    verb: String,
}

impl RequestTimer {
    pub fn new(method: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
            verb: String::new(),
        }
    }

    pub fn set_verb(&mut self, verb: &str) {
        self.verb = verb.to_string();
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.method, &self.verb, self.start.elapsed());
    }
}

/// RAII helper measuring upstream request duration.
pub struct UpstreamTimer {
    start: Instant,
    dispatcher: &'static str,
}

impl UpstreamTimer {
    pub fn new(dispatcher: &'static str) -> Self {
        Self {
            start: Instant::now(),
            dispatcher,
        }
    }
}

impl Drop for UpstreamTimer {
    fn drop(&mut self) {
        record_upstream_duration(self.dispatcher, self.start.elapsed());
    }
}
