//! Lightweight metrics helpers for Keel.
//!
//! Thin wrappers over the `metrics` crate macros. No exporter is embedded; the
//! application installs whatever recorder it likes and these calls become
//! no-ops until it does.
//!
//! Provided metrics:
//! * `keel_requests_total` (counter, labels: method, status)
//! * `keel_request_duration_seconds` (histogram, labels: method)
//! * `keel_open_sockets` (gauge)
//! * `keel_in_flight_requests` (gauge)
use std::{sync::Once, time::Instant};

use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

pub const KEEL_REQUESTS_TOTAL: &str = "keel_requests_total";
pub const KEEL_REQUEST_DURATION_SECONDS: &str = "keel_request_duration_seconds";
pub const KEEL_OPEN_SOCKETS: &str = "keel_open_sockets";
pub const KEEL_IN_FLIGHT_REQUESTS: &str = "keel_in_flight_requests";

static DESCRIBE: Once = Once::new();

/// Register metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    DESCRIBE.call_once(|| {
        describe_counter!(
            KEEL_REQUESTS_TOTAL,
            Unit::Count,
            "Total number of HTTP requests answered."
        );
        describe_histogram!(
            KEEL_REQUEST_DURATION_SECONDS,
            Unit::Seconds,
            "Time spent in the request pipeline."
        );
        describe_gauge!(KEEL_OPEN_SOCKETS, "Number of currently open client sockets.");
        describe_gauge!(
            KEEL_IN_FLIGHT_REQUESTS,
            "Number of requests currently being processed."
        );
        tracing::debug!("Keel metric descriptions registered");
    });
    Ok(())
}

/// Count a finished request.
pub fn increment_request_total(method: &str, status: u16) {
    counter!(
        KEEL_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record how long a request spent in the pipeline.
pub fn record_request_duration(method: &str, duration: std::time::Duration) {
    histogram!(KEEL_REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

pub fn set_open_sockets(count: usize) {
    gauge!(KEEL_OPEN_SOCKETS).set(count as f64);
}

pub fn set_in_flight_requests(count: usize) {
    gauge!(KEEL_IN_FLIGHT_REQUESTS).set(count as f64);
}

/// RAII helper measuring request duration, recorded on drop.
pub struct RequestTimer {
    start: Instant,
    method: String,
}

impl RequestTimer {
    pub fn new(method: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.method, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_request_timer() {
        let timer = RequestTimer::new("GET");
        assert!(timer.elapsed() < std::time::Duration::from_secs(5));
        // Timer records its duration when dropped
        drop(timer);
    }

    #[test]
    fn test_recording_without_recorder_is_a_noop() {
        increment_request_total("POST", 201);
        set_open_sockets(3);
        set_in_flight_requests(0);
    }
}
