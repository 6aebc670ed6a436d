//! Server metrics, pushed to an injected collaborator.
//!
//! The server never talks to a registry directly. It calls a [`Metrics`]
//! implementation handed to [`Server::start_with_metrics`], defaulting to
//! [`NoopMetrics`]. [`RecorderMetrics`] forwards to the `metrics` crate facade,
//! so whatever recorder the application installed (a Prometheus exporter, for
//! instance) receives them.
//!
//! [`Server::start_with_metrics`]: crate::Server::start_with_metrics

use http::StatusCode;
use std::time::Duration;

/// Receiver of server metrics. Called concurrently from every connection.
pub trait Metrics: Send + Sync + 'static {
    fn connection_opened(&self) {}

    /// Connection closed after being open for `lifetime`.
    fn connection_closed(&self, _lifetime: Duration) {}

    /// Size of a fully received request body.
    fn request_entity_size(&self, _bytes: u64) {}

    /// Body size of a fully sent response.
    fn response_content_length(&self, _bytes: u64) {}

    fn response_status(&self, _status: StatusCode) {}

    fn suspended(&self) {}

    fn succeeded(&self) {}

    fn failed(&self) {}

    /// Time from request head to the end of the response.
    fn service_time(&self, _elapsed: Duration) {}
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// Forwards to the `metrics` facade.
///
/// Metric names are prefixed with the given prefix, i.e. `"http"` gives
/// `http_connections_opened_total`, `http_connection_lifetime_seconds`,
/// `http_request_entity_bytes`, `http_response_content_length_bytes`,
/// `http_responses_total{class="2xx"}`, `http_exchanges_suspended_total`,
/// `http_exchanges_succeeded_total`, `http_exchanges_failed_total` and
/// `http_service_time_seconds`.
#[derive(Debug, Clone)]
pub struct RecorderMetrics {
    connections_opened: String,
    connection_lifetime: String,
    entity_size: String,
    content_length: String,
    responses: String,
    suspended: String,
    succeeded: String,
    failed: String,
    service_time: String,
}

impl RecorderMetrics {
    pub fn new(prefix: &str) -> Self {
        let name = |s: &str| format!("{}_{}", prefix, s);
        RecorderMetrics {
            connections_opened: name("connections_opened_total"),
            connection_lifetime: name("connection_lifetime_seconds"),
            entity_size: name("request_entity_bytes"),
            content_length: name("response_content_length_bytes"),
            responses: name("responses_total"),
            suspended: name("exchanges_suspended_total"),
            succeeded: name("exchanges_succeeded_total"),
            failed: name("exchanges_failed_total"),
            service_time: name("service_time_seconds"),
        }
    }
}

impl Default for RecorderMetrics {
    fn default() -> Self {
        RecorderMetrics::new("http")
    }
}

/// "1xx" to "5xx".
fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() / 100 {
        1 => "1xx",
        2 => "2xx",
        3 => "3xx",
        4 => "4xx",
        _ => "5xx",
    }
}

impl Metrics for RecorderMetrics {
    fn connection_opened(&self) {
        ::metrics::counter!(self.connections_opened.clone()).increment(1);
    }

    fn connection_closed(&self, lifetime: Duration) {
        ::metrics::histogram!(self.connection_lifetime.clone()).record(lifetime.as_secs_f64());
    }

    fn request_entity_size(&self, bytes: u64) {
        ::metrics::histogram!(self.entity_size.clone()).record(bytes as f64);
    }

    fn response_content_length(&self, bytes: u64) {
        ::metrics::histogram!(self.content_length.clone()).record(bytes as f64);
    }

    fn response_status(&self, status: StatusCode) {
        ::metrics::counter!(self.responses.clone(), "class" => status_class(status)).increment(1);
    }

    fn suspended(&self) {
        ::metrics::counter!(self.suspended.clone()).increment(1);
    }

    fn succeeded(&self) {
        ::metrics::counter!(self.succeeded.clone()).increment(1);
    }

    fn failed(&self) {
        ::metrics::counter!(self.failed.clone()).increment(1);
    }

    fn service_time(&self, elapsed: Duration) {
        ::metrics::histogram!(self.service_time.clone()).record(elapsed.as_secs_f64());
    }
}
