//! Prometheus metrics for the gateway.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "s3adapter_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "s3adapter_http_request_duration_seconds";

/// Total backend calls (counter). Labels: engine, operation, outcome.
pub const BACKEND_CALLS_TOTAL: &str = "s3adapter_backend_calls_total";

/// Rejected authentications (counter). Labels: code.
pub const AUTH_FAILURES_TOTAL: &str = "s3adapter_auth_failures_total";

/// Total bytes received in object bodies (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "s3adapter_bytes_received_total";

/// Total bytes sent in object bodies (counter).
pub const BYTES_SENT_TOTAL: &str = "s3adapter_bytes_sent_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(BACKEND_CALLS_TOTAL, "Backend calls by engine, operation and outcome");
    describe_counter!(AUTH_FAILURES_TOTAL, "Rejected authentications by error code");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total bytes received (object bodies)");
    describe_counter!(BYTES_SENT_TOTAL, "Total bytes sent (object bodies)");
}

// -- Recording helpers --------------------------------------------------------

/// Count one backend call.  `outcome` is `"ok"` or the normalized error code.
pub fn record_backend_call(engine: &str, operation: &'static str, outcome: &str) {
    counter!(
        BACKEND_CALLS_TOTAL,
        "engine" => engine.to_string(),
        "operation" => operation,
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_auth_failure(code: &str) {
    counter!(AUTH_FAILURES_TOTAL, "code" => code.to_string()).increment(1);
}

pub fn record_bytes_received(n: usize) {
    counter!(BYTES_RECEIVED_TOTAL).increment(n as u64);
}

pub fn record_bytes_sent(n: usize) {
    counter!(BYTES_SENT_TOTAL).increment(n as u64);
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation.  Must be the outermost
/// layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// Examples:
/// - `/version` -> `/version`
/// - `/my-bucket` -> `/{bucket}`
/// - `/my-bucket/path/to/key` -> `/{bucket}/{key}`
/// - `/` -> `/`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/version" | "/openapi.json" | "/metrics" => path.to_string(),
        _ => {
            let trimmed = path.trim_start_matches('/');
            if trimmed.is_empty() {
                return "/".to_string();
            }
            match trimmed.trim_end_matches('/').find('/') {
                None => "/{bucket}".to_string(),
                Some(_) => "/{bucket}/{key}".to_string(),
            }
        }
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_root() {
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_normalize_path_fixed_routes() {
        assert_eq!(normalize_path("/version"), "/version");
        assert_eq!(normalize_path("/openapi.json"), "/openapi.json");
    }

    #[test]
    fn test_normalize_path_bucket() {
        assert_eq!(normalize_path("/my-bucket"), "/{bucket}");
        assert_eq!(normalize_path("/my-bucket/"), "/{bucket}");
    }

    #[test]
    fn test_normalize_path_object() {
        assert_eq!(normalize_path("/my-bucket/key"), "/{bucket}/{key}");
        assert_eq!(
            normalize_path("/my-bucket/path/to/object.txt"),
            "/{bucket}/{key}"
        );
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_counters() {
        init_metrics();
        describe_metrics();
        record_backend_call("fake", "head_bucket", "ok");
        record_auth_failure("AllAccessDisabled");

        let resp = metrics_handler().await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(BACKEND_CALLS_TOTAL));
        assert!(text.contains(AUTH_FAILURES_TOTAL));
    }
}
