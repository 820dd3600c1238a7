use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. When a recorder is already installed (tests building
    /// several states in one process), a detached recorder is used instead.
    pub fn install() -> Self {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher");

        let handle = match builder.install_recorder() {
            Ok(handle) => handle,
            Err(_) => PrometheusBuilder::new().build_recorder().handle(),
        };

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // request path
        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_histogram!(
            "gateway_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream request duration (time spent waiting for upstream)"
        );
        describe_gauge!(
            "gateway_http_requests_in_flight",
            Unit::Count,
            "Number of requests currently being processed"
        );

        // retries / hedging / redirects
        describe_counter!(
            "gateway_upstream_retries_total",
            Unit::Count,
            "Total upstream retry attempts"
        );
        describe_counter!(
            "gateway_retry_budget_exhausted_total",
            Unit::Count,
            "Retries suppressed by the sliding-window budget"
        );
        describe_counter!(
            "gateway_hedged_requests_total",
            Unit::Count,
            "Speculative hedge attempts launched"
        );
        describe_counter!(
            "gateway_hedged_wins_total",
            Unit::Count,
            "Responses won by a hedge attempt"
        );
        describe_counter!(
            "gateway_redirect_max_exceeded_total",
            Unit::Count,
            "Redirect chains cut off at the configured bound"
        );

        // health management
        describe_counter!(
            "gateway_outlier_ejections_total",
            Unit::Count,
            "Backends ejected by the outlier detector"
        );
        describe_counter!(
            "gateway_outlier_recoveries_total",
            Unit::Count,
            "Backends restored after an ejection elapsed"
        );
        describe_counter!(
            "gateway_backpressure_throttled_total",
            Unit::Count,
            "Backends evicted after a 429/503 with Retry-After"
        );
        describe_counter!(
            "gateway_backpressure_recovered_total",
            Unit::Count,
            "Backends restored after their Retry-After elapsed"
        );
        describe_gauge!(
            "gateway_backend_health_status",
            Unit::Count,
            "Backend health: 1=healthy 0=unhealthy"
        );
        describe_counter!(
            "gateway_health_check_total",
            Unit::Count,
            "Total active health check attempts"
        );

        // progressive delivery
        describe_counter!(
            "gateway_canary_transitions_total",
            Unit::Count,
            "Canary state transitions"
        );
        describe_counter!(
            "gateway_bluegreen_transitions_total",
            Unit::Count,
            "Blue/green state transitions"
        );

        // connections
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Total connections accepted"
        );
        describe_counter!(
            "gateway_l4_connections_total",
            Unit::Count,
            "Total L4 TCP connections accepted"
        );
        describe_gauge!(
            "gateway_udp_sessions_active",
            Unit::Count,
            "Live UDP sessions"
        );

        // config
        describe_gauge!(
            "gateway_config_routes_total",
            Unit::Count,
            "Number of routes currently loaded"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
