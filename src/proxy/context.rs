use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Crate-wide body alias. Boxed error so upstream `Incoming` errors and the
/// idle-timeout reader's deadline errors flow through one type.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Box an upstream body into the crate-wide alias.
pub fn boxed_incoming(body: hyper::body::Incoming) -> BoxBody {
    body.map_err(|e| -> BoxError { Box::new(e) }).boxed()
}

/// Rule-level overrides attached by earlier middleware.
#[derive(Default)]
pub struct Overrides {
    /// Exact backend URL to use, bypassing selection (iff healthy).
    pub switch_backend: Option<String>,
}

/// Per-request variables context. Attached at routing time and read/written
/// throughout the pipeline; the admin access log and the health subsystems
/// all key off the fields accumulated here.
pub struct RequestContext {
    pub route_id: String,
    pub method: String,
    pub path: String,
    pub host: String,
    /// The downstream client IP (from TCP peer or trusted X-Forwarded-For).
    pub client_ip: IpAddr,
    pub upstream_addr: String,
    pub upstream_status: u16,
    pub upstream_response_time: Option<Duration>,
    /// Traffic group chosen by a sticky/weighted decision, when one was made.
    pub traffic_group: String,
    /// Set-Cookie value pinning a sticky/affinity decision, to be attached
    /// to the downstream response.
    pub set_cookie: Option<String>,
    pub api_version: Option<String>,
    pub tenant: Option<String>,
    pub overrides: Overrides,
    /// Inject W3C trace-context headers on the outbound request.
    pub propagate_trace: bool,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(route_id: &str, method: String, path: String, host: String, client_ip: IpAddr) -> Self {
        Self {
            route_id: route_id.to_string(),
            method,
            path,
            host,
            client_ip,
            upstream_addr: String::new(),
            upstream_status: 0,
            upstream_response_time: None,
            traffic_group: String::new(),
            set_cookie: None,
            api_version: None,
            tenant: None,
            overrides: Overrides::default(),
            propagate_trace: false,
            start: Instant::now(),
        }
    }

    /// Build a JSON error response and record metrics in one place — the
    /// single exit point for all dispatch-path failures.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status.as_u16());

        metrics::counter!(
            "gateway_http_requests_total",
            "route" => self.route_id.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "upstream_addr" => self.upstream_addr.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => self.route_id.clone(),
            "upstream_addr" => self.upstream_addr.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(format!(r#"{{"error":"{}"}}"#, msg)))
            .unwrap()
    }

    /// Record final metrics for a completed response.
    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "gateway_http_requests_total",
            "route" => self.route_id.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
            "upstream_addr" => self.upstream_addr.clone(),
        )
        .increment(1);

        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => self.route_id.clone(),
            "upstream_addr" => self.upstream_addr.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_elapsed) = self.upstream_response_time {
            metrics::histogram!(
                "gateway_upstream_request_duration_seconds",
                "route" => self.route_id.clone(),
                "upstream_addr" => self.upstream_addr.clone(),
            )
            .record(upstream_elapsed.as_secs_f64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_error_response_shape() {
        let ctx = RequestContext::new(
            "r1",
            "GET".to_string(),
            "/x".to_string(),
            "example.com".to_string(),
            "127.0.0.1".parse().unwrap(),
        );
        let resp = ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "no healthy backends");
        assert_eq!(resp.status(), 503);
        assert_eq!(resp.headers()["content-type"], "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], br#"{"error":"no healthy backends"}"#);
    }
}
