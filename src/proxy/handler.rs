use crate::balance::{ActiveGuard, Backend, RequestKey};
use crate::error::GatewayError;
use crate::proxy::context::{boxed_incoming, empty_body, full_body, BoxBody, RequestContext};
use crate::proxy::idle::IdleTimeoutBody;
use crate::proxy::transport::HttpClient;
use crate::server::state::{GatewayState, RouteRuntime};
use bytes::Bytes;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle one routed client request: select a backend, rewrite, forward,
/// stream the response back. Health bookkeeping (outlier stats, controller
/// metrics, backpressure) hangs off the completed exchange.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let route = match state.routes.load().match_route(&path) {
        Some(r) => r,
        None => {
            debug!("proxy: no route matched, path={}", path);
            metrics::counter!(
                "gateway_http_requests_total",
                "route" => "_no_route",
                "method" => method,
                "status_code" => "404",
                "upstream_addr" => "",
            )
            .increment(1);
            return Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header("content-type", "application/json")
                .body(full_body(r#"{"error":"no route matched"}"#))
                .unwrap());
        }
    };

    // Real client IP: left-most trusted X-Forwarded-For entry, else peer.
    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    let mut ctx = RequestContext::new(&route.id, method, path, host, client_ip);
    ctx.propagate_trace = route.propagate_trace;
    ctx.api_version = req
        .headers()
        .get(route.version_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    ctx.tenant = req
        .headers()
        .get(route.tenant_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    if let Some(ref header) = route.backend_override_header {
        ctx.overrides.switch_backend = req
            .headers()
            .get(header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
    }

    metrics::gauge!(
        "gateway_http_requests_in_flight",
        "route" => ctx.route_id.clone(),
    )
    .increment(1.0);

    let deadline = if route.timeout.request > 0.0 {
        Duration::from_secs_f64(route.timeout.request)
    } else {
        DEFAULT_REQUEST_TIMEOUT
    };

    let dispatched = tokio::time::timeout(deadline, dispatch(req, &mut ctx, &route)).await;
    let mut response = match dispatched {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => failure_response(&ctx, &e),
        Err(_) => ctx.error_response(StatusCode::GATEWAY_TIMEOUT, "gateway timeout"),
    };

    let status = response.status().as_u16();
    ctx.upstream_status = status;

    // Health / delivery bookkeeping off the final exchange.
    if !ctx.traffic_group.is_empty() {
        let latency_ms = ctx
            .upstream_response_time
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        if let Some(ref canary) = route.canary {
            canary.record(&ctx.traffic_group, status, latency_ms);
        }
        if let Some(ref bg) = route.blue_green {
            bg.record(&ctx.traffic_group, status, latency_ms);
        }
        if let Some(ref ab) = route.ab_test {
            ab.record(&ctx.traffic_group, status, latency_ms);
        }
    }
    if let Some(ref backpressure) = route.backpressure {
        let addr = if ctx.upstream_addr.is_empty() {
            None
        } else {
            Some(ctx.upstream_addr.as_str())
        };
        backpressure.on_response(addr, status, response.headers());
    }

    remove_hop_headers(response.headers_mut());
    if let Some(ref cookie) = ctx.set_cookie {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            response
                .headers_mut()
                .append(http::header::SET_COOKIE, value);
        }
    }
    if route.timeout.idle > 0.0 {
        let (parts, body) = response.into_parts();
        response = Response::from_parts(
            parts,
            IdleTimeoutBody::boxed(body, Duration::from_secs_f64(route.timeout.idle)),
        );
    }

    ctx.finalize_metrics(status);
    metrics::gauge!(
        "gateway_http_requests_in_flight",
        "route" => ctx.route_id.clone(),
    )
    .decrement(1.0);

    let total_ms = ctx.start.elapsed().as_millis();
    let upstream_ms = ctx
        .upstream_response_time
        .map(|d| d.as_millis())
        .unwrap_or(0);
    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        host = %ctx.host,
        path = %ctx.path,
        status = status,
        route = %ctx.route_id,
        upstream = %ctx.upstream_addr,
        group = %ctx.traffic_group,
        latency_ms = %total_ms,
        upstream_ms = %upstream_ms,
        "access"
    );

    Ok(response)
}

/// Forward the request upstream. Selection, rewrite, dispatch (plain /
/// retried / hedged / redirect-following), stats recording.
async fn dispatch(
    req: Request<Incoming>,
    ctx: &mut RequestContext,
    route: &Arc<RouteRuntime>,
) -> Result<Response<BoxBody>, GatewayError> {
    let method = req.method().clone();
    let query = req.uri().query().map(|q| q.to_string());
    let mut headers = req.headers().clone();
    inject_forwarded_headers(&mut headers, ctx);
    remove_hop_headers(&mut headers);
    if ctx.propagate_trace {
        inject_trace_context(&mut headers);
    }

    let hedging = route.hedging.clone();
    let needs_buffer =
        hedging.is_some() || route.retry.is_some() || route.redirect.is_some();

    let (body_bytes, streaming_body): (Option<Bytes>, Option<BoxBody>) = if needs_buffer {
        let bytes = req
            .into_body()
            .collect()
            .await
            .map_err(|e| GatewayError::Transport(format!("client body read: {}", e)))?
            .to_bytes();
        (Some(bytes), None)
    } else {
        (None, Some(boxed_incoming(req.into_body())))
    };

    let cancel = CancellationToken::new();

    // Hedged dispatch picks its own backends, one per speculative attempt.
    if let Some(hedging) = hedging {
        let balancer = route.balancer.clone();
        let backend_count = balancer.backends().len().max(1);
        let pick = move |used: &[String]| -> Option<Backend> {
            for _ in 0..backend_count {
                let candidate = balancer.next()?;
                if !used.iter().any(|u| u == candidate.url()) {
                    return Some(candidate);
                }
            }
            None
        };

        let body = body_bytes.clone().unwrap_or_default();
        let route_ref = route.clone();
        let method_ref = method.clone();
        let query_ref = query.clone();
        let path = ctx.path.clone();
        let headers_ref = headers.clone();

        let first = route.balancer.next().ok_or(GatewayError::NoBackend)?;
        ctx.upstream_addr = first.url().to_string();
        drop(first);

        let start = Instant::now();
        let result = hedging
            .execute(&route.id, &cancel, pick, move |backend| {
                let route = route_ref.clone();
                let method = method_ref.clone();
                let path = path.clone();
                let query = query_ref.clone();
                let headers = headers_ref.clone();
                let body = body.clone();
                async move {
                    let _guard = ActiveGuard::new(backend.clone());
                    let url = route.rewrite.target(backend.uri(), &path, query.as_deref());
                    send_recorded(&route, &backend, method, url, &headers, full_body(body)).await
                }
            })
            .await;
        ctx.upstream_response_time = Some(start.elapsed());
        return result;
    }

    // Non-hedging path: one backend, selected up front.
    let (backend, selection_group, set_cookie) = select_backend(ctx, route, &headers)?;
    ctx.upstream_addr = backend.url().to_string();
    ctx.traffic_group = selection_group;
    ctx.set_cookie = set_cookie;
    let _guard = ActiveGuard::new(backend.clone());

    let target = route
        .rewrite
        .target(backend.uri(), &ctx.path, query.as_deref());

    let start = Instant::now();
    let result = if let Some(ref policy) = route.retry {
        let body = body_bytes.clone().unwrap_or_default();
        let route_ref = route.clone();
        let backend_ref = backend.clone();
        let headers_ref = headers.clone();
        let target_ref = target.clone();
        let method_ref = method.clone();
        policy
            .execute(&route.id, &cancel, &method, move |_attempt| {
                let route = route_ref.clone();
                let backend = backend_ref.clone();
                let headers = headers_ref.clone();
                let method = method_ref.clone();
                let body = body.clone();
                let target = target_ref.clone();
                async move {
                    send_maybe_redirected(&route, &backend, method, target, &headers, body).await
                }
            })
            .await
    } else {
        let per_try = if route.timeout.backend > 0.0 {
            Some(Duration::from_secs_f64(route.timeout.backend))
        } else {
            None
        };
        let fut = async {
            match body_bytes {
                Some(bytes) => {
                    send_maybe_redirected(route, &backend, method, target, &headers, bytes).await
                }
                None => {
                    let body = streaming_body.unwrap_or_else(empty_body);
                    send_recorded(route, &backend, method, target, &headers, body).await
                }
            }
        };
        match per_try {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(r) => r,
                Err(_) => Err(GatewayError::DeadlineExceeded),
            },
            None => fut.await,
        }
    };
    ctx.upstream_response_time = Some(start.elapsed());
    result
}

/// Backend selection precedence: rule-level override, request-aware
/// balancer (honoring an already-assigned traffic group), plain `next()`.
fn select_backend(
    ctx: &RequestContext,
    route: &Arc<RouteRuntime>,
    headers: &HeaderMap,
) -> Result<(Backend, String, Option<String>), GatewayError> {
    if let Some(ref wanted) = ctx.overrides.switch_backend {
        if let Some(backend) = route
            .balancer
            .backends()
            .into_iter()
            .find(|b| b.url() == wanted && b.is_healthy())
        {
            debug!(
                "proxy: backend override, route={}, backend={}",
                route.id, wanted
            );
            return Ok((backend, String::new(), None));
        }
        warn!(
            "proxy: backend override ignored (unknown or unhealthy), route={}, backend={}",
            route.id, wanted
        );
    }

    if route.request_aware {
        if !ctx.traffic_group.is_empty() {
            if let Some(backend) = route.balancer.next_in_group(&ctx.traffic_group) {
                return Ok((backend, ctx.traffic_group.clone(), None));
            }
        }
        let key = RequestKey {
            headers,
            path: &ctx.path,
            client_ip: ctx.client_ip,
            api_version: ctx.api_version.as_deref(),
            tenant: ctx.tenant.as_deref(),
            assigned_group: if ctx.traffic_group.is_empty() {
                None
            } else {
                Some(ctx.traffic_group.as_str())
            },
        };
        let selection = route
            .balancer
            .next_for_request(&key)
            .ok_or(GatewayError::NoBackend)?;
        return Ok((selection.backend, selection.group, selection.set_cookie));
    }

    route
        .balancer
        .next()
        .map(|b| (b, String::new(), None))
        .ok_or(GatewayError::NoBackend)
}

/// One wire round-trip, with per-attempt stats recording (EWMA latency,
/// outlier window). Health flags are not touched here — that is the
/// detectors' job.
async fn send_recorded(
    route: &Arc<RouteRuntime>,
    backend: &Backend,
    method: Method,
    url: String,
    headers: &HeaderMap,
    body: BoxBody,
) -> Result<Response<BoxBody>, GatewayError> {
    let start = Instant::now();
    let result = send_once(&route.client, route, method, &url, headers, body).await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    match &result {
        Ok(resp) => {
            let status = resp.status().as_u16();
            if let Some(ref outlier) = route.outlier {
                outlier.record(backend.url(), status, elapsed_ms);
            }
            if route.records_latency {
                route.balancer.record_latency(backend.url(), elapsed_ms);
            }
        }
        Err(_) => {
            // A transport failure counts as a gateway-class error for the
            // outlier stats.
            if let Some(ref outlier) = route.outlier {
                outlier.record(backend.url(), 502, elapsed_ms);
            }
        }
    }
    result
}

/// `send_recorded`, wrapped with the route's redirect follower when enabled.
async fn send_maybe_redirected(
    route: &Arc<RouteRuntime>,
    backend: &Backend,
    method: Method,
    url: String,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response<BoxBody>, GatewayError> {
    match route.redirect {
        Some(ref follower) => {
            let route_ref = route.clone();
            let backend_ref = backend.clone();
            let headers_ref = headers.clone();
            follower
                .follow(&route.id, method, url, body, move |m, u, b| {
                    let route = route_ref.clone();
                    let backend = backend_ref.clone();
                    let headers = headers_ref.clone();
                    async move { send_recorded(&route, &backend, m, u, &headers, b).await }
                })
                .await
        }
        None => send_recorded(route, backend, method, url, headers, full_body(body)).await,
    }
}

/// Build and dispatch the upstream request on the route's pooled client.
async fn send_once(
    client: &HttpClient,
    route: &Arc<RouteRuntime>,
    method: Method,
    url: &str,
    headers: &HeaderMap,
    body: BoxBody,
) -> Result<Response<BoxBody>, GatewayError> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e| GatewayError::Transport(format!("bad target url {}: {}", url, e)))?;

    let host_value = match route.rewrite.host_override() {
        Some(host) => HeaderValue::from_str(host).ok(),
        None => uri
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok()),
    };

    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(headers_mut) = builder.headers_mut() {
        *headers_mut = headers.clone();
        headers_mut.remove(HOST);
        if let Some(host) = host_value {
            headers_mut.insert(HOST, host);
        }
    }
    let upstream_req = builder
        .body(body)
        .map_err(|e| GatewayError::Transport(format!("build request: {}", e)))?;

    match client.request(upstream_req).await {
        Ok(resp) => Ok(resp.map(boxed_incoming)),
        Err(e) => {
            if e.is_connect() {
                Err(GatewayError::Transport(format!("connect: {}", e)))
            } else {
                Err(GatewayError::Transport(e.to_string()))
            }
        }
    }
}

fn failure_response(ctx: &RequestContext, err: &GatewayError) -> Response<BoxBody> {
    match err {
        GatewayError::NoBackend => {
            warn!("proxy: no healthy backends, route={}", ctx.route_id);
            ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "no healthy backends")
        }
        GatewayError::DeadlineExceeded => {
            warn!("proxy: upstream deadline exceeded, route={}", ctx.route_id);
            ctx.error_response(StatusCode::GATEWAY_TIMEOUT, "gateway timeout")
        }
        GatewayError::Canceled => {
            ctx.error_response(StatusCode::BAD_GATEWAY, "request canceled")
        }
        other => {
            warn!(
                "proxy: upstream error, route={}, upstream={}, error={}",
                ctx.route_id, ctx.upstream_addr, other
            );
            ctx.error_response(StatusCode::BAD_GATEWAY, &other.to_string())
        }
    }
}

/// Hop-by-hop headers are stripped from both directions.
fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: [HeaderName; 9] = [
        CONNECTION,
        HeaderName::from_static("proxy-connection"),
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailer"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];
    for h in &hop_headers {
        headers.remove(h);
    }
}

/// Standard `X-Forwarded-*` injection: the client IP accumulates onto
/// X-Forwarded-For with a ", " separator; proto defaults to "http" unless a
/// trusted front hop already set it; host mirrors the original Host.
fn inject_forwarded_headers(headers: &mut HeaderMap, ctx: &RequestContext) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");

    let peer_ip = ctx.client_ip.to_string();
    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !ctx.host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(&ctx.host) {
            headers.insert(XFH.clone(), v);
        }
    }
}

/// W3C trace-context carrier: keep an existing traceparent, otherwise mint
/// a fresh root span id.
fn inject_trace_context(headers: &mut HeaderMap) {
    static TRACEPARENT: HeaderName = HeaderName::from_static("traceparent");
    if headers.contains_key(&TRACEPARENT) {
        return;
    }
    let mut rng = rand::thread_rng();
    let trace_id: u128 = rng.gen();
    let span_id: u64 = rng.gen();
    let value = format!("00-{:032x}-{:016x}-01", trace_id, span_id);
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(TRACEPARENT.clone(), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        headers.insert("proxy-connection", "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("upgrade", "h2c".parse().unwrap());
        headers.insert("te", "trailers".parse().unwrap());
        headers.insert("x-custom", "stays".parse().unwrap());
        remove_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-custom"));
    }

    fn ctx_for(ip: &str, host: &str) -> RequestContext {
        let mut ctx = RequestContext::new(
            "r1",
            "GET".to_string(),
            "/x".to_string(),
            host.to_string(),
            ip.parse().unwrap(),
        );
        ctx.upstream_addr = String::new();
        ctx
    }

    #[test]
    fn test_xff_appended_with_separator() {
        let ctx = ctx_for("203.0.113.7", "example.com");
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.1".parse().unwrap());
        inject_forwarded_headers(&mut headers, &ctx);
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "198.51.100.1, 203.0.113.7"
        );
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "example.com");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
    }

    #[test]
    fn test_xfp_preserved_when_present() {
        let ctx = ctx_for("203.0.113.7", "example.com");
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        inject_forwarded_headers(&mut headers, &ctx);
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn test_trace_context_minted_once() {
        let mut headers = HeaderMap::new();
        inject_trace_context(&mut headers);
        let minted = headers.get("traceparent").unwrap().clone();
        let s = minted.to_str().unwrap();
        assert!(s.starts_with("00-"));
        assert_eq!(s.len(), 55);

        inject_trace_context(&mut headers);
        assert_eq!(headers.get("traceparent").unwrap(), &minted);
    }
}
