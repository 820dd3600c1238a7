use crate::error::GatewayError;
use crate::proxy::context::{empty_body, full_body, BoxBody};
use bytes::Bytes;
use http::{Method, Response};
use http_body_util::BodyExt;
use std::future::Future;
use tracing::debug;

const REDIRECT_STATUSES: &[u16] = &[301, 302, 303, 307, 308];

/// Follows upstream redirects up to a bound instead of passing 3xx through.
/// Each hop re-sends the **original** request's headers; intermediate bodies
/// are fully drained before the next dispatch so pooled connections stay
/// reusable.
pub struct RedirectFollower {
    max_redirects: u32,
}

impl RedirectFollower {
    pub fn new(max_redirects: u32) -> Self {
        Self { max_redirects }
    }

    /// `send(method, url, body)` dispatches one request with the original
    /// headers. The body must be replayable, hence the buffered `Bytes`.
    pub async fn follow<S, Fut>(
        &self,
        route_id: &str,
        method: Method,
        url: String,
        body: Bytes,
        send: S,
    ) -> Result<Response<BoxBody>, GatewayError>
    where
        S: Fn(Method, String, BoxBody) -> Fut,
        Fut: Future<Output = Result<Response<BoxBody>, GatewayError>>,
    {
        let mut method = method;
        let mut url = url;
        let mut response = send(method.clone(), url.clone(), request_body(&method, &body)).await?;

        for _hop in 0..self.max_redirects {
            let status = response.status().as_u16();
            if !REDIRECT_STATUSES.contains(&status) {
                return Ok(response);
            }
            let Some(location) = response
                .headers()
                .get(http::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
            else {
                return Ok(response);
            };

            // Drain and close the intermediate body.
            let (_parts, old_body) = response.into_parts();
            let _ = old_body.collect().await;

            url = resolve_location(&url, &location);
            if status == 303 {
                method = Method::GET;
            }
            debug!(
                "redirect: following, route={}, status={}, next={}",
                route_id, status, url
            );
            response = send(method.clone(), url.clone(), request_body(&method, &body)).await?;
        }

        // Bound exceeded: hand back whatever the last hop said, as-is.
        if REDIRECT_STATUSES.contains(&response.status().as_u16()) {
            metrics::counter!(
                "gateway_redirect_max_exceeded_total",
                "route" => route_id.to_string(),
            )
            .increment(1);
            debug!(
                "redirect: max redirects ({}) exceeded, route={}",
                self.max_redirects, route_id
            );
        }
        Ok(response)
    }
}

/// GET and HEAD never carry a body; 303 rewrites already became GET.
fn request_body(method: &Method, body: &Bytes) -> BoxBody {
    if *method == Method::GET || *method == Method::HEAD {
        empty_body()
    } else {
        full_body(body.clone())
    }
}

/// Resolve a Location header against the current request URL. Handles
/// absolute URLs, protocol-relative `//host/path`, absolute paths, and
/// relative paths.
fn resolve_location(current: &str, location: &str) -> String {
    if location.contains("://") {
        return location.to_string();
    }
    let (scheme, rest) = match current.split_once("://") {
        Some(parts) => parts,
        None => return location.to_string(),
    };
    if let Some(stripped) = location.strip_prefix("//") {
        return format!("{}://{}", scheme, stripped);
    }
    let (authority, path) = match rest.split_once('/') {
        Some((a, p)) => (a, format!("/{}", p)),
        None => (rest, "/".to_string()),
    };
    if location.starts_with('/') {
        return format!("{}://{}{}", scheme, authority, location);
    }
    // Relative path: resolve against the current path's directory.
    let path_no_query = path.split('?').next().unwrap_or("/");
    let dir = match path_no_query.rfind('/') {
        Some(idx) => &path_no_query[..=idx],
        None => "/",
    };
    format!("{}://{}{}{}", scheme, authority, dir, location)
}

#[cfg(test)]
fn redirect_response(status: u16, location: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(http::header::LOCATION, location)
        .body(full_body("redirecting"))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn ok_response(body: &str) -> Response<BoxBody> {
        Response::builder()
            .status(200)
            .body(full_body(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_resolve_location() {
        assert_eq!(
            resolve_location("http://a:80/x/y", "http://b:81/z"),
            "http://b:81/z"
        );
        assert_eq!(
            resolve_location("http://a:80/x/y", "//b:81/z"),
            "http://b:81/z"
        );
        assert_eq!(resolve_location("http://a:80/x/y", "/z"), "http://a:80/z");
        assert_eq!(
            resolve_location("http://a:80/x/y", "z"),
            "http://a:80/x/z"
        );
        assert_eq!(resolve_location("http://a:80", "z"), "http://a:80/z");
        assert_eq!(
            resolve_location("http://a:80/x/y?q=1", "z"),
            "http://a:80/x/z"
        );
    }

    #[tokio::test]
    async fn test_follows_chain_to_success() {
        let calls = Mutex::new(Vec::new());
        let follower = RedirectFollower::new(10);
        let resp = follower
            .follow(
                "r1",
                Method::GET,
                "http://a:80/start".to_string(),
                Bytes::new(),
                |method, url, _body| {
                    calls.lock().unwrap().push((method.clone(), url.clone()));
                    async move {
                        Ok(match url.as_str() {
                            "http://a:80/start" => redirect_response(301, "/hop1"),
                            "http://a:80/hop1" => redirect_response(302, "http://b:81/hop2"),
                            "http://b:81/hop2" => ok_response("done"),
                            other => panic!("unexpected url {}", other),
                        })
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].1, "http://b:81/hop2");
    }

    #[tokio::test]
    async fn test_303_rewrites_method_to_get() {
        let methods = Mutex::new(Vec::new());
        let follower = RedirectFollower::new(10);
        let resp = follower
            .follow(
                "r1",
                Method::POST,
                "http://a:80/submit".to_string(),
                Bytes::from_static(b"payload"),
                |method, url, _body| {
                    methods.lock().unwrap().push(method.clone());
                    async move {
                        Ok(if url.ends_with("/submit") {
                            redirect_response(303, "/result")
                        } else {
                            ok_response("done")
                        })
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        let methods = methods.into_inner().unwrap();
        assert_eq!(methods[0], Method::POST);
        assert_eq!(methods[1], Method::GET);
    }

    #[tokio::test]
    async fn test_307_preserves_method() {
        let methods = Mutex::new(Vec::new());
        let follower = RedirectFollower::new(10);
        follower
            .follow(
                "r1",
                Method::POST,
                "http://a:80/submit".to_string(),
                Bytes::from_static(b"payload"),
                |method, url, _body| {
                    methods.lock().unwrap().push(method.clone());
                    async move {
                        Ok(if url.ends_with("/submit") {
                            redirect_response(307, "/retry")
                        } else {
                            ok_response("done")
                        })
                    }
                },
            )
            .await
            .unwrap();

        let methods = methods.into_inner().unwrap();
        assert_eq!(methods[1], Method::POST);
    }

    #[tokio::test]
    async fn test_max_redirects_returns_last_response() {
        let calls = AtomicUsize::new(0);
        let follower = RedirectFollower::new(3);
        let resp = follower
            .follow(
                "r1",
                Method::GET,
                "http://a:80/loop".to_string(),
                Bytes::new(),
                |_method, _url, _body| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    async { Ok(redirect_response(302, "/loop")) }
                },
            )
            .await
            .unwrap();

        // 1 original + 3 follows, and the final 302 comes back unchanged.
        assert_eq!(calls.load(Ordering::Relaxed), 4);
        assert_eq!(resp.status(), 302);
    }

    #[tokio::test]
    async fn test_non_redirect_passes_through() {
        let follower = RedirectFollower::new(10);
        let resp = follower
            .follow(
                "r1",
                Method::GET,
                "http://a:80/x".to_string(),
                Bytes::new(),
                |_m, _u, _b| async { Ok(ok_response("direct")) },
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    #[tokio::test]
    async fn test_redirect_without_location_passes_through() {
        let follower = RedirectFollower::new(10);
        let resp = follower
            .follow(
                "r1",
                Method::GET,
                "http://a:80/x".to_string(),
                Bytes::new(),
                |_m, _u, _b| async {
                    Ok(Response::builder()
                        .status(301)
                        .body(full_body("no location"))
                        .unwrap())
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), 301);
    }
}
