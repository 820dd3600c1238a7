use crate::balance::Backend;
use crate::config::HedgingConfig;
use crate::error::GatewayError;
use crate::proxy::context::BoxBody;
use futures_util::stream::{FuturesUnordered, StreamExt};
use http::Response;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Speculative parallel requests for tail-latency reduction. The original
/// request launches immediately; each `delay` thereafter another attempt
/// goes to a backend not yet tried, up to `max_requests` total. The first
/// result with no error and status < 500 wins; everything else is cancelled
/// (dropped futures close their response bodies).
pub struct HedgingExecutor {
    max_requests: u32,
    delay: Duration,
    hedged_requests: AtomicU64,
    hedged_wins: AtomicU64,
}

impl HedgingExecutor {
    pub fn new(config: &HedgingConfig) -> Self {
        Self {
            max_requests: config.max_requests.max(2),
            delay: Duration::from_millis(config.delay_ms),
            hedged_requests: AtomicU64::new(0),
            hedged_wins: AtomicU64::new(0),
        }
    }

    pub fn hedged_requests(&self) -> u64 {
        self.hedged_requests.load(Ordering::Relaxed)
    }

    pub fn hedged_wins(&self) -> u64 {
        self.hedged_wins.load(Ordering::Relaxed)
    }

    /// `pick` selects a backend not in the exclusion list; `send` dispatches
    /// one attempt. The caller owns the buffered request body and clones it
    /// per attempt inside `send`.
    pub async fn execute<P, S, Fut>(
        &self,
        route_id: &str,
        cancel: &CancellationToken,
        pick: P,
        send: S,
    ) -> Result<Response<BoxBody>, GatewayError>
    where
        P: Fn(&[String]) -> Option<Backend>,
        S: Fn(Backend) -> Fut,
        Fut: Future<Output = Result<Response<BoxBody>, GatewayError>>,
    {
        let mut used: Vec<String> = Vec::new();
        let first = pick(&used).ok_or(GatewayError::NoBackend)?;
        used.push(first.url().to_string());

        let mut inflight = FuturesUnordered::new();
        inflight.push(tagged(false, send(first)));
        let mut launched: u32 = 1;

        let mut fallback: Option<Response<BoxBody>> = None;
        let mut last_err: Option<GatewayError> = None;

        loop {
            let next_result = if launched < self.max_requests {
                tokio::select! {
                    result = inflight.next() => Some(result),
                    _ = tokio::time::sleep(self.delay) => None,
                    _ = cancel.cancelled() => {
                        drop(inflight);
                        return fallback.ok_or(GatewayError::Canceled);
                    }
                }
            } else {
                tokio::select! {
                    result = inflight.next() => Some(result),
                    _ = cancel.cancelled() => {
                        drop(inflight);
                        return fallback.ok_or(GatewayError::Canceled);
                    }
                }
            };

            let result = match next_result {
                // Hedge delay elapsed: launch another attempt if a distinct
                // backend remains.
                None => {
                    match pick(&used) {
                        Some(backend) => {
                            used.push(backend.url().to_string());
                            self.hedged_requests.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!(
                                "gateway_hedged_requests_total",
                                "route" => route_id.to_string(),
                            )
                            .increment(1);
                            debug!(
                                "hedge: speculative attempt launched, route={}, total={}",
                                route_id,
                                launched + 1
                            );
                            inflight.push(tagged(true, send(backend)));
                            launched += 1;
                        }
                        None => {
                            // No distinct backend left; stop launching.
                            launched = self.max_requests;
                        }
                    }
                    continue;
                }
                Some(r) => r,
            };

            match result {
                // All attempts resolved without a winner.
                None => {
                    if launched < self.max_requests {
                        // Everything in flight failed fast; skip the rest of
                        // the hedge delay and try the next backend now.
                        if let Some(backend) = pick(&used) {
                            used.push(backend.url().to_string());
                            self.hedged_requests.fetch_add(1, Ordering::Relaxed);
                            metrics::counter!(
                                "gateway_hedged_requests_total",
                                "route" => route_id.to_string(),
                            )
                            .increment(1);
                            inflight.push(tagged(true, send(backend)));
                            launched += 1;
                            continue;
                        }
                    }
                    return match fallback {
                        Some(resp) => Ok(resp),
                        None => Err(last_err.unwrap_or(GatewayError::NoBackend)),
                    };
                }
                Some((is_hedge, Ok(resp))) if resp.status().as_u16() < 500 => {
                    if is_hedge {
                        self.hedged_wins.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(
                            "gateway_hedged_wins_total",
                            "route" => route_id.to_string(),
                        )
                        .increment(1);
                    }
                    // Dropping the set cancels the losers and closes their
                    // bodies.
                    drop(inflight);
                    drop(fallback);
                    return Ok(resp);
                }
                Some((_, Ok(resp))) => {
                    // 5xx: keep as fallback, keep waiting.
                    fallback = Some(resp);
                }
                Some((_, Err(e))) => {
                    last_err = Some(e);
                }
            }
        }
    }
}

async fn tagged<Fut>(is_hedge: bool, fut: Fut) -> (bool, Result<Response<BoxBody>, GatewayError>)
where
    Fut: Future<Output = Result<Response<BoxBody>, GatewayError>>,
{
    (is_hedge, fut.await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::full_body;

    fn response(status: u16) -> Response<BoxBody> {
        Response::builder()
            .status(status)
            .body(full_body("x"))
            .unwrap()
    }

    fn backends(urls: &[&str]) -> Vec<Backend> {
        urls.iter().map(|u| Backend::new(u, 1).unwrap()).collect()
    }

    fn pick_from(pool: Vec<Backend>) -> impl Fn(&[String]) -> Option<Backend> {
        move |used: &[String]| {
            pool.iter()
                .find(|b| !used.iter().any(|u| u == b.url()))
                .cloned()
        }
    }

    fn executor(max_requests: u32, delay_ms: u64) -> HedgingExecutor {
        HedgingExecutor::new(&HedgingConfig {
            enabled: true,
            max_requests,
            delay_ms,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_hedge_wins_tail_latency() {
        let exec = executor(2, 10);
        let pool = backends(&["http://slow:80", "http://fast:80"]);
        let started = tokio::time::Instant::now();

        let resp = exec
            .execute(
                "r1",
                &CancellationToken::new(),
                pick_from(pool),
                |backend| async move {
                    if backend.url().contains("slow") {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    } else {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(response(200))
                },
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(exec.hedged_requests() >= 1);
        assert!(exec.hedged_wins() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_original_skips_hedge() {
        let exec = executor(2, 50);
        let pool = backends(&["http://fast:80", "http://other:80"]);

        let resp = exec
            .execute(
                "r1",
                &CancellationToken::new(),
                pick_from(pool),
                |_| async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(response(200))
                },
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(exec.hedged_requests(), 0);
        assert_eq!(exec.hedged_wins(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_5xx_retained_as_fallback() {
        let exec = executor(2, 10);
        let pool = backends(&["http://a:80", "http://b:80"]);

        let resp = exec
            .execute(
                "r1",
                &CancellationToken::new(),
                pick_from(pool),
                |_| async { Ok(response(503)) },
            )
            .await
            .unwrap();

        // Both attempts answered 503: the fallback comes back rather than
        // an error.
        assert_eq!(resp.status(), 503);
        assert_eq!(exec.hedged_requests(), 1);
        assert_eq!(exec.hedged_wins(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hedge_covers_original_error() {
        let exec = executor(2, 10);
        let pool = backends(&["http://down:80", "http://up:80"]);

        let resp = exec
            .execute(
                "r1",
                &CancellationToken::new(),
                pick_from(pool),
                |backend| async move {
                    if backend.url().contains("down") {
                        Err(GatewayError::Transport("connection refused".into()))
                    } else {
                        Ok(response(200))
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(exec.hedged_wins(), 1);
    }

    #[tokio::test]
    async fn test_no_backend() {
        let exec = executor(2, 10);
        let err = exec
            .execute(
                "r1",
                &CancellationToken::new(),
                |_: &[String]| None,
                |_| async { Ok(response(200)) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoBackend));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_backend_cannot_hedge() {
        let exec = executor(2, 10);
        let pool = backends(&["http://only:80"]);

        let resp = exec
            .execute(
                "r1",
                &CancellationToken::new(),
                pick_from(pool),
                |_| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(response(200))
                },
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(exec.hedged_requests(), 0);
    }
}
