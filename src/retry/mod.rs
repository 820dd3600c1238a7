pub mod budget;
pub mod hedge;

pub use budget::RetryBudget;
pub use hedge::HedgingExecutor;

use crate::config::RetryConfig;
use crate::error::GatewayError;
use crate::proxy::context::BoxBody;
use http::{Method, Response};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bounded retry with exponential backoff, gated by an optional
/// sliding-window budget. Network errors are always retryable; responses are
/// retryable only for configured method/status pairs.
pub struct RetryPolicy {
    config: RetryConfig,
    budget: Option<Arc<RetryBudget>>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            budget: config.budget.as_ref().map(|b| Arc::new(RetryBudget::new(b))),
        }
    }

    pub fn budget(&self) -> Option<&Arc<RetryBudget>> {
        self.budget.as_ref()
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    fn is_retryable_response(&self, method: &Method, status: u16) -> bool {
        self.config
            .retryable_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
            && self.config.retryable_statuses.contains(&status)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.config.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.config.initial_backoff_ms as f64 * exp)
            .min(self.config.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Drive `send` through up to `1 + max_retries` attempts. Each attempt
    /// runs under `per_try_timeout` when configured; the caller's deadline
    /// still applies around the whole call.
    pub async fn execute<F, Fut>(
        &self,
        route_id: &str,
        cancel: &CancellationToken,
        method: &Method,
        send: F,
    ) -> Result<Response<BoxBody>, GatewayError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<Response<BoxBody>, GatewayError>>,
    {
        let mut last_resp: Option<Response<BoxBody>> = None;
        let mut last_err: Option<GatewayError> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                if let Some(ref budget) = self.budget {
                    if !budget.allow_retry() {
                        debug!("retry: budget exhausted, route={}, attempt={}", route_id, attempt);
                        metrics::counter!(
                            "gateway_retry_budget_exhausted_total",
                            "route" => route_id.to_string(),
                        )
                        .increment(1);
                        break;
                    }
                    budget.record_retry();
                }
                metrics::counter!(
                    "gateway_upstream_retries_total",
                    "route" => route_id.to_string(),
                )
                .increment(1);

                tokio::select! {
                    _ = tokio::time::sleep(self.backoff(attempt)) => {}
                    _ = cancel.cancelled() => {
                        // Close any retained response before bailing out.
                        drop(last_resp.take());
                        return Err(GatewayError::Canceled);
                    }
                }
            }

            if let Some(ref budget) = self.budget {
                budget.record_request();
            }

            let result = if self.config.per_try_timeout > 0.0 {
                match tokio::time::timeout(
                    Duration::from_secs_f64(self.config.per_try_timeout),
                    send(attempt),
                )
                .await
                {
                    Ok(r) => r,
                    Err(_) => Err(GatewayError::DeadlineExceeded),
                }
            } else {
                send(attempt).await
            };

            match result {
                Err(e) => {
                    debug!(
                        "retry: attempt failed, route={}, attempt={}, error={}",
                        route_id, attempt, e
                    );
                    last_err = Some(e);
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if !self.is_retryable_response(method, status) {
                        return Ok(resp);
                    }
                    debug!(
                        "retry: retryable status {}, route={}, attempt={}",
                        status, route_id, attempt
                    );
                    // Dropping the previously retained response closes it.
                    last_resp = Some(resp);
                }
            }
        }

        match last_resp {
            Some(resp) => Ok(resp),
            None => Err(last_err.unwrap_or(GatewayError::NoBackend)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::proxy::context::full_body;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn response(status: u16) -> Response<BoxBody> {
        Response::builder()
            .status(status)
            .body(full_body("x"))
            .unwrap()
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            ..RetryConfig::default()
        })
    }

    #[tokio::test]
    async fn test_success_returns_immediately() {
        let calls = AtomicU32::new(0);
        let p = policy(3);
        let resp = p
            .execute("r1", &CancellationToken::new(), &Method::GET, |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Ok(response(200)) }
            })
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_retryable_status_then_success() {
        let calls = AtomicU32::new(0);
        let p = policy(3);
        let resp = p
            .execute("r1", &CancellationToken::new(), &Method::GET, |_| {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if n == 0 {
                        Ok(response(503))
                    } else {
                        Ok(response(200))
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_post_is_not_retried() {
        let calls = AtomicU32::new(0);
        let p = policy(3);
        let resp = p
            .execute("r1", &CancellationToken::new(), &Method::POST, |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Ok(response(503)) }
            })
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_network_error_always_retryable() {
        let calls = AtomicU32::new(0);
        let p = policy(2);
        let resp = p
            .execute("r1", &CancellationToken::new(), &Method::POST, |_| {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if n == 0 {
                        Err(GatewayError::Transport("connection refused".into()))
                    } else {
                        Ok(response(201))
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_response() {
        let calls = AtomicU32::new(0);
        let p = policy(2);
        let resp = p
            .execute("r1", &CancellationToken::new(), &Method::GET, |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Ok(response(502)) }
            })
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_only_errors_returns_last_error() {
        let p = policy(1);
        let err = p
            .execute("r1", &CancellationToken::new(), &Method::GET, |_| async {
                Err(GatewayError::Transport("dns failure".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
    }

    #[tokio::test]
    async fn test_budget_stops_retries() {
        let config = RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 1,
            budget: Some(BudgetConfig {
                ratio: 0.1,
                min_retries: 0.0,
                window: 10,
            }),
            ..RetryConfig::default()
        };
        let p = RetryPolicy::new(&config);
        // Saturate the budget: 10 requests, 2 retries → 20% > 10%.
        let budget = p.budget().unwrap();
        for _ in 0..10 {
            budget.record_request();
        }
        budget.record_retry();
        budget.record_retry();

        let calls = AtomicU32::new(0);
        let resp = p
            .execute("r1", &CancellationToken::new(), &Method::GET, |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Ok(response(503)) }
            })
            .await
            .unwrap();
        // First attempt only; the budget denied every retry.
        assert_eq!(resp.status(), 503);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 5_000,
            ..RetryConfig::default()
        };
        let p = RetryPolicy::new(&config);
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = p
            .execute("r1", &cancel, &Method::GET, |_| async { Ok(response(503)) })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Canceled));
    }

    #[tokio::test]
    async fn test_per_try_timeout_maps_to_deadline() {
        let config = RetryConfig {
            max_retries: 0,
            per_try_timeout: 0.01,
            ..RetryConfig::default()
        };
        let p = RetryPolicy::new(&config);
        let err = p
            .execute("r1", &CancellationToken::new(), &Method::GET, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(response(200))
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_backoff_progression() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            ..RetryConfig::default()
        };
        let p = RetryPolicy::new(&config);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        // Capped.
        assert_eq!(p.backoff(8), Duration::from_millis(1_000));
    }
}
