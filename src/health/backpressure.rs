use crate::balance::Balancer;
use crate::config::BackpressureConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Reacts to 429/503 from an upstream: the backend is taken out of rotation
/// until its `Retry-After` elapses, then restored by a timer.
pub struct BackpressureHandler {
    config: BackpressureConfig,
    balancer: Arc<Balancer>,
    timers: DashMap<String, TimerEntry>,
    generation: AtomicU64,
    throttled: AtomicU64,
    recovered: AtomicU64,
}

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

impl Drop for TimerEntry {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Serialize)]
pub struct BackpressureSnapshot {
    pub throttled: u64,
    pub recovered: u64,
    pub pending: usize,
}

impl BackpressureHandler {
    pub fn new(config: BackpressureConfig, balancer: Arc<Balancer>) -> Arc<Self> {
        Arc::new(Self {
            config,
            balancer,
            timers: DashMap::new(),
            generation: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
        })
    }

    /// Inspect a downstream response. `upstream_addr` is the backend URL the
    /// variables context recorded for this request; absent means selection
    /// never happened and there is nothing to evict.
    pub fn on_response(
        self: &Arc<Self>,
        upstream_addr: Option<&str>,
        status: u16,
        headers: &http::HeaderMap,
    ) {
        if !self.config.status_codes.contains(&status) {
            return;
        }
        let Some(addr) = upstream_addr.filter(|a| !a.is_empty()) else {
            return;
        };

        let delay = self.retry_after(headers);
        self.balancer.mark_unhealthy(addr);
        self.throttled.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("gateway_backpressure_throttled_total").increment(1);
        info!(
            "backpressure: backend evicted, backend={}, status={}, delay={:?}",
            addr, status, delay
        );

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handler = self.clone();
        let addr_owned = addr.to_string();
        // The timer must not fire before its map entry exists; gate it on a
        // registration signal sent after the insert below.
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            if registered_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            // Only the newest timer for this address may recover it.
            let current = handler
                .timers
                .remove_if(&addr_owned, |_, entry| entry.generation == generation);
            if current.is_some() {
                handler.balancer.mark_healthy(&addr_owned);
                handler.recovered.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_backpressure_recovered_total").increment(1);
                debug!("backpressure: backend restored, backend={}", addr_owned);
            }
        });

        // Replacing an entry drops it, aborting the superseded timer.
        self.timers.insert(
            addr.to_string(),
            TimerEntry {
                generation,
                handle,
            },
        );
        let _ = registered_tx.send(());
    }

    /// Parse `Retry-After`: decimal seconds first, HTTP-date second. Past
    /// dates and garbage fall back to the configured default. Everything is
    /// capped at `max_retry_after`.
    fn retry_after(&self, headers: &http::HeaderMap) -> Duration {
        let parsed = headers
            .get(http::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| {
                let raw = raw.trim();
                if let Ok(secs) = raw.parse::<u64>() {
                    return Some(Duration::from_secs(secs));
                }
                let date = httpdate::parse_http_date(raw).ok()?;
                date.duration_since(SystemTime::now()).ok()
            });

        let delay = parsed.unwrap_or_else(|| Duration::from_secs_f64(self.config.default_delay));
        delay.min(Duration::from_secs_f64(self.config.max_retry_after))
    }

    pub fn snapshot(&self) -> BackpressureSnapshot {
        BackpressureSnapshot {
            throttled: self.throttled.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            pending: self.timers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{round_robin, Backend};

    fn handler(default_delay: f64) -> (Arc<BackpressureHandler>, Arc<Balancer>) {
        let balancer = round_robin(vec![Backend::new("http://a:80", 1).unwrap()]);
        let config = BackpressureConfig {
            status_codes: vec![429, 503],
            default_delay,
            max_retry_after: 60.0,
        };
        (BackpressureHandler::new(config, balancer.clone()), balancer)
    }

    fn headers_with_retry_after(value: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, value.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_429_evicts_then_restores() {
        let (handler, balancer) = handler(5.0);
        handler.on_response(Some("http://a:80"), 429, &headers_with_retry_after("0"));
        assert_eq!(balancer.healthy_count(), 0);
        assert_eq!(handler.snapshot().throttled, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(balancer.healthy_count(), 1);
        let snap = handler.snapshot();
        assert_eq!(snap.recovered, 1);
        assert_eq!(snap.pending, 0);
    }

    #[tokio::test]
    async fn test_non_matching_status_ignored() {
        let (handler, balancer) = handler(5.0);
        handler.on_response(Some("http://a:80"), 500, &http::HeaderMap::new());
        assert_eq!(balancer.healthy_count(), 1);
        assert_eq!(handler.snapshot().throttled, 0);
    }

    #[tokio::test]
    async fn test_missing_upstream_addr_ignored() {
        let (handler, balancer) = handler(5.0);
        handler.on_response(None, 429, &http::HeaderMap::new());
        assert_eq!(balancer.healthy_count(), 1);
    }

    #[tokio::test]
    async fn test_past_http_date_uses_default_delay() {
        let (handler, balancer) = handler(0.05);
        let headers = headers_with_retry_after("Wed, 21 Oct 2015 07:28:00 GMT");
        handler.on_response(Some("http://a:80"), 503, &headers);
        assert_eq!(balancer.healthy_count(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(balancer.healthy_count(), 1);
        assert_eq!(handler.snapshot().recovered, 1);
    }

    #[tokio::test]
    async fn test_retry_after_capped() {
        let balancer = round_robin(vec![Backend::new("http://a:80", 1).unwrap()]);
        let config = BackpressureConfig {
            status_codes: vec![429],
            default_delay: 5.0,
            max_retry_after: 0.05,
        };
        let handler = BackpressureHandler::new(config, balancer.clone());
        handler.on_response(Some("http://a:80"), 429, &headers_with_retry_after("3600"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        // The one-hour ask was clamped to 50ms.
        assert_eq!(balancer.healthy_count(), 1);
    }

    #[tokio::test]
    async fn test_second_eviction_replaces_timer() {
        let (handler, balancer) = handler(5.0);
        handler.on_response(Some("http://a:80"), 429, &headers_with_retry_after("30"));
        handler.on_response(Some("http://a:80"), 429, &headers_with_retry_after("0"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The second (short) timer governs; the first was aborted.
        assert_eq!(balancer.healthy_count(), 1);
        assert_eq!(handler.snapshot().pending, 0);
    }

    #[tokio::test]
    async fn test_decimal_seconds_take_priority() {
        let (handler, _) = handler(5.0);
        let d = handler.retry_after(&headers_with_retry_after("7"));
        assert_eq!(d, Duration::from_secs(7));
    }
}
