use crate::balance::{Backend, Balancer};
use crate::config::ActiveHealthConfig;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Active HTTP prober for one route's backends. Consecutive-streak
/// thresholds flip the balancer's health flags; a single blip in either
/// direction never flaps a backend.
pub struct ActiveHealthChecker {
    route_id: String,
    config: ActiveHealthConfig,
    balancer: Arc<Balancer>,
    streaks: DashMap<String, Streak>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Streak {
    passes: AtomicU32,
    failures: AtomicU32,
}

/// Build a shared HTTP client for health checks.
pub fn build_health_check_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .no_proxy()
        .build()
        .expect("failed to build health check client")
}

impl ActiveHealthChecker {
    pub fn new(route_id: &str, config: ActiveHealthConfig, balancer: Arc<Balancer>) -> Arc<Self> {
        Arc::new(Self {
            route_id: route_id.to_string(),
            config,
            balancer,
            streaks: DashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>, client: reqwest::Client) {
        let checker = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(checker.config.interval.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => checker.run_round(&client).await,
                    _ = checker.cancel.cancelled() => {
                        debug!("health: active: checker stopped, route={}", checker.route_id);
                        return;
                    }
                }
            }
        });
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Probe every backend once, bounded by the configured concurrency.
    pub async fn run_round(self: &Arc<Self>, client: &reqwest::Client) {
        let backends = self.balancer.backends();
        if backends.is_empty() {
            return;
        }
        let concurrency = self.config.concurrency.max(1);

        stream::iter(backends)
            .map(|backend| {
                let checker = self.clone();
                let client = client.clone();
                async move {
                    checker.check_one(&client, &backend).await;
                }
            })
            .buffer_unordered(concurrency)
            .collect::<()>()
            .await;
    }

    async fn check_one(&self, client: &reqwest::Client, backend: &Backend) {
        let url = match self.probe_url(backend) {
            Some(u) => u,
            None => return,
        };

        let result = client
            .get(&url)
            .timeout(Duration::from_secs(self.config.timeout))
            .send()
            .await;

        let passed = match result {
            Ok(resp) => self.config.healthy_statuses.contains(&resp.status().as_u16()),
            Err(_) => false,
        };

        let streak = self
            .streaks
            .entry(backend.url().to_string())
            .or_default()
            .downgrade();

        if passed {
            streak.failures.store(0, Ordering::Relaxed);
            let passes = streak.passes.fetch_add(1, Ordering::Relaxed) + 1;
            drop(streak);
            if passes >= self.config.healthy_threshold && !backend.is_healthy() {
                self.balancer.mark_healthy(backend.url());
                metrics::gauge!(
                    "gateway_backend_health_status",
                    "route" => self.route_id.clone(),
                    "backend" => backend.url().to_string(),
                )
                .set(1.0);
                debug!(
                    "health: active: backend restored, route={}, backend={}",
                    self.route_id,
                    backend.url()
                );
            }
        } else {
            streak.passes.store(0, Ordering::Relaxed);
            let failures = streak.failures.fetch_add(1, Ordering::Relaxed) + 1;
            drop(streak);
            if failures >= self.config.unhealthy_threshold && backend.is_healthy() {
                self.balancer.mark_unhealthy(backend.url());
                metrics::gauge!(
                    "gateway_backend_health_status",
                    "route" => self.route_id.clone(),
                    "backend" => backend.url().to_string(),
                )
                .set(0.0);
                warn!(
                    "health: active: backend marked unhealthy, route={}, backend={}, consecutive_failures={}",
                    self.route_id,
                    backend.url(),
                    failures
                );
            }
        }
        metrics::counter!(
            "gateway_health_check_total",
            "route" => self.route_id.clone(),
            "result" => if passed { "success" } else { "failure" },
        )
        .increment(1);
    }

    /// Probe URL: the backend's scheme/host, the dedicated probe port when
    /// configured, and the probe path.
    fn probe_url(&self, backend: &Backend) -> Option<String> {
        let uri = backend.uri();
        let scheme = uri.scheme_str().unwrap_or("http");
        let host = uri.host()?;
        let port = self
            .config
            .port
            .or_else(|| uri.port_u16())
            .map(|p| format!(":{}", p))
            .unwrap_or_default();
        Some(format!("{}://{}{}{}", scheme, host, port, self.config.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ActiveHealthConfig {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }

    #[test]
    fn test_probe_url_default_port() {
        let checker = ActiveHealthChecker::new(
            "r1",
            config(),
            crate::balance::round_robin(vec![Backend::new("http://10.0.0.1:9000", 1).unwrap()]),
        );
        let backend = Backend::new("http://10.0.0.1:9000", 1).unwrap();
        assert_eq!(
            checker.probe_url(&backend).unwrap(),
            "http://10.0.0.1:9000/healthz"
        );
    }

    #[test]
    fn test_probe_url_port_override() {
        let mut cfg = config();
        cfg.port = Some(9901);
        cfg.path = "/status".to_string();
        let checker = ActiveHealthChecker::new(
            "r1",
            cfg,
            crate::balance::round_robin(vec![Backend::new("http://10.0.0.1:9000", 1).unwrap()]),
        );
        let backend = Backend::new("http://10.0.0.1:9000", 1).unwrap();
        assert_eq!(
            checker.probe_url(&backend).unwrap(),
            "http://10.0.0.1:9901/status"
        );
    }

    #[tokio::test]
    async fn test_threshold_flips_health() {
        // Probe an address nothing listens on: every check fails.
        let balancer =
            crate::balance::round_robin(vec![Backend::new("http://127.0.0.1:1", 1).unwrap()]);
        let mut cfg = config();
        cfg.timeout = 1;
        cfg.unhealthy_threshold = 2;
        let checker = ActiveHealthChecker::new("r1", cfg, balancer.clone());
        let client = build_health_check_client();

        checker.run_round(&client).await;
        assert_eq!(balancer.healthy_count(), 1, "one failure is not enough");
        checker.run_round(&client).await;
        assert_eq!(balancer.healthy_count(), 0, "second failure crosses the threshold");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let checker = ActiveHealthChecker::new(
            "r1",
            config(),
            crate::balance::round_robin(Vec::new()),
        );
        checker.start(build_health_check_client());
        checker.stop();
        checker.stop();
    }
}
