use crate::balance::Balancer;
use crate::config::OutlierConfig;
use crate::stats::{SlidingWindow, StatsSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Hook = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

/// Passive health management: a periodic sweep compares every backend's
/// error rate and p99 against the population medians and ejects the
/// deviants, with exponential back-off on repeat offenders.
pub struct OutlierDetector {
    route_id: String,
    config: OutlierConfig,
    balancer: Arc<Balancer>,
    inner: RwLock<Inner>,
    total_ejections: AtomicU64,
    total_recoveries: AtomicU64,
    cancel: CancellationToken,
    on_eject: Option<Hook>,
    on_recover: Option<Hook>,
}

struct Inner {
    stats: HashMap<String, Arc<SlidingWindow>>,
    ejected: HashMap<String, EjectionRecord>,
    /// Lifetime ejection counts, retained across recoveries so the back-off
    /// keeps growing for repeat offenders.
    ejection_counts: HashMap<String, u32>,
}

struct EjectionRecord {
    ejected_at: Instant,
    duration: Duration,
    count: u32,
    reason: String,
}

#[derive(Serialize)]
pub struct OutlierSnapshot {
    pub route_id: String,
    pub backend_stats: HashMap<String, StatsSnapshot>,
    pub ejected_backends: HashMap<String, EjectedEntry>,
    pub total_ejections: u64,
    pub total_recoveries: u64,
}

#[derive(Serialize)]
pub struct EjectedEntry {
    pub seconds_remaining: f64,
    pub count: u32,
    pub reason: String,
}

impl OutlierDetector {
    pub fn new(route_id: &str, config: OutlierConfig, balancer: Arc<Balancer>) -> Arc<Self> {
        Arc::new(Self {
            route_id: route_id.to_string(),
            config,
            balancer,
            inner: RwLock::new(Inner {
                stats: HashMap::new(),
                ejected: HashMap::new(),
                ejection_counts: HashMap::new(),
            }),
            total_ejections: AtomicU64::new(0),
            total_recoveries: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            on_eject: None,
            on_recover: None,
        })
    }

    /// Test/ops hooks, set before the detector is shared.
    pub fn with_hooks(mut self: Arc<Self>, on_eject: Hook, on_recover: Hook) -> Arc<Self> {
        let this = Arc::get_mut(&mut self).expect("with_hooks before sharing");
        this.on_eject = Some(on_eject);
        this.on_recover = Some(on_recover);
        self
    }

    /// Record one completed request against a backend. Hot path: a read lock
    /// plus the window's atomics; the write lock is taken only on first
    /// sight of a backend.
    pub fn record(&self, backend_url: &str, status: u16, latency_ms: f64) {
        {
            let inner = self.inner.read().unwrap();
            if let Some(window) = inner.stats.get(backend_url) {
                window.record(status, latency_ms);
                return;
            }
        }
        let window = {
            let mut inner = self.inner.write().unwrap();
            inner
                .stats
                .entry(backend_url.to_string())
                .or_insert_with(|| {
                    Arc::new(SlidingWindow::new(Duration::from_secs_f64(
                        self.config.window,
                    )))
                })
                .clone()
        };
        window.record(status, latency_ms);
    }

    /// Launch the periodic sweep task. Stoppable via `stop()`.
    pub fn start(self: &Arc<Self>) {
        let detector = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs_f64(detector.config.interval.max(0.001)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => detector.sweep(),
                    _ = detector.cancel.cancelled() => {
                        debug!("outlier: detector stopped, route={}", detector.route_id);
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

    /// One detection pass: recover expired ejections, then compare each
    /// eligible backend against the population medians.
    pub fn sweep(&self) {
        let mut inner = self.inner.write().unwrap();

        // Recovery phase.
        let now = Instant::now();
        let recovered: Vec<String> = inner
            .ejected
            .iter()
            .filter(|(_, r)| now.duration_since(r.ejected_at) >= r.duration)
            .map(|(url, _)| url.clone())
            .collect();
        for url in recovered {
            inner.ejected.remove(&url);
            self.balancer.mark_healthy(&url);
            self.total_recoveries.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(
                "gateway_outlier_recoveries_total",
                "route" => self.route_id.clone(),
            )
            .increment(1);
            info!("outlier: backend recovered, route={}, backend={}", self.route_id, url);
            if let Some(ref hook) = self.on_recover {
                hook(&self.route_id, &url, "ejection elapsed");
            }
        }

        // Eligibility: enough traffic to judge, and at least two backends to
        // form a population.
        let snapshots: Vec<(String, StatsSnapshot)> = inner
            .stats
            .iter()
            .map(|(url, w)| (url.clone(), w.snapshot()))
            .filter(|(_, s)| s.requests >= self.config.min_requests)
            .collect();
        if snapshots.len() < 2 {
            return;
        }

        let median_error_rate = median(snapshots.iter().map(|(_, s)| s.error_rate).collect());
        let median_p99 = median(snapshots.iter().map(|(_, s)| s.p99).collect());

        let total_backends = self.balancer.backends().len();
        let max_ejectable =
            (total_backends * self.config.max_ejection_percent as usize) / 100;

        for (url, snap) in &snapshots {
            if inner.ejected.contains_key(url) {
                continue;
            }
            if inner.ejected.len() >= max_ejectable {
                debug!(
                    "outlier: ejection cap reached, route={}, ejected={}",
                    self.route_id,
                    inner.ejected.len()
                );
                break;
            }

            let error_outlier = snap.error_rate > self.config.error_rate_threshold
                && snap.error_rate > self.config.error_rate_multiplier * median_error_rate;
            let latency_outlier =
                median_p99 > 0.0 && snap.p99 > self.config.latency_multiplier * median_p99;

            if !error_outlier && !latency_outlier {
                continue;
            }

            let reason = if error_outlier {
                format!(
                    "error_rate {:.3} vs median {:.3}",
                    snap.error_rate, median_error_rate
                )
            } else {
                format!("p99 {:.1}ms vs median {:.1}ms", snap.p99, median_p99)
            };

            let count = {
                let entry = inner.ejection_counts.entry(url.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            let duration = Duration::from_secs_f64(
                (count as f64 * self.config.base_ejection_duration)
                    .min(self.config.max_ejection_duration),
            );

            self.balancer.mark_unhealthy(url);
            inner.ejected.insert(
                url.clone(),
                EjectionRecord {
                    ejected_at: now,
                    duration,
                    count,
                    reason: reason.clone(),
                },
            );
            self.total_ejections.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(
                "gateway_outlier_ejections_total",
                "route" => self.route_id.clone(),
            )
            .increment(1);
            warn!(
                "outlier: backend ejected, route={}, backend={}, count={}, duration={:?}, reason={}",
                self.route_id, url, count, duration, reason
            );
            if let Some(ref hook) = self.on_eject {
                hook(&self.route_id, url, &reason);
            }
        }
    }

    pub fn snapshot(&self) -> OutlierSnapshot {
        let inner = self.inner.read().unwrap();
        let now = Instant::now();
        OutlierSnapshot {
            route_id: self.route_id.clone(),
            backend_stats: inner
                .stats
                .iter()
                .map(|(url, w)| (url.clone(), w.snapshot()))
                .collect(),
            ejected_backends: inner
                .ejected
                .iter()
                .map(|(url, r)| {
                    let remaining = r
                        .duration
                        .saturating_sub(now.duration_since(r.ejected_at))
                        .as_secs_f64();
                    (
                        url.clone(),
                        EjectedEntry {
                            seconds_remaining: remaining,
                            count: r.count,
                            reason: r.reason.clone(),
                        },
                    )
                })
                .collect(),
            total_ejections: self.total_ejections.load(Ordering::Relaxed),
            total_recoveries: self.total_recoveries.load(Ordering::Relaxed),
        }
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{round_robin, Backend};
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> OutlierConfig {
        OutlierConfig {
            enabled: true,
            interval: 0.05,
            window: 0.5,
            min_requests: 3,
            error_rate_threshold: 0.5,
            error_rate_multiplier: 1.5,
            latency_multiplier: 3.0,
            base_ejection_duration: 0.1,
            max_ejection_duration: 1.0,
            max_ejection_percent: 50,
        }
    }

    fn two_backend_balancer() -> Arc<Balancer> {
        round_robin(vec![
            Backend::new("http://good:80", 1).unwrap(),
            Backend::new("http://bad:80", 1).unwrap(),
        ])
    }

    #[test]
    fn test_median() {
        assert_eq!(median(vec![1.0, 3.0, 2.0]), 2.0);
        assert_eq!(median(vec![1.0, 2.0]), 1.5);
        assert_eq!(median(vec![]), 0.0);
    }

    #[test]
    fn test_ejects_error_rate_outlier() {
        let balancer = two_backend_balancer();
        let detector = OutlierDetector::new("r1", test_config(), balancer.clone());
        for _ in 0..10 {
            detector.record("http://good:80", 200, 5.0);
            detector.record("http://bad:80", 500, 5.0);
        }
        detector.sweep();

        let snap = detector.snapshot();
        assert_eq!(snap.total_ejections, 1);
        assert!(snap.ejected_backends.contains_key("http://bad:80"));
        assert_eq!(balancer.healthy_count(), 1);
    }

    #[test]
    fn test_single_eligible_backend_never_ejected() {
        let balancer = two_backend_balancer();
        let detector = OutlierDetector::new("r1", test_config(), balancer.clone());
        for _ in 0..10 {
            detector.record("http://bad:80", 500, 5.0);
        }
        detector.sweep();
        assert_eq!(detector.snapshot().total_ejections, 0);
        assert_eq!(balancer.healthy_count(), 2);
    }

    #[test]
    fn test_max_ejection_percent_cap() {
        let balancer = round_robin(vec![
            Backend::new("http://a:80", 1).unwrap(),
            Backend::new("http://b:80", 1).unwrap(),
            Backend::new("http://c:80", 1).unwrap(),
        ]);
        let mut config = test_config();
        // Lower the comparative bar so both bad backends qualify; the cap
        // (floor(3 * 50%) = 1) must still hold one back.
        config.error_rate_multiplier = 0.5;
        let detector = OutlierDetector::new("r1", config, balancer.clone());
        for _ in 0..10 {
            detector.record("http://a:80", 500, 5.0);
            detector.record("http://b:80", 500, 5.0);
            detector.record("http://c:80", 200, 5.0);
        }
        detector.sweep();
        assert_eq!(detector.snapshot().ejected_backends.len(), 1);
        assert_eq!(balancer.healthy_count(), 2);
    }

    #[test]
    fn test_latency_outlier() {
        let balancer = round_robin(vec![
            Backend::new("http://a:80", 1).unwrap(),
            Backend::new("http://b:80", 1).unwrap(),
            Backend::new("http://slow:80", 1).unwrap(),
        ]);
        let detector = OutlierDetector::new("r1", test_config(), balancer.clone());
        for _ in 0..10 {
            detector.record("http://a:80", 200, 10.0);
            detector.record("http://b:80", 200, 12.0);
            detector.record("http://slow:80", 200, 100.0);
        }
        detector.sweep();
        // median p99 = 12ms; 100 > 3 * 12 — latency outlier with zero errors.
        let snap = detector.snapshot();
        assert_eq!(snap.total_ejections, 1);
        assert!(snap.ejected_backends.contains_key("http://slow:80"));
    }

    #[tokio::test]
    async fn test_eject_then_recover() {
        let balancer = two_backend_balancer();
        let detector = OutlierDetector::new("r1", test_config(), balancer.clone());
        for _ in 0..10 {
            detector.record("http://good:80", 200, 5.0);
            detector.record("http://bad:80", 500, 5.0);
        }
        detector.sweep();
        assert_eq!(balancer.healthy_count(), 1);

        // base_ejection_duration = 100ms; after it elapses (and the window
        // has rolled the errors away) the next sweep restores the backend.
        tokio::time::sleep(Duration::from_millis(600)).await;
        detector.record("http://good:80", 200, 5.0);
        detector.record("http://bad:80", 200, 5.0);
        detector.sweep();

        assert_eq!(balancer.healthy_count(), 2);
        let snap = detector.snapshot();
        assert_eq!(snap.total_recoveries, 1);
        assert!(snap.ejected_backends.is_empty());
    }

    #[test]
    fn test_backoff_grows_with_repeat_ejections() {
        let balancer = two_backend_balancer();
        let detector = OutlierDetector::new("r1", test_config(), balancer.clone());
        for _ in 0..10 {
            detector.record("http://good:80", 200, 5.0);
            detector.record("http://bad:80", 500, 5.0);
        }
        detector.sweep();

        // Force the record out and re-eject.
        {
            let mut inner = detector.inner.write().unwrap();
            let record = inner.ejected.remove("http://bad:80").unwrap();
            assert_eq!(record.count, 1);
        }
        balancer.mark_healthy("http://bad:80");
        for _ in 0..10 {
            detector.record("http://bad:80", 500, 5.0);
        }
        detector.sweep();

        let inner = detector.inner.read().unwrap();
        let record = inner.ejected.get("http://bad:80").unwrap();
        assert_eq!(record.count, 2);
        assert!(record.duration >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_hooks_fire() {
        let ejections = Arc::new(AtomicUsize::new(0));
        let recoveries = Arc::new(AtomicUsize::new(0));
        let balancer = two_backend_balancer();
        let e = ejections.clone();
        let r = recoveries.clone();
        let detector = OutlierDetector::new("r1", test_config(), balancer)
            .with_hooks(
                Arc::new(move |_, _, _| {
                    e.fetch_add(1, Ordering::Relaxed);
                }),
                Arc::new(move |_, _, _| {
                    r.fetch_add(1, Ordering::Relaxed);
                }),
            );
        for _ in 0..10 {
            detector.record("http://good:80", 200, 5.0);
            detector.record("http://bad:80", 500, 5.0);
        }
        detector.sweep();
        assert_eq!(ejections.load(Ordering::Relaxed), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        detector.sweep();
        assert_eq!(recoveries.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let detector = OutlierDetector::new("r1", test_config(), two_backend_balancer());
        detector.start();
        detector.stop();
        detector.stop();
    }
}
