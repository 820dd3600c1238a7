use super::{Backend, BackendSet};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_ALPHA: f64 = 0.5;

/// Least-response-time: one EWMA latency tracker per backend URL, updated on
/// every completed request. Cold backends (no samples yet) are preferred so
/// every backend gets explored before latency steering kicks in.
pub struct ResponseTimeBalancer {
    set: BackendSet,
    trackers: DashMap<String, EwmaTracker>,
    alpha: f64,
}

/// EWMA stored as f64 bits in an `AtomicU64` so updates stay lock-free.
struct EwmaTracker {
    ewma_ms: AtomicU64,
    samples: AtomicU64,
}

impl EwmaTracker {
    fn new() -> Self {
        Self {
            ewma_ms: AtomicU64::new(0f64.to_bits()),
            samples: AtomicU64::new(0),
        }
    }

    fn ewma(&self) -> f64 {
        f64::from_bits(self.ewma_ms.load(Ordering::Relaxed))
    }

    fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    fn observe(&self, latency_ms: f64, alpha: f64) {
        if self.samples.fetch_add(1, Ordering::Relaxed) == 0 {
            self.ewma_ms.store(latency_ms.to_bits(), Ordering::Relaxed);
            return;
        }
        let current = f64::from_bits(self.ewma_ms.load(Ordering::Relaxed));
        let next = alpha * latency_ms + (1.0 - alpha) * current;
        self.ewma_ms.store(next.to_bits(), Ordering::Relaxed);
    }
}

impl ResponseTimeBalancer {
    pub fn new(backends: Vec<Backend>) -> Self {
        let lb = Self {
            set: BackendSet::new(Vec::new()),
            trackers: DashMap::new(),
            alpha: DEFAULT_ALPHA,
        };
        lb.update_backends(backends);
        lb
    }

    pub fn next(&self) -> Option<Backend> {
        let snap = self.set.healthy();
        if snap.backends.is_empty() {
            return None;
        }

        // Cold-start preference: any healthy backend we have never timed.
        for backend in &snap.backends {
            let cold = self
                .trackers
                .get(backend.url())
                .map(|t| t.samples() == 0)
                .unwrap_or(true);
            if cold {
                return Some(backend.clone());
            }
        }

        let mut best: Option<&Backend> = None;
        let mut best_ewma = f64::INFINITY;
        for backend in &snap.backends {
            let ewma = self
                .trackers
                .get(backend.url())
                .map(|t| t.ewma())
                .unwrap_or(0.0);
            if ewma < best_ewma {
                best_ewma = ewma;
                best = Some(backend);
            }
        }
        best.cloned()
    }

    /// Fold one measured latency into the backend's tracker.
    pub fn record(&self, url: &str, latency_ms: f64) {
        if let Some(tracker) = self.trackers.get(url) {
            tracker.observe(latency_ms, self.alpha);
        }
    }

    pub fn update_backends(&self, backends: Vec<Backend>) {
        for backend in &backends {
            self.trackers
                .entry(backend.url().to_string())
                .or_insert_with(EwmaTracker::new);
        }
        let keep: std::collections::HashSet<String> =
            backends.iter().map(|b| b.url().to_string()).collect();
        self.trackers.retain(|k, _| keep.contains(k));
        self.set.update(backends);
    }

    pub fn mark(&self, url: &str, healthy: bool) -> bool {
        self.set.mark(url, healthy)
    }

    pub fn healthy_count(&self) -> usize {
        self.set.healthy_count()
    }

    pub fn backends(&self) -> Vec<Backend> {
        self.set.all()
    }

    #[cfg(test)]
    fn ewma_of(&self, url: &str) -> Option<f64> {
        self.trackers.get(url).map(|t| t.ewma())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;

    #[test]
    fn test_cold_start_preference() {
        let lb = ResponseTimeBalancer::new(backends(&["http://a:80", "http://b:80"]));
        lb.record("http://a:80", 5.0);
        // b has no samples yet, so it must be explored.
        assert_eq!(lb.next().unwrap().url(), "http://b:80");
    }

    #[test]
    fn test_prefers_fastest_when_warm() {
        let lb = ResponseTimeBalancer::new(backends(&["http://a:80", "http://b:80"]));
        lb.record("http://a:80", 100.0);
        lb.record("http://b:80", 5.0);
        for _ in 0..5 {
            assert_eq!(lb.next().unwrap().url(), "http://b:80");
        }
    }

    #[test]
    fn test_ewma_decay() {
        let lb = ResponseTimeBalancer::new(backends(&["http://a:80"]));
        lb.record("http://a:80", 100.0);
        lb.record("http://a:80", 0.0);
        // alpha = 0.5: 0.5*0 + 0.5*100 = 50
        assert!((lb.ewma_of("http://a:80").unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_trackers_mirror_backend_set() {
        let lb = ResponseTimeBalancer::new(backends(&["http://a:80", "http://b:80"]));
        lb.record("http://a:80", 10.0);
        lb.update_backends(backends(&["http://b:80", "http://c:80"]));
        assert!(lb.ewma_of("http://a:80").is_none());
        assert!(lb.ewma_of("http://c:80").is_some());
    }

    #[test]
    fn test_unhealthy_warm_backend_not_selected() {
        let lb = ResponseTimeBalancer::new(backends(&["http://a:80", "http://b:80"]));
        lb.record("http://a:80", 1.0);
        lb.record("http://b:80", 50.0);
        lb.mark("http://a:80", false);
        assert_eq!(lb.next().unwrap().url(), "http://b:80");
    }

    #[test]
    fn test_empty() {
        let lb = ResponseTimeBalancer::new(Vec::new());
        assert!(lb.next().is_none());
    }
}
