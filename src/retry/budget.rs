use crate::config::BudgetConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const NUM_BUCKETS: usize = 10;

/// Sliding-window guard on the retry/request ratio. Records are lock-free
/// (atomics in the current bucket); rotation is serialized by a mutex taken
/// at most once per bucket duration.
pub struct RetryBudget {
    buckets: Vec<Bucket>,
    bucket_duration: Duration,
    start: Instant,
    last_advance_ns: AtomicU64,
    cursor: AtomicUsize,
    rotate_mu: Mutex<()>,
    ratio: f64,
    min_retries_per_sec: f64,
    window_secs: f64,
}

struct Bucket {
    requests: AtomicU64,
    retries: AtomicU64,
}

#[derive(Serialize)]
pub struct BudgetSnapshot {
    pub ratio: f64,
    pub min_retries_per_sec: f64,
    /// Window length in seconds.
    pub window: f64,
    pub total_requests: u64,
    pub total_retries: u64,
    /// Fraction of the allowed retry ratio currently consumed.
    pub utilization: f64,
}

impl RetryBudget {
    pub fn new(config: &BudgetConfig) -> Self {
        let window = Duration::from_secs(config.window.max(1));
        Self {
            buckets: (0..NUM_BUCKETS)
                .map(|_| Bucket {
                    requests: AtomicU64::new(0),
                    retries: AtomicU64::new(0),
                })
                .collect(),
            bucket_duration: window / NUM_BUCKETS as u32,
            start: Instant::now(),
            last_advance_ns: AtomicU64::new(0),
            cursor: AtomicUsize::new(0),
            rotate_mu: Mutex::new(()),
            ratio: config.ratio,
            min_retries_per_sec: config.min_retries,
            window_secs: window.as_secs_f64(),
        }
    }

    pub fn record_request(&self) {
        self.maybe_rotate();
        self.buckets[self.cursor.load(Ordering::Acquire)]
            .requests
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.maybe_rotate();
        self.buckets[self.cursor.load(Ordering::Acquire)]
            .retries
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Whether one more retry fits the budget right now.
    pub fn allow_retry(&self) -> bool {
        self.maybe_rotate();
        let (requests, retries) = self.totals();

        // Floor guarantee: a trickle of retries is always allowed.
        if (retries as f64) / self.window_secs < self.min_retries_per_sec {
            return true;
        }
        if requests == 0 {
            return true;
        }
        (retries as f64) / (requests as f64) < self.ratio
    }

    fn totals(&self) -> (u64, u64) {
        let mut requests = 0;
        let mut retries = 0;
        for bucket in &self.buckets {
            requests += bucket.requests.load(Ordering::Relaxed);
            retries += bucket.retries.load(Ordering::Relaxed);
        }
        (requests, retries)
    }

    fn maybe_rotate(&self) {
        let now_ns = self.start.elapsed().as_nanos() as u64;
        let bucket_ns = self.bucket_duration.as_nanos() as u64;
        if now_ns.saturating_sub(self.last_advance_ns.load(Ordering::Acquire)) < bucket_ns {
            return;
        }

        let _guard = self.rotate_mu.lock().unwrap();
        let last = self.last_advance_ns.load(Ordering::Acquire);
        let elapsed = now_ns.saturating_sub(last);
        if elapsed < bucket_ns {
            return;
        }

        let steps = (elapsed / bucket_ns) as usize;
        let cursor = self.cursor.load(Ordering::Acquire);
        for i in 1..=steps.min(NUM_BUCKETS) {
            let bucket = &self.buckets[(cursor + i) % NUM_BUCKETS];
            bucket.requests.store(0, Ordering::Relaxed);
            bucket.retries.store(0, Ordering::Relaxed);
        }
        self.cursor
            .store((cursor + steps) % NUM_BUCKETS, Ordering::Release);
        self.last_advance_ns
            .store(last + steps as u64 * bucket_ns, Ordering::Release);
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let (requests, retries) = self.totals();
        let utilization = if requests > 0 && self.ratio > 0.0 {
            (retries as f64 / requests as f64) / self.ratio
        } else {
            0.0
        };
        BudgetSnapshot {
            ratio: self.ratio,
            min_retries_per_sec: self.min_retries_per_sec,
            window: self.window_secs,
            total_requests: requests,
            total_retries: retries,
            utilization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(ratio: f64, min_retries: f64, window: u64) -> RetryBudget {
        RetryBudget::new(&BudgetConfig {
            ratio,
            min_retries,
            window,
        })
    }

    #[test]
    fn test_ratio_cap() {
        let b = budget(0.2, 0.0, 10);
        for _ in 0..10 {
            b.record_request();
        }
        b.record_retry();
        // 1/10 < 0.2: still allowed.
        assert!(b.allow_retry());
        b.record_retry();
        // 2/10 == 0.2: at the cap, denied.
        assert!(!b.allow_retry());
    }

    #[test]
    fn test_min_retries_floor() {
        let b = budget(0.0, 100.0, 10);
        for _ in 0..10 {
            b.record_request();
            b.record_retry();
        }
        // 10 retries over a 10s window = 1/s, well under the 100/s floor.
        assert!(b.allow_retry());
    }

    #[test]
    fn test_no_requests_allows() {
        let b = budget(0.2, 0.0, 10);
        assert!(b.allow_retry());
    }

    #[test]
    fn test_window_rollover_restores_budget() {
        let b = RetryBudget::new(&BudgetConfig {
            ratio: 0.2,
            min_retries: 0.0,
            window: 1,
        });
        for _ in 0..10 {
            b.record_request();
        }
        b.record_retry();
        b.record_retry();
        assert!(!b.allow_retry());

        // Let every bucket roll over.
        std::thread::sleep(Duration::from_millis(1200));
        assert!(b.allow_retry());
        assert_eq!(b.snapshot().total_requests, 0);
    }

    #[test]
    fn test_snapshot_utilization() {
        let b = budget(0.2, 0.0, 10);
        for _ in 0..10 {
            b.record_request();
        }
        b.record_retry();
        let snap = b.snapshot();
        assert_eq!(snap.total_requests, 10);
        assert_eq!(snap.total_retries, 1);
        assert!((snap.utilization - 0.5).abs() < 1e-9);
    }
}
