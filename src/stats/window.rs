use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const NUM_BUCKETS: usize = 10;

/// Bucketed ring of per-backend request/error/latency counters.
///
/// The hot path (`record`) touches only atomics plus a short per-bucket
/// latency lock. Rotation is serialized by a mutex entered at most once per
/// bucket duration; crossed buckets are zeroed so stale data never leaks
/// into a snapshot.
pub struct SlidingWindow {
    buckets: Vec<Bucket>,
    bucket_duration: Duration,
    start: Instant,
    /// Nanoseconds since `start` of the last rotation, read lock-free.
    last_advance_ns: AtomicU64,
    cursor: AtomicUsize,
    rotate_mu: Mutex<()>,
}

struct Bucket {
    requests: AtomicU64,
    errors: AtomicU64,
    latencies: Mutex<Vec<f64>>,
}

impl Bucket {
    fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latencies: Mutex::new(Vec::new()),
        }
    }

    fn clear(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.latencies.lock().unwrap().clear();
    }
}

/// Point-in-time aggregate over the whole window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    /// Milliseconds.
    pub p50: f64,
    /// Milliseconds.
    pub p99: f64,
}

impl SlidingWindow {
    pub fn new(window: Duration) -> Self {
        let bucket_duration = window / NUM_BUCKETS as u32;
        Self {
            buckets: (0..NUM_BUCKETS).map(|_| Bucket::new()).collect(),
            bucket_duration: bucket_duration.max(Duration::from_millis(1)),
            start: Instant::now(),
            last_advance_ns: AtomicU64::new(0),
            cursor: AtomicUsize::new(0),
            rotate_mu: Mutex::new(()),
        }
    }

    /// Record one completed request. Status >= 500 counts as an error
    /// (499, a client disconnect, does not).
    pub fn record(&self, status: u16, latency_ms: f64) {
        self.maybe_rotate();
        let bucket = &self.buckets[self.cursor.load(Ordering::Acquire)];
        bucket.requests.fetch_add(1, Ordering::Relaxed);
        if status >= 500 {
            bucket.errors.fetch_add(1, Ordering::Relaxed);
        }
        bucket.latencies.lock().unwrap().push(latency_ms);
    }

    /// Advance the cursor by `floor(elapsed / bucket_duration)` steps,
    /// zeroing every crossed bucket.
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
            self.buckets[(cursor + i) % NUM_BUCKETS].clear();
        }
        self.cursor
            .store((cursor + steps) % NUM_BUCKETS, Ordering::Release);
        // Keep rotation aligned to bucket boundaries.
        self.last_advance_ns
            .store(last + steps as u64 * bucket_ns, Ordering::Release);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.maybe_rotate();

        let mut requests = 0u64;
        let mut errors = 0u64;
        let mut latencies: Vec<f64> = Vec::new();
        for bucket in &self.buckets {
            requests += bucket.requests.load(Ordering::Relaxed);
            errors += bucket.errors.load(Ordering::Relaxed);
            latencies.extend_from_slice(&bucket.latencies.lock().unwrap());
        }

        let error_rate = if requests > 0 {
            errors as f64 / requests as f64
        } else {
            0.0
        };

        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        StatsSnapshot {
            requests,
            errors,
            error_rate,
            p50: percentile(&latencies, 0.50),
            p99: percentile(&latencies, 0.99),
        }
    }

    /// Zero every bucket. Used when a controller wants a fresh
    /// evaluation period.
    pub fn reset(&self) {
        let _guard = self.rotate_mu.lock().unwrap();
        for bucket in &self.buckets {
            bucket.clear();
        }
        self.last_advance_ns
            .store(self.start.elapsed().as_nanos() as u64, Ordering::Release);
    }
}

/// Ceiling-rank percentile: `sorted[ceil(p * n) - 1]`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}
