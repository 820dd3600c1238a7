use super::{Backend, BackendSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Round-robin over the healthy snapshot via an atomic counter.
pub struct RoundRobinBalancer {
    set: BackendSet,
    counter: AtomicU64,
}

impl RoundRobinBalancer {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            set: BackendSet::new(backends),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> Option<Backend> {
        let snap = self.set.healthy();
        if snap.backends.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(snap.backends[(count % snap.backends.len() as u64) as usize].clone())
    }

    pub fn update_backends(&self, backends: Vec<Backend>) {
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
}
