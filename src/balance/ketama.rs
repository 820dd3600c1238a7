use super::{cookie_value, Backend, BackendSet, RequestKey, Selection};
use crate::config::ConsistentHashConfig;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Consistent-hash (ketama) balancer. The ring holds `replicas * weight`
/// virtual nodes per healthy backend and is rebuilt on every health or
/// backend-set change, published by pointer swap.
pub struct KetamaBalancer {
    set: BackendSet,
    ring: ArcSwap<Vec<RingEntry>>,
    key: HashKey,
    replicas: u32,
    /// Fallback cursor for key-less (`next()`) selection.
    counter: AtomicU64,
}

struct RingEntry {
    hash: u32,
    backend: Backend,
}

/// Where the hash key comes from, per configuration.
enum HashKey {
    Header(String),
    Cookie(String),
    Path,
    Ip,
}

impl HashKey {
    fn parse(key: &str) -> Self {
        if let Some(name) = key.strip_prefix("header:") {
            HashKey::Header(name.to_string())
        } else if let Some(name) = key.strip_prefix("cookie:") {
            HashKey::Cookie(name.to_string())
        } else if key == "path" {
            HashKey::Path
        } else {
            HashKey::Ip
        }
    }

    /// Extract the key string. "ip" honours X-Forwarded-For before falling
    /// back to the peer address host part.
    fn extract(&self, key: &RequestKey<'_>) -> String {
        match self {
            HashKey::Header(name) => key
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string(),
            HashKey::Cookie(name) => cookie_value(key.headers, name).unwrap_or_default(),
            HashKey::Path => key.path.to_string(),
            HashKey::Ip => key
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').next().unwrap_or("").trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| key.client_ip.to_string()),
        }
    }
}

/// First four bytes of the MD5 digest, little-endian.
fn hash32(data: &[u8]) -> u32 {
    let digest = md5::compute(data);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

impl KetamaBalancer {
    pub fn new(backends: Vec<Backend>, config: ConsistentHashConfig) -> Self {
        let lb = Self {
            set: BackendSet::new(backends),
            ring: ArcSwap::from_pointee(Vec::new()),
            key: HashKey::parse(&config.key),
            replicas: config.replicas.max(1),
            counter: AtomicU64::new(0),
        };
        lb.rebuild();
        lb
    }

    /// Rebuild the sorted ring from the healthy snapshot.
    fn rebuild(&self) {
        let snap = self.set.healthy();
        let mut ring: Vec<RingEntry> = Vec::new();
        for backend in &snap.backends {
            let vnodes = self.replicas * backend.weight();
            for i in 0..vnodes {
                let mut data = Vec::with_capacity(backend.url().len() + 4);
                data.extend_from_slice(backend.url().as_bytes());
                data.extend_from_slice(&i.to_le_bytes());
                ring.push(RingEntry {
                    hash: hash32(&data),
                    backend: backend.clone(),
                });
            }
        }
        ring.sort_by_key(|e| e.hash);
        self.ring.store(Arc::new(ring));
    }

    fn lookup(&self, h: u32) -> Option<Backend> {
        let ring = self.ring.load();
        if ring.is_empty() {
            return None;
        }
        let idx = ring.partition_point(|e| e.hash < h);
        let entry = if idx == ring.len() { &ring[0] } else { &ring[idx] };
        Some(entry.backend.clone())
    }

    pub fn next_for_request(&self, key: &RequestKey<'_>) -> Option<Selection> {
        let raw = self.key.extract(key);
        self.lookup(hash32(raw.as_bytes())).map(Selection::bare)
    }

    /// Key-less selection for callers without request context.
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
        self.rebuild();
    }

    pub fn mark(&self, url: &str, healthy: bool) -> bool {
        let found = self.set.mark(url, healthy);
        if found {
            self.rebuild();
        }
        found
    }

    pub fn healthy_count(&self) -> usize {
        self.set.healthy_count()
    }

    pub fn backends(&self) -> Vec<Backend> {
        self.set.all()
    }
}
