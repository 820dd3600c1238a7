pub mod affinity;
pub mod ketama;
pub mod least_conn;
pub mod response_time;
pub mod round_robin;
pub mod split;
pub mod sticky;
pub mod tenant;
pub mod versioned;
pub mod weighted;

use crate::config::{BackendConfig, GroupConfig, RouteConfig};
use affinity::SessionAffinityBalancer;
use arc_swap::ArcSwap;
use ketama::KetamaBalancer;
use least_conn::LeastConnBalancer;
use response_time::ResponseTimeBalancer;
use round_robin::RoundRobinBalancer;
use split::TrafficSplitBalancer;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tenant::TenantBalancer;
use versioned::VersionedBalancer;
use weighted::WeightedRoundRobinBalancer;

/// An upstream endpoint. Cheap to clone — health flag and active counter are
/// shared via `Arc` so every clone observes the same state.
#[derive(Debug, Clone)]
pub struct Backend {
    url: Arc<str>,
    parsed: http::Uri,
    weight: u32,
    healthy: Arc<AtomicBool>,
    active_requests: Arc<AtomicI64>,
}

impl Backend {
    pub fn new(url: &str, weight: u32) -> Result<Self, http::uri::InvalidUri> {
        let parsed: http::Uri = url.parse()?;
        Ok(Self {
            url: Arc::from(url),
            parsed,
            weight: weight.max(1),
            healthy: Arc::new(AtomicBool::new(true)),
            active_requests: Arc::new(AtomicI64::new(0)),
        })
    }

    pub fn from_config(cfg: &BackendConfig) -> Result<Self, http::uri::InvalidUri> {
        Self::new(&cfg.url, cfg.weight)
    }

    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Pre-parsed URL for the hot path. Zero allocation.
    #[inline]
    pub fn uri(&self) -> &http::Uri {
        &self.parsed
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn inc_active(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::Relaxed)
    }
}

/// RAII guard over a selected backend's in-flight counter. Decrements on
/// every exit path, including errors.
pub struct ActiveGuard {
    backend: Backend,
}

impl ActiveGuard {
    pub fn new(backend: Backend) -> Self {
        backend.inc_active();
        Self { backend }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.backend.dec_active();
    }
}

/// The request facts a request-aware balancer may consult.
pub struct RequestKey<'a> {
    pub headers: &'a http::HeaderMap,
    pub path: &'a str,
    pub client_ip: IpAddr,
    pub api_version: Option<&'a str>,
    pub tenant: Option<&'a str>,
    /// A traffic group already pinned by an earlier rule, if any.
    pub assigned_group: Option<&'a str>,
}

/// Outcome of a request-aware selection.
pub struct Selection {
    pub backend: Backend,
    /// Traffic-group name, empty when no split decision was made.
    pub group: String,
    /// Full Set-Cookie value to attach to the response, if a sticky or
    /// affinity decision needs pinning.
    pub set_cookie: Option<String>,
}

impl Selection {
    pub(crate) fn bare(backend: Backend) -> Self {
        Self {
            backend,
            group: String::new(),
            set_cookie: None,
        }
    }
}

/// Read a named cookie value out of the request's `Cookie` headers.
pub(crate) fn cookie_value(headers: &http::HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(http::header::COOKIE) {
        let raw = value.to_str().ok()?;
        for pair in raw.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(name) {
                return parts.next().map(|v| v.to_string());
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Healthy-set publication
// ---------------------------------------------------------------------------

/// Snapshot of the currently-healthy backends, published by pointer swap so
/// `next()` never takes a lock. The generation bumps on every identity
/// change, letting per-balancer derived state (WRR interleave, ketama ring)
/// know when to recompute.
pub(crate) struct HealthySnapshot {
    pub backends: Vec<Backend>,
    pub generation: u64,
}

/// Shared backend bookkeeping for the leaf balancers: the full set, the
/// healthy snapshot, and the health-preserving update rules.
pub(crate) struct BackendSet {
    all: ArcSwap<Vec<Backend>>,
    healthy: ArcSwap<HealthySnapshot>,
    generation: AtomicU64,
    /// Serializes mutations; reads stay lock-free.
    update_mu: Mutex<()>,
}

impl BackendSet {
    pub fn new(backends: Vec<Backend>) -> Self {
        let set = Self {
            all: ArcSwap::from_pointee(Vec::new()),
            healthy: ArcSwap::from_pointee(HealthySnapshot {
                backends: Vec::new(),
                generation: 0,
            }),
            generation: AtomicU64::new(0),
            update_mu: Mutex::new(()),
        };
        set.update(backends);
        set
    }

    /// Replace the backend set. Backends whose URL is already known keep
    /// their health flag and in-flight counter; new URLs start healthy.
    pub fn update(&self, backends: Vec<Backend>) {
        let _guard = self.update_mu.lock().unwrap();
        let old = self.all.load();
        let merged: Vec<Backend> = backends
            .into_iter()
            .map(|mut b| {
                if let Some(existing) = old.iter().find(|e| e.url() == b.url()) {
                    b.healthy = existing.healthy.clone();
                    b.active_requests = existing.active_requests.clone();
                }
                b
            })
            .collect();
        self.all.store(Arc::new(merged));
        self.republish();
    }

    /// Flip one backend's health flag. Returns false when the URL is unknown.
    pub fn mark(&self, url: &str, healthy: bool) -> bool {
        let _guard = self.update_mu.lock().unwrap();
        let all = self.all.load();
        let Some(backend) = all.iter().find(|b| b.url() == url) else {
            return false;
        };
        backend.set_healthy(healthy);
        self.republish();
        true
    }

    fn republish(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let healthy: Vec<Backend> = self
            .all
            .load()
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect();
        self.healthy.store(Arc::new(HealthySnapshot {
            backends: healthy,
            generation,
        }));
    }

    #[inline]
    pub fn healthy(&self) -> Arc<HealthySnapshot> {
        self.healthy.load_full()
    }

    pub fn healthy_count(&self) -> usize {
        self.healthy.load().backends.len()
    }

    pub fn all(&self) -> Vec<Backend> {
        self.all.load().as_ref().clone()
    }
}

// ---------------------------------------------------------------------------
// The balancer family
// ---------------------------------------------------------------------------

/// Enum-based balancer — no trait objects, no dynamic dispatch.
pub enum Balancer {
    RoundRobin(RoundRobinBalancer),
    WeightedRoundRobin(WeightedRoundRobinBalancer),
    LeastConn(LeastConnBalancer),
    ResponseTime(ResponseTimeBalancer),
    Ketama(KetamaBalancer),
    Split(TrafficSplitBalancer),
    Affinity(SessionAffinityBalancer),
    Tenant(TenantBalancer),
    Versioned(VersionedBalancer),
}

impl Balancer {
    /// Assemble the balancer a route config describes, wrappers included.
    pub fn from_route(route: &RouteConfig) -> anyhow::Result<Arc<Self>> {
        let cfg = &route.balancer;
        let backends = build_backends(&route.backends)?;

        let core = match cfg.algorithm.as_str() {
            "weighted" => Balancer::Split(TrafficSplitBalancer::from_groups(
                &route.groups,
                cfg.sticky.as_ref(),
            )?),
            "weighted_round_robin" => {
                Balancer::WeightedRoundRobin(WeightedRoundRobinBalancer::new(backends))
            }
            "least_conn" => Balancer::LeastConn(LeastConnBalancer::new(backends)),
            "least_response_time" => Balancer::ResponseTime(ResponseTimeBalancer::new(backends)),
            "consistent_hash" => Balancer::Ketama(KetamaBalancer::new(
                backends,
                cfg.consistent_hash.clone().unwrap_or_default(),
            )),
            "versioned" => {
                let mut versions = HashMap::new();
                for v in &cfg.versions {
                    versions.insert(v.version.clone(), build_backends(&v.backends)?);
                }
                Balancer::Versioned(VersionedBalancer::new(
                    versions,
                    cfg.default_version.clone(),
                    backends,
                ))
            }
            "tenant" => {
                let mut tenants = HashMap::new();
                for t in &cfg.tenants {
                    tenants.insert(
                        t.tenant.clone(),
                        Arc::new(Balancer::RoundRobin(RoundRobinBalancer::new(build_backends(
                            &t.backends,
                        )?))),
                    );
                }
                let default = Arc::new(Balancer::RoundRobin(RoundRobinBalancer::new(backends)));
                Balancer::Tenant(TenantBalancer::new(tenants, default))
            }
            // "round_robin" and anything the validator let through.
            _ => {
                if route.groups.is_empty() {
                    Balancer::RoundRobin(RoundRobinBalancer::new(backends))
                } else {
                    Balancer::Split(TrafficSplitBalancer::from_groups(
                        &route.groups,
                        cfg.sticky.as_ref(),
                    )?)
                }
            }
        };

        let balancer = match cfg.session_affinity {
            Some(ref affinity) if affinity.enabled => Arc::new(Balancer::Affinity(
                SessionAffinityBalancer::new(Arc::new(core), affinity.clone()),
            )),
            _ => Arc::new(core),
        };
        Ok(balancer)
    }

    /// Pick one healthy backend without request context.
    pub fn next(&self) -> Option<Backend> {
        match self {
            Balancer::RoundRobin(b) => b.next(),
            Balancer::WeightedRoundRobin(b) => b.next(),
            Balancer::LeastConn(b) => b.next(),
            Balancer::ResponseTime(b) => b.next(),
            Balancer::Ketama(b) => b.next(),
            Balancer::Split(b) => b.next(),
            Balancer::Affinity(b) => b.inner().next(),
            Balancer::Tenant(b) => b.default().next(),
            Balancer::Versioned(b) => b.next(),
        }
    }

    /// Request-aware selection. Non-aware variants delegate to `next()`.
    pub fn next_for_request(&self, key: &RequestKey<'_>) -> Option<Selection> {
        match self {
            Balancer::Ketama(b) => b.next_for_request(key),
            Balancer::Split(b) => b.next_for_request(key),
            Balancer::Affinity(b) => b.next_for_request(key),
            Balancer::Tenant(b) => b.next_for_request(key),
            Balancer::Versioned(b) => b.next_for_request(key),
            _ => self.next().map(Selection::bare),
        }
    }

    /// Whether `next_for_request` can use more than `next()` would.
    pub fn is_request_aware(&self) -> bool {
        matches!(
            self,
            Balancer::Ketama(_)
                | Balancer::Split(_)
                | Balancer::Affinity(_)
                | Balancer::Tenant(_)
                | Balancer::Versioned(_)
        )
    }

    /// Pick from a specific traffic group (a rule already made the split
    /// decision). Only meaningful for the weighted-split balancer.
    pub fn next_in_group(&self, group: &str) -> Option<Backend> {
        match self {
            Balancer::Split(b) => b.next_in_group(group),
            Balancer::Affinity(b) => b.inner().next_in_group(group),
            _ => None,
        }
    }

    pub fn update_backends(&self, backends: Vec<Backend>) {
        match self {
            Balancer::RoundRobin(b) => b.update_backends(backends),
            Balancer::WeightedRoundRobin(b) => b.update_backends(backends),
            Balancer::LeastConn(b) => b.update_backends(backends),
            Balancer::ResponseTime(b) => b.update_backends(backends),
            Balancer::Ketama(b) => b.update_backends(backends),
            Balancer::Split(_) => {}
            Balancer::Affinity(b) => b.inner().update_backends(backends),
            Balancer::Tenant(b) => b.default().update_backends(backends),
            Balancer::Versioned(b) => b.update_default(backends),
        }
    }

    pub fn mark_healthy(&self, url: &str) {
        self.mark(url, true);
    }

    pub fn mark_unhealthy(&self, url: &str) {
        self.mark(url, false);
    }

    fn mark(&self, url: &str, healthy: bool) {
        match self {
            Balancer::RoundRobin(b) => {
                b.mark(url, healthy);
            }
            Balancer::WeightedRoundRobin(b) => {
                b.mark(url, healthy);
            }
            Balancer::LeastConn(b) => {
                b.mark(url, healthy);
            }
            Balancer::ResponseTime(b) => {
                b.mark(url, healthy);
            }
            Balancer::Ketama(b) => {
                b.mark(url, healthy);
            }
            Balancer::Split(b) => b.mark(url, healthy),
            Balancer::Affinity(b) => b.inner().mark(url, healthy),
            Balancer::Tenant(b) => b.mark(url, healthy),
            Balancer::Versioned(b) => b.mark(url, healthy),
        }
    }

    pub fn healthy_count(&self) -> usize {
        match self {
            Balancer::RoundRobin(b) => b.healthy_count(),
            Balancer::WeightedRoundRobin(b) => b.healthy_count(),
            Balancer::LeastConn(b) => b.healthy_count(),
            Balancer::ResponseTime(b) => b.healthy_count(),
            Balancer::Ketama(b) => b.healthy_count(),
            Balancer::Split(b) => b.healthy_count(),
            Balancer::Affinity(b) => b.inner().healthy_count(),
            Balancer::Tenant(b) => b.healthy_count(),
            Balancer::Versioned(b) => b.healthy_count(),
        }
    }

    pub fn backends(&self) -> Vec<Backend> {
        match self {
            Balancer::RoundRobin(b) => b.backends(),
            Balancer::WeightedRoundRobin(b) => b.backends(),
            Balancer::LeastConn(b) => b.backends(),
            Balancer::ResponseTime(b) => b.backends(),
            Balancer::Ketama(b) => b.backends(),
            Balancer::Split(b) => b.backends(),
            Balancer::Affinity(b) => b.inner().backends(),
            Balancer::Tenant(b) => b.backends(),
            Balancer::Versioned(b) => b.backends(),
        }
    }

    /// Feed a measured response latency back to latency-aware variants.
    pub fn record_latency(&self, url: &str, latency_ms: f64) {
        match self {
            Balancer::ResponseTime(b) => b.record(url, latency_ms),
            Balancer::Split(b) => b.record_latency(url, latency_ms),
            Balancer::Affinity(b) => b.inner().record_latency(url, latency_ms),
            Balancer::Tenant(b) => b.record_latency(url, latency_ms),
            _ => {}
        }
    }

    pub fn records_latency(&self) -> bool {
        matches!(
            self,
            Balancer::ResponseTime(_) | Balancer::Split(_) | Balancer::Affinity(_) | Balancer::Tenant(_)
        )
    }

    // ---- Traffic-group weight plumbing (progressive delivery) ----

    pub fn as_split(&self) -> Option<&TrafficSplitBalancer> {
        match self {
            Balancer::Split(b) => Some(b),
            Balancer::Affinity(b) => b.inner().as_split(),
            _ => None,
        }
    }

    pub fn group_weights(&self) -> Option<Vec<(String, u32)>> {
        self.as_split().map(|s| s.weights())
    }

    pub fn set_group_weight(&self, group: &str, weight: u32) -> bool {
        self.as_split()
            .map(|s| s.set_weight(group, weight))
            .unwrap_or(false)
    }
}

pub(crate) fn build_backends(configs: &[BackendConfig]) -> anyhow::Result<Vec<Backend>> {
    configs
        .iter()
        .map(|c| {
            Backend::from_config(c).map_err(|e| anyhow::anyhow!("bad backend url {}: {}", c.url, e))
        })
        .collect()
}

pub(crate) fn build_group(cfg: &GroupConfig) -> anyhow::Result<Vec<Backend>> {
    build_backends(&cfg.backends)
}

/// Convenience constructor used by tests and the L4 proxies.
pub fn round_robin(backends: Vec<Backend>) -> Arc<Balancer> {
    Arc::new(Balancer::RoundRobin(RoundRobinBalancer::new(backends)))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn backend(url: &str) -> Backend {
        Backend::new(url, 1).unwrap()
    }

    pub fn weighted_backend(url: &str, weight: u32) -> Backend {
        Backend::new(url, weight).unwrap()
    }

    pub fn backends(urls: &[&str]) -> Vec<Backend> {
        urls.iter().map(|u| backend(u)).collect()
    }

    pub fn empty_headers() -> http::HeaderMap {
        http::HeaderMap::new()
    }

    pub fn key<'a>(headers: &'a http::HeaderMap, path: &'a str) -> RequestKey<'a> {
        RequestKey {
            headers,
            path,
            client_ip: "203.0.113.7".parse().unwrap(),
            api_version: None,
            tenant: None,
            assigned_group: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn test_backend_weight_floor() {
        let b = Backend::new("http://a:80", 0).unwrap();
        assert_eq!(b.weight(), 1);
    }

    #[test]
    fn test_active_guard_decrements_on_drop() {
        let b = backend("http://a:80");
        {
            let _g = ActiveGuard::new(b.clone());
            assert_eq!(b.active_requests(), 1);
        }
        assert_eq!(b.active_requests(), 0);
    }

    #[test]
    fn test_backend_set_health_preserved_across_update() {
        let set = BackendSet::new(backends(&["http://a:80", "http://b:80"]));
        set.mark("http://a:80", false);
        assert_eq!(set.healthy_count(), 1);

        // Re-push the same URLs plus a new one: a stays unhealthy, c starts healthy.
        set.update(backends(&["http://a:80", "http://b:80", "http://c:80"]));
        assert_eq!(set.healthy_count(), 2);
        let a = set.all().into_iter().find(|b| b.url() == "http://a:80").unwrap();
        assert!(!a.is_healthy());
    }

    #[test]
    fn test_backend_set_generation_bumps_on_mark() {
        let set = BackendSet::new(backends(&["http://a:80"]));
        let g1 = set.healthy().generation;
        set.mark("http://a:80", false);
        let g2 = set.healthy().generation;
        assert!(g2 > g1);
    }

    #[test]
    fn test_cookie_value() {
        let mut headers = empty_headers();
        headers.insert(
            http::header::COOKIE,
            "foo=bar; janus_group=canary; other=1".parse().unwrap(),
        );
        assert_eq!(cookie_value(&headers, "janus_group").as_deref(), Some("canary"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
