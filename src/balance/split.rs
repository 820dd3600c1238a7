use super::round_robin::RoundRobinBalancer;
use super::sticky::StickyPolicy;
use super::{build_group, Backend, Balancer, RequestKey, Selection};
use crate::config::{GroupConfig, StickyConfig};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A named subset of backends within a weighted split. The weight is atomic
/// so progressive-delivery controllers can shift traffic without touching
/// the group list.
pub struct TrafficGroup {
    name: String,
    weight: AtomicU32,
    original_weight: u32,
    inner: Arc<Balancer>,
    /// Lower-cased header name → expected value (case-insensitive compare).
    match_headers: HashMap<String, String>,
}

impl TrafficGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Acquire)
    }

    pub fn original_weight(&self) -> u32 {
        self.original_weight
    }

    pub fn inner(&self) -> &Arc<Balancer> {
        &self.inner
    }

    fn matches_headers(&self, headers: &http::HeaderMap) -> bool {
        if self.match_headers.is_empty() {
            return false;
        }
        self.match_headers.iter().all(|(name, expected)| {
            headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case(expected))
                .unwrap_or(false)
        })
    }
}

/// Weighted traffic split across named groups. Resolution order per request:
/// sticky policy, header-match groups, weighted random.
pub struct TrafficSplitBalancer {
    groups: Vec<TrafficGroup>,
    sticky: Option<StickyPolicy>,
}

impl TrafficSplitBalancer {
    pub fn from_groups(
        configs: &[GroupConfig],
        sticky: Option<&StickyConfig>,
    ) -> anyhow::Result<Self> {
        let mut groups = Vec::with_capacity(configs.len());
        for cfg in configs {
            let backends = build_group(cfg)?;
            groups.push(TrafficGroup {
                name: cfg.name.clone(),
                weight: AtomicU32::new(cfg.weight),
                original_weight: cfg.weight,
                inner: Arc::new(Balancer::RoundRobin(RoundRobinBalancer::new(backends))),
                match_headers: cfg
                    .match_headers
                    .iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                    .collect(),
            });
        }
        Ok(Self {
            groups,
            sticky: sticky.map(StickyPolicy::new),
        })
    }

    pub fn groups(&self) -> &[TrafficGroup] {
        &self.groups
    }

    pub fn weights(&self) -> Vec<(String, u32)> {
        self.groups
            .iter()
            .map(|g| (g.name.clone(), g.weight()))
            .collect()
    }

    pub fn set_weight(&self, group: &str, weight: u32) -> bool {
        match self.groups.iter().find(|g| g.name == group) {
            Some(g) => {
                g.weight.store(weight, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Replace all weights at once (controller promote/rollback paths).
    pub fn set_weights(&self, weights: &HashMap<String, u32>) {
        for g in &self.groups {
            if let Some(w) = weights.get(&g.name) {
                g.weight.store(*w, Ordering::Release);
            }
        }
    }

    pub fn next_in_group(&self, group: &str) -> Option<Backend> {
        self.groups
            .iter()
            .find(|g| g.name == group)
            .and_then(|g| g.inner.next())
    }

    pub fn update_group_backends(&self, group: &str, backends: Vec<Backend>) -> bool {
        match self.groups.iter().find(|g| g.name == group) {
            Some(g) => {
                g.inner.update_backends(backends);
                true
            }
            None => false,
        }
    }

    pub fn next_for_request(&self, key: &RequestKey<'_>) -> Option<Selection> {
        // (a) sticky policy
        if let Some(ref sticky) = self.sticky {
            if let Some(group) = sticky.resolve(key, &self.weights()) {
                if let Some(backend) = self.next_in_group(&group) {
                    return Some(Selection {
                        backend,
                        group,
                        set_cookie: None,
                    });
                }
            }
        }

        // (b) header-match groups
        for g in &self.groups {
            if g.matches_headers(key.headers) {
                if let Some(backend) = g.inner.next() {
                    return Some(Selection {
                        backend,
                        group: g.name.clone(),
                        set_cookie: None,
                    });
                }
            }
        }

        // (c) weighted random
        let (backend, group) = self.weighted_pick()?;
        let set_cookie = self
            .sticky
            .as_ref()
            .filter(|s| s.issues_cookie())
            .map(|s| s.issue(&group));
        Some(Selection {
            backend,
            group,
            set_cookie,
        })
    }

    /// Weighted random draw without request context.
    pub fn next(&self) -> Option<Backend> {
        self.weighted_pick().map(|(b, _)| b)
    }

    fn weighted_pick(&self) -> Option<(Backend, String)> {
        let total: u64 = self.groups.iter().map(|g| g.weight() as u64).sum();
        if total == 0 {
            return None;
        }
        let mut point = rand::thread_rng().gen_range(0..total);
        for g in &self.groups {
            let w = g.weight() as u64;
            if point < w {
                return g.inner.next().map(|b| (b, g.name.clone()));
            }
            point -= w;
        }
        None
    }

    pub fn mark(&self, url: &str, healthy: bool) {
        for g in &self.groups {
            if healthy {
                g.inner.mark_healthy(url);
            } else {
                g.inner.mark_unhealthy(url);
            }
        }
    }

    pub fn healthy_count(&self) -> usize {
        self.groups.iter().map(|g| g.inner.healthy_count()).sum()
    }

    pub fn backends(&self) -> Vec<Backend> {
        self.groups.iter().flat_map(|g| g.inner.backends()).collect()
    }

    pub fn record_latency(&self, url: &str, latency_ms: f64) {
        for g in &self.groups {
            g.inner.record_latency(url, latency_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;

    fn group_cfg(name: &str, weight: u32, urls: &[&str]) -> GroupConfig {
        GroupConfig {
            name: name.to_string(),
            weight,
            backends: urls
                .iter()
                .map(|u| crate::config::BackendConfig {
                    url: u.to_string(),
                    weight: 1,
                })
                .collect(),
            match_headers: HashMap::new(),
        }
    }

    fn split(sticky: Option<&StickyConfig>) -> TrafficSplitBalancer {
        TrafficSplitBalancer::from_groups(
            &[
                group_cfg("stable", 90, &["http://stable-1:80", "http://stable-2:80"]),
                group_cfg("canary", 10, &["http://canary-1:80"]),
            ],
            sticky,
        )
        .unwrap()
    }

    #[test]
    fn test_weighted_distribution_rough() {
        let lb = split(None);
        let headers = empty_headers();
        let k = key(&headers, "/");
        let mut canary = 0;
        for _ in 0..2000 {
            let sel = lb.next_for_request(&k).unwrap();
            if sel.group == "canary" {
                canary += 1;
            }
        }
        // Expect ~200; accept a generous band.
        assert!((100..400).contains(&canary), "canary={}", canary);
    }

    #[test]
    fn test_header_match_forces_group() {
        let mut cfg = group_cfg("preview", 0, &["http://preview-1:80"]);
        cfg.match_headers.insert("X-Debug".to_string(), "On".to_string());
        let lb = TrafficSplitBalancer::from_groups(
            &[group_cfg("stable", 100, &["http://stable-1:80"]), cfg],
            None,
        )
        .unwrap();

        let mut headers = empty_headers();
        headers.insert("x-debug", "on".parse().unwrap());
        let k = key(&headers, "/");
        let sel = lb.next_for_request(&k).unwrap();
        assert_eq!(sel.group, "preview");
        assert_eq!(sel.backend.url(), "http://preview-1:80");
    }

    #[test]
    fn test_sticky_cookie_overrides_weights() {
        let sticky = StickyConfig {
            mode: "cookie".to_string(),
            cookie_name: "janus_group".to_string(),
            hash_key: String::new(),
            ttl: 600,
        };
        let lb = split(Some(&sticky));
        let mut headers = empty_headers();
        headers.insert(http::header::COOKIE, "janus_group=canary".parse().unwrap());
        let k = key(&headers, "/");
        for _ in 0..10 {
            let sel = lb.next_for_request(&k).unwrap();
            assert_eq!(sel.group, "canary");
        }
    }

    #[test]
    fn test_cookie_issued_on_random_pick() {
        let sticky = StickyConfig {
            mode: "cookie".to_string(),
            cookie_name: "janus_group".to_string(),
            hash_key: String::new(),
            ttl: 600,
        };
        let lb = split(Some(&sticky));
        let headers = empty_headers();
        let k = key(&headers, "/");
        let sel = lb.next_for_request(&k).unwrap();
        let cookie = sel.set_cookie.expect("cookie mode pins random picks");
        assert!(cookie.starts_with(&format!("janus_group={}", sel.group)));
    }

    #[test]
    fn test_zero_total_weight_returns_none() {
        let lb = TrafficSplitBalancer::from_groups(
            &[group_cfg("stable", 0, &["http://stable-1:80"])],
            None,
        )
        .unwrap();
        let headers = empty_headers();
        let k = key(&headers, "/");
        assert!(lb.next_for_request(&k).is_none());
    }

    #[test]
    fn test_weight_shift_is_visible() {
        let lb = split(None);
        lb.set_weight("stable", 0);
        lb.set_weight("canary", 100);
        let headers = empty_headers();
        let k = key(&headers, "/");
        for _ in 0..20 {
            assert_eq!(lb.next_for_request(&k).unwrap().group, "canary");
        }
    }

    #[test]
    fn test_mark_unhealthy_propagates() {
        let lb = split(None);
        lb.mark("http://canary-1:80", false);
        assert_eq!(lb.healthy_count(), 2);
        assert!(lb.next_in_group("canary").is_none());
    }
}
