use super::round_robin::RoundRobinBalancer;
use super::{Backend, RequestKey, Selection};
use std::collections::HashMap;

/// API-version dispatch: a round-robin pool per version string. Requests with
/// no version, or an unknown one, use the default version's pool. Selections
/// report an empty group name so an earlier traffic-group decision is never
/// overwritten by the caller.
pub struct VersionedBalancer {
    versions: HashMap<String, RoundRobinBalancer>,
    default_version: Option<String>,
    default_pool: RoundRobinBalancer,
}

impl VersionedBalancer {
    pub fn new(
        versions: HashMap<String, Vec<Backend>>,
        default_version: Option<String>,
        default_backends: Vec<Backend>,
    ) -> Self {
        Self {
            versions: versions
                .into_iter()
                .map(|(v, backends)| (v, RoundRobinBalancer::new(backends)))
                .collect(),
            default_version,
            default_pool: RoundRobinBalancer::new(default_backends),
        }
    }

    fn pool_for(&self, version: Option<&str>) -> &RoundRobinBalancer {
        if let Some(v) = version {
            if let Some(pool) = self.versions.get(v) {
                return pool;
            }
        }
        if let Some(ref v) = self.default_version {
            if let Some(pool) = self.versions.get(v) {
                return pool;
            }
        }
        &self.default_pool
    }

    pub fn next(&self) -> Option<Backend> {
        self.pool_for(None).next()
    }

    pub fn next_for_request(&self, key: &RequestKey<'_>) -> Option<Selection> {
        self.pool_for(key.api_version).next().map(Selection::bare)
    }

    pub fn update_default(&self, backends: Vec<Backend>) {
        self.default_pool.update_backends(backends);
    }

    pub fn mark(&self, url: &str, healthy: bool) {
        for pool in self.versions.values() {
            pool.mark(url, healthy);
        }
        self.default_pool.mark(url, healthy);
    }

    pub fn healthy_count(&self) -> usize {
        self.versions
            .values()
            .map(|p| p.healthy_count())
            .sum::<usize>()
            + self.default_pool.healthy_count()
    }

    pub fn backends(&self) -> Vec<Backend> {
        let mut all: Vec<Backend> = self
            .versions
            .values()
            .flat_map(|p| p.backends())
            .collect();
        all.extend(self.default_pool.backends());
        all
    }
}
