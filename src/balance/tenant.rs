use super::{Backend, Balancer, RequestKey, Selection};
use std::collections::HashMap;
use std::sync::Arc;

/// Tenant-aware dispatch: a balancer per tenant id plus a default. Unknown
/// tenants, or tenants whose pool has no healthy backend, fall through to
/// the default balancer.
pub struct TenantBalancer {
    tenants: HashMap<String, Arc<Balancer>>,
    default: Arc<Balancer>,
}

impl TenantBalancer {
    pub fn new(tenants: HashMap<String, Arc<Balancer>>, default: Arc<Balancer>) -> Self {
        Self { tenants, default }
    }

    pub fn default(&self) -> &Arc<Balancer> {
        &self.default
    }

    pub fn next_for_request(&self, key: &RequestKey<'_>) -> Option<Selection> {
        if let Some(tenant) = key.tenant {
            if let Some(inner) = self.tenants.get(tenant) {
                if let Some(backend) = inner.next() {
                    return Some(Selection::bare(backend));
                }
            }
        }
        self.default.next().map(Selection::bare)
    }

    pub fn mark(&self, url: &str, healthy: bool) {
        for inner in self.tenants.values() {
            if healthy {
                inner.mark_healthy(url);
            } else {
                inner.mark_unhealthy(url);
            }
        }
        if healthy {
            self.default.mark_healthy(url);
        } else {
            self.default.mark_unhealthy(url);
        }
    }

    pub fn healthy_count(&self) -> usize {
        self.tenants
            .values()
            .map(|b| b.healthy_count())
            .sum::<usize>()
            + self.default.healthy_count()
    }

    pub fn backends(&self) -> Vec<Backend> {
        let mut all: Vec<Backend> = self
            .tenants
            .values()
            .flat_map(|b| b.backends())
            .collect();
        all.extend(self.default.backends());
        all
    }

    pub fn record_latency(&self, url: &str, latency_ms: f64) {
        for inner in self.tenants.values() {
            inner.record_latency(url, latency_ms);
        }
        self.default.record_latency(url, latency_ms);
    }
}
