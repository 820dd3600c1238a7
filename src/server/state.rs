use crate::balance::Balancer;
use crate::config::{GatewayConfig, RouteConfig, TimeoutPolicy};
use crate::health::active::ActiveHealthChecker;
use crate::health::backpressure::BackpressureHandler;
use crate::health::outlier::OutlierDetector;
use crate::metrics::Metrics;
use crate::proxy::redirect::RedirectFollower;
use crate::proxy::rewrite::RewriteRules;
use crate::proxy::transport::{HttpClient, TransportPool};
use crate::retry::{HedgingExecutor, RetryPolicy};
use crate::rollout::ab::AbTestController;
use crate::rollout::blue_green::BlueGreenController;
use crate::rollout::canary::CanaryController;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

/// Everything one HTTP route needs at dispatch time, assembled once from
/// config. Interface conformance (request-awareness, latency recording) is
/// resolved here so the hot path never re-checks it.
pub struct RouteRuntime {
    pub id: String,
    pub path_prefix: String,
    pub balancer: Arc<Balancer>,
    pub retry: Option<Arc<RetryPolicy>>,
    pub hedging: Option<Arc<HedgingExecutor>>,
    pub outlier: Option<Arc<OutlierDetector>>,
    pub canary: Option<Arc<CanaryController>>,
    pub blue_green: Option<Arc<BlueGreenController>>,
    pub ab_test: Option<Arc<AbTestController>>,
    pub backpressure: Option<Arc<BackpressureHandler>>,
    pub active_health: Option<Arc<ActiveHealthChecker>>,
    pub rewrite: RewriteRules,
    pub redirect: Option<RedirectFollower>,
    pub timeout: TimeoutPolicy,
    pub client: HttpClient,
    pub backend_override_header: Option<String>,
    pub version_header: String,
    pub tenant_header: String,
    pub propagate_trace: bool,
    pub request_aware: bool,
    pub records_latency: bool,
}

impl RouteRuntime {
    pub fn build(cfg: &RouteConfig, transports: &TransportPool) -> Result<Arc<Self>> {
        let balancer = Balancer::from_route(cfg)?;

        let retry = cfg
            .retry
            .as_ref()
            .filter(|r| r.max_retries > 0 || r.budget.is_some())
            .map(|r| Arc::new(RetryPolicy::new(r)));
        let hedging = cfg
            .retry
            .as_ref()
            .and_then(|r| r.hedging.as_ref())
            .filter(|h| h.enabled)
            .map(|h| Arc::new(HedgingExecutor::new(h)));

        let outlier = cfg
            .outlier
            .as_ref()
            .filter(|o| o.enabled)
            .map(|o| OutlierDetector::new(&cfg.id, o.clone(), balancer.clone()));

        let canary = match cfg.canary.as_ref().filter(|c| c.enabled) {
            Some(c) => Some(CanaryController::new(&cfg.id, c.clone(), balancer.clone())?),
            None => None,
        };
        let blue_green = match cfg.blue_green.as_ref().filter(|b| b.enabled) {
            Some(b) => Some(BlueGreenController::new(&cfg.id, b.clone(), balancer.clone())?),
            None => None,
        };
        let ab_test = cfg.ab_test.as_ref().filter(|a| a.enabled).map(|a| {
            let groups: Vec<String> = cfg.groups.iter().map(|g| g.name.clone()).collect();
            AbTestController::new(&cfg.id, a, &groups)
        });

        let backpressure = cfg
            .backpressure
            .as_ref()
            .map(|b| BackpressureHandler::new(b.clone(), balancer.clone()));

        let active_health = cfg
            .active_health
            .as_ref()
            .map(|h| ActiveHealthChecker::new(&cfg.id, h.clone(), balancer.clone()));

        let request_aware = balancer.is_request_aware();
        let records_latency = balancer.records_latency();

        Ok(Arc::new(Self {
            id: cfg.id.clone(),
            path_prefix: cfg.path_prefix.clone(),
            balancer,
            retry,
            hedging,
            outlier,
            canary,
            blue_green,
            ab_test,
            backpressure,
            active_health,
            rewrite: RewriteRules::compile(cfg.rewrite.as_ref())?,
            redirect: cfg
                .redirect
                .as_ref()
                .filter(|r| r.enabled)
                .map(|r| RedirectFollower::new(r.max_redirects)),
            timeout: cfg.timeout.clone(),
            client: transports.get(cfg.transport.as_deref()).clone(),
            backend_override_header: cfg.backend_override_header.clone(),
            version_header: cfg.version_header.clone(),
            tenant_header: cfg.tenant_header.clone(),
            propagate_trace: cfg.propagate_trace,
            request_aware,
            records_latency,
        }))
    }

    /// Stop every background task this route owns. Idempotent.
    pub fn stop_background(&self) {
        if let Some(ref outlier) = self.outlier {
            outlier.stop();
        }
        if let Some(ref checker) = self.active_health {
            checker.stop();
        }
        if let Some(ref canary) = self.canary {
            canary.stop();
        }
        if let Some(ref bg) = self.blue_green {
            bg.stop();
        }
    }
}

/// Longest-prefix route table, published by pointer swap.
pub struct RouteTable {
    routes: Vec<Arc<RouteRuntime>>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<Arc<RouteRuntime>>) -> Self {
        // Longest prefix first; dispatch scans in order.
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Self { routes }
    }

    pub fn match_route(&self, path: &str) -> Option<Arc<RouteRuntime>> {
        self.routes
            .iter()
            .find(|r| path.starts_with(r.path_prefix.as_str()))
            .cloned()
    }

    pub fn all_routes(&self) -> &[Arc<RouteRuntime>] {
        &self.routes
    }
}

/// Shared gateway state, cheaply cloneable. Route runtimes and config are
/// published via `ArcSwap`; the hot path only does pointer loads.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: Metrics,
    pub routes: Arc<ArcSwap<RouteTable>>,
    pub transports: Arc<TransportPool>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let transports = Arc::new(TransportPool::from_configs(&config.transports));
        let mut routes = Vec::with_capacity(config.routes.len());
        for route_cfg in &config.routes {
            routes.push(RouteRuntime::build(route_cfg, &transports)?);
        }
        info!("state: built {} route runtimes", routes.len());

        let metrics = Metrics::install();
        metrics::gauge!("gateway_config_routes_total").set(config.routes.len() as f64);

        Ok(Self {
            config: Arc::new(ArcSwap::new(Arc::new(config))),
            metrics,
            routes: Arc::new(ArcSwap::new(Arc::new(RouteTable::new(routes)))),
            transports,
        })
    }

    /// Start per-route background tasks. Canaries only auto-start when their
    /// config says so.
    pub fn start_background(&self, health_client: &reqwest::Client) {
        let table = self.routes.load();
        let config = self.config.load();
        for route in table.all_routes() {
            if let Some(ref outlier) = route.outlier {
                outlier.start();
            }
            if let Some(ref checker) = route.active_health {
                checker.start(health_client.clone());
            }
            let auto_start = config
                .routes
                .iter()
                .find(|r| r.id == route.id)
                .and_then(|r| r.canary.as_ref())
                .map(|c| c.auto_start)
                .unwrap_or(false);
            if auto_start {
                if let Some(ref canary) = route.canary {
                    if let Err(e) = canary.start() {
                        tracing::warn!(
                            "canary: auto start failed, route={}, error={}",
                            route.id,
                            e
                        );
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        for route in self.routes.load().all_routes() {
            route.stop_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, prefix: &str) -> Arc<RouteRuntime> {
        let cfg: RouteConfig = serde_json::from_value(serde_json::json!({
            "id": id,
            "path_prefix": prefix,
            "backends": [{"url": "http://127.0.0.1:9001"}]
        }))
        .unwrap();
        let transports = TransportPool::from_configs(&[]);
        RouteRuntime::build(&cfg, &transports).unwrap()
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let table = RouteTable::new(vec![
            route("catch", "/"),
            route("api", "/api"),
            route("users", "/api/users"),
        ]);
        assert_eq!(table.match_route("/api/users/7").unwrap().id, "users");
        assert_eq!(table.match_route("/api/other").unwrap().id, "api");
        assert_eq!(table.match_route("/health").unwrap().id, "catch");
    }

    #[tokio::test]
    async fn test_no_match_without_catch_all() {
        let table = RouteTable::new(vec![route("api", "/api")]);
        assert!(table.match_route("/other").is_none());
    }

    #[tokio::test]
    async fn test_route_runtime_conformance_flags() {
        let cfg: RouteConfig = serde_json::from_value(serde_json::json!({
            "id": "split",
            "groups": [
                {"name": "stable", "weight": 90, "backends": [{"url": "http://a:1"}]},
                {"name": "canary", "weight": 10, "backends": [{"url": "http://b:1"}]}
            ],
            "balancer": {"algorithm": "weighted"}
        }))
        .unwrap();
        let transports = TransportPool::from_configs(&[]);
        let runtime = RouteRuntime::build(&cfg, &transports).unwrap();
        assert!(runtime.request_aware);
    }
}
