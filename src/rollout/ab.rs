use crate::config::AbTestConfig;
use crate::stats::{SlidingWindow, StatsSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Passive A/B experiment: per-group request metrics, no weight mutation.
/// The split balancer keeps serving whatever weights the config declares;
/// this controller only observes and reports.
pub struct AbTestController {
    route_id: String,
    experiment_name: String,
    started_at: SystemTime,
    started_instant: Instant,
    stats: HashMap<String, Arc<SlidingWindow>>,
}

#[derive(Serialize)]
pub struct AbTestSnapshot {
    pub route_id: String,
    pub experiment_name: String,
    /// Unix epoch seconds.
    pub started_at: u64,
    pub duration_sec: u64,
    pub groups: HashMap<String, StatsSnapshot>,
}

impl AbTestController {
    pub fn new(route_id: &str, config: &AbTestConfig, groups: &[String]) -> Arc<Self> {
        let window = Duration::from_secs_f64(config.window.max(1.0));
        Arc::new(Self {
            route_id: route_id.to_string(),
            experiment_name: config.experiment_name.clone(),
            started_at: SystemTime::now(),
            started_instant: Instant::now(),
            stats: groups
                .iter()
                .map(|g| (g.clone(), Arc::new(SlidingWindow::new(window))))
                .collect(),
        })
    }

    pub fn record(&self, group: &str, status: u16, latency_ms: f64) {
        if let Some(window) = self.stats.get(group) {
            window.record(status, latency_ms);
        }
    }

    pub fn snapshot(&self) -> AbTestSnapshot {
        AbTestSnapshot {
            route_id: self.route_id.clone(),
            experiment_name: self.experiment_name.clone(),
            started_at: self
                .started_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            duration_sec: self.started_instant.elapsed().as_secs(),
            groups: self
                .stats
                .iter()
                .map(|(name, w)| (name.clone(), w.snapshot()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AbTestConfig {
        AbTestConfig {
            enabled: true,
            experiment_name: "checkout-v2".to_string(),
            window: 30.0,
        }
    }

    #[test]
    fn test_collects_per_group() {
        let controller = AbTestController::new(
            "r1",
            &config(),
            &["control".to_string(), "variant".to_string()],
        );
        controller.record("control", 200, 10.0);
        controller.record("variant", 500, 20.0);
        controller.record("variant", 200, 30.0);

        let snap = controller.snapshot();
        assert_eq!(snap.experiment_name, "checkout-v2");
        assert_eq!(snap.groups["control"].requests, 1);
        assert_eq!(snap.groups["variant"].requests, 2);
        assert_eq!(snap.groups["variant"].errors, 1);
    }

    #[test]
    fn test_unknown_group_ignored() {
        let controller = AbTestController::new("r1", &config(), &["control".to_string()]);
        controller.record("mystery", 200, 10.0);
        assert_eq!(controller.snapshot().groups["control"].requests, 0);
    }
}
