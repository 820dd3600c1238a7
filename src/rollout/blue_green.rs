use crate::balance::Balancer;
use crate::config::BlueGreenConfig;
use crate::error::GatewayError;
use crate::stats::{SlidingWindow, StatsSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlueGreenState {
    Inactive,
    HealthChecking,
    Promoting,
    Active,
    RolledBack,
}

/// Atomic two-group swap with an observation window. `promote()` flips all
/// traffic to the inactive group; while promoting, a watcher rolls back the
/// swap if the promoted group's error rate crosses the threshold before the
/// window closes.
pub struct BlueGreenController {
    route_id: String,
    config: BlueGreenConfig,
    balancer: Arc<Balancer>,
    original_weights: Vec<(String, u32)>,
    stats: HashMap<String, Arc<SlidingWindow>>,
    inner: RwLock<Inner>,
}

struct Inner {
    state: BlueGreenState,
    /// Cancels the in-flight observation task, if any.
    observation: Option<CancellationToken>,
}

#[derive(Serialize)]
pub struct BlueGreenSnapshot {
    pub route_id: String,
    pub state: BlueGreenState,
    pub active_group: String,
    pub inactive_group: String,
    pub current_weights: HashMap<String, u32>,
    pub groups: HashMap<String, StatsSnapshot>,
}

/// What one observation tick decided.
enum Observation {
    Continue,
    Rollback(String),
}

impl BlueGreenController {
    pub fn new(
        route_id: &str,
        config: BlueGreenConfig,
        balancer: Arc<Balancer>,
    ) -> anyhow::Result<Arc<Self>> {
        let split = balancer
            .as_split()
            .ok_or_else(|| anyhow::anyhow!("blue/green requires a weighted-split balancer"))?;
        let original_weights = split.weights();
        for name in [&config.active_group, &config.inactive_group] {
            if !original_weights.iter().any(|(n, _)| n == name) {
                anyhow::bail!("blue/green group {} not found", name);
            }
        }

        let window = Duration::from_secs_f64(config.observation_window.max(30.0));
        let stats = original_weights
            .iter()
            .map(|(name, _)| (name.clone(), Arc::new(SlidingWindow::new(window))))
            .collect();

        Ok(Arc::new(Self {
            route_id: route_id.to_string(),
            config,
            balancer,
            original_weights,
            stats,
            inner: RwLock::new(Inner {
                state: BlueGreenState::Inactive,
                observation: None,
            }),
        }))
    }

    pub fn state(&self) -> BlueGreenState {
        self.inner.read().unwrap().state
    }

    pub fn record(&self, group: &str, status: u16, latency_ms: f64) {
        if let Some(window) = self.stats.get(group) {
            window.record(status, latency_ms);
        }
    }

    /// Swap all traffic to the inactive group. Valid from `inactive` and
    /// `rolled_back` (re-attempt).
    pub fn promote(self: &Arc<Self>) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().unwrap();
        if !matches!(
            inner.state,
            BlueGreenState::Inactive | BlueGreenState::RolledBack
        ) {
            return Err(GatewayError::InvalidState(format!(
                "blue/green promote from {:?}",
                inner.state
            )));
        }

        let mut weights = HashMap::new();
        weights.insert(self.config.inactive_group.clone(), 100);
        weights.insert(self.config.active_group.clone(), 0);
        if let Some(split) = self.balancer.as_split() {
            split.set_weights(&weights);
        }
        for window in self.stats.values() {
            window.reset();
        }
        inner.state = BlueGreenState::Promoting;
        info!(
            "bluegreen: promoting, route={}, group={}",
            self.route_id, self.config.inactive_group
        );
        metrics::counter!(
            "gateway_bluegreen_transitions_total",
            "route" => self.route_id.clone(),
            "state" => "promoting",
        )
        .increment(1);

        if self.config.rollback_on_error && self.config.observation_window > 0.0 {
            let cancel = CancellationToken::new();
            inner.observation = Some(cancel.clone());
            self.spawn_observer(cancel);
        } else {
            inner.state = BlueGreenState::Active;
            info!("bluegreen: active, route={}", self.route_id);
        }
        Ok(())
    }

    /// Restore the original weights. Valid from `promoting` and `active`.
    pub fn rollback(&self, reason: &str) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().unwrap();
        if !matches!(
            inner.state,
            BlueGreenState::Promoting | BlueGreenState::Active
        ) {
            return Err(GatewayError::InvalidState(format!(
                "blue/green rollback from {:?}",
                inner.state
            )));
        }
        self.rollback_locked(&mut inner, reason);
        Ok(())
    }

    fn rollback_locked(&self, inner: &mut Inner, reason: &str) {
        if let Some(cancel) = inner.observation.take() {
            cancel.cancel();
        }
        let restore: HashMap<String, u32> = self.original_weights.iter().cloned().collect();
        if let Some(split) = self.balancer.as_split() {
            split.set_weights(&restore);
        }
        inner.state = BlueGreenState::RolledBack;
        warn!(
            event = "bluegreen.rolled_back",
            route = %self.route_id,
            reason = %reason,
            "blue/green rolled back"
        );
        metrics::counter!(
            "gateway_bluegreen_transitions_total",
            "route" => self.route_id.clone(),
            "state" => "rolled_back",
        )
        .increment(1);
    }

    /// Idempotent: cancels any in-flight observation.
    pub fn stop(&self) {
        let mut inner = self.inner.write().unwrap();
        if let Some(cancel) = inner.observation.take() {
            cancel.cancel();
        }
    }

    fn spawn_observer(self: &Arc<Self>, cancel: CancellationToken) {
        let controller = self.clone();
        tokio::spawn(async move {
            let deadline =
                Instant::now() + Duration::from_secs_f64(controller.config.observation_window);
            // Once per second for production windows; tighter for short ones
            // so at least a handful of checks land inside the window.
            let tick = Duration::from_secs_f64(
                (controller.config.observation_window / 10.0).clamp(0.01, 1.0),
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = cancel.cancelled() => return,
                }

                match controller.observe_once() {
                    Observation::Rollback(reason) => {
                        let mut inner = controller.inner.write().unwrap();
                        if inner.state == BlueGreenState::Promoting {
                            controller.rollback_locked(&mut inner, &reason);
                        }
                        return;
                    }
                    Observation::Continue => {}
                }

                if Instant::now() >= deadline {
                    let mut inner = controller.inner.write().unwrap();
                    if inner.state == BlueGreenState::Promoting {
                        inner.state = BlueGreenState::Active;
                        inner.observation = None;
                        info!(
                            "bluegreen: observation passed, route={}, now active",
                            controller.route_id
                        );
                        metrics::counter!(
                            "gateway_bluegreen_transitions_total",
                            "route" => controller.route_id.clone(),
                            "state" => "active",
                        )
                        .increment(1);
                    }
                    return;
                }
            }
        });
    }

    fn observe_once(&self) -> Observation {
        let snap = self.stats[&self.config.inactive_group].snapshot();
        if snap.requests >= self.config.min_requests
            && snap.error_rate > self.config.error_threshold
        {
            return Observation::Rollback(format!(
                "error_rate {:.3} above threshold {:.3} during observation",
                snap.error_rate, self.config.error_threshold
            ));
        }
        Observation::Continue
    }

    pub fn snapshot(&self) -> BlueGreenSnapshot {
        let inner = self.inner.read().unwrap();
        BlueGreenSnapshot {
            route_id: self.route_id.clone(),
            state: inner.state,
            active_group: self.config.active_group.clone(),
            inactive_group: self.config.inactive_group.clone(),
            current_weights: self
                .balancer
                .group_weights()
                .unwrap_or_default()
                .into_iter()
                .collect(),
            groups: self
                .stats
                .iter()
                .map(|(name, w)| (name.clone(), w.snapshot()))
                .collect(),
        }
    }
}
