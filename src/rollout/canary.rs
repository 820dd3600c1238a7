use crate::balance::Balancer;
use crate::config::CanaryConfig;
use crate::error::GatewayError;
use crate::stats::{SlidingWindow, StatsSnapshot};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryState {
    Pending,
    Progressing,
    Paused,
    Completed,
    RolledBack,
}

/// Operator actions delivered to the background task.
#[derive(Debug, Clone, Copy)]
pub enum CanaryAction {
    Pause,
    Resume,
    Promote,
    Rollback,
}

/// Multi-step canary rollout for one route. Shifts the canary group's weight
/// through the configured steps, evaluating its error rate and p99 against
/// absolute thresholds and against the baseline group each analysis tick.
pub struct CanaryController {
    route_id: String,
    config: CanaryConfig,
    balancer: Arc<Balancer>,
    baseline_group: String,
    /// Group weights as configured, in declaration order. The redistribution
    /// remainder goes to the last non-canary entry.
    original_weights: Vec<(String, u32)>,
    stats: HashMap<String, Arc<SlidingWindow>>,
    inner: RwLock<Inner>,
    action_tx: mpsc::Sender<CanaryAction>,
    action_rx: Mutex<Option<mpsc::Receiver<CanaryAction>>>,
    cancel: CancellationToken,
}

struct Inner {
    state: CanaryState,
    current_step: usize,
    consecutive_failures: u32,
    step_started: Instant,
}

#[derive(Serialize)]
pub struct CanarySnapshot {
    pub route_id: String,
    pub state: CanaryState,
    pub current_step: usize,
    pub total_steps: usize,
    pub canary_group: String,
    pub baseline_group: String,
    pub consecutive_failures: u32,
    pub max_failures: u32,
    pub current_weights: HashMap<String, u32>,
    pub original_weights: HashMap<String, u32>,
    pub groups: HashMap<String, StatsSnapshot>,
}

impl CanaryController {
    pub fn new(
        route_id: &str,
        config: CanaryConfig,
        balancer: Arc<Balancer>,
    ) -> anyhow::Result<Arc<Self>> {
        if config.steps.is_empty() {
            anyhow::bail!("canary requires at least one step");
        }
        let split = balancer
            .as_split()
            .ok_or_else(|| anyhow::anyhow!("canary requires a weighted-split balancer"))?;
        let original_weights = split.weights();
        if !original_weights.iter().any(|(n, _)| *n == config.canary_group) {
            anyhow::bail!("canary group {} not found", config.canary_group);
        }

        // Baseline: the non-canary group with the highest original weight,
        // ties broken alphabetically.
        let baseline_group = original_weights
            .iter()
            .filter(|(name, _)| *name != config.canary_group)
            .max_by(|(an, aw), (bn, bw)| aw.cmp(bw).then(bn.cmp(an)))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| anyhow::anyhow!("canary needs at least one non-canary group"))?;

        let window = Duration::from_secs_f64(config.analysis.interval.max(1.0) * 10.0);
        let stats = original_weights
            .iter()
            .map(|(name, _)| (name.clone(), Arc::new(SlidingWindow::new(window))))
            .collect();

        let (action_tx, action_rx) = mpsc::channel(1);
        Ok(Arc::new(Self {
            route_id: route_id.to_string(),
            config,
            balancer,
            baseline_group,
            original_weights,
            stats,
            inner: RwLock::new(Inner {
                state: CanaryState::Pending,
                current_step: 0,
                consecutive_failures: 0,
                step_started: Instant::now(),
            }),
            action_tx,
            action_rx: Mutex::new(Some(action_rx)),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn state(&self) -> CanaryState {
        self.inner.read().unwrap().state
    }

    pub fn baseline_group(&self) -> &str {
        &self.baseline_group
    }

    /// Record a completed request attributed to a traffic group.
    pub fn record(&self, group: &str, status: u16, latency_ms: f64) {
        if let Some(window) = self.stats.get(group) {
            window.record(status, latency_ms);
        }
    }

    /// Begin the rollout: apply the first step and launch the analysis task.
    pub fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.state != CanaryState::Pending {
                return Err(GatewayError::InvalidState(format!(
                    "canary start from {:?}",
                    inner.state
                )));
            }
            inner.state = CanaryState::Progressing;
            inner.step_started = Instant::now();
            self.apply_step_weights(0);
        }
        info!(
            "canary: started, route={}, steps={}",
            self.route_id,
            self.config.steps.len()
        );

        let controller = self.clone();
        let mut action_rx = self
            .action_rx
            .lock()
            .unwrap()
            .take()
            .expect("canary started twice");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs_f64(
                controller.config.analysis.interval.max(0.001),
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => controller.evaluate(),
                    action = action_rx.recv() => {
                        match action {
                            Some(a) => controller.apply_action(a),
                            None => return,
                        }
                    }
                    _ = controller.cancel.cancelled() => return,
                }
                if matches!(
                    controller.state(),
                    CanaryState::Completed | CanaryState::RolledBack
                ) {
                    return;
                }
            }
        });
        Ok(())
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Queue an operator action for the background task.
    pub fn send_action(&self, action: CanaryAction) -> Result<(), GatewayError> {
        self.action_tx
            .try_send(action)
            .map_err(|_| GatewayError::InvalidState("canary action queue full or closed".into()))
    }

    fn apply_action(&self, action: CanaryAction) {
        match action {
            CanaryAction::Pause => {
                let mut inner = self.inner.write().unwrap();
                if inner.state == CanaryState::Progressing {
                    inner.state = CanaryState::Paused;
                    info!("canary: paused, route={}", self.route_id);
                }
            }
            CanaryAction::Resume => {
                let mut inner = self.inner.write().unwrap();
                if inner.state == CanaryState::Paused {
                    inner.state = CanaryState::Progressing;
                    inner.step_started = Instant::now();
                    info!("canary: resumed, route={}", self.route_id);
                }
            }
            CanaryAction::Promote => self.promote(),
            CanaryAction::Rollback => self.rollback("operator requested"),
        }
    }

    /// One analysis tick. Only meaningful while progressing.
    fn evaluate(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.state != CanaryState::Progressing {
            return;
        }

        let canary = self.stats[&self.config.canary_group].snapshot();
        if canary.requests < self.config.analysis.min_requests {
            return;
        }

        if let Some(reason) = self.analyze(&canary) {
            inner.consecutive_failures += 1;
            let tolerated = self.config.analysis.max_failures.max(1);
            warn!(
                "canary: analysis failed, route={}, reason={}, consecutive={}/{}",
                self.route_id, reason, inner.consecutive_failures, tolerated
            );
            if inner.consecutive_failures >= tolerated {
                let failures = inner.consecutive_failures;
                self.rollback_locked(&mut inner, &reason, failures);
            }
            return;
        }
        inner.consecutive_failures = 0;

        // Step advance.
        let step = &self.config.steps[inner.current_step.min(self.config.steps.len() - 1)];
        if inner.step_started.elapsed() < Duration::from_secs_f64(step.pause) {
            return;
        }
        inner.current_step += 1;
        if inner.current_step >= self.config.steps.len() {
            inner.state = CanaryState::Completed;
            info!("canary: completed, route={}", self.route_id);
            metrics::counter!(
                "gateway_canary_transitions_total",
                "route" => self.route_id.clone(),
                "state" => "completed",
            )
            .increment(1);
            return;
        }
        self.apply_step_weights(inner.current_step);
        inner.step_started = Instant::now();
        inner.consecutive_failures = 0;
        // Fresh metrics for the new step's evaluation.
        for window in self.stats.values() {
            window.reset();
        }
        info!(
            "canary: step advanced, route={}, step={}/{}",
            self.route_id,
            inner.current_step + 1,
            self.config.steps.len()
        );
    }

    /// Returns a failure reason, or `None` when the canary looks healthy.
    fn analyze(&self, canary: &StatsSnapshot) -> Option<String> {
        let analysis = &self.config.analysis;

        // Absolute checks.
        if analysis.error_threshold > 0.0 && canary.error_rate > analysis.error_threshold {
            return Some(format!(
                "error_rate {:.3} above threshold {:.3}",
                canary.error_rate, analysis.error_threshold
            ));
        }
        if analysis.latency_threshold > 0.0 && canary.p99 > analysis.latency_threshold {
            return Some(format!(
                "p99 {:.1}ms above threshold {:.1}ms",
                canary.p99, analysis.latency_threshold
            ));
        }

        // Comparative checks against the baseline group.
        let baseline = self.stats[&self.baseline_group].snapshot();
        if analysis.max_error_rate_increase > 0.0 && baseline.errors > 0 {
            let ratio = canary.error_rate / baseline.error_rate;
            if ratio > analysis.max_error_rate_increase {
                return Some(format!(
                    "error_rate {:.1}x baseline (limit {:.1}x)",
                    ratio, analysis.max_error_rate_increase
                ));
            }
        }
        if analysis.max_latency_increase > 0.0 && baseline.p99 > 0.0 {
            let ratio = canary.p99 / baseline.p99;
            if ratio > analysis.max_latency_increase {
                return Some(format!(
                    "p99 {:.1}x baseline (limit {:.1}x)",
                    ratio, analysis.max_latency_increase
                ));
            }
        }
        None
    }

    /// Set the canary weight for a step and spread the remainder across the
    /// non-canary groups proportionally to their original weights. Integer
    /// division; the rounding remainder lands on the last non-canary group
    /// so the total is exactly 100.
    fn apply_step_weights(&self, step: usize) {
        let canary_weight = self.config.steps[step].weight.min(100);
        let mut weights = HashMap::new();
        weights.insert(self.config.canary_group.clone(), canary_weight);

        let remaining = 100 - canary_weight;
        let non_canary: Vec<&(String, u32)> = self
            .original_weights
            .iter()
            .filter(|(name, _)| *name != self.config.canary_group)
            .collect();
        let original_total: u32 = non_canary.iter().map(|(_, w)| *w).sum();

        let mut assigned = 0u32;
        for (i, (name, orig)) in non_canary.iter().enumerate() {
            let w = if i + 1 == non_canary.len() {
                remaining - assigned
            } else if original_total > 0 {
                remaining * orig / original_total
            } else {
                0
            };
            assigned += w;
            weights.insert(name.clone(), w);
        }

        if let Some(split) = self.balancer.as_split() {
            split.set_weights(&weights);
        }
    }

    fn rollback(&self, reason: &str) {
        let mut inner = self.inner.write().unwrap();
        if !matches!(inner.state, CanaryState::Progressing | CanaryState::Paused) {
            return;
        }
        let failures = inner.consecutive_failures;
        self.rollback_locked(&mut inner, reason, failures);
    }

    fn rollback_locked(&self, inner: &mut Inner, reason: &str, failures: u32) {
        let restore: HashMap<String, u32> = self.original_weights.iter().cloned().collect();
        if let Some(split) = self.balancer.as_split() {
            split.set_weights(&restore);
        }
        inner.state = CanaryState::RolledBack;
        warn!(
            event = "canary.rolled_back",
            route = %self.route_id,
            reason = %reason,
            consecutive_failures = failures,
            "canary rolled back"
        );
        metrics::counter!(
            "gateway_canary_transitions_total",
            "route" => self.route_id.clone(),
            "state" => "rolled_back",
        )
        .increment(1);
    }

    fn promote(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.state != CanaryState::Progressing {
            return;
        }
        let mut weights = HashMap::new();
        for (name, _) in &self.original_weights {
            weights.insert(
                name.clone(),
                if *name == self.config.canary_group { 100 } else { 0 },
            );
        }
        if let Some(split) = self.balancer.as_split() {
            split.set_weights(&weights);
        }
        inner.state = CanaryState::Completed;
        info!("canary: promoted, route={}", self.route_id);
        metrics::counter!(
            "gateway_canary_transitions_total",
            "route" => self.route_id.clone(),
            "state" => "completed",
        )
        .increment(1);
    }

    pub fn snapshot(&self) -> CanarySnapshot {
        let inner = self.inner.read().unwrap();
        let current_weights = self
            .balancer
            .group_weights()
            .unwrap_or_default()
            .into_iter()
            .collect();
        CanarySnapshot {
            route_id: self.route_id.clone(),
            state: inner.state,
            current_step: inner.current_step,
            total_steps: self.config.steps.len(),
            canary_group: self.config.canary_group.clone(),
            baseline_group: self.baseline_group.clone(),
            consecutive_failures: inner.consecutive_failures,
            max_failures: self.config.analysis.max_failures,
            current_weights,
            original_weights: self.original_weights.iter().cloned().collect(),
            groups: self
                .stats
                .iter()
                .map(|(name, w)| (name.clone(), w.snapshot()))
                .collect(),
        }
    }
}
