use super::{Backend, BackendSet};
use std::sync::Mutex;

/// Weighted round-robin with classic GCD interleaving: walk the healthy set,
/// lowering the admission threshold by `gcd` on each wrap, and emit backends
/// whose weight clears the threshold. Produces a smooth interleave rather
/// than weight-sized bursts.
pub struct WeightedRoundRobinBalancer {
    set: BackendSet,
    state: Mutex<InterleaveState>,
}

/// Derived interleave values, valid only for the snapshot generation they
/// were computed from. Any health transition or backend update invalidates
/// them wholesale.
struct InterleaveState {
    generation: u64,
    index: usize,
    current_weight: u32,
    gcd: u32,
    max_weight: u32,
}

impl InterleaveState {
    fn empty() -> Self {
        Self {
            generation: 0,
            index: 0,
            current_weight: 0,
            gcd: 0,
            max_weight: 0,
        }
    }

    fn recompute(&mut self, backends: &[Backend], generation: u64) {
        self.generation = generation;
        self.index = 0;
        self.current_weight = 0;
        self.gcd = backends.iter().fold(0, |acc, b| gcd(acc, b.weight()));
        self.max_weight = backends.iter().map(|b| b.weight()).max().unwrap_or(0);
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

impl WeightedRoundRobinBalancer {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            set: BackendSet::new(backends),
            state: Mutex::new(InterleaveState::empty()),
        }
    }

    pub fn next(&self) -> Option<Backend> {
        let snap = self.set.healthy();
        let n = snap.backends.len();
        if n == 0 {
            return None;
        }

        let mut state = self.state.lock().unwrap();
        if state.generation != snap.generation {
            state.recompute(&snap.backends, snap.generation);
        }
        if state.max_weight == 0 {
            return None;
        }

        // Bounded by one full sweep of every admission level.
        let max_iter = n * (state.max_weight / state.gcd.max(1) + 1) as usize;
        for _ in 0..max_iter {
            state.index = (state.index + 1) % n;
            if state.index == 0 {
                state.current_weight = state.current_weight.saturating_sub(state.gcd);
                if state.current_weight == 0 {
                    state.current_weight = state.max_weight;
                }
            }
            if state.current_weight == 0 {
                state.current_weight = state.max_weight;
            }
            if snap.backends[state.index].weight() >= state.current_weight {
                return Some(snap.backends[state.index].clone());
            }
        }
        // All weights equal and positive would have returned above; this is
        // unreachable with weight >= 1 invariants, but stay total.
        snap.backends.first().cloned()
    }

    pub fn update_backends(&self, backends: Vec<Backend>) {
        self.set.update(backends);
        // Force recompute on the next selection.
        let mut state = self.state.lock().unwrap();
        *state = InterleaveState::empty();
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

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(0, 5), 5);
        assert_eq!(gcd(4, 6), 2);
        assert_eq!(gcd(7, 3), 1);
    }

    #[test]
    fn test_weighted_distribution() {
        let lb = WeightedRoundRobinBalancer::new(vec![
            weighted_backend("http://a:80", 5),
            weighted_backend("http://b:80", 1),
        ]);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..60 {
            let b = lb.next().unwrap();
            *counts.entry(b.url().to_string()).or_insert(0) += 1;
        }
        assert_eq!(counts["http://a:80"], 50);
        assert_eq!(counts["http://b:80"], 10);
    }

    #[test]
    fn test_interleaves_rather_than_bursts() {
        let lb = WeightedRoundRobinBalancer::new(vec![
            weighted_backend("http://a:80", 2),
            weighted_backend("http://b:80", 1),
        ]);
        let seq: Vec<String> = (0..6).map(|_| lb.next().unwrap().url().to_string()).collect();
        // b must appear before a's full weight is exhausted twice in a row.
        assert!(seq.contains(&"http://b:80".to_string()));
    }

    #[test]
    fn test_recomputes_on_health_change() {
        let lb = WeightedRoundRobinBalancer::new(vec![
            weighted_backend("http://a:80", 4),
            weighted_backend("http://b:80", 2),
        ]);
        lb.next();
        lb.mark("http://a:80", false);
        for _ in 0..6 {
            assert_eq!(lb.next().unwrap().url(), "http://b:80");
        }
    }

    #[test]
    fn test_empty() {
        let lb = WeightedRoundRobinBalancer::new(Vec::new());
        assert!(lb.next().is_none());
    }

    #[test]
    fn test_update_resets_state() {
        let lb = WeightedRoundRobinBalancer::new(vec![weighted_backend("http://a:80", 3)]);
        lb.next();
        lb.update_backends(vec![weighted_backend("http://b:80", 1)]);
        assert_eq!(lb.next().unwrap().url(), "http://b:80");
    }
}
