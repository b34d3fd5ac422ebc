//! # Instance Selection Strategies
//!
//! A strategy picks one instance out of the healthy candidates the registry
//! hands to the balancer. Candidates arrive in registration order and are never
//! empty when `select` is called by the balancer, but every strategy still
//! returns `None` for an empty slice.
//!
//! Strategies keep their cursors per service name so that traffic to one
//! service never shifts the rotation of another.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::core::config::StrategyKind;
use crate::core::types::ServiceInstance;

pub trait BalancingStrategy: Send + Sync {
    fn select<'a>(&self, service_name: &str, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance>;

    /// Algorithm name for metrics and logging
    fn name(&self) -> &'static str;

    /// Forget rotation state
    fn reset(&self) {}
}

/// Build the strategy for `kind`
pub fn create_strategy(kind: StrategyKind, connections: Arc<ConnectionTracker>) -> Box<dyn BalancingStrategy> {
    match kind {
        StrategyKind::RoundRobin => Box::new(RoundRobin::new()),
        StrategyKind::LeastConnections => Box::new(LeastConnections::new(connections)),
        StrategyKind::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
        StrategyKind::Random => Box::new(RandomStrategy),
    }
}

/// In-flight request counts per instance id
///
/// `clear` starts a new generation. Holders that incremented in an earlier
/// generation must skip their decrement, see `release`.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    counts: DashMap<String, AtomicUsize>,
    generation: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, instance_id: &str) -> usize {
        let counter = self
            .counts
            .entry(instance_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn decrement(&self, instance_id: &str) -> usize {
        match self.counts.get(instance_id) {
            Some(counter) => {
                // Never wraps below zero even if a reset raced with an in-flight request
                let previous = counter
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
                    .unwrap_or(0);
                previous.saturating_sub(1)
            }
            None => 0,
        }
    }

    pub fn get(&self, instance_id: &str) -> usize {
        self.counts
            .get(instance_id)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Decrement only if no `clear` happened since `generation` was read
    pub fn release(&self, instance_id: &str, generation: u64) -> usize {
        if self.generation() == generation {
            self.decrement(instance_id)
        } else {
            self.get(instance_id)
        }
    }

    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.counts.clear();
    }
}

/// Rotates through candidates, one cursor per service
#[derive(Default)]
pub struct RoundRobin {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BalancingStrategy for RoundRobin {
    fn select<'a>(&self, service_name: &str, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let ticket = match self.cursors.get(service_name) {
            Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed),
            None => self
                .cursors
                .entry(service_name.to_string())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed),
        };
        instances.get(ticket % instances.len())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn reset(&self) {
        self.cursors.clear();
    }
}

/// Routes to the candidate with the fewest in-flight requests
///
/// Ties go to the earliest registered candidate.
pub struct LeastConnections {
    connections: Arc<ConnectionTracker>,
}

impl LeastConnections {
    pub fn new(connections: Arc<ConnectionTracker>) -> Self {
        Self { connections }
    }
}

impl BalancingStrategy for LeastConnections {
    fn select<'a>(&self, service_name: &str, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        let selected = instances
            .iter()
            .map(|instance| (self.connections.get(&instance.id), instance))
            .min_by_key(|(connections, _)| *connections);

        if let Some((connections, instance)) = selected {
            debug!(
                service = %service_name,
                instance_id = %instance.id,
                connections,
                "Selected instance with least connections"
            );
        }
        selected.map(|(_, instance)| instance)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

/// Smooth weighted round robin over the `weight` metadata of each instance
///
/// Over any window of `sum(weights)` selections every instance is picked
/// exactly `weight` times, interleaved rather than in bursts.
#[derive(Default)]
pub struct WeightedRoundRobin {
    current_weights: DashMap<String, Mutex<HashMap<String, i64>>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BalancingStrategy for WeightedRoundRobin {
    fn select<'a>(&self, service_name: &str, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let entry = self
            .current_weights
            .entry(service_name.to_string())
            .or_insert_with(|| Mutex::new(HashMap::new()));
        let mut current = entry.lock();

        // Drop state for instances that left the candidate set
        current.retain(|id, _| instances.iter().any(|instance| &instance.id == id));

        let mut total: i64 = 0;
        let mut best: Option<(usize, i64)> = None;
        for (index, instance) in instances.iter().enumerate() {
            let weight = instance.weight() as i64;
            total += weight;
            let value = current.entry(instance.id.clone()).or_insert(0);
            *value += weight;
            if best.map_or(true, |(_, best_value)| *value > best_value) {
                best = Some((index, *value));
            }
        }

        let (index, _) = best?;
        let selected = &instances[index];
        if let Some(value) = current.get_mut(&selected.id) {
            *value -= total;
        }
        Some(selected)
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn reset(&self) {
        self.current_weights.clear();
    }
}

/// Uniform random pick
pub struct RandomStrategy;

impl BalancingStrategy for RandomStrategy {
    fn select<'a>(&self, _service_name: &str, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..instances.len());
        instances.get(index)
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ServiceRegistration;

    fn instances(name: &str, weights: &[u64]) -> Vec<ServiceInstance> {
        weights
            .iter()
            .enumerate()
            .map(|(i, weight)| {
                ServiceInstance::new(
                    ServiceRegistration::new(name, "127.0.0.1", 9000 + i as u16).with_metadata("weight", *weight),
                )
            })
            .collect()
    }

    #[test]
    fn test_round_robin_cycles_per_service() {
        let strategy = RoundRobin::new();
        let a = instances("a", &[1, 1, 1]);
        let b = instances("b", &[1, 1]);

        let picks: Vec<&str> = (0..6)
            .map(|_| strategy.select("a", &a).unwrap().id.as_str())
            .collect();
        assert_eq!(picks[0], a[0].id);
        assert_eq!(picks[1], a[1].id);
        assert_eq!(picks[2], a[2].id);
        assert_eq!(picks[3], a[0].id);

        // Unaffected by traffic to "a"
        assert_eq!(strategy.select("b", &b).unwrap().id, b[0].id);
    }

    #[test]
    fn test_least_connections_prefers_idle_instance() {
        let tracker = Arc::new(ConnectionTracker::new());
        let strategy = LeastConnections::new(Arc::clone(&tracker));
        let pool = instances("svc", &[1, 1, 1]);

        tracker.increment(&pool[0].id);
        tracker.increment(&pool[1].id);
        assert_eq!(strategy.select("svc", &pool).unwrap().id, pool[2].id);

        tracker.increment(&pool[2].id);
        tracker.increment(&pool[2].id);
        tracker.decrement(&pool[0].id);
        assert_eq!(strategy.select("svc", &pool).unwrap().id, pool[0].id);
    }

    #[test]
    fn test_connection_tracker_never_underflows() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.decrement("missing"), 0);
        tracker.increment("x");
        assert_eq!(tracker.decrement("x"), 0);
        assert_eq!(tracker.decrement("x"), 0);
        assert_eq!(tracker.get("x"), 0);
    }

    #[test]
    fn test_release_after_clear_leaves_new_generation_alone() {
        let tracker = ConnectionTracker::new();
        let before = tracker.generation();
        tracker.increment("x");

        tracker.clear();
        let after = tracker.generation();
        tracker.increment("x");

        assert_eq!(tracker.release("x", before), 1);
        assert_eq!(tracker.get("x"), 1);
        assert_eq!(tracker.release("x", after), 0);
    }

    #[test]
    fn test_weighted_round_robin_honours_weights() {
        let strategy = WeightedRoundRobin::new();
        let pool = instances("svc", &[5, 1, 1]);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..7 {
            let picked = strategy.select("svc", &pool).unwrap();
            *counts.entry(picked.id.clone()).or_default() += 1;
        }

        assert_eq!(counts[&pool[0].id], 5);
        assert_eq!(counts[&pool[1].id], 1);
        assert_eq!(counts[&pool[2].id], 1);
    }

    #[test]
    fn test_weighted_round_robin_interleaves() {
        let strategy = WeightedRoundRobin::new();
        let pool = instances("svc", &[2, 1]);

        let picks: Vec<String> = (0..3).map(|_| strategy.select("svc", &pool).unwrap().id.clone()).collect();
        assert_eq!(picks, vec![pool[0].id.clone(), pool[1].id.clone(), pool[0].id.clone()]);
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let pool = instances("svc", &[1, 1]);
        for _ in 0..50 {
            let picked = RandomStrategy.select("svc", &pool).unwrap();
            assert!(pool.iter().any(|instance| instance.id == picked.id));
        }
        assert!(RandomStrategy.select("svc", &[]).is_none());
    }

    #[test]
    fn test_factory_names() {
        let tracker = Arc::new(ConnectionTracker::new());
        assert_eq!(create_strategy(StrategyKind::RoundRobin, tracker.clone()).name(), "round_robin");
        assert_eq!(create_strategy(StrategyKind::LeastConnections, tracker.clone()).name(), "least_connections");
        assert_eq!(create_strategy(StrategyKind::WeightedRoundRobin, tracker.clone()).name(), "weighted_round_robin");
        assert_eq!(create_strategy(StrategyKind::Random, tracker).name(), "random");
    }
}
