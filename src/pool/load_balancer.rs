//! Load balancing strategies for pool members
//!
//! A balancer picks one of the currently eligible members. Candidates
//! arrive in registration order; the strategy changes distribution
//! only, never which members are eligible.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::LoadBalancingStrategy;

/// A member eligible for selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub agent_id: String,
    pub weight: u32,
    pub active_connections: usize,
}

/// Member selection policy
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Select a member, or `None` when there are no candidates
    async fn select(&self, candidates: &[Candidate]) -> Option<String>;

    fn strategy(&self) -> LoadBalancingStrategy;

    /// Forget rotation state
    fn reset(&self);
}

/// Build the balancer for a strategy
pub fn create_load_balancer(strategy: LoadBalancingStrategy) -> Box<dyn LoadBalancer> {
    match strategy {
        LoadBalancingStrategy::RoundRobin => Box::new(RoundRobinBalancer::new()),
        LoadBalancingStrategy::LeastConnection => Box::new(LeastConnectionBalancer),
        LoadBalancingStrategy::Weighted => Box::new(WeightedBalancer::new()),
        LoadBalancingStrategy::Random => Box::new(RandomBalancer),
    }
}

/// Cycles through candidates in order
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    next: Mutex<usize>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoadBalancer for RoundRobinBalancer {
    async fn select(&self, candidates: &[Candidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let mut next = self.next.lock();
        let index = *next % candidates.len();
        *next = next.wrapping_add(1);
        Some(candidates[index].agent_id.clone())
    }

    fn strategy(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::RoundRobin
    }

    fn reset(&self) {
        *self.next.lock() = 0;
    }
}

/// Picks the member with the fewest outstanding leases, earliest on ties
#[derive(Debug, Default)]
pub struct LeastConnectionBalancer;

#[async_trait]
impl LoadBalancer for LeastConnectionBalancer {
    async fn select(&self, candidates: &[Candidate]) -> Option<String> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(index, c)| (c.active_connections, *index))
            .map(|(_, c)| c.agent_id.clone())
    }

    fn strategy(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::LeastConnection
    }

    fn reset(&self) {}
}

#[derive(Debug, Default)]
struct WeightedCursor {
    last_index: Option<usize>,
    current_weight: i64,
}

/// Interleaved weighted round robin stepping by the GCD of the weights
#[derive(Debug, Default)]
pub struct WeightedBalancer {
    cursor: Mutex<WeightedCursor>,
}

impl WeightedBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

#[async_trait]
impl LoadBalancer for WeightedBalancer {
    async fn select(&self, candidates: &[Candidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let weights: Vec<u32> = candidates.iter().map(|c| c.weight.max(1)).collect();
        let max_weight = weights.iter().copied().max().unwrap_or(1) as i64;
        let step = weights.iter().copied().fold(0, gcd).max(1) as i64;

        let mut cursor = self.cursor.lock();
        loop {
            let index = cursor
                .last_index
                .map(|last| (last + 1) % candidates.len())
                .unwrap_or(0);
            cursor.last_index = Some(index);

            if index == 0 {
                cursor.current_weight -= step;
                if cursor.current_weight <= 0 {
                    cursor.current_weight = max_weight;
                }
            }

            if weights[index] as i64 >= cursor.current_weight {
                return Some(candidates[index].agent_id.clone());
            }
        }
    }

    fn strategy(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::Weighted
    }

    fn reset(&self) {
        *self.cursor.lock() = WeightedCursor::default();
    }
}

/// Uniform random choice
#[derive(Debug, Default)]
pub struct RandomBalancer;

#[async_trait]
impl LoadBalancer for RandomBalancer {
    async fn select(&self, candidates: &[Candidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[index].agent_id.clone())
    }

    fn strategy(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::Random
    }

    fn reset(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn candidate(id: &str, weight: u32, connections: usize) -> Candidate {
        Candidate {
            agent_id: id.to_string(),
            weight,
            active_connections: connections,
        }
    }

    #[tokio::test]
    async fn test_round_robin_cycles_in_order() {
        let balancer = RoundRobinBalancer::new();
        let candidates = vec![candidate("a", 1, 0), candidate("b", 1, 0), candidate("c", 1, 0)];

        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(balancer.select(&candidates).await.unwrap());
        }
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);

        assert!(balancer.select(&[]).await.is_none());
    }

    #[tokio::test]
    async fn test_least_connection_prefers_idle() {
        let balancer = LeastConnectionBalancer;
        let candidates = vec![candidate("a", 1, 3), candidate("b", 1, 1), candidate("c", 1, 1)];
        assert_eq!(balancer.select(&candidates).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_weighted_distribution() {
        let balancer = WeightedBalancer::new();
        let candidates = vec![candidate("heavy", 3, 0), candidate("light", 1, 0)];

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..40 {
            let id = balancer.select(&candidates).await.unwrap();
            *counts.entry(id).or_insert(0) += 1;
        }
        assert_eq!(counts["heavy"], 30);
        assert_eq!(counts["light"], 10);
    }

    #[tokio::test]
    async fn test_weighted_handles_shrinking_candidates() {
        let balancer = WeightedBalancer::new();
        let three = vec![candidate("a", 2, 0), candidate("b", 2, 0), candidate("c", 2, 0)];
        for _ in 0..5 {
            balancer.select(&three).await.unwrap();
        }
        let one = vec![candidate("a", 2, 0)];
        assert_eq!(balancer.select(&one).await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_random_stays_within_candidates() {
        let balancer = create_load_balancer(LoadBalancingStrategy::Random);
        assert_eq!(balancer.strategy(), LoadBalancingStrategy::Random);

        let candidates = vec![candidate("a", 1, 0), candidate("b", 1, 0)];
        for _ in 0..20 {
            let id = balancer.select(&candidates).await.unwrap();
            assert!(id == "a" || id == "b");
        }
    }
}
