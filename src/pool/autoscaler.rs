//! Auto-scaling decisions
//!
//! The decision is a pure function of the pool's load, its bounds and
//! the time of the last scaling action. Any action, including
//! replenishment to the minimum, opens a cooldown window in which no
//! further automatic action is taken, so two opposite-direction actions
//! can never fall inside one window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AutoScalingConfig;

/// What the control loop should do this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDecision {
    Hold,
    ScaleUp,
    ScaleDown,
}

/// Pool state the decision is computed from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingInput {
    pub members: usize,
    pub min_agents: usize,
    pub max_agents: usize,
    /// Outstanding tasks over total member concurrency, in percent
    pub load_percent: f64,
    pub now: DateTime<Utc>,
}

/// Task load in percent; an empty pool with queued work counts as saturated
pub fn load_percent(outstanding: usize, capacity: usize) -> f64 {
    if capacity == 0 {
        return if outstanding > 0 { 100.0 } else { 0.0 };
    }
    outstanding as f64 / capacity as f64 * 100.0
}

/// Per-pool cooldown state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoScaler {
    last_action: Option<DateTime<Utc>>,
}

impl AutoScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_action(&self) -> Option<DateTime<Utc>> {
        self.last_action
    }

    pub fn record_action(&mut self, at: DateTime<Utc>) {
        self.last_action = Some(at);
    }

    pub fn in_cooldown(&self, config: &AutoScalingConfig, now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_action else {
            return false;
        };
        let cooldown = chrono::Duration::from_std(config.cooldown_period)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        now - last < cooldown
    }

    pub fn decide(&self, config: &AutoScalingConfig, input: &ScalingInput) -> ScalingDecision {
        if !config.enabled || self.in_cooldown(config, input.now) {
            return ScalingDecision::Hold;
        }

        if input.load_percent >= config.scale_up_threshold && input.members < input.max_agents {
            ScalingDecision::ScaleUp
        } else if input.load_percent <= config.scale_down_threshold
            && input.members > input.min_agents
        {
            ScalingDecision::ScaleDown
        } else {
            ScalingDecision::Hold
        }
    }
}
