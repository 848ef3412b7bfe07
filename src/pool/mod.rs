//! Agent pools
//!
//! A pool groups agents under one load-balancing and scaling policy.
//! Membership is mutated only through the owning [`AgentPool`], whose
//! health and scaling loops are serialized against admin operations.

pub mod agent_pool;
pub mod autoscaler;
pub mod health;
pub mod load_balancer;
pub mod manager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    runtime::AgentConfig,
};

pub use agent_pool::AgentPool;
pub use autoscaler::{AutoScaler, ScalingDecision, ScalingInput};
pub use health::{HealthReport, MemberCheck};
pub use load_balancer::{create_load_balancer, Candidate, LoadBalancer};
pub use manager::{PoolManager, PoolManagerConfig};

/// Generate a new pool identifier
pub fn generate_pool_id() -> String {
    format!("pool-{}", Uuid::new_v4())
}

/// How the next unit of work picks a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnection,
    Weighted,
    Random,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::LeastConnection => "least_connection",
            LoadBalancingStrategy::Weighted => "weighted",
            LoadBalancingStrategy::Random => "random",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Active,
    Paused,
    Draining,
    Stopped,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Active => "active",
            PoolStatus::Paused => "paused",
            PoolStatus::Draining => "draining",
            PoolStatus::Stopped => "stopped",
        }
    }

    /// Membership may still be changed by admin calls
    pub fn accepts_members(&self) -> bool {
        matches!(self, PoolStatus::Active | PoolStatus::Paused)
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate limits used for utilization accounting; zero means unbounded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU in millicores across all members
    pub total_cpu: u32,
    /// Memory in megabytes across all members
    pub total_memory: u32,
    pub max_concurrent_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScalingConfig {
    pub enabled: bool,
    /// Task load percentage at or above which the pool grows
    pub scale_up_threshold: f64,
    /// Task load percentage at or below which the pool shrinks
    pub scale_down_threshold: f64,
    /// Minimum time between two scaling actions
    pub cooldown_period: Duration,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scale_up_threshold: 80.0,
            scale_down_threshold: 20.0,
            cooldown_period: Duration::from_secs(300),
        }
    }
}

/// Blueprint for agents the pool creates itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTemplate {
    pub agent_type: String,
    /// Unset fields fall back to the runtime's agent defaults
    pub config: Option<AgentConfig>,
    pub weight: u32,
}

impl Default for AgentTemplate {
    fn default() -> Self {
        Self {
            agent_type: "worker".to_string(),
            config: None,
            weight: 1,
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub description: String,
    pub load_balancing_strategy: LoadBalancingStrategy,
    pub min_agents: usize,
    pub max_agents: usize,
    /// Zero selects the manager default
    pub health_check_interval: Duration,
    /// How long a member may stay unhealthy before eviction; zero selects the manager default
    pub unhealthy_grace_period: Duration,
    pub resource_limits: ResourceLimits,
    pub auto_scaling: AutoScalingConfig,
    pub template: AgentTemplate,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            load_balancing_strategy: LoadBalancingStrategy::RoundRobin,
            min_agents: 0,
            max_agents: 10,
            health_check_interval: Duration::ZERO,
            unhealthy_grace_period: Duration::ZERO,
            resource_limits: ResourceLimits::default(),
            auto_scaling: AutoScalingConfig::default(),
            template: AgentTemplate::default(),
        }
    }
}

impl PoolConfig {
    pub fn new<S: Into<String>>(name: S, min_agents: usize, max_agents: usize) -> Self {
        Self {
            name: name.into(),
            min_agents,
            max_agents,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.load_balancing_strategy = strategy;
        self
    }

    pub fn with_auto_scaling(mut self, auto_scaling: AutoScalingConfig) -> Self {
        self.auto_scaling = auto_scaling;
        self
    }

    pub fn with_template(mut self, template: AgentTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_unhealthy_grace_period(mut self, grace: Duration) -> Self {
        self.unhealthy_grace_period = grace;
        self
    }

    /// Check limits and fill unset intervals
    pub fn validated(
        mut self,
        default_health_interval: Duration,
        default_grace: Duration,
    ) -> AppResult<Self> {
        if self.name.trim().is_empty() {
            return Err(AppError::validation("pool name cannot be empty"));
        }
        if self.max_agents == 0 {
            return Err(AppError::validation("max_agents must be greater than 0"));
        }
        if self.min_agents > self.max_agents {
            return Err(AppError::validation(format!(
                "invalid agent limits: min={}, max={}",
                self.min_agents, self.max_agents
            )));
        }
        if self.auto_scaling.enabled
            && self.auto_scaling.scale_down_threshold >= self.auto_scaling.scale_up_threshold
        {
            return Err(AppError::validation(
                "scale_down_threshold must be below scale_up_threshold",
            ));
        }
        if self.template.agent_type.trim().is_empty() {
            return Err(AppError::validation("agent template type cannot be empty"));
        }

        if self.health_check_interval.is_zero() {
            self.health_check_interval = default_health_interval;
        }
        if self.unhealthy_grace_period.is_zero() {
            self.unhealthy_grace_period = default_grace;
        }
        self.template.weight = normalize_weight(self.template.weight);
        Ok(self)
    }
}

/// Weights outside 1..=100 fall back to 1
pub fn normalize_weight(weight: u32) -> u32 {
    if (1..=100).contains(&weight) {
        weight
    } else {
        1
    }
}

/// An agent's membership record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMember {
    pub agent_id: String,
    /// Weighted balancing share, 1..=100
    pub weight: u32,
    pub joined_at: DateTime<Utc>,
    /// Leases not yet released
    pub active_connections: usize,
    pub healthy: bool,
    pub unhealthy_since: Option<DateTime<Utc>>,
    pub last_health_check: DateTime<Utc>,
    /// Created by the pool, and deleted when it leaves
    pub owned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub task_load: f64,
}

/// Pool-level snapshot aggregated from members
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub pool_id: String,
    pub total_requests: u64,
    pub active_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub active_agents: usize,
    pub running_tasks: usize,
    pub pending_tasks: usize,
    /// Failed releases since the previous health check
    pub recent_failures: u64,
    pub resource_utilization: ResourceUtilization,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Outcome reported when a leased agent is released
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub success: bool,
    pub response_time: Duration,
}

impl RequestOutcome {
    pub fn success(response_time: Duration) -> Self {
        Self {
            success: true,
            response_time,
        }
    }

    pub fn failure(response_time: Duration) -> Self {
        Self {
            success: false,
            response_time,
        }
    }
}

/// Serializable pool snapshot, also the persisted record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInfo {
    pub id: String,
    pub config: PoolConfig,
    pub status: PoolStatus,
    pub members: Vec<PoolMember>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_scaling_at: Option<DateTime<Utc>>,
}
