//! Pool member health checks and eviction
//!
//! Members are checked through the agent's own lifecycle state and
//! heartbeat. An unhealthy member stops receiving leases immediately
//! but is evicted only once it has stayed unhealthy for the grace
//! period; a member whose agent no longer exists is evicted at once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::PoolMember;
use crate::runtime::{Agent, AgentState};

/// Result of checking one member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberCheck {
    Healthy,
    Unhealthy,
    /// The agent is no longer registered with the runtime
    Missing,
}

impl MemberCheck {
    /// Running with a fresh heartbeat
    pub fn of(agent: Option<&Agent>, now: DateTime<Utc>) -> Self {
        match agent {
            None => MemberCheck::Missing,
            Some(agent) if agent.state() == AgentState::Running && agent.is_healthy_at(now) => {
                MemberCheck::Healthy
            }
            Some(_) => MemberCheck::Unhealthy,
        }
    }
}

/// Record a check on a member; returns true when the member should be evicted
pub fn apply_check(
    member: &mut PoolMember,
    check: MemberCheck,
    now: DateTime<Utc>,
    grace: Duration,
) -> bool {
    member.last_health_check = now;
    match check {
        MemberCheck::Healthy => {
            member.healthy = true;
            member.unhealthy_since = None;
            false
        }
        MemberCheck::Unhealthy => {
            member.healthy = false;
            let since = *member.unhealthy_since.get_or_insert(now);
            let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::max_value());
            now - since >= grace
        }
        MemberCheck::Missing => {
            member.healthy = false;
            member.unhealthy_since.get_or_insert(now);
            true
        }
    }
}

/// Outcome of one health check cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub pool_id: String,
    pub checked_at: Option<DateTime<Utc>>,
    pub healthy: usize,
    pub unhealthy: Vec<String>,
    pub evicted: Vec<String>,
    /// Agents created to bring the pool back to its minimum
    pub replenished: Vec<String>,
}
