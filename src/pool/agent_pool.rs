//! A single agent pool
//!
//! All membership mutations, including those made by the health and
//! scaling loops, go through one async lock per pool so that no two
//! scaling decisions for the same pool overlap.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    autoscaler::{load_percent, AutoScaler, ScalingDecision, ScalingInput},
    generate_pool_id,
    health::{apply_check, HealthReport, MemberCheck},
    load_balancer::{create_load_balancer, Candidate, LoadBalancer},
    normalize_weight, PoolConfig, PoolInfo, PoolMember, PoolMetrics, PoolStatus, RequestOutcome,
    ResourceUtilization,
};
use crate::{
    error::{AppError, AppResult},
    runtime::{Agent, AgentSpec, RuntimeManager},
};

#[derive(Debug, Default)]
struct RequestStats {
    total: u64,
    active: u64,
    failed: u64,
    responses: u64,
    total_response_ms: f64,
    recent_failures: u64,
}

struct PoolState {
    config: PoolConfig,
    status: PoolStatus,
    members: IndexMap<String, PoolMember>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    stats: RequestStats,
    balancer: Box<dyn LoadBalancer>,
    scaler: AutoScaler,
}

/// Outstanding work and capacity of the current members
#[derive(Debug, Default)]
struct MemberLoad {
    running: usize,
    pending: usize,
    capacity: usize,
    active_agents: usize,
    cpu_millicores: u64,
    memory_mb: u64,
    /// (agent id, outstanding tasks) per live member
    per_member: Vec<(String, usize)>,
}

/// A named group of agents sharing balancing and scaling policy
pub struct AgentPool {
    id: String,
    runtime: Arc<RuntimeManager>,
    state: tokio::sync::Mutex<PoolState>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentPool {
    /// `config` must already be validated
    pub(crate) fn new(config: PoolConfig, runtime: Arc<RuntimeManager>) -> Self {
        let now = runtime.clock().now();
        let balancer = create_load_balancer(config.load_balancing_strategy);

        Self {
            id: generate_pool_id(),
            runtime,
            state: tokio::sync::Mutex::new(PoolState {
                config,
                status: PoolStatus::Active,
                members: IndexMap::new(),
                created_at: now,
                updated_at: now,
                stats: RequestStats::default(),
                balancer,
                scaler: AutoScaler::new(),
            }),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild a pool from its stored record.
    ///
    /// Members whose agent is no longer registered are dropped; the health
    /// cycle replenishes them. Owned members of an active pool are started
    /// again. Lease counters and request statistics start from zero.
    pub(crate) async fn restore(info: PoolInfo, runtime: Arc<RuntimeManager>) -> Self {
        let now = runtime.clock().now();
        let mut members = IndexMap::new();

        for mut member in info.members {
            let Ok(agent) = runtime.get_agent(&member.agent_id).await else {
                warn!("Pool {} lost member {} while offline", info.id, member.agent_id);
                continue;
            };
            if member.owned && info.status == PoolStatus::Active && !agent.state().is_active() {
                if let Err(e) = runtime.start_agent(agent.id()).await {
                    warn!("Could not restart pool member {}: {}", agent.id(), e);
                }
            }
            member.active_connections = 0;
            member.healthy = true;
            member.unhealthy_since = None;
            member.last_health_check = now;
            members.insert(member.agent_id.clone(), member);
        }

        let balancer = create_load_balancer(info.config.load_balancing_strategy);
        Self {
            id: info.id,
            runtime,
            state: tokio::sync::Mutex::new(PoolState {
                config: info.config,
                status: info.status,
                members,
                created_at: info.created_at,
                updated_at: now,
                stats: RequestStats::default(),
                balancer,
                scaler: AutoScaler::new(),
            }),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn now(&self) -> DateTime<Utc> {
        self.runtime.clock().now()
    }

    fn info_locked(&self, state: &PoolState) -> PoolInfo {
        PoolInfo {
            id: self.id.clone(),
            config: state.config.clone(),
            status: state.status,
            members: state.members.values().cloned().collect(),
            created_at: state.created_at,
            updated_at: state.updated_at,
            last_scaling_at: state.scaler.last_action(),
        }
    }

    pub async fn info(&self) -> PoolInfo {
        let state = self.state.lock().await;
        self.info_locked(&state)
    }

    pub async fn status(&self) -> PoolStatus {
        self.state.lock().await.status
    }

    pub async fn config(&self) -> PoolConfig {
        self.state.lock().await.config.clone()
    }

    pub async fn members(&self) -> Vec<PoolMember> {
        self.state.lock().await.members.values().cloned().collect()
    }

    pub async fn has_member(&self, agent_id: &str) -> bool {
        self.state.lock().await.members.contains_key(agent_id)
    }

    async fn persist_locked(&self, state: &PoolState) -> AppResult<()> {
        self.runtime.store().save_pool(&self.info_locked(state)).await
    }

    async fn persist_logged(&self, state: &PoolState) {
        if let Err(e) = self.persist_locked(state).await {
            warn!("Failed to persist pool {}: {}", self.id, e);
        }
    }

    fn add_member_locked(
        &self,
        state: &mut PoolState,
        agent: &Agent,
        weight: u32,
        owned: bool,
    ) -> AppResult<()> {
        if !state.status.accepts_members() {
            return Err(AppError::invalid_transition(
                &self.id,
                state.status,
                "accepting members",
            ));
        }
        if state.members.len() >= state.config.max_agents {
            return Err(AppError::capacity(format!(
                "pool {} at maximum capacity ({} agents)",
                self.id, state.config.max_agents
            )));
        }
        if state.members.contains_key(agent.id()) {
            return Err(AppError::validation(format!(
                "agent {} already in pool {}",
                agent.id(),
                self.id
            )));
        }

        let now = self.now();
        let weight = normalize_weight(weight);
        state.members.insert(
            agent.id().to_string(),
            PoolMember {
                agent_id: agent.id().to_string(),
                weight,
                joined_at: now,
                active_connections: 0,
                healthy: true,
                unhealthy_since: None,
                last_health_check: now,
                owned,
            },
        );
        state.updated_at = now;

        info!(
            "Added agent {} to pool {} (weight {}, total {})",
            agent.id(),
            self.id,
            weight,
            state.members.len()
        );
        Ok(())
    }

    /// Create, start and register one agent from the template
    async fn provision_locked(&self, state: &mut PoolState) -> AppResult<String> {
        if state.members.len() >= state.config.max_agents {
            return Err(AppError::capacity(format!(
                "pool {} at maximum capacity ({} agents)",
                self.id, state.config.max_agents
            )));
        }

        let template = state.config.template.clone();
        let name = format!("{}-{}", state.config.name, state.members.len() + 1);
        let mut spec = AgentSpec::new(name, template.agent_type).with_metadata("pool_id", &self.id);
        if let Some(config) = template.config {
            spec = spec.with_config(config);
        }

        let agent = self.runtime.create_agent(spec).await?;
        if let Err(e) = self.runtime.start_agent(agent.id()).await {
            self.discard(agent.id()).await;
            return Err(e);
        }
        if let Err(e) = self.add_member_locked(state, &agent, template.weight, true) {
            self.discard(agent.id()).await;
            return Err(e);
        }

        Ok(agent.id().to_string())
    }

    async fn discard(&self, agent_id: &str) {
        match self.runtime.delete_agent(agent_id).await {
            Ok(()) | Err(AppError::NotFound { .. }) => {}
            Err(e) => warn!("Failed to delete pool agent {}: {}", agent_id, e),
        }
    }

    /// Release a departed member; agents the pool created are deleted
    async fn retire(&self, member: &PoolMember) {
        if member.active_connections > 0 {
            warn!(
                "Agent {} left pool {} with {} active connections",
                member.agent_id, self.id, member.active_connections
            );
        }
        if member.owned {
            self.discard(&member.agent_id).await;
        }
    }

    /// Bring membership up to `min_agents`; returns the new agent IDs
    async fn replenish_locked(&self, state: &mut PoolState) -> Vec<String> {
        let mut created = Vec::new();
        while state.members.len() < state.config.min_agents {
            match self.provision_locked(state).await {
                Ok(agent_id) => created.push(agent_id),
                Err(e) => {
                    error!("Pool {} could not reach min_agents: {}", self.id, e);
                    break;
                }
            }
        }
        created
    }

    /// Initial provisioning at creation; all or nothing
    pub(crate) async fn provision_minimum(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        while state.members.len() < state.config.min_agents {
            if let Err(e) = self.provision_locked(&mut state).await {
                let members: Vec<PoolMember> = state.members.drain(..).map(|(_, m)| m).collect();
                for member in &members {
                    self.retire(member).await;
                }
                return Err(e);
            }
        }
        self.persist_locked(&state).await
    }

    pub async fn add_agent(&self, agent_id: &str, weight: u32) -> AppResult<()> {
        let agent = self.runtime.get_agent(agent_id).await?;
        let mut state = self.state.lock().await;
        self.add_member_locked(&mut state, &agent, weight, false)?;
        self.persist_logged(&state).await;
        Ok(())
    }

    /// Remove a member; refused when it would drop the pool below `min_agents`
    pub async fn remove_agent(&self, agent_id: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if !state.members.contains_key(agent_id) {
            return Err(AppError::not_found("pool member", agent_id));
        }
        if state.members.len() <= state.config.min_agents {
            return Err(AppError::validation(format!(
                "removing {} would drop pool {} below min_agents ({})",
                agent_id, self.id, state.config.min_agents
            )));
        }

        if let Some(member) = state.members.shift_remove(agent_id) {
            state.updated_at = self.now();
            self.retire(&member).await;
            info!("Removed agent {} from pool {}", agent_id, self.id);
        }
        self.persist_logged(&state).await;
        Ok(())
    }

    /// Lease a member chosen by the load balancer
    pub async fn lease(&self) -> AppResult<Arc<Agent>> {
        let mut state = self.state.lock().await;
        if state.status != PoolStatus::Active {
            return Err(AppError::invalid_transition(
                &self.id,
                state.status,
                "leasing agents",
            ));
        }

        let candidates: Vec<Candidate> = state
            .members
            .values()
            .filter(|m| m.healthy)
            .map(|m| Candidate {
                agent_id: m.agent_id.clone(),
                weight: m.weight,
                active_connections: m.active_connections,
            })
            .collect();

        let selected = state.balancer.select(&candidates).await.ok_or_else(|| {
            AppError::capacity(format!("no healthy agents available in pool {}", self.id))
        })?;
        let agent = self.runtime.get_agent(&selected).await?;

        if let Some(member) = state.members.get_mut(&selected) {
            member.active_connections += 1;
        }
        state.stats.total += 1;
        state.stats.active += 1;

        debug!(
            "Pool {} leased agent {} ({})",
            self.id,
            selected,
            state.balancer.strategy()
        );
        Ok(agent)
    }

    /// Return a leased member and record the request outcome
    pub async fn release(&self, agent_id: &str, outcome: RequestOutcome) -> AppResult<()> {
        let mut state = self.state.lock().await;
        let member = state
            .members
            .get_mut(agent_id)
            .ok_or_else(|| AppError::not_found("pool member", agent_id))?;
        member.active_connections = member.active_connections.saturating_sub(1);

        let stats = &mut state.stats;
        stats.active = stats.active.saturating_sub(1);
        stats.responses += 1;
        stats.total_response_ms += outcome.response_time.as_secs_f64() * 1000.0;
        if !outcome.success {
            stats.failed += 1;
            stats.recent_failures += 1;
        }
        Ok(())
    }

    pub async fn pause(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.status != PoolStatus::Active {
            return Err(AppError::invalid_transition(&self.id, state.status, PoolStatus::Paused));
        }
        state.status = PoolStatus::Paused;
        state.updated_at = self.now();
        self.persist_logged(&state).await;
        info!("Paused pool {}", self.id);
        Ok(())
    }

    pub async fn resume(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.status != PoolStatus::Paused {
            return Err(AppError::invalid_transition(&self.id, state.status, PoolStatus::Active));
        }
        state.status = PoolStatus::Active;
        state.updated_at = self.now();
        self.persist_logged(&state).await;
        info!("Resumed pool {}", self.id);
        Ok(())
    }

    /// Replace the configuration; `config` must already be validated
    pub async fn update_config(&self, config: PoolConfig) -> AppResult<PoolInfo> {
        let mut state = self.state.lock().await;
        if state.members.len() > config.max_agents {
            return Err(AppError::validation(format!(
                "cannot reduce max_agents below current pool size ({})",
                state.members.len()
            )));
        }

        if config.load_balancing_strategy != state.config.load_balancing_strategy {
            state.balancer = create_load_balancer(config.load_balancing_strategy);
        }
        state.config = config;
        state.updated_at = self.now();

        info!(
            "Updated pool {} configuration (strategy {}, min {}, max {})",
            self.id,
            state.config.load_balancing_strategy,
            state.config.min_agents,
            state.config.max_agents
        );
        self.persist_logged(&state).await;
        Ok(self.info_locked(&state))
    }

    async fn member_load(&self, state: &PoolState) -> MemberLoad {
        let mut load = MemberLoad::default();
        for agent_id in state.members.keys() {
            let Ok(agent) = self.runtime.get_agent(agent_id).await else {
                continue;
            };
            let (running, pending) = agent.load();
            load.running += running;
            load.pending += pending;
            load.capacity += agent.config().max_concurrent_tasks;
            load.cpu_millicores += agent.config().resources.cpu_millicores as u64;
            load.memory_mb += agent.config().resources.memory_mb as u64;
            if agent.state().is_active() {
                load.active_agents += 1;
            }
            load.per_member.push((agent_id.clone(), running + pending));
        }
        load
    }

    pub async fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock().await;
        let load = self.member_load(&state).await;
        let limits = &state.config.resource_limits;

        let percent = |used: u64, limit: u64| {
            if limit == 0 {
                0.0
            } else {
                used as f64 / limit as f64 * 100.0
            }
        };

        PoolMetrics {
            pool_id: self.id.clone(),
            total_requests: state.stats.total,
            active_requests: state.stats.active,
            failed_requests: state.stats.failed,
            average_response_time_ms: if state.stats.responses == 0 {
                0.0
            } else {
                state.stats.total_response_ms / state.stats.responses as f64
            },
            total_agents: state.members.len(),
            healthy_agents: state.members.values().filter(|m| m.healthy).count(),
            active_agents: load.active_agents,
            running_tasks: load.running,
            pending_tasks: load.pending,
            recent_failures: state.stats.recent_failures,
            resource_utilization: ResourceUtilization {
                cpu_usage: percent(load.cpu_millicores, limits.total_cpu as u64),
                memory_usage: percent(load.memory_mb, limits.total_memory as u64),
                task_load: load_percent(load.running + load.pending, load.capacity),
            },
            last_updated: Some(self.now()),
        }
    }

    /// MemberCheck every member, evict those past the grace period and replenish
    pub async fn check_health(&self) -> HealthReport {
        let mut state = self.state.lock().await;
        let now = self.now();
        let mut report = HealthReport {
            pool_id: self.id.clone(),
            checked_at: Some(now),
            ..HealthReport::default()
        };
        if !state.status.accepts_members() {
            return report;
        }

        let grace = state.config.unhealthy_grace_period;
        let ids: Vec<String> = state.members.keys().cloned().collect();
        for agent_id in ids {
            let agent = self.runtime.get_agent(&agent_id).await.ok();
            let check = MemberCheck::of(agent.as_deref(), now);
            let evict = match state.members.get_mut(&agent_id) {
                Some(member) => apply_check(member, check, now, grace),
                None => false,
            };
            debug!("Pool {} checked {}: {:?}", self.id, agent_id, check);

            if evict {
                if let Some(member) = state.members.shift_remove(&agent_id) {
                    warn!("Evicting agent {} from pool {} ({:?})", agent_id, self.id, check);
                    self.retire(&member).await;
                    report.evicted.push(agent_id);
                }
            }
        }

        for member in state.members.values() {
            if member.healthy {
                report.healthy += 1;
            } else {
                report.unhealthy.push(member.agent_id.clone());
            }
        }

        if state.status == PoolStatus::Active {
            report.replenished = self.replenish_locked(&mut state).await;
            if !report.replenished.is_empty() {
                state.scaler.record_action(now);
            }
        }

        state.stats.recent_failures = 0;
        if !report.evicted.is_empty() || !report.replenished.is_empty() {
            state.updated_at = now;
        }
        self.persist_logged(&state).await;
        report
    }

    /// Run one auto-scaling step and return the action taken
    pub async fn evaluate_scaling(&self) -> AppResult<ScalingDecision> {
        let mut state = self.state.lock().await;
        if state.status != PoolStatus::Active {
            return Ok(ScalingDecision::Hold);
        }

        let now = self.now();
        let load = self.member_load(&state).await;
        let input = ScalingInput {
            members: state.members.len(),
            min_agents: state.config.min_agents,
            max_agents: state.config.max_agents,
            load_percent: load_percent(load.running + load.pending, load.capacity),
            now,
        };

        let decision = state.scaler.decide(&state.config.auto_scaling, &input);
        match decision {
            ScalingDecision::Hold => return Ok(decision),
            ScalingDecision::ScaleUp => {
                let agent_id = self.provision_locked(&mut state).await?;
                info!(
                    "Pool {} scaled up with {} (load {:.1}%)",
                    self.id, agent_id, input.load_percent
                );
            }
            ScalingDecision::ScaleDown => {
                let victim = load
                    .per_member
                    .iter()
                    .filter_map(|(id, outstanding)| {
                        state
                            .members
                            .get(id)
                            .filter(|m| m.owned)
                            .map(|m| (id.clone(), *outstanding, m.active_connections, m.joined_at))
                    })
                    .min_by(|a, b| (a.1, a.2).cmp(&(b.1, b.2)).then(b.3.cmp(&a.3)))
                    .map(|(id, ..)| id);

                let Some(victim) = victim else {
                    debug!("Pool {} has no owned member to scale down", self.id);
                    return Ok(ScalingDecision::Hold);
                };
                if let Some(member) = state.members.shift_remove(&victim) {
                    self.retire(&member).await;
                }
                info!(
                    "Pool {} scaled down by {} (load {:.1}%)",
                    self.id, victim, input.load_percent
                );
            }
        }

        state.scaler.record_action(now);
        state.updated_at = now;
        self.persist_logged(&state).await;
        Ok(decision)
    }

    /// Stop background loops and take every member out of service
    pub(crate) async fn drain(&self) {
        self.stop_loops();
        let mut state = self.state.lock().await;
        state.status = PoolStatus::Draining;

        let members: Vec<PoolMember> = state.members.drain(..).map(|(_, m)| m).collect();
        for member in &members {
            if member.owned {
                self.discard(&member.agent_id).await;
            } else if let Ok(agent) = self.runtime.get_agent(&member.agent_id).await {
                if agent.state().is_active() {
                    if let Err(e) = self.runtime.stop_agent(&member.agent_id).await {
                        warn!("Failed to stop pool member {}: {}", member.agent_id, e);
                    }
                }
            }
        }

        state.status = PoolStatus::Stopped;
        state.updated_at = self.now();
        info!("Drained pool {} ({} members)", self.id, members.len());
    }

    /// Start the health check and auto-scaling loops
    pub(crate) fn spawn_loops(self: &Arc<Self>, scaling_interval: Duration) {
        let weak = Arc::downgrade(self);
        let health = tokio::spawn(health_loop(weak.clone()));
        let scaling = tokio::spawn(scaling_loop(weak, scaling_interval));

        let mut loops = self.loops.lock();
        for handle in loops.drain(..) {
            handle.abort();
        }
        loops.push(health);
        loops.push(scaling);
    }

    pub(crate) fn stop_loops(&self) {
        for handle in self.loops.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for AgentPool {
    fn drop(&mut self) {
        self.stop_loops();
    }
}

async fn health_loop(weak: Weak<AgentPool>) {
    loop {
        let interval = match weak.upgrade() {
            Some(pool) => pool.config().await.health_check_interval,
            None => break,
        };
        tokio::time::sleep(interval).await;

        let Some(pool) = weak.upgrade() else {
            break;
        };
        let report = pool.check_health().await;
        if !report.unhealthy.is_empty() || !report.evicted.is_empty() {
            warn!(
                "Pool {}: {} unhealthy, {} evicted, {} replenished",
                report.pool_id,
                report.unhealthy.len(),
                report.evicted.len(),
                report.replenished.len()
            );
        }
    }
}

async fn scaling_loop(weak: Weak<AgentPool>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(pool) = weak.upgrade() else {
            break;
        };
        if let Err(e) = pool.evaluate_scaling().await {
            error!("Auto-scaling step for pool {} failed: {}", pool.id(), e);
        }
    }
}
