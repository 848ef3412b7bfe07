//! Pool Manager
//!
//! Registry of pools keyed by ID. Creation is serialized so that name
//! uniqueness and the `max_pools` bound hold while the minimum members
//! are being provisioned.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{
    agent_pool::AgentPool, autoscaler::ScalingDecision, health::HealthReport, PoolConfig,
    PoolInfo, PoolMember, PoolMetrics, PoolStatus, RequestOutcome,
};
use crate::{
    error::{AppError, AppResult},
    runtime::{Agent, RuntimeManager},
};

/// Pool Manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolManagerConfig {
    pub max_pools: usize,
    /// Used when a pool leaves its health interval unset
    pub default_health_check_interval: Duration,
    /// Used when a pool leaves its eviction grace unset
    pub default_unhealthy_grace_period: Duration,
    /// Period of each pool's auto-scaling loop
    pub scaling_interval: Duration,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            max_pools: 50,
            default_health_check_interval: Duration::from_secs(30),
            default_unhealthy_grace_period: Duration::from_secs(60),
            scaling_interval: Duration::from_secs(30),
        }
    }
}

pub struct PoolManager {
    runtime: Arc<RuntimeManager>,
    config: PoolManagerConfig,
    pools: RwLock<HashMap<String, Arc<AgentPool>>>,
    /// Pool name to pool ID
    names: Mutex<HashMap<String, String>>,
    creation: tokio::sync::Mutex<()>,
}

impl PoolManager {
    pub fn new(runtime: Arc<RuntimeManager>, config: PoolManagerConfig) -> Self {
        info!(
            "Initializing Pool Manager (max_pools: {}, scaling interval: {:?})",
            config.max_pools, config.scaling_interval
        );
        Self {
            runtime,
            config,
            pools: RwLock::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
            creation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PoolManagerConfig {
        &self.config
    }

    fn validate(&self, config: PoolConfig) -> AppResult<PoolConfig> {
        config.validated(
            self.config.default_health_check_interval,
            self.config.default_unhealthy_grace_period,
        )
    }

    /// Create a pool and provision its minimum members
    pub async fn create_pool(&self, config: PoolConfig) -> AppResult<PoolInfo> {
        let config = self.validate(config)?;
        let _creating = self.creation.lock().await;

        if self.names.lock().contains_key(&config.name) {
            return Err(AppError::validation(format!(
                "pool name '{}' already exists",
                config.name
            )));
        }
        if self.pools.read().await.len() >= self.config.max_pools {
            return Err(AppError::capacity(format!(
                "pool limit reached ({})",
                self.config.max_pools
            )));
        }

        let name = config.name.clone();
        let pool = Arc::new(AgentPool::new(config, Arc::clone(&self.runtime)));
        if let Err(e) = pool.provision_minimum().await {
            warn!("Provisioning pool '{}' failed: {}", name, e);
            pool.drain().await;
            if let Err(e) = self.runtime.store().delete_pool(pool.id()).await {
                warn!("Failed to delete pool record {}: {}", pool.id(), e);
            }
            return Err(e);
        }

        self.pools
            .write()
            .await
            .insert(pool.id().to_string(), Arc::clone(&pool));
        self.names.lock().insert(name.clone(), pool.id().to_string());
        pool.spawn_loops(self.config.scaling_interval);

        let info = pool.info().await;
        info!(
            "Created pool {} ('{}', strategy {}, {} members)",
            info.id,
            name,
            info.config.load_balancing_strategy,
            info.members.len()
        );
        Ok(info)
    }

    /// Re-register pools recorded in the store and restart their loops.
    ///
    /// Run after [`RuntimeManager::restore_from_store`] so members can be
    /// found. Pools that were draining, clash with a registered name or
    /// exceed `max_pools` are skipped. Returns the number restored.
    pub async fn restore_from_store(&self) -> AppResult<usize> {
        let mut records = self.runtime.store().list_pools().await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let _creating = self.creation.lock().await;
        let mut restored = 0;
        for record in records {
            if !record.status.accepts_members() {
                debug!("Not restoring pool {} ({})", record.id, record.status);
                continue;
            }
            if self.pools.read().await.contains_key(&record.id) {
                continue;
            }
            if self.names.lock().contains_key(&record.config.name) {
                warn!("Not restoring pool {}: name '{}' in use", record.id, record.config.name);
                continue;
            }
            if self.pools.read().await.len() >= self.config.max_pools {
                warn!("Pool limit reached ({}); not restoring {}", self.config.max_pools, record.id);
                continue;
            }

            let name = record.config.name.clone();
            let pool = Arc::new(AgentPool::restore(record, Arc::clone(&self.runtime)).await);
            self.pools
                .write()
                .await
                .insert(pool.id().to_string(), Arc::clone(&pool));
            self.names.lock().insert(name, pool.id().to_string());
            pool.spawn_loops(self.config.scaling_interval);
            restored += 1;
        }

        info!("Restored {} pool(s) from store", restored);
        Ok(restored)
    }

    pub async fn pool(&self, pool_id: &str) -> AppResult<Arc<AgentPool>> {
        self.pools
            .read()
            .await
            .get(pool_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("pool", pool_id))
    }

    pub async fn get_pool(&self, pool_id: &str) -> AppResult<PoolInfo> {
        Ok(self.pool(pool_id).await?.info().await)
    }

    /// Pools ordered by creation time, optionally filtered by status
    pub async fn list_pools(&self, status: Option<PoolStatus>) -> Vec<PoolInfo> {
        let pools: Vec<Arc<AgentPool>> = self.pools.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(pools.len());
        for pool in pools {
            let info = pool.info().await;
            if status.map_or(true, |s| s == info.status) {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Drain and deregister a pool
    pub async fn delete_pool(&self, pool_id: &str) -> AppResult<()> {
        let pool = self
            .pools
            .write()
            .await
            .remove(pool_id)
            .ok_or_else(|| AppError::not_found("pool", pool_id))?;
        self.names.lock().retain(|_, id| id != pool_id);

        pool.drain().await;
        if let Err(e) = self.runtime.store().delete_pool(pool_id).await {
            warn!("Failed to delete pool record {}: {}", pool_id, e);
        }
        info!("Deleted pool {}", pool_id);
        Ok(())
    }

    pub async fn get_pool_metrics(&self, pool_id: &str) -> AppResult<PoolMetrics> {
        Ok(self.pool(pool_id).await?.metrics().await)
    }

    pub async fn add_agent_to_pool(&self, pool_id: &str, agent_id: &str, weight: u32) -> AppResult<()> {
        self.pool(pool_id).await?.add_agent(agent_id, weight).await
    }

    pub async fn remove_agent_from_pool(&self, pool_id: &str, agent_id: &str) -> AppResult<()> {
        self.pool(pool_id).await?.remove_agent(agent_id).await
    }

    /// Lease a member according to the pool's balancing strategy
    pub async fn get_agent_from_pool(&self, pool_id: &str) -> AppResult<Arc<Agent>> {
        self.pool(pool_id).await?.lease().await
    }

    pub async fn release_agent(
        &self,
        pool_id: &str,
        agent_id: &str,
        outcome: RequestOutcome,
    ) -> AppResult<()> {
        self.pool(pool_id).await?.release(agent_id, outcome).await
    }

    pub async fn update_pool_config(&self, pool_id: &str, config: PoolConfig) -> AppResult<PoolInfo> {
        let config = self.validate(config)?;
        let pool = self.pool(pool_id).await?;
        let _updating = self.creation.lock().await;

        {
            let names = self.names.lock();
            if let Some(owner) = names.get(&config.name) {
                if owner != pool_id {
                    return Err(AppError::validation(format!(
                        "pool name '{}' already exists",
                        config.name
                    )));
                }
            }
        }

        let name = config.name.clone();
        let info = pool.update_config(config).await?;
        let mut names = self.names.lock();
        names.retain(|_, id| id != pool_id);
        names.insert(name, pool_id.to_string());
        Ok(info)
    }

    pub async fn pause_pool(&self, pool_id: &str) -> AppResult<()> {
        self.pool(pool_id).await?.pause().await
    }

    pub async fn resume_pool(&self, pool_id: &str) -> AppResult<()> {
        self.pool(pool_id).await?.resume().await
    }

    /// Pools the agent is a member of
    pub async fn get_agent_pools(&self, agent_id: &str) -> Vec<PoolInfo> {
        let pools: Vec<Arc<AgentPool>> = self.pools.read().await.values().cloned().collect();
        let mut infos = Vec::new();
        for pool in pools {
            if pool.has_member(agent_id).await {
                infos.push(pool.info().await);
            }
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub async fn get_pool_members(&self, pool_id: &str) -> AppResult<Vec<PoolMember>> {
        Ok(self.pool(pool_id).await?.members().await)
    }

    /// Run one health check cycle now
    pub async fn check_pool_health(&self, pool_id: &str) -> AppResult<HealthReport> {
        Ok(self.pool(pool_id).await?.check_health().await)
    }

    /// Run one auto-scaling step now
    pub async fn evaluate_scaling(&self, pool_id: &str) -> AppResult<ScalingDecision> {
        self.pool(pool_id).await?.evaluate_scaling().await
    }

    /// Stop every pool's background loops; members are left running
    pub async fn shutdown(&self) {
        let pools = self.pools.read().await;
        for pool in pools.values() {
            pool.stop_loops();
        }
        info!("Pool Manager stopped ({} pools)", pools.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pool::{AgentTemplate, AutoScalingConfig, LoadBalancingStrategy},
        runtime::{
            AgentConfig, AgentSpec, AgentState, HandlerRegistry, InMemoryStore, ManagerConfig,
            ManualClock, StateStore, TaskSpec,
        },
    };
    use serde_json::json;

    fn runtime_with_clock(clock: Arc<ManualClock>) -> Arc<RuntimeManager> {
        Arc::new(RuntimeManager::with_components(
            ManagerConfig {
                shutdown_timeout: Duration::from_secs(2),
                ..ManagerConfig::default()
            },
            Arc::new(HandlerRegistry::with_builtin_handlers()),
            Arc::new(InMemoryStore::new()),
            clock,
        ))
    }

    fn setup() -> (Arc<RuntimeManager>, PoolManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let runtime = runtime_with_clock(Arc::clone(&clock));
        let manager = PoolManager::new(
            Arc::clone(&runtime),
            PoolManagerConfig {
                // keep background loops out of the way of the assertions
                scaling_interval: Duration::from_secs(3600),
                default_health_check_interval: Duration::from_secs(3600),
                ..PoolManagerConfig::default()
            },
        );
        (runtime, manager, clock)
    }

    #[tokio::test]
    async fn test_create_pool_provisions_minimum() {
        let (runtime, manager, _clock) = setup();
        let info = manager.create_pool(PoolConfig::new("workers", 2, 4)).await.unwrap();

        assert_eq!(info.status, PoolStatus::Active);
        assert_eq!(info.members.len(), 2);
        for member in &info.members {
            assert!(member.owned);
            let agent = runtime.get_agent(&member.agent_id).await.unwrap();
            assert_eq!(agent.state(), AgentState::Running);
        }
        assert_eq!(runtime.store().list_pools().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pool_names_unique_and_bounded() {
        let (runtime, _, _) = setup();
        let manager = PoolManager::new(
            runtime,
            PoolManagerConfig {
                max_pools: 1,
                ..PoolManagerConfig::default()
            },
        );

        manager.create_pool(PoolConfig::new("a", 0, 2)).await.unwrap();
        assert!(matches!(
            manager.create_pool(PoolConfig::new("a", 0, 2)).await,
            Err(AppError::Validation { .. })
        ));
        assert!(matches!(
            manager.create_pool(PoolConfig::new("b", 0, 2)).await,
            Err(AppError::CapacityExceeded { .. })
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_and_remove_members() {
        let (runtime, manager, _clock) = setup();
        let pool = manager.create_pool(PoolConfig::new("p", 1, 2)).await.unwrap();

        let external = runtime.create_agent(AgentSpec::new("ext", "worker")).await.unwrap();
        runtime.start_agent(external.id()).await.unwrap();
        manager.add_agent_to_pool(&pool.id, external.id(), 5).await.unwrap();

        let extra = runtime.create_agent(AgentSpec::new("extra", "worker")).await.unwrap();
        assert!(matches!(
            manager.add_agent_to_pool(&pool.id, extra.id(), 1).await,
            Err(AppError::CapacityExceeded { .. })
        ));

        manager.remove_agent_from_pool(&pool.id, external.id()).await.unwrap();
        // External agents survive removal
        assert!(runtime.get_agent(external.id()).await.is_ok());

        let remaining = manager.get_pool_members(&pool.id).await.unwrap();
        assert!(matches!(
            manager.remove_agent_from_pool(&pool.id, &remaining[0].agent_id).await,
            Err(AppError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_lease_round_robin_and_release() {
        let (_runtime, manager, _clock) = setup();
        let pool = manager
            .create_pool(PoolConfig::new("rr", 2, 2).with_strategy(LoadBalancingStrategy::RoundRobin))
            .await
            .unwrap();

        let first = manager.get_agent_from_pool(&pool.id).await.unwrap();
        let second = manager.get_agent_from_pool(&pool.id).await.unwrap();
        let third = manager.get_agent_from_pool(&pool.id).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.id(), third.id());

        manager
            .release_agent(&pool.id, first.id(), RequestOutcome::failure(Duration::from_millis(10)))
            .await
            .unwrap();
        let metrics = manager.get_pool_metrics(&pool.id).await.unwrap();
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.active_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.total_agents, 2);
    }

    #[tokio::test]
    async fn test_paused_pool_leases_nothing() {
        let (_runtime, manager, _clock) = setup();
        let pool = manager.create_pool(PoolConfig::new("p", 1, 2)).await.unwrap();

        manager.pause_pool(&pool.id).await.unwrap();
        assert!(matches!(
            manager.get_agent_from_pool(&pool.id).await,
            Err(AppError::InvalidStateTransition { .. })
        ));
        assert_eq!(manager.list_pools(Some(PoolStatus::Paused)).await.len(), 1);
        assert!(manager.list_pools(Some(PoolStatus::Active)).await.is_empty());

        manager.resume_pool(&pool.id).await.unwrap();
        assert!(manager.get_agent_from_pool(&pool.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_unhealthy_member_evicted_and_replaced() {
        let (runtime, manager, clock) = setup();
        let pool = manager
            .create_pool(
                PoolConfig::new("h", 1, 2).with_unhealthy_grace_period(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        let original = pool.members[0].agent_id.clone();

        runtime.stop_agent(&original).await.unwrap();
        let report = manager.check_pool_health(&pool.id).await.unwrap();
        assert_eq!(report.unhealthy, vec![original.clone()]);
        assert!(report.evicted.is_empty());
        assert!(manager.get_agent_from_pool(&pool.id).await.is_err());

        clock.advance(chrono::Duration::seconds(61));
        let report = manager.check_pool_health(&pool.id).await.unwrap();
        assert_eq!(report.evicted, vec![original.clone()]);
        assert_eq!(report.replenished.len(), 1);

        let members = manager.get_pool_members(&pool.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_ne!(members[0].agent_id, original);
        assert!(runtime.get_agent(&original).await.is_err());
    }

    #[tokio::test]
    async fn test_auto_scaling_respects_cooldown() {
        let (runtime, manager, clock) = setup();
        let config = PoolConfig::new("auto", 1, 3)
            .with_auto_scaling(AutoScalingConfig {
                enabled: true,
                scale_up_threshold: 80.0,
                scale_down_threshold: 20.0,
                cooldown_period: Duration::from_secs(60),
            })
            .with_template(AgentTemplate {
                agent_type: "worker".to_string(),
                config: Some(AgentConfig {
                    max_concurrent_tasks: 1,
                    ..AgentConfig::default()
                }),
                weight: 1,
            });
        let pool = manager.create_pool(config).await.unwrap();
        let member = pool.members[0].agent_id.clone();

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let id = runtime
                .submit_task(&member, TaskSpec::new("delay", json!({"duration": 30})))
                .await
                .unwrap();
            tasks.push(id);
        }

        assert_eq!(manager.evaluate_scaling(&pool.id).await.unwrap(), ScalingDecision::ScaleUp);
        assert_eq!(manager.get_pool_members(&pool.id).await.unwrap().len(), 2);

        // Still overloaded, but inside the cooldown window
        assert_eq!(manager.evaluate_scaling(&pool.id).await.unwrap(), ScalingDecision::Hold);

        for id in &tasks {
            runtime.cancel_task(&member, id).await.unwrap();
        }
        for id in &tasks {
            runtime.wait_for_task(&member, id, Duration::from_secs(2)).await.unwrap();
        }

        // Idle now, still inside the window: no opposite action
        assert_eq!(manager.evaluate_scaling(&pool.id).await.unwrap(), ScalingDecision::Hold);

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(manager.evaluate_scaling(&pool.id).await.unwrap(), ScalingDecision::ScaleDown);
        assert_eq!(manager.get_pool_members(&pool.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replenishment_ignores_cooldown() {
        let (_runtime, manager, clock) = setup();
        let config = |min_agents| {
            PoolConfig::new("floor", min_agents, 3).with_auto_scaling(AutoScalingConfig {
                enabled: true,
                scale_up_threshold: 80.0,
                scale_down_threshold: 20.0,
                cooldown_period: Duration::from_secs(60),
            })
        };
        let pool = manager.create_pool(config(2)).await.unwrap();

        manager.update_pool_config(&pool.id, config(1)).await.unwrap();
        assert_eq!(manager.evaluate_scaling(&pool.id).await.unwrap(), ScalingDecision::ScaleDown);
        let scaled_at = manager.get_pool(&pool.id).await.unwrap().last_scaling_at.unwrap();

        // min_agents wins over the cooldown the scale-down just started
        clock.advance(chrono::Duration::seconds(30));
        manager.update_pool_config(&pool.id, config(2)).await.unwrap();
        let report = manager.check_pool_health(&pool.id).await.unwrap();
        assert_eq!(report.replenished.len(), 1);

        let info = manager.get_pool(&pool.id).await.unwrap();
        assert_eq!(info.members.len(), 2);
        assert_eq!(info.last_scaling_at, Some(scaled_at + chrono::Duration::seconds(30)));
        assert_eq!(manager.evaluate_scaling(&pool.id).await.unwrap(), ScalingDecision::Hold);
    }

    #[tokio::test]
    async fn test_restore_pools_with_their_members() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let build = || {
            Arc::new(RuntimeManager::with_components(
                ManagerConfig {
                    shutdown_timeout: Duration::from_secs(2),
                    ..ManagerConfig::default()
                },
                Arc::new(HandlerRegistry::with_builtin_handlers()),
                Arc::clone(&store),
                Arc::new(ManualClock::default()),
            ))
        };
        let quiet = PoolManagerConfig {
            scaling_interval: Duration::from_secs(3600),
            default_health_check_interval: Duration::from_secs(3600),
            ..PoolManagerConfig::default()
        };

        let first_runtime = build();
        let first = PoolManager::new(Arc::clone(&first_runtime), quiet.clone());
        let pool = first.create_pool(PoolConfig::new("kept", 2, 4)).await.unwrap();
        let external = first_runtime
            .create_agent(AgentSpec::new("external", "worker"))
            .await
            .unwrap();
        first.add_agent_to_pool(&pool.id, external.id(), 3).await.unwrap();
        first.shutdown().await;

        let runtime = build();
        assert_eq!(runtime.restore_from_store().await.unwrap(), 3);
        let manager = PoolManager::new(Arc::clone(&runtime), quiet);
        assert_eq!(manager.restore_from_store().await.unwrap(), 1);

        let restored = manager.get_pool(&pool.id).await.unwrap();
        assert_eq!(restored.config.name, "kept");
        assert_eq!(restored.members.len(), 3);
        for member in &restored.members {
            let agent = runtime.get_agent(&member.agent_id).await.unwrap();
            if member.owned {
                assert_eq!(agent.state(), AgentState::Running);
            } else {
                assert_eq!(member.weight, 3);
                assert_eq!(agent.state(), AgentState::Created);
            }
        }

        // the name is taken again, so a second pass restores nothing
        assert_eq!(manager.restore_from_store().await.unwrap(), 0);
        assert!(manager.create_pool(PoolConfig::new("kept", 0, 1)).await.is_err());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_pool_removes_owned_agents() {
        let (runtime, manager, _clock) = setup();
        let pool = manager.create_pool(PoolConfig::new("d", 2, 2)).await.unwrap();
        assert_eq!(runtime.agent_count().await, 2);

        manager.delete_pool(&pool.id).await.unwrap();
        assert_eq!(runtime.agent_count().await, 0);
        assert!(matches!(
            manager.get_pool(&pool.id).await,
            Err(AppError::NotFound { .. })
        ));
        assert!(runtime.store().list_pools().await.unwrap().is_empty());

        // The name can be reused
        manager.create_pool(PoolConfig::new("d", 0, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_agent_pools() {
        let (runtime, manager, _clock) = setup();
        let a = manager.create_pool(PoolConfig::new("a", 0, 2)).await.unwrap();
        let b = manager.create_pool(PoolConfig::new("b", 0, 2)).await.unwrap();

        let agent = runtime.create_agent(AgentSpec::new("shared", "worker")).await.unwrap();
        manager.add_agent_to_pool(&a.id, agent.id(), 1).await.unwrap();
        manager.add_agent_to_pool(&b.id, agent.id(), 1).await.unwrap();

        let pools = manager.get_agent_pools(agent.id()).await;
        assert_eq!(pools.len(), 2);
    }
}
