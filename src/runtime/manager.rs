//! Runtime Manager: fleet registry, capacity gate and metrics
//!
//! The RuntimeManager is responsible for:
//! - Agent creation against the fleet capacity limit
//! - Delegating lifecycle transitions and task operations by agent ID
//! - Fleet-wide counters, updated by the operations that change them
//! - Periodic health checks and bounded shutdown

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::{
    agent::{Agent, AgentConfig, AgentInfo, AgentSpec, AgentState, LifecycleObserver},
    clock::{Clock, SystemClock},
    handler::HandlerRegistry,
    scheduler::{CancelOutcome, DrainReport, SchedulerStatus, TaskObserver},
    store::{InMemoryStore, StateStore},
    task::{Task, TaskFilter, TaskMetrics, TaskResult, TaskSpec},
};
use crate::error::{AppError, AppResult};

/// Runtime Manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Maximum number of registered agents
    pub max_agents: usize,
    /// Period of the background health check
    pub health_check_interval: Duration,
    /// Bound for draining agents on stop and shutdown
    pub shutdown_timeout: Duration,
    /// Defaults applied to unset agent configuration fields
    pub default_agent_config: AgentConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_agents: 100,
            health_check_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            default_agent_config: AgentConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.max_agents == 0 {
            return Err(AppError::validation("max_agents must be greater than 0"));
        }
        if self.health_check_interval.is_zero() {
            return Err(AppError::validation("health_check_interval must be greater than 0"));
        }
        self.default_agent_config.validate()
    }
}

/// Fleet-wide counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    pub total_agents_created: u64,
    pub total_agents_stopped: u64,
    pub total_tasks_executed: u64,
    pub total_tasks_failed: u64,
    pub current_active_agents: u64,
    pub current_running_tasks: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Outcome of a fleet shutdown
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Agents stopped with all in-flight work drained
    pub drained: Vec<String>,
    /// Agents stopped after their drain timed out
    pub forced: Vec<String>,
    /// Agents that could not be stopped, with the error
    pub failed: Vec<(String, String)>,
}

/// Owns the metrics aggregate; every update happens under one lock
struct MetricsRecorder {
    metrics: Mutex<RuntimeMetrics>,
    clock: Arc<dyn Clock>,
}

impl MetricsRecorder {
    fn update<F: FnOnce(&mut RuntimeMetrics)>(&self, f: F) {
        let mut metrics = self.metrics.lock();
        f(&mut metrics);
        metrics.last_updated = Some(self.clock.now());

        #[cfg(feature = "performance-monitoring")]
        {
            metrics::gauge!("agent_runtime.active_agents").set(metrics.current_active_agents as f64);
            metrics::gauge!("agent_runtime.running_tasks").set(metrics.current_running_tasks as f64);
        }
    }

    fn snapshot(&self) -> RuntimeMetrics {
        self.metrics.lock().clone()
    }

    /// Account for a lifecycle transition between two states
    fn record_transition(&self, from: AgentState, to: AgentState) {
        self.update(|m| {
            match (from.is_active(), to.is_active()) {
                (false, true) => m.current_active_agents += 1,
                (true, false) => {
                    m.current_active_agents = m.current_active_agents.saturating_sub(1)
                }
                _ => {}
            }
            if from.is_active() && to == AgentState::Stopped {
                m.total_agents_stopped += 1;
            }
        });
    }
}

impl LifecycleObserver for MetricsRecorder {
    fn state_changed(&self, _agent_id: &str, from: AgentState, to: AgentState) {
        self.record_transition(from, to);
    }
}

impl TaskObserver for MetricsRecorder {
    fn task_started(&self, _task: &Task) {
        self.update(|m| m.current_running_tasks += 1);
    }

    fn task_finished(&self, result: &TaskResult, executed: bool) {
        self.update(|m| {
            if executed {
                m.current_running_tasks = m.current_running_tasks.saturating_sub(1);
                m.total_tasks_executed += 1;
            }
            if result.status.is_failure() {
                m.total_tasks_failed += 1;
            }
        });

        #[cfg(feature = "performance-monitoring")]
        if result.status.is_failure() {
            metrics::counter!("agent_runtime.tasks_failed").increment(1);
        }
    }
}

/// Process-wide registry of agents
pub struct RuntimeManager {
    agents: Arc<RwLock<HashMap<String, Arc<Agent>>>>,
    config: ManagerConfig,
    recorder: Arc<MetricsRecorder>,
    handlers: Arc<HandlerRegistry>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    health_monitor: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeManager {
    /// Create a manager with built-in handlers, an in-memory store and the system clock
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_components(
            config,
            Arc::new(HandlerRegistry::with_builtin_handlers()),
            Arc::new(InMemoryStore::new()),
            Arc::new(SystemClock),
        )
    }

    pub fn with_components(
        config: ManagerConfig,
        handlers: Arc<HandlerRegistry>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            "Initializing Runtime Manager (max_agents: {}, health interval: {:?})",
            config.max_agents, config.health_check_interval
        );

        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            recorder: Arc::new(MetricsRecorder {
                metrics: Mutex::new(RuntimeMetrics::default()),
                clock: clock.clone(),
            }),
            config,
            handlers,
            store,
            clock,
            health_monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Create and register an agent in the `created` state
    pub async fn create_agent(&self, spec: AgentSpec) -> AppResult<Arc<Agent>> {
        if spec.name.trim().is_empty() {
            return Err(AppError::validation("agent name cannot be empty"));
        }
        if spec.agent_type.trim().is_empty() {
            return Err(AppError::validation("agent type cannot be empty"));
        }

        let config = spec
            .config
            .clone()
            .unwrap_or_default()
            .with_defaults(&self.config.default_agent_config);
        config.validate()?;

        let mut agents = self.agents.write().await;
        if agents.len() >= self.config.max_agents {
            return Err(AppError::capacity(format!(
                "fleet is at max_agents ({})",
                self.config.max_agents
            )));
        }

        let agent = Arc::new(self.observed(Agent::new(
            spec,
            config,
            Arc::clone(&self.handlers),
            Arc::clone(&self.clock),
            Some(self.task_observer()),
            Some(Arc::clone(&self.store)),
        )));

        // Persist first so a store failure leaves no registered agent behind
        self.store.save_agent(&agent.info()).await?;
        agents.insert(agent.id().to_string(), Arc::clone(&agent));
        self.recorder.update(|m| m.total_agents_created += 1);

        info!("Created agent: {} ({}, type {})", agent.id(), agent.name(), agent.agent_type());
        Ok(agent)
    }

    fn task_observer(&self) -> Arc<dyn TaskObserver> {
        self.recorder.clone()
    }

    fn observed(&self, agent: Agent) -> Agent {
        let observer: Arc<dyn LifecycleObserver> = self.recorder.clone();
        agent.with_lifecycle_observer(observer)
    }

    /// Re-register agents recorded in the store.
    ///
    /// Restored agents come back `stopped` (or `created` if they never
    /// started) and count towards `total_agents_created`. Records already
    /// registered, past the fleet limit or with an unusable configuration
    /// are skipped. Returns the number of agents restored.
    pub async fn restore_from_store(&self) -> AppResult<usize> {
        let mut records = self.store.list_agents().await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut restored = Vec::new();
        {
            let mut agents = self.agents.write().await;
            for record in records {
                if agents.contains_key(&record.id) {
                    continue;
                }
                if agents.len() >= self.config.max_agents {
                    warn!(
                        "Fleet is at max_agents ({}); not restoring agent {}",
                        self.config.max_agents, record.id
                    );
                    continue;
                }
                if let Err(e) = record.config.validate() {
                    warn!("Not restoring agent {}: {}", record.id, e);
                    continue;
                }

                let agent = Arc::new(self.observed(Agent::restore(
                    record,
                    Arc::clone(&self.handlers),
                    Arc::clone(&self.clock),
                    Some(self.task_observer()),
                    Some(Arc::clone(&self.store)),
                )));
                debug!("Restored agent {} as {}", agent.id(), agent.state());
                agents.insert(agent.id().to_string(), Arc::clone(&agent));
                restored.push(agent);
            }
        }

        for agent in &restored {
            self.persist(agent).await;
        }
        let count = restored.len();
        self.recorder.update(|m| m.total_agents_created += count as u64);

        info!("Restored {} agent(s) from store", count);
        Ok(count)
    }

    pub async fn get_agent(&self, agent_id: &str) -> AppResult<Arc<Agent>> {
        let agents = self.agents.read().await;
        agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("agent", agent_id))
    }

    /// Snapshot of every registered agent, in no particular order
    pub async fn list_agents(&self) -> Vec<AgentInfo> {
        let agents: Vec<Arc<Agent>> = self.agents.read().await.values().cloned().collect();
        agents.iter().map(|agent| agent.info()).collect()
    }

    pub async fn agent_count(&self) -> usize {
        self.agents.read().await.len()
    }

    async fn persist(&self, agent: &Agent) {
        if let Err(e) = self.store.save_agent(&agent.info()).await {
            warn!("Failed to persist agent {}: {}", agent.id(), e);
        }
    }

    pub async fn start_agent(&self, agent_id: &str) -> AppResult<AgentInfo> {
        let agent = self.get_agent(agent_id).await?;
        agent.start().await?;
        self.persist(&agent).await;
        Ok(agent.info())
    }

    /// Stop an agent, draining in-flight tasks within the shutdown timeout
    pub async fn stop_agent(&self, agent_id: &str) -> AppResult<DrainReport> {
        let agent = self.get_agent(agent_id).await?;
        let (_, report) = agent.stop(self.config.shutdown_timeout).await?;
        self.persist(&agent).await;
        Ok(report)
    }

    pub async fn pause_agent(&self, agent_id: &str) -> AppResult<AgentInfo> {
        let agent = self.get_agent(agent_id).await?;
        agent.pause().await?;
        self.persist(&agent).await;
        Ok(agent.info())
    }

    pub async fn resume_agent(&self, agent_id: &str) -> AppResult<AgentInfo> {
        let agent = self.get_agent(agent_id).await?;
        agent.resume().await?;
        self.persist(&agent).await;
        Ok(agent.info())
    }

    /// Stop then start as one operation; the agent ends running or the call fails
    pub async fn restart_agent(&self, agent_id: &str) -> AppResult<AgentInfo> {
        let agent = self.get_agent(agent_id).await?;
        match agent.restart(self.config.shutdown_timeout).await {
            Ok(_) => {
                self.persist(&agent).await;
                Ok(agent.info())
            }
            Err(e) => {
                error!("Restart of agent {} failed: {}", agent_id, e);
                self.persist(&agent).await;
                Err(e)
            }
        }
    }

    pub async fn mark_agent_failed(&self, agent_id: &str, reason: &str) -> AppResult<AgentInfo> {
        let agent = self.get_agent(agent_id).await?;
        agent.fail(reason).await?;
        self.persist(&agent).await;
        Ok(agent.info())
    }

    /// Stop (if active) and deregister an agent
    pub async fn delete_agent(&self, agent_id: &str) -> AppResult<()> {
        let agent = self.get_agent(agent_id).await?;
        if agent.state().is_active() {
            self.stop_agent(agent_id).await?;
        }

        self.agents.write().await.remove(agent_id);
        if let Err(e) = self.store.delete_agent(agent_id).await {
            warn!("Failed to delete agent record {}: {}", agent_id, e);
        }
        info!("Deleted agent: {}", agent_id);
        Ok(())
    }

    pub async fn submit_task(&self, agent_id: &str, spec: TaskSpec) -> AppResult<String> {
        let agent = self.get_agent(agent_id).await?;
        agent.submit_task(spec)
    }

    pub async fn get_task(&self, agent_id: &str, task_id: &str) -> AppResult<Task> {
        self.get_agent(agent_id).await?.get_task(task_id)
    }

    /// Falls back to the store once retention has evicted the record
    pub async fn get_task_result(
        &self,
        agent_id: &str,
        task_id: &str,
    ) -> AppResult<Option<TaskResult>> {
        let agent = self.get_agent(agent_id).await?;
        match agent.get_task_result(task_id) {
            Err(AppError::NotFound { .. }) => {
                self.stored_task_result(agent_id, task_id).await.map(Some)
            }
            other => other,
        }
    }

    pub async fn wait_for_task(
        &self,
        agent_id: &str,
        task_id: &str,
        timeout: Duration,
    ) -> AppResult<TaskResult> {
        let agent = self.get_agent(agent_id).await?;
        match agent.wait_for_task(task_id, timeout).await {
            Err(AppError::NotFound { .. }) => self.stored_task_result(agent_id, task_id).await,
            other => other,
        }
    }

    async fn stored_task_result(&self, agent_id: &str, task_id: &str) -> AppResult<TaskResult> {
        match self.store.load_task_result(task_id).await? {
            Some(result) if result.agent_id == agent_id => Ok(result),
            _ => Err(AppError::not_found("task", task_id)),
        }
    }

    pub async fn cancel_task(&self, agent_id: &str, task_id: &str) -> AppResult<CancelOutcome> {
        let agent = self.get_agent(agent_id).await?;
        agent.cancel_task(task_id).await
    }

    pub async fn list_tasks(&self, agent_id: &str, filter: &TaskFilter) -> AppResult<Vec<Task>> {
        Ok(self.get_agent(agent_id).await?.list_tasks(filter))
    }

    pub async fn get_task_metrics(&self, agent_id: &str) -> AppResult<TaskMetrics> {
        Ok(self.get_agent(agent_id).await?.task_metrics())
    }

    pub async fn task_manager_status(&self, agent_id: &str) -> AppResult<SchedulerStatus> {
        Ok(self.get_agent(agent_id).await?.task_manager_status())
    }

    pub fn get_metrics(&self) -> RuntimeMetrics {
        self.recorder.snapshot()
    }

    /// Run one health check cycle; returns the IDs of unhealthy agents
    pub async fn check_health(&self) -> Vec<String> {
        let agents: Vec<Arc<Agent>> = self.agents.read().await.values().cloned().collect();
        let mut unhealthy = Vec::new();

        for agent in agents {
            let state = agent.state();
            if !state.is_active() {
                continue;
            }

            if state == AgentState::Running && !agent.dispatcher_alive() {
                error!("Dispatcher of agent {} exited unexpectedly", agent.id());
                if let Err(e) = self.mark_agent_failed(agent.id(), "task dispatcher exited").await {
                    warn!("Could not mark agent {} failed: {}", agent.id(), e);
                }
                unhealthy.push(agent.id().to_string());
                continue;
            }

            if !agent.is_healthy() {
                warn!(
                    "Agent {} is unhealthy (last heartbeat {})",
                    agent.id(),
                    agent.last_heartbeat()
                );
                unhealthy.push(agent.id().to_string());
            }
        }

        debug!("Health check completed: {} unhealthy", unhealthy.len());
        unhealthy
    }

    /// Start the periodic health check loop
    pub fn start_health_monitor(self: &Arc<Self>) -> AppResult<()> {
        self.config.validate()?;
        let period = self.config.health_check_interval;
        let weak: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.check_health().await;
            }
        });

        if let Some(previous) = self.health_monitor.lock().replace(handle) {
            previous.abort();
        }
        info!("Health monitor started (interval {:?})", period);
        Ok(())
    }

    pub fn stop_health_monitor(&self) {
        if let Some(handle) = self.health_monitor.lock().take() {
            handle.abort();
        }
    }

    /// Stop every registered agent within the shutdown timeout
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Shutting down Runtime Manager");
        self.stop_health_monitor();

        let agents: Vec<Arc<Agent>> = self.agents.read().await.values().cloned().collect();
        let timeout = self.config.shutdown_timeout;

        let stops = agents
            .iter()
            .filter(|agent| agent.state().is_active() || agent.state() == AgentState::Failed)
            .map(|agent| {
                let agent = Arc::clone(agent);
                async move {
                    let result = agent.stop(timeout).await;
                    (agent, result)
                }
            });

        let mut report = ShutdownReport::default();
        for (agent, result) in join_all(stops).await {
            match result {
                Ok((_, drain)) => {
                    if drain.drained {
                        report.drained.push(agent.id().to_string());
                    } else {
                        report.forced.push(agent.id().to_string());
                    }
                    self.persist(&agent).await;
                }
                Err(e) => report.failed.push((agent.id().to_string(), e.to_string())),
            }
        }

        info!(
            "Shutdown complete: {} drained, {} forced, {} failed",
            report.drained.len(),
            report.forced.len(),
            report.failed.len()
        );
        report
    }
}

impl Drop for RuntimeManager {
    fn drop(&mut self) {
        self.stop_health_monitor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task::TaskStatus;
    use async_trait::async_trait;
    use mockall::mock;
    use serde_json::json;

    mock! {
        Store {}

        #[async_trait]
        impl StateStore for Store {
            async fn save_agent(&self, agent: &AgentInfo) -> AppResult<()>;
            async fn delete_agent(&self, agent_id: &str) -> AppResult<()>;
            async fn list_agents(&self) -> AppResult<Vec<AgentInfo>>;
            async fn save_task_result(&self, result: &TaskResult) -> AppResult<()>;
            async fn load_task_result(&self, task_id: &str) -> AppResult<Option<TaskResult>>;
            async fn save_pool(&self, pool: &crate::pool::PoolInfo) -> AppResult<()>;
            async fn delete_pool(&self, pool_id: &str) -> AppResult<()>;
            async fn list_pools(&self) -> AppResult<Vec<crate::pool::PoolInfo>>;
        }
    }

    fn manager(max_agents: usize) -> RuntimeManager {
        RuntimeManager::new(ManagerConfig {
            max_agents,
            shutdown_timeout: Duration::from_secs(2),
            ..ManagerConfig::default()
        })
    }

    #[tokio::test]
    async fn test_create_agent_applies_defaults() {
        let manager = manager(10);
        let agent = manager
            .create_agent(AgentSpec::new("worker", "worker").with_config(AgentConfig {
                max_concurrent_tasks: 2,
                task_queue_size: 0,
                ..AgentConfig::default()
            }))
            .await
            .unwrap();

        assert_eq!(agent.state(), AgentState::Created);
        assert_eq!(agent.config().max_concurrent_tasks, 2);
        assert_eq!(agent.config().task_queue_size, 100);
        assert_eq!(manager.get_metrics().total_agents_created, 1);
    }

    #[tokio::test]
    async fn test_fleet_capacity() {
        let manager = manager(2);
        manager.create_agent(AgentSpec::new("a", "worker")).await.unwrap();
        manager.create_agent(AgentSpec::new("b", "worker")).await.unwrap();

        let result = manager.create_agent(AgentSpec::new("c", "worker")).await;
        assert!(matches!(result, Err(AppError::CapacityExceeded { .. })));
        assert_eq!(manager.agent_count().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_not_found() {
        let manager = manager(2);
        assert!(matches!(
            manager.start_agent("agent-missing").await,
            Err(AppError::NotFound { .. })
        ));
        assert!(matches!(
            manager.submit_task("agent-missing", TaskSpec::new("echo", json!({}))).await,
            Err(AppError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_metrics_follow_transitions_and_tasks() {
        let manager = manager(5);
        let agent = manager.create_agent(AgentSpec::new("a", "worker")).await.unwrap();
        let id = agent.id().to_string();

        manager.start_agent(&id).await.unwrap();
        assert_eq!(manager.get_metrics().current_active_agents, 1);

        let ok = manager.submit_task(&id, TaskSpec::new("echo", json!({}))).await.unwrap();
        let bad = manager
            .submit_task(&id, TaskSpec::new("error", json!({"message": "x"})))
            .await
            .unwrap();
        manager.wait_for_task(&id, &ok, Duration::from_secs(2)).await.unwrap();
        let failed = manager.wait_for_task(&id, &bad, Duration::from_secs(2)).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);

        manager.stop_agent(&id).await.unwrap();
        let metrics = manager.get_metrics();
        assert_eq!(metrics.current_active_agents, 0);
        assert_eq!(metrics.total_agents_stopped, 1);
        assert_eq!(metrics.total_tasks_executed, 2);
        assert_eq!(metrics.total_tasks_failed, 1);
        assert_eq!(metrics.current_running_tasks, 0);
    }

    #[tokio::test]
    async fn test_store_failure_leaves_no_agent() {
        let mut store = MockStore::new();
        store
            .expect_save_agent()
            .returning(|_| Err(AppError::storage("disk full")));

        let manager = RuntimeManager::with_components(
            ManagerConfig::default(),
            Arc::new(HandlerRegistry::with_builtin_handlers()),
            Arc::new(store),
            Arc::new(SystemClock),
        );

        let result = manager.create_agent(AgentSpec::new("a", "worker")).await;
        assert!(matches!(result, Err(AppError::Storage { .. })));
        assert_eq!(manager.agent_count().await, 0);
        assert_eq!(manager.get_metrics().total_agents_created, 0);
    }

    #[tokio::test]
    async fn test_transitions_on_agent_handle_update_metrics() {
        let manager = manager(5);
        let agent = manager.create_agent(AgentSpec::new("a", "worker")).await.unwrap();

        agent.start().await.unwrap();
        assert_eq!(manager.get_metrics().current_active_agents, 1);
        agent.pause().await.unwrap();
        assert_eq!(manager.get_metrics().current_active_agents, 1);
        agent.resume().await.unwrap();

        agent.fail("boom").await.unwrap();
        assert_eq!(manager.get_metrics().current_active_agents, 0);

        agent.restart(Duration::from_secs(1)).await.unwrap();
        let metrics = manager.get_metrics();
        assert_eq!(metrics.current_active_agents, 1);
        assert_eq!(metrics.total_agents_stopped, 0);

        agent.stop(Duration::from_secs(1)).await.unwrap();
        let metrics = manager.get_metrics();
        assert_eq!(metrics.current_active_agents, 0);
        assert_eq!(metrics.total_agents_stopped, 1);
    }

    #[tokio::test]
    async fn test_zero_intervals_rejected() {
        let manager = RuntimeManager::new(ManagerConfig {
            default_agent_config: AgentConfig {
                heartbeat_interval: Duration::ZERO,
                ..AgentConfig::default()
            },
            ..ManagerConfig::default()
        });
        let result = manager.create_agent(AgentSpec::new("a", "worker")).await;
        assert!(matches!(result, Err(AppError::Validation { .. })));
        assert_eq!(manager.agent_count().await, 0);

        let manager = Arc::new(RuntimeManager::new(ManagerConfig {
            health_check_interval: Duration::ZERO,
            ..ManagerConfig::default()
        }));
        assert!(matches!(
            manager.start_health_monitor(),
            Err(AppError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStore::new());
        let build = || {
            RuntimeManager::with_components(
                ManagerConfig {
                    shutdown_timeout: Duration::from_secs(2),
                    ..ManagerConfig::default()
                },
                Arc::new(HandlerRegistry::with_builtin_handlers()),
                Arc::clone(&store),
                Arc::new(SystemClock),
            )
        };

        let (started, idle) = {
            let first = build();
            let started = first.create_agent(AgentSpec::new("a", "worker")).await.unwrap();
            let idle = first.create_agent(AgentSpec::new("b", "worker")).await.unwrap();
            first.start_agent(started.id()).await.unwrap();
            (started.id().to_string(), idle.id().to_string())
        };

        let second = build();
        assert_eq!(second.restore_from_store().await.unwrap(), 2);
        assert_eq!(second.get_agent(&started).await.unwrap().state(), AgentState::Stopped);
        assert_eq!(second.get_agent(&idle).await.unwrap().state(), AgentState::Created);

        let metrics = second.get_metrics();
        assert_eq!(metrics.total_agents_created, 2);
        assert_eq!(metrics.current_active_agents, 0);

        second.start_agent(&started).await.unwrap();
        assert_eq!(second.get_metrics().current_active_agents, 1);
        assert_eq!(second.restore_from_store().await.unwrap(), 0);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_evicted_result_read_from_store() {
        let manager = manager(5);
        let agent = manager
            .create_agent(AgentSpec::new("a", "worker").with_config(AgentConfig {
                retained_tasks: 1,
                ..AgentConfig::default()
            }))
            .await
            .unwrap();
        let id = agent.id().to_string();
        manager.start_agent(&id).await.unwrap();

        let first = manager.submit_task(&id, TaskSpec::new("echo", json!({"n": 1}))).await.unwrap();
        manager.wait_for_task(&id, &first, Duration::from_secs(2)).await.unwrap();
        let second = manager.submit_task(&id, TaskSpec::new("echo", json!({"n": 2}))).await.unwrap();
        manager.wait_for_task(&id, &second, Duration::from_secs(2)).await.unwrap();

        assert!(matches!(agent.get_task(&first), Err(AppError::NotFound { .. })));
        let stored = manager.get_task_result(&id, &first).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Succeeded);
        assert!(matches!(
            manager.get_task_result(&id, "task_missing").await,
            Err(AppError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let manager = manager(5);
        for name in ["a", "b", "c"] {
            let agent = manager.create_agent(AgentSpec::new(name, "worker")).await.unwrap();
            manager.start_agent(agent.id()).await.unwrap();
        }

        let report = manager.shutdown().await;
        assert_eq!(report.drained.len(), 3);
        assert!(report.failed.is_empty());
        assert_eq!(manager.get_metrics().current_active_agents, 0);
        for info in manager.list_agents().await {
            assert_eq!(info.state, AgentState::Stopped);
        }
    }
}
