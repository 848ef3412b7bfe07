//! Agent lifecycle state machine
//!
//! An agent owns one [`TaskScheduler`] and a heartbeat. Lifecycle
//! transitions for a single agent are serialized through an async lock;
//! state reads never wait on a transition in progress. Transitions are
//! crate-internal and driven by the runtime manager; every state change
//! is reported to the agent's [`LifecycleObserver`] while the lock is held.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    clock::Clock,
    handler::HandlerRegistry,
    scheduler::{
        CancelOutcome, DrainReport, SchedulerConfig, SchedulerStatus, TaskObserver, TaskScheduler,
    },
    store::StateStore,
    task::{Task, TaskFilter, TaskMetrics, TaskResult, TaskSpec},
};
use crate::error::{AppError, AppResult};

/// Generate a new agent identifier
pub fn generate_agent_id() -> String {
    format!("agent-{}", Uuid::new_v4())
}

/// Agent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Created,
    Running,
    Paused,
    Stopped,
    Failed,
}

impl AgentState {
    /// Allowed lifecycle edges
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Stopped)
                | (Running, Paused)
                | (Running, Stopped)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Stopped, Running)
                | (Failed, Running)
                | (Failed, Stopped)
        )
    }

    /// Running or paused; counted as active by the fleet metrics
    pub fn is_active(&self) -> bool {
        matches!(self, AgentState::Running | AgentState::Paused)
    }

    pub fn accepts_tasks(&self) -> bool {
        !matches!(self, AgentState::Stopped | AgentState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Running => "running",
            AgentState::Paused => "paused",
            AgentState::Stopped => "stopped",
            AgentState::Failed => "failed",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource allocation used for pool utilization accounting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// CPU in millicores
    pub cpu_millicores: u32,
    /// Memory in megabytes
    pub memory_mb: u32,
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Tasks running at the same time
    pub max_concurrent_tasks: usize,
    /// Outstanding tasks admitted before submissions are rejected
    pub task_queue_size: usize,
    /// Expected heartbeat period
    pub heartbeat_interval: Duration,
    /// Default per-task execution ceiling
    pub task_timeout: Duration,
    /// Terminal task records kept for queries
    pub retained_tasks: usize,
    pub resources: ResourceAllocation,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            task_queue_size: 100,
            heartbeat_interval: Duration::from_secs(30),
            task_timeout: Duration::from_secs(300),
            retained_tasks: 1000,
            resources: ResourceAllocation::default(),
        }
    }
}

impl AgentConfig {
    /// Reject limits the scheduler and heartbeat cannot run with
    pub fn validate(&self) -> AppResult<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(AppError::validation("max_concurrent_tasks must be greater than 0"));
        }
        if self.task_queue_size == 0 {
            return Err(AppError::validation("task_queue_size must be greater than 0"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(AppError::validation("heartbeat_interval must be greater than 0"));
        }
        if self.task_timeout.is_zero() {
            return Err(AppError::validation("task_timeout must be greater than 0"));
        }
        Ok(())
    }

    /// Replace unset (zero) fields with the given defaults
    pub fn with_defaults(mut self, defaults: &AgentConfig) -> Self {
        if self.max_concurrent_tasks == 0 {
            self.max_concurrent_tasks = defaults.max_concurrent_tasks;
        }
        if self.task_queue_size == 0 {
            self.task_queue_size = defaults.task_queue_size;
        }
        if self.heartbeat_interval.is_zero() {
            self.heartbeat_interval = defaults.heartbeat_interval;
        }
        if self.task_timeout.is_zero() {
            self.task_timeout = defaults.task_timeout;
        }
        if self.retained_tasks == 0 {
            self.retained_tasks = defaults.retained_tasks;
        }
        self
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_tasks: self.max_concurrent_tasks,
            task_queue_size: self.task_queue_size,
            task_timeout: self.task_timeout,
            retained_tasks: self.retained_tasks,
        }
    }
}

/// Serializable agent snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    pub state: AgentState,
    pub config: AgentConfig,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub healthy: bool,
    pub running_tasks: usize,
    pub pending_tasks: usize,
}

/// Agent creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub agent_type: String,
    /// Zero fields fall back to the manager's defaults
    pub config: Option<AgentConfig>,
    pub metadata: HashMap<String, String>,
}

impl AgentSpec {
    pub fn new<N: Into<String>, T: Into<String>>(name: N, agent_type: T) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            config: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Receives every lifecycle state change of an agent
pub trait LifecycleObserver: Send + Sync {
    fn state_changed(&self, agent_id: &str, from: AgentState, to: AgentState);
}

#[derive(Debug)]
struct Lifecycle {
    state: AgentState,
    updated_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    failure_reason: Option<String>,
}

impl Lifecycle {
    fn beat(&mut self, now: DateTime<Utc>) {
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
    }
}

/// A stateful execution unit with its own task queue and heartbeat
pub struct Agent {
    id: String,
    name: String,
    agent_type: String,
    config: AgentConfig,
    metadata: HashMap<String, String>,
    created_at: DateTime<Utc>,
    lifecycle: Arc<RwLock<Lifecycle>>,
    transitions: tokio::sync::Mutex<()>,
    scheduler: TaskScheduler,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
    lifecycle_observer: Option<Arc<dyn LifecycleObserver>>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("agent_type", &self.agent_type)
            .field("state", &self.state())
            .finish()
    }
}

impl Agent {
    pub fn new(
        spec: AgentSpec,
        config: AgentConfig,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        observer: Option<Arc<dyn TaskObserver>>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        let now = clock.now();
        let info = AgentInfo {
            id: generate_agent_id(),
            name: spec.name,
            agent_type: spec.agent_type,
            state: AgentState::Created,
            config,
            metadata: spec.metadata,
            created_at: now,
            updated_at: now,
            last_heartbeat: now,
            healthy: true,
            running_tasks: 0,
            pending_tasks: 0,
        };
        Self::from_info(info, handlers, clock, observer, store)
    }

    /// Rebuild an agent from a stored record.
    ///
    /// Nothing is running after a restore, so any record that was past
    /// `created` comes back `stopped`. Queued work is not recovered.
    pub fn restore(
        mut info: AgentInfo,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        observer: Option<Arc<dyn TaskObserver>>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        if info.state != AgentState::Created {
            info.state = AgentState::Stopped;
        }
        info.updated_at = clock.now();
        Self::from_info(info, handlers, clock, observer, store)
    }

    fn from_info(
        info: AgentInfo,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        observer: Option<Arc<dyn TaskObserver>>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        let scheduler =
            TaskScheduler::new(&info.id, info.config.scheduler_config(), handlers, clock.clone())
                .with_hooks(observer, store);

        Self {
            id: info.id,
            name: info.name,
            agent_type: info.agent_type,
            config: info.config,
            metadata: info.metadata,
            created_at: info.created_at,
            lifecycle: Arc::new(RwLock::new(Lifecycle {
                state: info.state,
                updated_at: info.updated_at,
                last_heartbeat: info.last_heartbeat,
                failure_reason: None,
            })),
            transitions: tokio::sync::Mutex::new(()),
            scheduler,
            heartbeat: Mutex::new(None),
            clock,
            lifecycle_observer: None,
        }
    }

    pub fn with_lifecycle_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.lifecycle_observer = Some(observer);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        self.lifecycle.read().state
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.lifecycle.read().failure_reason.clone()
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.lifecycle.read().last_heartbeat
    }

    /// Record liveness; never moves the heartbeat backwards
    pub fn heartbeat(&self) {
        self.lifecycle.write().beat(self.clock.now());
    }

    /// Heartbeat age within twice the configured interval
    pub fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        let age = now - self.last_heartbeat();
        let limit = chrono::Duration::from_std(self.config.heartbeat_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        age <= limit
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(self.clock.now())
    }

    pub fn info(&self) -> AgentInfo {
        let (running_tasks, pending_tasks) = self.scheduler.load();
        let lifecycle = self.lifecycle.read();
        AgentInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            agent_type: self.agent_type.clone(),
            state: lifecycle.state,
            config: self.config.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: lifecycle.updated_at,
            last_heartbeat: lifecycle.last_heartbeat,
            healthy: self.is_healthy_at(self.clock.now()),
            running_tasks,
            pending_tasks,
        }
    }

    fn check_transition(&self, to: AgentState) -> AppResult<AgentState> {
        let from = self.state();
        if from.can_transition_to(to) {
            Ok(from)
        } else {
            Err(AppError::invalid_transition(&self.id, from, to))
        }
    }

    /// Callers hold the transition lock
    fn set_state(&self, to: AgentState) {
        let now = self.clock.now();
        let from = {
            let mut lifecycle = self.lifecycle.write();
            let from = lifecycle.state;
            debug!("Agent {} state {} -> {}", self.id, from, to);
            lifecycle.state = to;
            lifecycle.updated_at = now;
            if to == AgentState::Running {
                lifecycle.beat(now);
                lifecycle.failure_reason = None;
            }
            from
        };

        if from != to {
            if let Some(observer) = &self.lifecycle_observer {
                observer.state_changed(&self.id, from, to);
            }
        }
    }

    fn spawn_heartbeat(&self) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let clock = Arc::clone(&self.clock);
        let period = self.config.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                lifecycle.write().beat(clock.now());
            }
        });

        if let Some(previous) = self.heartbeat.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
    }

    fn start_locked(&self) -> AppResult<AgentState> {
        let from = self.check_transition(AgentState::Running)?;
        self.scheduler.start();
        self.spawn_heartbeat();
        self.set_state(AgentState::Running);
        Ok(from)
    }

    async fn stop_locked(&self, drain_timeout: Duration) -> AppResult<(AgentState, DrainReport)> {
        let from = self.check_transition(AgentState::Stopped)?;
        // Reject new submissions before draining
        self.set_state(AgentState::Stopped);
        self.stop_heartbeat();
        let report = self.scheduler.stop(drain_timeout).await;
        Ok((from, report))
    }

    /// `created|stopped|failed -> running`; returns the previous state
    pub(crate) async fn start(&self) -> AppResult<AgentState> {
        let _guard = self.transitions.lock().await;
        let from = self.start_locked()?;
        info!("Agent started: {} ({})", self.id, self.name);
        Ok(from)
    }

    /// Drain in-flight tasks within `drain_timeout`, then stop
    pub(crate) async fn stop(&self, drain_timeout: Duration) -> AppResult<(AgentState, DrainReport)> {
        let _guard = self.transitions.lock().await;
        let result = self.stop_locked(drain_timeout).await?;
        info!("Agent stopped: {} (drained: {})", self.id, result.1.drained);
        Ok(result)
    }

    pub(crate) async fn pause(&self) -> AppResult<()> {
        let _guard = self.transitions.lock().await;
        let from = self.check_transition(AgentState::Paused)?;
        if from != AgentState::Running {
            return Err(AppError::invalid_transition(&self.id, from, AgentState::Paused));
        }
        self.scheduler.pause();
        self.set_state(AgentState::Paused);
        info!("Agent paused: {}", self.id);
        Ok(())
    }

    pub(crate) async fn resume(&self) -> AppResult<()> {
        let _guard = self.transitions.lock().await;
        let from = self.state();
        if from != AgentState::Paused {
            return Err(AppError::invalid_transition(&self.id, from, AgentState::Running));
        }
        self.scheduler.resume();
        self.set_state(AgentState::Running);
        info!("Agent resumed: {}", self.id);
        Ok(())
    }

    /// Stop then start as one serialized operation.
    ///
    /// Both halves are checked before anything changes; the start half
    /// cannot observe an intermediate state because the transition lock
    /// is held throughout.
    pub(crate) async fn restart(&self, drain_timeout: Duration) -> AppResult<(AgentState, DrainReport)> {
        let _guard = self.transitions.lock().await;
        let from = self.state();

        let report = match from {
            AgentState::Running | AgentState::Paused | AgentState::Failed => {
                self.stop_locked(drain_timeout).await?.1
            }
            AgentState::Created | AgentState::Stopped => DrainReport {
                drained: true,
                forced: Vec::new(),
            },
        };

        if let Err(e) = self.start_locked() {
            warn!("Restart of agent {} failed in start phase: {}", self.id, e);
            self.set_state(AgentState::Failed);
            self.lifecycle.write().failure_reason = Some(format!("restart failed: {}", e));
            return Err(e);
        }

        info!("Agent restarted: {}", self.id);
        Ok((from, report))
    }

    /// `running -> failed` on an unrecoverable error; in-flight tasks are cancelled
    pub(crate) async fn fail<S: Into<String>>(&self, reason: S) -> AppResult<AgentState> {
        let _guard = self.transitions.lock().await;
        let from = self.check_transition(AgentState::Failed)?;
        let reason = reason.into();

        self.set_state(AgentState::Failed);
        self.lifecycle.write().failure_reason = Some(reason.clone());
        self.stop_heartbeat();
        self.scheduler.stop(Duration::ZERO).await;

        warn!("Agent failed: {} ({})", self.id, reason);
        Ok(from)
    }

    /// Queue a task; rejected while the agent is stopped or failed
    pub fn submit_task(&self, spec: TaskSpec) -> AppResult<String> {
        let lifecycle = self.lifecycle.read();
        if !lifecycle.state.accepts_tasks() {
            return Err(AppError::invalid_transition(
                &self.id,
                lifecycle.state,
                "accepting tasks",
            ));
        }
        self.scheduler.submit(spec)
    }

    pub async fn cancel_task(&self, task_id: &str) -> AppResult<CancelOutcome> {
        self.scheduler.cancel(task_id).await
    }

    pub fn get_task(&self, task_id: &str) -> AppResult<Task> {
        self.scheduler.get_task(task_id)
    }

    pub fn get_task_result(&self, task_id: &str) -> AppResult<Option<TaskResult>> {
        self.scheduler.get_result(task_id)
    }

    pub async fn wait_for_task(&self, task_id: &str, timeout: Duration) -> AppResult<TaskResult> {
        self.scheduler.wait_for_result(task_id, timeout).await
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.scheduler.list(filter)
    }

    pub fn task_metrics(&self) -> TaskMetrics {
        self.scheduler.metrics()
    }

    pub fn task_manager_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// (running, pending) task counts
    pub fn load(&self) -> (usize, usize) {
        self.scheduler.load()
    }

    pub(crate) fn dispatcher_alive(&self) -> bool {
        self.scheduler.dispatcher_alive()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}
