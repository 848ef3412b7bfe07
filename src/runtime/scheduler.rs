//! Per-agent task scheduler
//!
//! Admission control, ordering and dispatch for a single agent's work:
//! - submissions fail fast once the agent holds `task_queue_size`
//!   outstanding tasks
//! - dispatch picks the highest priority admissible task, FIFO within a
//!   priority, and never runs a task before all of its dependencies
//!   succeeded
//! - at most `max_concurrent_tasks` run at once, each bounded by its
//!   timeout
//! - cancellation of running tasks is cooperative

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicU32, Ordering as AtomicOrdering},
        Arc,
    },
    time::{Duration, Instant},
};
use parking_lot::Mutex;
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{
    clock::Clock,
    handler::{CancelSignal, HandlerRegistry, TaskContext, TaskError},
    store::StateStore,
    task::{Task, TaskFilter, TaskMetrics, TaskResult, TaskSpec, TaskStatus},
};
use crate::error::{AppError, AppResult};

/// Scheduler limits, derived from the owning agent's configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: usize,
    /// Outstanding (pending + running) tasks admitted at once
    pub task_queue_size: usize,
    /// Ceiling for tasks that carry no timeout of their own
    pub task_timeout: Duration,
    /// Terminal task records kept for queries
    pub retained_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            task_queue_size: 100,
            task_timeout: Duration::from_secs(300),
            retained_tasks: 1000,
        }
    }
}

/// Receives task lifecycle events, used for fleet-wide accounting
pub trait TaskObserver: Send + Sync {
    fn task_started(&self, task: &Task);

    /// `executed` is false for tasks that finished without running
    fn task_finished(&self, result: &TaskResult, executed: bool);
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Pending task removed from the queue
    Cancelled,
    /// Running task signalled; it becomes `cancelled` once it stops
    Requested,
    /// Task already terminal; nothing changed
    AlreadyFinished(TaskStatus),
}

/// Outcome of draining in-flight work
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrainReport {
    /// All running tasks finished within the timeout
    pub drained: bool,
    /// Tasks forcibly cancelled after the timeout
    pub forced: Vec<String>,
}

/// Task manager status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub agent_id: String,
    pub started: bool,
    pub dispatching: bool,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub handler_types: Vec<String>,
}

/// Queue entry ordered for a max-heap
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedTask {
    task_id: String,
    priority: u8,
    created_at: DateTime<Utc>,
    seq: u64,
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier creation, then submission order
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct RunningTask {
    signal: CancelSignal,
    handle: Option<JoinHandle<()>>,
}

enum Readiness {
    Ready,
    Waiting,
    DependencyFailed(String),
    Gone,
}

struct SchedulerState {
    tasks: HashMap<String, Task>,
    results: HashMap<String, TaskResult>,
    queue: BinaryHeap<QueuedTask>,
    running: HashMap<String, RunningTask>,
    finished_order: VecDeque<String>,
    metrics: TaskMetrics,
    started: bool,
    dispatching: bool,
    seq: u64,
}

impl SchedulerState {
    fn readiness(&self, task_id: &str) -> Readiness {
        let Some(task) = self.tasks.get(task_id) else {
            return Readiness::Gone;
        };
        if task.status != TaskStatus::Pending {
            return Readiness::Gone;
        }

        for dependency in &task.dependencies {
            match self.tasks.get(dependency).map(|d| d.status) {
                Some(TaskStatus::Succeeded) | None => {}
                Some(status) if status.is_terminal() => {
                    return Readiness::DependencyFailed(dependency.clone())
                }
                Some(_) => return Readiness::Waiting,
            }
        }
        Readiness::Ready
    }

    fn is_dependency_of_pending(&self, task_id: &str) -> bool {
        self.queue.iter().any(|entry| {
            self.tasks
                .get(&entry.task_id)
                .map(|t| t.dependencies.iter().any(|d| d == task_id))
                .unwrap_or(false)
        })
    }

    /// Drop the oldest terminal records beyond the retention limit
    fn evict_finished(&mut self, retained: usize) {
        while self.finished_order.len() > retained {
            let Some(position) = self
                .finished_order
                .iter()
                .position(|id| !self.is_dependency_of_pending(id))
            else {
                break;
            };
            if let Some(id) = self.finished_order.remove(position) {
                self.tasks.remove(&id);
                self.results.remove(&id);
            }
        }
    }
}

struct Shared {
    agent_id: String,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    handlers: Arc<HandlerRegistry>,
    observer: Option<Arc<dyn TaskObserver>>,
    store: Option<Arc<dyn StateStore>>,
    clock: Arc<dyn Clock>,
    wakeup: Notify,
    completions: watch::Sender<u64>,
}

impl Shared {
    /// Move a task to a terminal status and build its result.
    /// Dependents that can no longer run are failed alongside it.
    fn finalize(
        &self,
        state: &mut SchedulerState,
        task_id: &str,
        status: TaskStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
        attempts: u32,
        duration: Duration,
    ) -> Vec<TaskResult> {
        let now = self.clock.now();
        let mut finished = Vec::new();

        let Some(task) = state.tasks.get_mut(task_id) else {
            return finished;
        };
        if !task.status.can_transition_to(status) {
            return finished;
        }

        task.status = status;
        task.completed_at = Some(now);
        let result = TaskResult {
            task_id: task.id.clone(),
            agent_id: self.agent_id.clone(),
            status,
            output,
            error,
            attempts,
            started_at: task.started_at,
            completed_at: now,
            duration,
        };

        state.metrics.record_finished(status, duration);
        state.results.insert(task_id.to_string(), result.clone());
        state.finished_order.push_back(task_id.to_string());
        finished.push(result);

        if status != TaskStatus::Succeeded {
            let dependents: Vec<String> = state
                .tasks
                .values()
                .filter(|t| {
                    t.status == TaskStatus::Pending && t.dependencies.iter().any(|d| d == task_id)
                })
                .map(|t| t.id.clone())
                .collect();

            for dependent in dependents {
                state.queue.retain(|entry| entry.task_id != dependent);
                let reason = AppError::DependencyFailed {
                    task_id: dependent.clone(),
                    dependency_id: task_id.to_string(),
                };
                debug!("Failing task {}: {}", dependent, reason);
                finished.extend(self.finalize(
                    state,
                    &dependent,
                    TaskStatus::Failed,
                    None,
                    Some(reason.to_string()),
                    0,
                    Duration::ZERO,
                ));
            }
        }

        state.evict_finished(self.config.retained_tasks);
        finished
    }

    /// Start as many admissible tasks as the concurrency limit allows
    fn dispatch_ready(self: &Arc<Self>) -> Vec<TaskResult> {
        let mut launched = Vec::new();
        let mut failed = Vec::new();

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if !state.dispatching {
                return failed;
            }

            let mut blocked = Vec::new();
            while state.running.len() < self.config.max_concurrent_tasks {
                let Some(entry) = state.queue.pop() else {
                    break;
                };

                match state.readiness(&entry.task_id) {
                    Readiness::Ready => {
                        let now = self.clock.now();
                        if let Some(task) = state.tasks.get_mut(&entry.task_id) {
                            task.status = TaskStatus::Running;
                            task.started_at = Some(now);
                            let (signal, cancel_rx) = CancelSignal::new();
                            launched.push((task.clone(), cancel_rx));
                            state.running.insert(
                                entry.task_id.clone(),
                                RunningTask {
                                    signal,
                                    handle: None,
                                },
                            );
                        }
                    }
                    Readiness::Waiting => blocked.push(entry),
                    Readiness::DependencyFailed(dependency) => {
                        let reason = AppError::DependencyFailed {
                            task_id: entry.task_id.clone(),
                            dependency_id: dependency,
                        };
                        failed.extend(self.finalize(
                            state,
                            &entry.task_id,
                            TaskStatus::Failed,
                            None,
                            Some(reason.to_string()),
                            0,
                            Duration::ZERO,
                        ));
                    }
                    Readiness::Gone => {}
                }
            }

            for entry in blocked {
                state.queue.push(entry);
            }
        }

        for (task, cancel_rx) in launched {
            debug!("Dispatching task {} on agent {}", task.id, self.agent_id);
            if let Some(observer) = &self.observer {
                observer.task_started(&task);
            }

            let task_id = task.id.clone();
            let shared = Arc::clone(self);
            let handle = tokio::spawn(async move {
                shared.execute(task, cancel_rx).await;
            });

            let mut state = self.state.lock();
            if let Some(running) = state.running.get_mut(&task_id) {
                running.handle = Some(handle);
            }
        }

        failed
    }

    async fn execute(self: Arc<Self>, task: Task, cancel_rx: watch::Receiver<bool>) {
        let started = Instant::now();
        let timeout = task.timeout.unwrap_or(self.config.task_timeout);
        let attempts = AtomicU32::new(0);

        let outcome =
            tokio::time::timeout(timeout, self.run_attempts(&task, &cancel_rx, &attempts)).await;

        let (status, output, error) = match outcome {
            Ok(Ok(value)) => (TaskStatus::Succeeded, Some(value), None),
            Ok(Err(TaskError::Cancelled)) => {
                (TaskStatus::Cancelled, None, Some(TaskError::Cancelled.to_string()))
            }
            Ok(Err(e)) => (TaskStatus::Failed, None, Some(e.to_string())),
            Err(_) => {
                warn!("Task {} timed out after {:?}", task.id, timeout);
                let error = AppError::timeout(format!("task {} exceeded {:?}", task.id, timeout));
                (TaskStatus::TimedOut, None, Some(error.to_string()))
            }
        };

        let results = {
            let mut state = self.state.lock();
            state.running.remove(&task.id);
            self.finalize(
                &mut state,
                &task.id,
                status,
                output,
                error,
                attempts.load(AtomicOrdering::SeqCst),
                started.elapsed(),
            )
        };

        self.publish(executed_first(results)).await;
        self.wakeup.notify_one();
    }

    async fn run_attempts(
        &self,
        task: &Task,
        cancel_rx: &watch::Receiver<bool>,
        attempts: &AtomicU32,
    ) -> Result<serde_json::Value, TaskError> {
        let handler = self
            .handlers
            .get(&task.task_type)
            .ok_or_else(|| TaskError::Failed(format!("no handler for type {}", task.task_type)))?;

        loop {
            let attempt = attempts.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            let ctx = TaskContext::new(task, attempt, cancel_rx.clone());

            let error = match handler.execute(task, ctx.clone()).await {
                Ok(value) => return Ok(value),
                Err(TaskError::Cancelled) => return Err(TaskError::Cancelled),
                Err(e) => e,
            };

            let Some(policy) = &task.retry_policy else {
                return Err(error);
            };
            if attempt > policy.max_retries || ctx.is_cancelled() {
                return Err(error);
            }

            let delay = policy.delay_for(attempt - 1);
            debug!(
                "Retrying task {} in {:?} (attempt {} failed: {})",
                task.id, delay, attempt, error
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancelled() => return Err(TaskError::Cancelled),
            }
        }
    }

    /// Notify observers and the store about terminal results.
    /// Each result carries whether a handler actually ran it.
    async fn publish(&self, results: Vec<(TaskResult, bool)>) {
        if results.is_empty() {
            return;
        }

        for (result, executed) in &results {
            if let Some(observer) = &self.observer {
                observer.task_finished(result, *executed);
            }
            if let Some(store) = &self.store {
                if let Err(e) = store.save_task_result(result).await {
                    warn!("Failed to persist result of task {}: {}", result.task_id, e);
                }
            }
        }

        self.completions.send_modify(|count| *count += results.len() as u64);
    }
}

/// Only the first result of a `finalize` call ran; the rest are dependents
fn executed_first(results: Vec<TaskResult>) -> Vec<(TaskResult, bool)> {
    results
        .into_iter()
        .enumerate()
        .map(|(index, result)| (result, index == 0))
        .collect()
}

fn never_executed(results: Vec<TaskResult>) -> Vec<(TaskResult, bool)> {
    results.into_iter().map(|result| (result, false)).collect()
}

/// Per-agent task scheduler
pub struct TaskScheduler {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>>,
}

impl TaskScheduler {
    pub fn new(
        agent_id: &str,
        config: SchedulerConfig,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (completions, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                agent_id: agent_id.to_string(),
                state: Mutex::new(SchedulerState {
                    tasks: HashMap::new(),
                    results: HashMap::new(),
                    queue: BinaryHeap::new(),
                    running: HashMap::new(),
                    finished_order: VecDeque::new(),
                    metrics: TaskMetrics::new(agent_id),
                    started: false,
                    dispatching: false,
                    seq: 0,
                }),
                config,
                handlers,
                observer: None,
                store: None,
                clock,
                wakeup: Notify::new(),
                completions,
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Attach an observer and a result store; must be called before use
    pub fn with_hooks(
        mut self,
        observer: Option<Arc<dyn TaskObserver>>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.observer = observer;
            shared.store = store;
        }
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Admit a task; fails fast when the queue is full
    pub fn submit(&self, spec: TaskSpec) -> AppResult<String> {
        let task = Task::from_spec(&self.shared.agent_id, spec, self.shared.clock.now());
        self.shared.handlers.validate(&task)?;

        let task_id = task.id.clone();
        {
            let mut state = self.shared.state.lock();

            let outstanding = state.queue.len() + state.running.len();
            if outstanding >= self.shared.config.task_queue_size {
                return Err(AppError::capacity(format!(
                    "task queue full for agent {} ({} tasks)",
                    self.shared.agent_id, self.shared.config.task_queue_size
                )));
            }

            if let Some(unknown) = task
                .dependencies
                .iter()
                .find(|dependency| !state.tasks.contains_key(dependency.as_str()))
            {
                return Err(AppError::validation(format!(
                    "unknown dependency {} for agent {}",
                    unknown, self.shared.agent_id
                )));
            }

            state.seq += 1;
            let entry = QueuedTask {
                task_id: task_id.clone(),
                priority: task.priority,
                created_at: task.created_at,
                seq: state.seq,
            };
            state.metrics.record_submitted(&task.task_type);
            state.tasks.insert(task_id.clone(), task);
            state.queue.push(entry);
        }

        debug!("Task {} queued on agent {}", task_id, self.shared.agent_id);
        self.shared.wakeup.notify_one();
        Ok(task_id)
    }

    /// Start the dispatch loop
    pub fn start(&self) {
        {
            let mut state = self.shared.state.lock();
            state.started = true;
            state.dispatching = true;
        }

        let mut dispatcher = self.dispatcher.lock();
        let alive = dispatcher
            .as_ref()
            .map(|(handle, _)| !handle.is_finished())
            .unwrap_or(false);
        if !alive {
            let (stop_tx, stop_rx) = watch::channel(false);
            let shared = Arc::clone(&self.shared);
            let handle = tokio::spawn(dispatch_loop(shared, stop_rx));
            *dispatcher = Some((handle, stop_tx));
        }

        self.shared.wakeup.notify_one();
    }

    /// Stop dispatching new tasks; running tasks continue
    pub fn pause(&self) {
        self.shared.state.lock().dispatching = false;
    }

    pub fn resume(&self) {
        self.shared.state.lock().dispatching = true;
        self.shared.wakeup.notify_one();
    }

    /// Stop dispatching and drain running tasks within `timeout`.
    ///
    /// Tasks still running afterwards are cancelled forcibly. Pending
    /// tasks stay queued and dispatch again after a restart.
    pub async fn stop(&self, timeout: Duration) -> DrainReport {
        {
            let mut state = self.shared.state.lock();
            state.dispatching = false;
            state.started = false;
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some((handle, stop_tx)) = dispatcher {
            stop_tx.send_replace(true);
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                warn!("Dispatcher for agent {} did not exit in time", self.shared.agent_id);
            }
        }

        let drained = self.wait_until_idle(timeout).await;
        if drained {
            return DrainReport {
                drained: true,
                forced: Vec::new(),
            };
        }

        let (forced, results) = {
            let mut state = self.shared.state.lock();
            let running: Vec<(String, RunningTask)> = state.running.drain().collect();
            let mut results = Vec::new();
            let mut forced = Vec::new();

            for (task_id, running) in running {
                running.signal.cancel();
                if let Some(handle) = running.handle {
                    handle.abort();
                }
                let elapsed = state
                    .tasks
                    .get(&task_id)
                    .and_then(|t| t.started_at)
                    .map(|s| (self.shared.clock.now() - s).to_std().unwrap_or_default())
                    .unwrap_or_default();
                results.extend(executed_first(self.shared.finalize(
                    &mut state,
                    &task_id,
                    TaskStatus::Cancelled,
                    None,
                    Some("cancelled by forced stop".to_string()),
                    1,
                    elapsed,
                )));
                forced.push(task_id);
            }
            (forced, results)
        };

        warn!(
            "Agent {} drain timed out after {:?}; forcibly cancelled {} task(s)",
            self.shared.agent_id,
            timeout,
            forced.len()
        );
        self.shared.publish(results).await;

        DrainReport {
            drained: false,
            forced,
        }
    }

    async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let mut completions = self.shared.completions.subscribe();
        let wait = async {
            loop {
                if self.shared.state.lock().running.is_empty() {
                    return;
                }
                if completions.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Cancel a task. Pending tasks are removed, running tasks signalled.
    pub async fn cancel(&self, task_id: &str) -> AppResult<CancelOutcome> {
        let (outcome, results) = {
            let mut state = self.shared.state.lock();
            let status = state
                .tasks
                .get(task_id)
                .map(|t| t.status)
                .ok_or_else(|| AppError::not_found("task", task_id))?;

            match status {
                TaskStatus::Pending => {
                    state.queue.retain(|entry| entry.task_id != task_id);
                    let results = self.shared.finalize(
                        &mut state,
                        task_id,
                        TaskStatus::Cancelled,
                        None,
                        Some("cancelled before execution".to_string()),
                        0,
                        Duration::ZERO,
                    );
                    (CancelOutcome::Cancelled, results)
                }
                TaskStatus::Running => {
                    if let Some(task) = state.tasks.get_mut(task_id) {
                        task.cancel_requested = true;
                    }
                    if let Some(running) = state.running.get(task_id) {
                        running.signal.cancel();
                    }
                    (CancelOutcome::Requested, Vec::new())
                }
                terminal => (CancelOutcome::AlreadyFinished(terminal), Vec::new()),
            }
        };

        info!("Cancel task {} on agent {}: {:?}", task_id, self.shared.agent_id, outcome);
        self.shared.publish(never_executed(results)).await;
        Ok(outcome)
    }

    pub fn get_task(&self, task_id: &str) -> AppResult<Task> {
        self.shared
            .state
            .lock()
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| AppError::not_found("task", task_id))
    }

    /// `None` while the task has not reached a terminal status
    pub fn get_result(&self, task_id: &str) -> AppResult<Option<TaskResult>> {
        let state = self.shared.state.lock();
        if !state.tasks.contains_key(task_id) {
            return Err(AppError::not_found("task", task_id));
        }
        Ok(state.results.get(task_id).cloned())
    }

    /// Wait for a task's result, bounded by `timeout`
    pub async fn wait_for_result(&self, task_id: &str, timeout: Duration) -> AppResult<TaskResult> {
        let mut completions = self.shared.completions.subscribe();
        let wait = async {
            loop {
                match self.get_result(task_id) {
                    Ok(Some(result)) => return Ok(result),
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
                if completions.changed().await.is_err() {
                    return Err(AppError::not_found("task", task_id));
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| AppError::timeout(format!("waiting for task {}", task_id)))?
    }

    /// Filtered task listing ordered by creation time
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = {
            let state = self.shared.state.lock();
            state
                .tasks
                .values()
                .filter(|t| filter.matches(t))
                .cloned()
                .collect()
        };
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let limit = filter.limit.unwrap_or(usize::MAX);
        tasks.into_iter().skip(filter.offset).take(limit).collect()
    }

    pub fn metrics(&self) -> TaskMetrics {
        self.shared.state.lock().metrics.clone()
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.shared.state.lock();
        SchedulerStatus {
            agent_id: self.shared.agent_id.clone(),
            started: state.started,
            dispatching: state.dispatching,
            pending_tasks: state.queue.len(),
            running_tasks: state.running.len(),
            handler_types: self.shared.handlers.types(),
        }
    }

    /// (running, pending) counts
    pub fn load(&self) -> (usize, usize) {
        let state = self.shared.state.lock();
        (state.running.len(), state.queue.len())
    }

    /// False when the dispatch loop exited while it should be running
    pub fn dispatcher_alive(&self) -> bool {
        let started = self.shared.state.lock().started;
        if !started {
            return true;
        }
        self.dispatcher
            .lock()
            .as_ref()
            .map(|(handle, _)| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if let Some((handle, _)) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    debug!("Dispatcher started for agent {}", shared.agent_id);

    loop {
        let failed = shared.dispatch_ready();
        if !failed.is_empty() {
            shared.publish(never_executed(failed)).await;
            // Failures may unblock or fail further dependents
            continue;
        }

        tokio::select! {
            _ = shared.wakeup.notified() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Dispatcher stopped for agent {}", shared.agent_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{clock::SystemClock, store::InMemoryStore};
    use serde_json::json;

    fn scheduler(max_concurrent: usize, queue_size: usize) -> TaskScheduler {
        TaskScheduler::new(
            "agent-test",
            SchedulerConfig {
                max_concurrent_tasks: max_concurrent,
                task_queue_size: queue_size,
                task_timeout: Duration::from_secs(5),
                retained_tasks: 100,
            },
            Arc::new(HandlerRegistry::with_builtin_handlers()),
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn test_queue_ordering() {
        let now = Utc::now();
        let mut heap = BinaryHeap::new();
        heap.push(QueuedTask { task_id: "low".into(), priority: 1, created_at: now, seq: 1 });
        heap.push(QueuedTask { task_id: "high-late".into(), priority: 5, created_at: now, seq: 3 });
        heap.push(QueuedTask { task_id: "high-early".into(), priority: 5, created_at: now, seq: 2 });

        assert_eq!(heap.pop().unwrap().task_id, "high-early");
        assert_eq!(heap.pop().unwrap().task_id, "high-late");
        assert_eq!(heap.pop().unwrap().task_id, "low");
    }

    #[tokio::test]
    async fn test_queue_full_fails_fast() {
        let scheduler = scheduler(1, 2);

        scheduler.submit(TaskSpec::new("echo", json!({}))).unwrap();
        scheduler.submit(TaskSpec::new("echo", json!({}))).unwrap();
        let overflow = scheduler.submit(TaskSpec::new("echo", json!({})));

        assert!(matches!(overflow, Err(AppError::CapacityExceeded { .. })));
        assert_eq!(scheduler.list(&TaskFilter::new()).len(), 2);
    }

    #[tokio::test]
    async fn test_priority_dispatch_order() {
        let scheduler = scheduler(1, 10);
        let low = scheduler
            .submit(TaskSpec::new("echo", json!({})).with_priority(1))
            .unwrap();
        let high = scheduler
            .submit(TaskSpec::new("echo", json!({})).with_priority(5))
            .unwrap();

        scheduler.start();
        let low_result = scheduler.wait_for_result(&low, Duration::from_secs(2)).await.unwrap();
        let high_result = scheduler.wait_for_result(&high, Duration::from_secs(2)).await.unwrap();

        assert!(high_result.started_at.unwrap() <= low_result.started_at.unwrap());
        assert!(high_result.completed_at <= low_result.started_at.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_marks_timed_out() {
        let scheduler = scheduler(1, 10);
        scheduler.start();

        let id = scheduler
            .submit(
                TaskSpec::new("delay", json!({"duration": "5s"}))
                    .with_timeout(Duration::from_millis(50)),
            )
            .unwrap();

        let result = scheduler.wait_for_result(&id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.status, TaskStatus::TimedOut);
        assert_eq!(scheduler.metrics().timeout_tasks, 1);
        assert_eq!(scheduler.metrics().failed_tasks, 1);
    }

    #[tokio::test]
    async fn test_cancel_running_is_request_then_ack() {
        let scheduler = scheduler(1, 10);
        scheduler.start();

        let id = scheduler
            .submit(TaskSpec::new("delay", json!({"duration": "10s"})))
            .unwrap();

        let running = async {
            loop {
                if scheduler.get_task(&id).unwrap().status == TaskStatus::Running {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(1), running).await.unwrap();

        let outcome = scheduler.cancel(&id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Requested);

        let result = scheduler.wait_for_result(&id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);

        let again = scheduler.cancel(&id).await.unwrap();
        assert_eq!(again, CancelOutcome::AlreadyFinished(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_retry_policy_counts_attempts() {
        let scheduler = scheduler(1, 10);
        scheduler.start();

        let policy = crate::runtime::task::RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        };
        let id = scheduler
            .submit(TaskSpec::new("error", json!({"message": "nope"})).with_retry_policy(policy))
            .unwrap();

        let result = scheduler.wait_for_result(&id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.attempts, 3);
        assert!(result.error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_forced_stop_cancels_stragglers() {
        let scheduler = scheduler(2, 10);
        scheduler.start();

        let id = scheduler
            .submit(TaskSpec::new("delay", json!({"duration": "10s"})))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The delay handler honours cancellation, so draining with a zero
        // timeout is what forces the cancel path here.
        let report = scheduler.stop(Duration::ZERO).await;
        assert!(!report.drained);
        assert_eq!(report.forced, vec![id.clone()]);
        assert_eq!(scheduler.get_task(&id).unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_terminal_results_are_persisted() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler =
            scheduler(1, 10).with_hooks(None, Some(store.clone() as Arc<dyn StateStore>));
        scheduler.start();

        let done = scheduler.submit(TaskSpec::new("echo", json!({}))).unwrap();
        scheduler.wait_for_result(&done, Duration::from_secs(2)).await.unwrap();
        let saved = store.load_task_result(&done).await.unwrap().unwrap();
        assert_eq!(saved.status, TaskStatus::Succeeded);

        let slow = scheduler
            .submit(TaskSpec::new("delay", json!({"duration": "10s"})))
            .unwrap();
        let dependent = scheduler
            .submit(TaskSpec::new("echo", json!({})).with_dependency(&slow))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let report = scheduler.stop(Duration::ZERO).await;
        assert_eq!(report.forced, vec![slow.clone()]);

        let forced = store.load_task_result(&slow).await.unwrap().unwrap();
        assert_eq!(forced.status, TaskStatus::Cancelled);
        let failed = store.load_task_result(&dependent).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.attempts, 0);
    }
}
