//! Task model: submissions, lifecycle status, results, filters and metrics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, time::Duration};
use uuid::Uuid;

/// Default priority assigned when a submission does not specify one
pub const DEFAULT_TASK_PRIORITY: u8 = 5;
/// Highest accepted priority; larger values are clamped
pub const MAX_TASK_PRIORITY: u8 = 10;

/// Generate a new task identifier
pub fn generate_task_id() -> String {
    format!("task_{}", Uuid::new_v4())
}

/// Task lifecycle status
///
/// Status only moves forward: `pending -> running -> terminal`, or
/// `pending -> terminal` for cancellation and dependency failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut
        )
    }

    /// Failure outcome for metrics purposes; a timeout counts as a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed | TaskStatus::TimedOut)
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            _ => 2,
        }
    }

    /// Whether moving to `next` keeps the status monotonic
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff for retrying failed handler attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(32) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

/// A task submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_type: String,
    pub name: Option<String>,
    pub payload: serde_json::Value,
    pub priority: u8,
    pub timeout: Option<Duration>,
    pub dependencies: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub retry_policy: Option<RetryPolicy>,
}

impl TaskSpec {
    pub fn new<S: Into<String>>(task_type: S, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            name: None,
            payload,
            priority: DEFAULT_TASK_PRIORITY,
            timeout: None,
            dependencies: Vec::new(),
            metadata: HashMap::new(),
            retry_policy: None,
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_dependency<S: Into<String>>(mut self, task_id: S) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// A task owned by one agent's scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub agent_id: String,
    pub task_type: String,
    pub name: Option<String>,
    pub payload: serde_json::Value,
    /// Higher is more urgent, 0..=10
    pub priority: u8,
    pub timeout: Option<Duration>,
    pub dependencies: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub retry_policy: Option<RetryPolicy>,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    /// Cancellation was signalled but not yet honored
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn from_spec(agent_id: &str, spec: TaskSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            id: generate_task_id(),
            agent_id: agent_id.to_string(),
            task_type: spec.task_type,
            name: spec.name,
            payload: spec.payload,
            priority: spec.priority.min(MAX_TASK_PRIORITY),
            timeout: spec.timeout,
            dependencies: spec.dependencies,
            metadata: spec.metadata,
            retry_policy: spec.retry_policy,
            created_at,
            status: TaskStatus::Pending,
            cancel_requested: false,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Outcome record, written once on the terminal transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Handler invocations, 0 when the task never ran
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

/// Read-only task query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Empty matches every status
    pub statuses: Vec<TaskStatus>,
    pub task_type: Option<String>,
    pub min_priority: Option<u8>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_type<S: Into<String>>(mut self, task_type: S) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_min_priority(mut self, priority: u8) -> Self {
        self.min_priority = Some(priority);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(task_type) = &self.task_type {
            if &task.task_type != task_type {
                return false;
            }
        }
        if let Some(min) = self.min_priority {
            if task.priority < min {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if task.created_at <= after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if task.created_at >= before {
                return false;
            }
        }
        true
    }
}

/// Per-agent task counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub agent_id: String,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    /// Includes timed-out and dependency-failed tasks
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub timeout_tasks: u64,
    pub total_duration: Duration,
    pub average_duration: Duration,
    pub tasks_by_type: HashMap<String, u64>,
}

impl TaskMetrics {
    pub(crate) fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            ..Self::default()
        }
    }

    pub(crate) fn record_submitted(&mut self, task_type: &str) {
        self.total_tasks += 1;
        *self.tasks_by_type.entry(task_type.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn record_finished(&mut self, status: TaskStatus, duration: Duration) {
        match status {
            TaskStatus::Succeeded => self.completed_tasks += 1,
            TaskStatus::Failed => self.failed_tasks += 1,
            TaskStatus::TimedOut => {
                self.timeout_tasks += 1;
                self.failed_tasks += 1;
            }
            TaskStatus::Cancelled => self.cancelled_tasks += 1,
            TaskStatus::Pending | TaskStatus::Running => return,
        }

        self.total_duration += duration;
        let finished = self.completed_tasks + self.failed_tasks + self.cancelled_tasks;
        if finished > 0 {
            self.average_duration = self.total_duration / finished as u32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::TimedOut));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Succeeded.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[test]
    fn test_priority_is_clamped() {
        let spec = TaskSpec::new("echo", serde_json::json!({})).with_priority(42);
        let task = Task::from_spec("agent-1", spec, Utc::now());

        assert_eq!(task.priority, MAX_TASK_PRIORITY);
        assert!(task.id.starts_with("task_"));
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_filter_matching() {
        let now = Utc::now();
        let task = Task::from_spec(
            "agent-1",
            TaskSpec::new("echo", serde_json::json!({})).with_priority(7),
            now,
        );

        assert!(TaskFilter::new().matches(&task));
        assert!(TaskFilter::new().with_status(TaskStatus::Pending).matches(&task));
        assert!(!TaskFilter::new().with_status(TaskStatus::Running).matches(&task));
        assert!(TaskFilter::new().with_min_priority(7).matches(&task));
        assert!(!TaskFilter::new().with_min_priority(8).matches(&task));
        assert!(!TaskFilter::new().with_type("delay").matches(&task));
    }

    #[test]
    fn test_metrics_count_timeout_as_failure() {
        let mut metrics = TaskMetrics::new("agent-1");
        metrics.record_submitted("echo");
        metrics.record_submitted("echo");
        metrics.record_finished(TaskStatus::Succeeded, Duration::from_millis(10));
        metrics.record_finished(TaskStatus::TimedOut, Duration::from_millis(30));

        assert_eq!(metrics.total_tasks, 2);
        assert_eq!(metrics.completed_tasks, 1);
        assert_eq!(metrics.failed_tasks, 1);
        assert_eq!(metrics.timeout_tasks, 1);
        assert_eq!(metrics.average_duration, Duration::from_millis(20));
        assert_eq!(metrics.tasks_by_type.get("echo"), Some(&2));
    }
}
