//! Task handlers
//!
//! A handler executes one task type. Handlers receive a [`TaskContext`]
//! carrying the cooperative cancellation signal and are expected to
//! check it at safe points; the scheduler only marks a running task
//! `cancelled` once the handler has actually given up.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use super::task::Task;
use crate::error::{AppError, AppResult};

/// Handler-level failure, recorded in the task result
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The handler observed the cancellation signal and stopped
    #[error("task cancelled")]
    Cancelled,
}

/// Sending half of a task's cancellation signal
#[derive(Debug)]
pub(crate) struct CancelSignal {
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub(crate) fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Execution context handed to a handler
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub agent_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    cancel: watch::Receiver<bool>,
}

impl TaskContext {
    pub(crate) fn new(task: &Task, attempt: u32, cancel: watch::Receiver<bool>) -> Self {
        Self {
            task_id: task.id.clone(),
            agent_id: task.agent_id.clone(),
            attempt,
            cancel,
        }
    }

    /// Context that is never cancelled, for driving handlers directly
    pub fn detached(task: &Task) -> Self {
        let (_signal, rx) = CancelSignal::new();
        Self::new(task, 1, rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation has been requested
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Signal owner is gone, cancellation can no longer arrive
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Executes tasks of a single type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Task type served by this handler
    fn task_type(&self) -> &str;

    /// Reject malformed payloads at submission time
    fn validate(&self, _task: &Task) -> Result<(), TaskError> {
        Ok(())
    }

    async fn execute(&self, task: &Task, ctx: TaskContext) -> Result<Value, TaskError>;
}

/// Registry of handlers keyed by task type
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `echo`, `delay` and `error`
    pub fn with_builtin_handlers() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(EchoHandler));
        registry.register(Arc::new(DelayHandler));
        registry.register(Arc::new(ErrorHandler));
        registry
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register(&self, handler: Arc<dyn TaskHandler>) {
        let task_type = handler.task_type().to_string();
        debug!("Registering task handler: {}", task_type);
        self.handlers.write().insert(task_type, handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(task_type).cloned()
    }

    /// Resolve the handler for a task and validate its payload
    pub fn validate(&self, task: &Task) -> AppResult<()> {
        let handler = self.get(&task.task_type).ok_or_else(|| {
            AppError::validation(format!(
                "no handler registered for task type '{}'",
                task.task_type
            ))
        })?;

        handler
            .validate(task)
            .map_err(|e| AppError::validation(format!("task {}: {}", task.task_type, e)))
    }

    /// Registered task types, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

/// Returns the payload unchanged
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn task_type(&self) -> &str {
        "echo"
    }

    async fn execute(&self, task: &Task, ctx: TaskContext) -> Result<Value, TaskError> {
        if ctx.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        Ok(json!({
            "echo": task.payload,
            "task_id": task.id,
        }))
    }
}

/// Sleeps for `payload.duration`, honouring cancellation
///
/// `duration` is either a number of seconds or a string such as
/// `"150ms"`, `"2s"` or `"1m30s"`.
#[derive(Debug, Default)]
pub struct DelayHandler;

impl DelayHandler {
    fn duration_of(task: &Task) -> Result<Duration, TaskError> {
        let value = task
            .payload
            .get("duration")
            .ok_or_else(|| TaskError::InvalidPayload("missing required field: duration".into()))?;

        match value {
            Value::Number(n) => {
                let secs = n
                    .as_f64()
                    .ok_or_else(|| TaskError::InvalidPayload("duration is not a number".into()))?;
                if secs < 0.0 || !secs.is_finite() {
                    return Err(TaskError::InvalidPayload("duration cannot be negative".into()));
                }
                Duration::try_from_secs_f64(secs)
                    .map_err(|_| TaskError::InvalidPayload("duration is out of range".into()))
            }
            Value::String(s) => parse_duration(s).map_err(TaskError::InvalidPayload),
            _ => Err(TaskError::InvalidPayload(
                "duration must be a string or number".into(),
            )),
        }
    }
}

#[async_trait]
impl TaskHandler for DelayHandler {
    fn task_type(&self) -> &str {
        "delay"
    }

    fn validate(&self, task: &Task) -> Result<(), TaskError> {
        Self::duration_of(task).map(|_| ())
    }

    async fn execute(&self, task: &Task, ctx: TaskContext) -> Result<Value, TaskError> {
        let duration = Self::duration_of(task)?;

        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(json!({
                "slept_ms": duration.as_millis() as u64,
            })),
            _ = ctx.cancelled() => Err(TaskError::Cancelled),
        }
    }
}

/// Always fails with `payload.message`
#[derive(Debug, Default)]
pub struct ErrorHandler;

#[async_trait]
impl TaskHandler for ErrorHandler {
    fn task_type(&self) -> &str {
        "error"
    }

    async fn execute(&self, task: &Task, _ctx: TaskContext) -> Result<Value, TaskError> {
        let message = task
            .payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("simulated failure");
        Err(TaskError::Failed(message.to_string()))
    }
}

/// Parse durations like `"300ms"`, `"1.5s"`, `"2m"` or `"1h30m"`
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.starts_with('-') {
        return Err("duration cannot be negative".to_string());
    }

    let mut total = 0f64;
    let mut rest = input;

    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{}'", input))?;
        if number_end == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let value: f64 = rest[..number_end]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", input))?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => return Err(format!("unknown unit '{}' in duration '{}'", unit, input)),
        };
        total += value * seconds_per_unit;
        rest = &rest[unit_end..];
    }

    Duration::try_from_secs_f64(total)
        .map_err(|_| format!("duration '{}' is out of range", input))
}
