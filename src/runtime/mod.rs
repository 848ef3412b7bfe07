//! Agent runtime
//!
//! Agents, their task schedulers and the fleet-level [`RuntimeManager`].

pub mod agent;
pub mod clock;
pub mod handler;
pub mod manager;
pub mod scheduler;
pub mod store;
pub mod task;

pub use agent::{
    generate_agent_id, Agent, AgentConfig, AgentInfo, AgentSpec, AgentState, LifecycleObserver,
    ResourceAllocation,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use handler::{
    parse_duration, DelayHandler, EchoHandler, ErrorHandler, HandlerRegistry, TaskContext,
    TaskError, TaskHandler,
};
pub use manager::{ManagerConfig, RuntimeManager, RuntimeMetrics, ShutdownReport};
pub use scheduler::{
    CancelOutcome, DrainReport, SchedulerConfig, SchedulerStatus, TaskObserver, TaskScheduler,
};
pub use store::{InMemoryStore, StateStore};
pub use task::{
    generate_task_id, RetryPolicy, Task, TaskFilter, TaskMetrics, TaskResult, TaskSpec,
    TaskStatus, DEFAULT_TASK_PRIORITY, MAX_TASK_PRIORITY,
};
