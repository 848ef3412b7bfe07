//! Agent Runtime - lifecycle, scheduling, pooling and messaging for agents
//!
//! This library hosts a fleet of stateful agents, each with its own
//! bounded, priority-ordered task queue, and groups them into pools that
//! balance load and scale themselves.
//!
//! # Architecture
//!
//! The crate is layered leaves first:
//! - **Runtime**: agent state machine, per-agent task scheduler, runtime
//!   manager with fleet metrics and a pluggable state store
//! - **Pool**: pool membership, load-balancing strategies, health checks
//!   and the auto-scaling control loop
//! - **Messaging**: direct addressed messages and topic publish/subscribe
//! - **Config**: TOML and environment configuration

pub mod config;
pub mod error;
pub mod messaging;
pub mod pool;
pub mod runtime;

pub use config::{LoggingConfig, RuntimeConfig};
pub use error::{AppError, AppResult, ErrorSeverity};
pub use messaging::{CommunicationPoller, MessageService, PubSubService};
pub use pool::{AgentPool, PoolConfig, PoolManager};
pub use runtime::{Agent, AgentConfig, AgentState, RuntimeManager, TaskSpec, TaskStatus};

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "agent_runtime=info";

/// Initialize the logging system with structured logging
///
/// Log levels come from `RUST_LOG`, defaulting to `agent_runtime=info`.
/// Calling it again after a subscriber is installed does nothing.
pub fn initialize_logging() -> Result<()> {
    install_subscriber(DEFAULT_LOG_FILTER.to_string(), true)
}

/// Initialize logging at the configured level unless `RUST_LOG` is set
pub fn initialize_logging_with(config: &LoggingConfig) -> Result<()> {
    install_subscriber(format!("agent_runtime={}", config.level), config.show_target)
}

fn install_subscriber(default_filter: String, show_target: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&default_filter))?;

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(show_target))
        .try_init();

    if installed.is_err() {
        tracing::debug!("Logging already initialized");
    }
    Ok(())
}
