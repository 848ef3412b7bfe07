//! Configuration management module
//!
//! Provides configuration management with:
//! - TOML-based configuration files
//! - Environment variable overrides (`AGENT_RUNTIME__SECTION__KEY`)
//! - Validation and conversion into the runtime types
//!
//! Durations are written in whole seconds so files stay readable.

use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::{debug, info};

use crate::{
    error::{AppError, AppResult},
    messaging::{MessagingConfig, PollerConfig},
    pool::PoolManagerConfig,
    runtime::{AgentConfig, ManagerConfig, ResourceAllocation},
};

const CONFIG_FILE_NAME: &str = "agent-runtime.toml";
const ENV_PREFIX: &str = "AGENT_RUNTIME";

/// Main runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub logging: LoggingConfig,
    pub manager: ManagerSettings,
    pub agent_defaults: AgentDefaults,
    pub pools: PoolSettings,
    pub messaging: MessagingSettings,
}

impl RuntimeConfig {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./agent-runtime.toml
    /// 2. ~/.config/agent-runtime/config.toml
    /// 3. Default configuration
    pub async fn load() -> AppResult<Self> {
        info!("Loading runtime configuration");

        if let Ok(config) = Self::load_from_file(CONFIG_FILE_NAME).await {
            info!("Loaded configuration from ./{}", CONFIG_FILE_NAME);
            return Ok(config);
        }

        if let Some(config_path) = Self::get_user_config_path() {
            if let Ok(config) = Self::load_from_file(&config_path).await {
                info!("Loaded configuration from {}", config_path.display());
                return Ok(config);
            }
        }

        info!("Using default configuration");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path).await?;
        let config: RuntimeConfig = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Layer defaults, an optional file and environment overrides
    ///
    /// `AGENT_RUNTIME__MANAGER__MAX_AGENTS=10` overrides
    /// `manager.max_agents`.
    pub fn load_with_env(path: Option<&Path>) -> AppResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            debug!("Layering configuration file: {}", path.display());
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config: RuntimeConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> AppResult<()> {
        debug!("Validating configuration");

        let nonzero = [
            ("manager.max_agents", self.manager.max_agents as u64),
            ("manager.health_check_interval_secs", self.manager.health_check_interval_secs),
            ("manager.shutdown_timeout_secs", self.manager.shutdown_timeout_secs),
            ("agent_defaults.max_concurrent_tasks", self.agent_defaults.max_concurrent_tasks as u64),
            ("agent_defaults.task_queue_size", self.agent_defaults.task_queue_size as u64),
            ("agent_defaults.heartbeat_interval_secs", self.agent_defaults.heartbeat_interval_secs),
            ("agent_defaults.task_timeout_secs", self.agent_defaults.task_timeout_secs),
            ("pools.max_pools", self.pools.max_pools as u64),
            ("pools.health_check_interval_secs", self.pools.health_check_interval_secs),
            ("pools.scaling_interval_secs", self.pools.scaling_interval_secs),
            ("pools.default_max_agents", self.pools.default_max_agents as u64),
            ("messaging.default_message_ttl_secs", self.messaging.default_message_ttl_secs),
            ("messaging.pending_limit", self.messaging.pending_limit as u64),
            ("messaging.poll_interval_ms", self.messaging.poll_interval_ms),
        ];
        if let Some((key, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(AppError::validation(format!("{} must be greater than 0", key)));
        }

        if self.pools.default_min_agents > self.pools.default_max_agents {
            return Err(AppError::validation(format!(
                "pools.default_min_agents ({}) must not exceed pools.default_max_agents ({})",
                self.pools.default_min_agents, self.pools.default_max_agents
            )));
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Get user configuration directory path
    fn get_user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push("agent-runtime");
            path.push("config.toml");
            path
        })
    }

    pub fn agent_config(&self) -> AgentConfig {
        let defaults = &self.agent_defaults;
        AgentConfig {
            max_concurrent_tasks: defaults.max_concurrent_tasks,
            task_queue_size: defaults.task_queue_size,
            heartbeat_interval: Duration::from_secs(defaults.heartbeat_interval_secs),
            task_timeout: Duration::from_secs(defaults.task_timeout_secs),
            retained_tasks: defaults.retained_tasks,
            resources: ResourceAllocation {
                cpu_millicores: defaults.cpu_millicores,
                memory_mb: defaults.memory_mb,
            },
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_agents: self.manager.max_agents,
            health_check_interval: Duration::from_secs(self.manager.health_check_interval_secs),
            shutdown_timeout: Duration::from_secs(self.manager.shutdown_timeout_secs),
            default_agent_config: self.agent_config(),
        }
    }

    pub fn pool_manager_config(&self) -> PoolManagerConfig {
        PoolManagerConfig {
            max_pools: self.pools.max_pools,
            default_health_check_interval: Duration::from_secs(self.pools.health_check_interval_secs),
            default_unhealthy_grace_period: Duration::from_secs(
                self.pools.unhealthy_grace_period_secs,
            ),
            scaling_interval: Duration::from_secs(self.pools.scaling_interval_secs),
        }
    }

    pub fn messaging_config(&self) -> MessagingConfig {
        MessagingConfig {
            default_message_ttl: Duration::from_secs(self.messaging.default_message_ttl_secs),
            default_publication_ttl_seconds: self.messaging.default_publication_ttl_secs,
            pending_limit: self.messaging.pending_limit,
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(self.messaging.poll_interval_ms),
            batch_size: self.messaging.pending_limit,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for this crate when `RUST_LOG` is unset
    pub level: String,
    /// Include module targets in log lines
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: if cfg!(debug_assertions) {
                "debug"
            } else {
                "info"
            }
            .to_string(),
            show_target: true,
        }
    }
}

/// Fleet-wide limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    pub max_agents: usize,
    pub health_check_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_agents: 100,
            health_check_interval_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Defaults for agents created without explicit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefaults {
    pub max_concurrent_tasks: usize,
    pub task_queue_size: usize,
    pub heartbeat_interval_secs: u64,
    pub task_timeout_secs: u64,
    pub retained_tasks: usize,
    pub cpu_millicores: u32,
    pub memory_mb: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        let agent = AgentConfig::default();
        Self {
            max_concurrent_tasks: agent.max_concurrent_tasks,
            task_queue_size: agent.task_queue_size,
            heartbeat_interval_secs: agent.heartbeat_interval.as_secs(),
            task_timeout_secs: agent.task_timeout.as_secs(),
            retained_tasks: agent.retained_tasks,
            cpu_millicores: agent.resources.cpu_millicores,
            memory_mb: agent.resources.memory_mb,
        }
    }
}

/// Pool manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_pools: usize,
    pub health_check_interval_secs: u64,
    pub unhealthy_grace_period_secs: u64,
    pub scaling_interval_secs: u64,
    /// Bounds suggested for pools created without explicit sizes
    pub default_min_agents: usize,
    pub default_max_agents: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_pools: 50,
            health_check_interval_secs: 30,
            unhealthy_grace_period_secs: 60,
            scaling_interval_secs: 30,
            default_min_agents: 1,
            default_max_agents: 10,
        }
    }
}

/// Messaging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingSettings {
    pub default_message_ttl_secs: u64,
    pub default_publication_ttl_secs: u64,
    pub pending_limit: usize,
    pub poll_interval_ms: u64,
}

impl Default for MessagingSettings {
    fn default() -> Self {
        Self {
            default_message_ttl_secs: 3600,
            default_publication_ttl_secs: 3600,
            pending_limit: 50,
            poll_interval_ms: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_runtime_types() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());

        let manager = config.manager_config();
        assert_eq!(manager.max_agents, 100);
        assert_eq!(manager.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(manager.default_agent_config, AgentConfig::default());

        assert_eq!(config.messaging_config().default_message_ttl, Duration::from_secs(3600));
        assert_eq!(config.pool_manager_config().max_pools, 50);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("agent-runtime.toml");

        let mut config = RuntimeConfig::default();
        config.manager.max_agents = 12;
        config.agent_defaults.task_queue_size = 7;
        config.save_to_file(&path).await.unwrap();

        let loaded = RuntimeConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.agent_config().task_queue_size, 7);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[manager]\nmax_agents = 3\n").await.unwrap();

        let loaded = RuntimeConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.manager.max_agents, 3);
        assert_eq!(loaded.manager.shutdown_timeout_secs, 30);
        assert_eq!(loaded.messaging, MessagingSettings::default());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RuntimeConfig::default();
        config.agent_defaults.max_concurrent_tasks = 0;
        assert!(matches!(config.validate(), Err(AppError::Validation { .. })));

        let mut config = RuntimeConfig::default();
        config.pools.default_min_agents = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("layered.toml");
        std::fs::write(&path, "[pools]\nmax_pools = 4\n[messaging]\npending_limit = 9\n").unwrap();

        std::env::set_var("AGENT_RUNTIME__MESSAGING__PENDING_LIMIT", "25");
        let config = RuntimeConfig::load_with_env(Some(&path));
        std::env::remove_var("AGENT_RUNTIME__MESSAGING__PENDING_LIMIT");

        let config = config.unwrap();
        assert_eq!(config.pools.max_pools, 4);
        assert_eq!(config.messaging.pending_limit, 25);
        assert_eq!(config.manager.max_agents, 100);
    }
}
