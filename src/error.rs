//! Error handling for the agent runtime
//!
//! Every public operation returns [`AppResult`]. The variants mirror the
//! failure classes callers are expected to branch on: unknown IDs,
//! capacity limits, illegal lifecycle transitions, failed dependencies,
//! timeouts and malformed input. None of them are process-fatal.

use thiserror::Error;

/// Application result type alias
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Main runtime error enum
#[derive(Error, Debug)]
pub enum AppError {
    /// Agent, task, pool, message or subscription ID is unknown
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Fleet, pool or per-agent queue capacity reached
    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// Lifecycle transition not allowed from the current state
    #[error("Invalid state transition for {id}: {from} -> {to}")]
    InvalidStateTransition {
        id: String,
        from: String,
        to: String,
    },

    /// A task prerequisite did not succeed
    #[error("Dependency failed: task {task_id} depends on {dependency_id}")]
    DependencyFailed {
        task_id: String,
        dependency_id: String,
    },

    /// A bounded wait ran out
    #[error("Timeout: {message}")]
    Timeout { message: String },

    /// Malformed configuration or request
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Message or publication consumed after its TTL
    #[error("{kind} expired: {id}")]
    Expired { kind: &'static str, id: String },

    /// Persistence backend failure
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// I/O operation errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Layered configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// TOML parse errors
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AppError {
    /// Create a NotFound error
    pub fn not_found<S: Into<String>>(kind: &'static str, id: S) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a CapacityExceeded error
    pub fn capacity<S: Into<String>>(message: S) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    /// Create an InvalidStateTransition error
    pub fn invalid_transition<I, F, T>(id: I, from: F, to: T) -> Self
    where
        I: Into<String>,
        F: ToString,
        T: ToString,
    {
        Self::InvalidStateTransition {
            id: id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create a Timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a Validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a Storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::NotFound { .. } => true,
            AppError::CapacityExceeded { .. } => true,
            AppError::InvalidStateTransition { .. } => true,
            AppError::DependencyFailed { .. } => true,
            AppError::Timeout { .. } => true,
            AppError::Validation { .. } => true,
            AppError::Expired { .. } => true,
            AppError::Storage { .. } => true,
            AppError::Io(_) => false,
            AppError::Config(_) => false,
            AppError::TomlDe(_) => false,
            AppError::TomlSer(_) => false,
            AppError::Serde(_) => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AppError::NotFound { .. } => ErrorSeverity::Low,
            AppError::Validation { .. } => ErrorSeverity::Low,
            AppError::Expired { .. } => ErrorSeverity::Low,
            AppError::CapacityExceeded { .. } => ErrorSeverity::Medium,
            AppError::InvalidStateTransition { .. } => ErrorSeverity::Medium,
            AppError::DependencyFailed { .. } => ErrorSeverity::Medium,
            AppError::Timeout { .. } => ErrorSeverity::Medium,
            AppError::Storage { .. } => ErrorSeverity::High,
            AppError::Io(_) => ErrorSeverity::High,
            AppError::Config(_) => ErrorSeverity::High,
            AppError::TomlDe(_) => ErrorSeverity::High,
            AppError::TomlSer(_) => ErrorSeverity::High,
            AppError::Serde(_) => ErrorSeverity::Medium,
        }
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// Convert severity to string for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "LOW",
            ErrorSeverity::Medium => "MEDIUM",
            ErrorSeverity::High => "HIGH",
            ErrorSeverity::Critical => "CRITICAL",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_is_recoverable() {
        let errors = vec![
            AppError::not_found("agent", "agent-1"),
            AppError::capacity("fleet full"),
            AppError::invalid_transition("agent-1", "stopped", "paused"),
            AppError::DependencyFailed {
                task_id: "task_b".to_string(),
                dependency_id: "task_a".to_string(),
            },
            AppError::timeout("drain"),
            AppError::validation("min_agents > max_agents"),
        ];

        for error in errors {
            assert!(error.is_recoverable(), "{} should be recoverable", error);
        }
    }

    #[test]
    fn test_error_display() {
        let error = AppError::invalid_transition("agent-1", "stopped", "paused");
        assert_eq!(
            error.to_string(),
            "Invalid state transition for agent-1: stopped -> paused"
        );

        let error = AppError::not_found("pool", "pool-9");
        assert_eq!(error.to_string(), "pool not found: pool-9");
        assert_eq!(error.severity(), ErrorSeverity::Low);
        assert_eq!(error.severity().as_str(), "LOW");
    }
}
