//! Inter-agent messaging
//!
//! Two services share agent identity but nothing else:
//! - [`MessageService`]: directly addressed messages, delivered by
//!   priority per recipient
//! - [`PubSubService`]: topic publications fanned out to subscriptions
//!
//! Neither touches the task scheduler. A `task_request` message can be
//! turned into a [`TaskSpec`] by the receiving side.

pub mod matcher;
pub mod message_service;
pub mod poller;
pub mod pubsub;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt, time::Duration};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    runtime::TaskSpec,
};

pub use matcher::SubscriptionMatcher;
pub use message_service::MessageService;
pub use poller::{CommunicationPoller, Inbound, PollerConfig};
pub use pubsub::PubSubService;

pub const DEFAULT_MESSAGE_PRIORITY: u8 = 5;

pub fn generate_message_id() -> String {
    format!("msg-{}", Uuid::new_v4())
}

pub fn generate_publication_id() -> String {
    format!("pub-{}", Uuid::new_v4())
}

pub fn generate_subscription_id() -> String {
    format!("sub-{}", Uuid::new_v4())
}

/// Messaging defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Validity of a direct message sent without a TTL
    pub default_message_ttl: Duration,
    /// Validity of a publication published without a TTL
    pub default_publication_ttl_seconds: u64,
    /// Pending messages returned when no limit is given
    pub pending_limit: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_message_ttl: Duration::from_secs(3600),
            default_publication_ttl_seconds: 3600,
            pending_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    DataShare,
    Command,
    Response,
    Notification,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskRequest => "task_request",
            MessageType::DataShare => "data_share",
            MessageType::Command => "command",
            MessageType::Response => "response",
            MessageType::Notification => "notification",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directly addressed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub message_type: MessageType,
    /// Always a JSON object
    pub payload: Value,
    pub status: MessageStatus,
    /// 1..=10, higher is delivered first
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl Message {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Build a task submission from a `task_request` message
    ///
    /// The payload names the task type in `task_type`; `payload` (or
    /// the whole message payload when absent) becomes the task payload
    /// and `priority` overrides the message priority.
    pub fn to_task_spec(&self) -> AppResult<TaskSpec> {
        if self.message_type != MessageType::TaskRequest {
            return Err(AppError::validation(format!(
                "message {} is a {} message, not a task request",
                self.id, self.message_type
            )));
        }

        let task_type = self
            .payload
            .get("task_type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::validation("task request is missing task_type"))?;
        let payload = self
            .payload
            .get("payload")
            .cloned()
            .unwrap_or_else(|| self.payload.clone());
        let priority = self
            .payload
            .get("priority")
            .and_then(Value::as_u64)
            .map(|p| p.min(u8::MAX as u64) as u8)
            .unwrap_or(self.priority);

        let mut spec = TaskSpec::new(task_type, payload)
            .with_priority(priority)
            .with_metadata("message_id", &self.id)
            .with_metadata("from_agent_id", &self.from_agent_id);
        if let Some(correlation_id) = &self.correlation_id {
            spec = spec.with_metadata("correlation_id", correlation_id);
        }
        Ok(spec)
    }
}

/// Optional message parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendOptions {
    /// 1..=10, defaults to 5
    pub priority: Option<u8>,
    /// Defaults to the configured message TTL; zero expires immediately
    pub ttl: Option<Duration>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl SendOptions {
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_correlation_id<S: Into<String>>(mut self, id: S) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to<S: Into<String>>(mut self, agent_id: S) -> Self {
        self.reply_to = Some(agent_id.into());
        self
    }
}

/// Publication classes; `status_change` is delivered at most once per subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationType {
    StatusChange,
    #[default]
    Event,
    Metric,
    Alert,
    Broadcast,
}

impl PublicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationType::StatusChange => "status_change",
            PublicationType::Event => "event",
            PublicationType::Metric => "metric",
            PublicationType::Alert => "alert",
            PublicationType::Broadcast => "broadcast",
        }
    }

    pub fn at_most_once(&self) -> bool {
        matches!(self, PublicationType::StatusChange)
    }
}

impl fmt::Display for PublicationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A topic publication, valid until `expires_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub id: String,
    pub publisher_agent_id: String,
    pub publisher_agent_type: String,
    pub publication_type: PublicationType,
    /// Hierarchical name such as `task.completed`
    pub event_name: String,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl Publication {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishOptions {
    pub publication_type: PublicationType,
    /// `None` selects the default TTL; `Some(0)` expires at publication
    pub ttl_seconds: Option<u64>,
    pub metadata: HashMap<String, String>,
}

impl PublishOptions {
    pub fn new(publication_type: PublicationType) -> Self {
        Self {
            publication_type,
            ..Self::default()
        }
    }

    pub fn with_ttl_seconds(mut self, ttl: u64) -> Self {
        self.ttl_seconds = Some(ttl);
        self
    }
}

/// Optional subscription filters; empty filters match everything
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilters {
    pub publisher_agent_id: Option<String>,
    pub publisher_agent_type: Option<String>,
    pub publication_types: Vec<PublicationType>,
    /// Payload fields that must be equal; strings compare case-insensitively
    pub conditions: Map<String, Value>,
}

/// An agent's interest in publications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub subscriber_agent_id: String,
    pub subscriber_agent_type: String,
    /// Glob over event names: `*` and `?` stay within one `/` segment
    pub event_pattern: String,
    pub filters: SubscriptionFilters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
    pub last_matched_at: Option<DateTime<Utc>>,
}
