//! Per-agent communication poller
//!
//! Pulls pending messages and new matching publications for one agent
//! on a fixed interval and forwards them to a channel. A message is
//! marked delivered only once the channel has room for it, and is sent
//! only if it was still live when marked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::{Message, MessageService, PubSubService, Publication};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Pending messages fetched per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }
}

impl PollerConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.interval.is_zero() {
            return Err(AppError::validation("poll interval must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(AppError::validation("poll batch size must be greater than 0"));
        }
        Ok(())
    }
}

/// Traffic forwarded to the agent
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Message),
    Publication(Publication),
}

#[derive(Debug, Default)]
struct PollCursor {
    /// Publication time of the newest publication forwarded
    since: Option<DateTime<Utc>>,
    /// Publications forwarded at or after `since`
    seen: HashMap<String, DateTime<Utc>>,
}

pub struct CommunicationPoller {
    agent_id: String,
    messages: Arc<MessageService>,
    pubsub: Arc<PubSubService>,
    config: PollerConfig,
    sink: mpsc::Sender<Inbound>,
    cursor: Mutex<PollCursor>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CommunicationPoller {
    pub fn new(
        agent_id: impl Into<String>,
        messages: Arc<MessageService>,
        pubsub: Arc<PubSubService>,
        config: PollerConfig,
        sink: mpsc::Sender<Inbound>,
    ) -> AppResult<Self> {
        config.validate()?;
        Ok(Self {
            agent_id: agent_id.into(),
            messages,
            pubsub,
            config,
            sink,
            cursor: Mutex::new(PollCursor::default()),
            handle: parking_lot::Mutex::new(None),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Run one poll; returns how many items were forwarded
    pub async fn poll_once(&self) -> AppResult<usize> {
        let mut cursor = self.cursor.lock().await;
        let mut forwarded = 0;

        let pending = self
            .messages
            .get_pending_messages(&self.agent_id, Some(self.config.batch_size));
        for message in pending {
            let id = message.id.clone();
            let Ok(permit) = self.sink.reserve().await else {
                warn!("Inbound channel for {} closed, message {} failed", self.agent_id, id);
                self.messages.mark_failed(&id)?;
                return Ok(forwarded);
            };
            // The wait for room may outlast the TTL
            match self.messages.mark_delivered(&id) {
                Ok(()) => {
                    permit.send(Inbound::Message(message));
                    forwarded += 1;
                }
                Err(e) => debug!("Message {} not delivered: {}", id, e),
            }
        }

        let publications = self
            .pubsub
            .get_matching_publications(&self.agent_id, cursor.since);
        for publication in publications {
            if cursor.seen.contains_key(&publication.id) {
                continue;
            }
            let id = publication.id.clone();
            let published_at = publication.published_at;
            if self.sink.send(Inbound::Publication(publication)).await.is_err() {
                warn!("Inbound channel for {} closed", self.agent_id);
                break;
            }
            cursor.seen.insert(id, published_at);
            if cursor.since.map_or(true, |since| published_at > since) {
                cursor.since = Some(published_at);
            }
            forwarded += 1;
        }

        if let Some(since) = cursor.since {
            cursor.seen.retain(|_, published_at| *published_at >= since);
        }

        if forwarded > 0 {
            debug!("Poller for {} forwarded {} items", self.agent_id, forwarded);
        }
        Ok(forwarded)
    }

    /// Poll now and then on every interval until stopped or the channel closes
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(poller) = weak.upgrade() else {
                    break;
                };
                if poller.sink.is_closed() {
                    info!("Poller for {} stopping: channel closed", poller.agent_id);
                    break;
                }
                if let Err(e) = poller.poll_once().await {
                    error!("Poll for {} failed: {}", poller.agent_id, e);
                }
            }
        });

        if let Some(previous) = self.handle.lock().replace(handle) {
            previous.abort();
        }
        info!("Communication poller started for {} (interval {:?})", self.agent_id, period);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}

impl Drop for CommunicationPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
