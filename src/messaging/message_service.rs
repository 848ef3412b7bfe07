//! Direct agent-to-agent messages
//!
//! Messages are held per ID with a submission sequence so that pending
//! messages for a recipient come out by priority, FIFO within a
//! priority. A message past its TTL is never handed out.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, info};

use super::{
    generate_message_id, Message, MessageStatus, MessageType, MessagingConfig, SendOptions,
    DEFAULT_MESSAGE_PRIORITY,
};
use crate::{
    error::{AppError, AppResult},
    runtime::Clock,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    message: Message,
}

pub struct MessageService {
    messages: DashMap<String, StoredMessage>,
    seq: AtomicU64,
    config: MessagingConfig,
    clock: Arc<dyn Clock>,
}

impl MessageService {
    pub fn new(config: MessagingConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            messages: DashMap::new(),
            seq: AtomicU64::new(0),
            config,
            clock,
        }
    }

    fn validate(from: &str, to: &str, payload: &Value, priority: u8) -> AppResult<()> {
        if from.trim().is_empty() {
            return Err(AppError::validation("from_agent_id is required"));
        }
        if to.trim().is_empty() {
            return Err(AppError::validation("to_agent_id is required"));
        }
        if !payload.is_object() {
            return Err(AppError::validation("payload must be a JSON object"));
        }
        if !(1..=10).contains(&priority) {
            return Err(AppError::validation(format!(
                "priority must be between 1 and 10, got {}",
                priority
            )));
        }
        Ok(())
    }

    /// Enqueue a message for `to`; returns the message ID immediately
    pub fn send_message(
        &self,
        from: &str,
        to: &str,
        message_type: MessageType,
        payload: Value,
        options: SendOptions,
    ) -> AppResult<String> {
        let priority = options.priority.unwrap_or(DEFAULT_MESSAGE_PRIORITY);
        Self::validate(from, to, &payload, priority)?;

        let now = self.clock.now();
        let ttl = options.ttl.unwrap_or(self.config.default_message_ttl);
        let expires_at = now
            + chrono::Duration::from_std(ttl).map_err(|_| AppError::validation("message ttl is too large"))?;

        let message = Message {
            id: generate_message_id(),
            from_agent_id: from.to_string(),
            to_agent_id: to.to_string(),
            message_type,
            payload,
            status: MessageStatus::Pending,
            priority,
            created_at: now,
            delivered_at: None,
            acknowledged_at: None,
            expires_at,
            correlation_id: options.correlation_id,
            reply_to: options.reply_to,
            metadata: options.metadata,
        };
        let id = message.id.clone();

        debug!(
            "Message {} sent: {} -> {} ({}, priority {})",
            id, from, to, message_type, priority
        );
        self.messages.insert(
            id.clone(),
            StoredMessage {
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                message,
            },
        );
        Ok(id)
    }

    pub fn get_message(&self, message_id: &str) -> AppResult<Message> {
        self.messages
            .get(message_id)
            .map(|entry| entry.message.clone())
            .ok_or_else(|| AppError::not_found("message", message_id))
    }

    /// Pending, unexpired messages for an agent, highest priority first
    ///
    /// Pending messages found past their TTL are marked `expired`.
    pub fn get_pending_messages(&self, agent_id: &str, limit: Option<usize>) -> Vec<Message> {
        let now = self.clock.now();
        let limit = limit.filter(|l| *l > 0).unwrap_or(self.config.pending_limit);

        let mut pending: Vec<(u64, Message)> = Vec::new();
        for mut entry in self.messages.iter_mut() {
            let stored = entry.value_mut();
            if stored.message.to_agent_id != agent_id
                || stored.message.status != MessageStatus::Pending
            {
                continue;
            }
            if stored.message.is_expired_at(now) {
                stored.message.status = MessageStatus::Expired;
                continue;
            }
            pending.push((stored.seq, stored.message.clone()));
        }

        pending.sort_by(|(seq_a, a), (seq_b, b)| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(seq_a.cmp(seq_b))
        });
        pending.truncate(limit);
        pending.into_iter().map(|(_, m)| m).collect()
    }

    fn update<F>(&self, message_id: &str, f: F) -> AppResult<()>
    where
        F: FnOnce(&mut Message, DateTime<Utc>) -> AppResult<()>,
    {
        let now = self.clock.now();
        let mut entry = self
            .messages
            .get_mut(message_id)
            .ok_or_else(|| AppError::not_found("message", message_id))?;
        f(&mut entry.message, now)
    }

    /// `pending -> delivered`; a message past its TTL becomes `expired` instead
    pub fn mark_delivered(&self, message_id: &str) -> AppResult<()> {
        self.update(message_id, |message, now| {
            if message.status != MessageStatus::Pending {
                return Err(AppError::invalid_transition(
                    &message.id,
                    message.status,
                    MessageStatus::Delivered,
                ));
            }
            if message.is_expired_at(now) {
                message.status = MessageStatus::Expired;
                return Err(AppError::Expired {
                    kind: "message",
                    id: message.id.clone(),
                });
            }
            message.status = MessageStatus::Delivered;
            message.delivered_at = Some(now);
            Ok(())
        })
    }

    pub fn mark_failed(&self, message_id: &str) -> AppResult<()> {
        self.update(message_id, |message, _| {
            if message.status != MessageStatus::Pending {
                return Err(AppError::invalid_transition(
                    &message.id,
                    message.status,
                    MessageStatus::Failed,
                ));
            }
            message.status = MessageStatus::Failed;
            Ok(())
        })
    }

    /// Recipient confirms processing of a delivered message
    pub fn acknowledge(&self, message_id: &str) -> AppResult<()> {
        self.update(message_id, |message, now| {
            if message.status != MessageStatus::Delivered {
                return Err(AppError::invalid_transition(
                    &message.id,
                    message.status,
                    "acknowledged",
                ));
            }
            message.acknowledged_at.get_or_insert(now);
            Ok(())
        })
    }

    /// All messages sharing a correlation ID, oldest first
    pub fn get_conversation(&self, correlation_id: &str) -> Vec<Message> {
        let mut messages: Vec<(u64, Message)> = self
            .messages
            .iter()
            .filter(|entry| entry.message.correlation_id.as_deref() == Some(correlation_id))
            .map(|entry| (entry.seq, entry.message.clone()))
            .collect();
        messages.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b))
        });
        messages.into_iter().map(|(_, m)| m).collect()
    }

    /// Respond to a message, addressed to its `reply_to` or its sender
    pub fn send_reply(&self, original_id: &str, from: &str, payload: Value) -> AppResult<String> {
        let original = self.get_message(original_id)?;
        let to = original
            .reply_to
            .clone()
            .unwrap_or_else(|| original.from_agent_id.clone());
        let correlation_id = original
            .correlation_id
            .clone()
            .unwrap_or_else(|| original.id.clone());

        self.send_message(
            from,
            &to,
            MessageType::Response,
            payload,
            SendOptions::default()
                .with_priority(original.priority)
                .with_correlation_id(correlation_id),
        )
    }

    /// Drop every message past its TTL; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.messages.len();
        self.messages.retain(|_, stored| !stored.message.is_expired_at(now));
        let removed = before.saturating_sub(self.messages.len());
        if removed > 0 {
            info!("Cleaned up {} expired messages", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ManualClock;
    use serde_json::json;
    use std::time::Duration;

    fn service() -> (MessageService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (
            MessageService::new(MessagingConfig::default(), clock.clone()),
            clock,
        )
    }

    #[test]
    fn test_send_validation() {
        let (service, _) = service();
        assert!(service
            .send_message("", "b", MessageType::Command, json!({}), SendOptions::default())
            .is_err());
        assert!(service
            .send_message("a", "b", MessageType::Command, json!([1]), SendOptions::default())
            .is_err());
        assert!(matches!(
            service.send_message(
                "a",
                "b",
                MessageType::Command,
                json!({}),
                SendOptions::default().with_priority(11)
            ),
            Err(AppError::Validation { .. })
        ));

        let id = service
            .send_message("a", "b", MessageType::Command, json!({}), SendOptions::default())
            .unwrap();
        assert!(id.starts_with("msg-"));
        assert_eq!(service.get_message(&id).unwrap().priority, 5);
    }

    #[test]
    fn test_pending_order_priority_then_fifo() {
        let (service, _) = service();
        let send = |priority: u8, n: u32| {
            service
                .send_message(
                    "a",
                    "b",
                    MessageType::DataShare,
                    json!({ "n": n }),
                    SendOptions::default().with_priority(priority),
                )
                .unwrap()
        };
        let low = send(2, 1);
        let high_first = send(9, 2);
        let high_second = send(9, 3);
        service
            .send_message("a", "c", MessageType::DataShare, json!({}), SendOptions::default())
            .unwrap();

        let pending = service.get_pending_messages("b", None);
        let ids: Vec<&str> = pending.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![high_first.as_str(), high_second.as_str(), low.as_str()]);

        assert_eq!(service.get_pending_messages("b", Some(1)).len(), 1);
    }

    #[test]
    fn test_expired_messages_are_never_delivered() {
        let (service, clock) = service();
        let id = service
            .send_message(
                "a",
                "b",
                MessageType::Notification,
                json!({}),
                SendOptions::default().with_ttl(Duration::from_secs(10)),
            )
            .unwrap();

        clock.advance(chrono::Duration::seconds(10));
        assert!(matches!(
            service.mark_delivered(&id),
            Err(AppError::Expired { .. })
        ));
        assert_eq!(service.get_message(&id).unwrap().status, MessageStatus::Expired);
        assert!(service.get_pending_messages("b", None).is_empty());

        assert_eq!(service.cleanup_expired(), 1);
        assert!(service.is_empty());
    }

    #[test]
    fn test_delivery_lifecycle() {
        let (service, _) = service();
        let id = service
            .send_message("a", "b", MessageType::Command, json!({}), SendOptions::default())
            .unwrap();

        assert!(service.acknowledge(&id).is_err());
        service.mark_delivered(&id).unwrap();
        assert!(service.mark_delivered(&id).is_err());
        service.acknowledge(&id).unwrap();

        let message = service.get_message(&id).unwrap();
        assert_eq!(message.status, MessageStatus::Delivered);
        assert!(message.delivered_at.is_some());
        assert!(message.acknowledged_at.is_some());

        let failed = service
            .send_message("a", "b", MessageType::Command, json!({}), SendOptions::default())
            .unwrap();
        service.mark_failed(&failed).unwrap();
        assert_eq!(service.get_message(&failed).unwrap().status, MessageStatus::Failed);
    }

    #[test]
    fn test_reply_joins_conversation() {
        let (service, _) = service();
        let request = service
            .send_message(
                "a",
                "b",
                MessageType::TaskRequest,
                json!({"task_type": "echo"}),
                SendOptions::default()
                    .with_correlation_id("conv-9")
                    .with_reply_to("a-inbox"),
            )
            .unwrap();

        let reply = service.send_reply(&request, "b", json!({"ok": true})).unwrap();
        let reply = service.get_message(&reply).unwrap();
        assert_eq!(reply.to_agent_id, "a-inbox");
        assert_eq!(reply.message_type, MessageType::Response);

        let conversation = service.get_conversation("conv-9");
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation[0].id, request);
    }
}
