//! Messaging integration tests
//!
//! Direct messages and publications flow through the services and the
//! communication poller; a task request message is turned into a task
//! on a real agent.

use agent_runtime::{
    error::AppError,
    messaging::{
        CommunicationPoller, Inbound, MessageService, MessageStatus, MessageType,
        MessagingConfig, PollerConfig, PubSubService, PublicationType, PublishOptions,
        SendOptions, SubscriptionFilters,
    },
    runtime::{AgentSpec, Clock, ManagerConfig, ManualClock, RuntimeManager, TaskStatus},
};
use serde_json::{json, Map};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

struct Services {
    clock: Arc<ManualClock>,
    messages: Arc<MessageService>,
    pubsub: Arc<PubSubService>,
}

fn services() -> Services {
    let clock = Arc::new(ManualClock::default());
    let shared: Arc<dyn Clock> = clock.clone();
    Services {
        messages: Arc::new(MessageService::new(MessagingConfig::default(), shared.clone())),
        pubsub: Arc::new(PubSubService::new(MessagingConfig::default(), shared)),
        clock,
    }
}

/// A publication with TTL 0, or one whose TTL elapsed, is never returned
#[tokio::test]
async fn test_publication_ttl_expiry() {
    let s = services();
    s.pubsub
        .subscribe("observer", "monitor", "agent.*", SubscriptionFilters::default())
        .unwrap();

    s.pubsub
        .publish(
            "agent-1",
            "worker",
            "agent.heartbeat",
            json!({}),
            PublishOptions::default().with_ttl_seconds(0),
        )
        .unwrap();
    s.pubsub
        .publish(
            "agent-1",
            "worker",
            "agent.started",
            json!({}),
            PublishOptions::default().with_ttl_seconds(60),
        )
        .unwrap();

    let visible = s.pubsub.get_matching_publications("observer", None);
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].event_name, "agent.started");

    s.clock.advance(chrono::Duration::seconds(61));
    assert!(s.pubsub.get_matching_publications("observer", None).is_empty());

    println!("✓ Expired publications are never delivered");
}

#[tokio::test]
async fn test_filtered_subscriptions() {
    let s = services();
    let mut conditions = Map::new();
    conditions.insert("severity".to_string(), json!("critical"));
    s.pubsub
        .subscribe(
            "pager",
            "notifier",
            "alert.*",
            SubscriptionFilters {
                publication_types: vec![PublicationType::Alert],
                conditions,
                ..SubscriptionFilters::default()
            },
        )
        .unwrap();

    let alert = PublishOptions::new(PublicationType::Alert);
    s.pubsub
        .publish("monitor", "monitor", "alert.disk", json!({"severity": "CRITICAL"}), alert.clone())
        .unwrap();
    s.pubsub
        .publish("monitor", "monitor", "alert.cpu", json!({"severity": "warning"}), alert)
        .unwrap();
    s.pubsub
        .publish("monitor", "monitor", "alert.mem", json!({"severity": "critical"}), PublishOptions::default())
        .unwrap();

    let matched = s.pubsub.get_matching_publications("pager", None);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].event_name, "alert.disk");

    println!("✓ Subscription filters narrow matches");
}

#[tokio::test]
async fn test_status_changes_delivered_once() {
    let s = services();
    s.pubsub
        .subscribe("observer", "monitor", "*", SubscriptionFilters::default())
        .unwrap();

    s.pubsub
        .publish("agent-1", "worker", "state", json!({"to": "paused"}), PublishOptions::new(PublicationType::StatusChange))
        .unwrap();
    s.pubsub
        .publish("agent-1", "worker", "progress", json!({"pct": 40}), PublishOptions::new(PublicationType::Event))
        .unwrap();

    assert_eq!(s.pubsub.get_matching_publications("observer", None).len(), 2);
    let replay = s.pubsub.get_matching_publications("observer", None);
    assert_eq!(replay.len(), 1);
    assert_eq!(replay[0].event_name, "progress");

    println!("✓ Status changes are at-most-once, events replay");
}

#[tokio::test]
async fn test_message_priority_and_expiry() {
    let s = services();
    let short = s
        .messages
        .send_message(
            "a",
            "b",
            MessageType::Notification,
            json!({}),
            SendOptions::default().with_priority(10).with_ttl(Duration::from_secs(5)),
        )
        .unwrap();
    let normal = s
        .messages
        .send_message("a", "b", MessageType::Notification, json!({}), SendOptions::default())
        .unwrap();

    let pending = s.messages.get_pending_messages("b", None);
    assert_eq!(pending[0].id, short);
    assert_eq!(pending[1].id, normal);

    s.clock.advance(chrono::Duration::seconds(5));
    let pending = s.messages.get_pending_messages("b", None);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, normal);
    assert_eq!(s.messages.get_message(&short).unwrap().status, MessageStatus::Expired);

    let zero = s
        .messages
        .send_message(
            "a",
            "b",
            MessageType::Notification,
            json!({}),
            SendOptions::default().with_ttl(Duration::ZERO),
        )
        .unwrap();
    assert!(matches!(
        s.messages.mark_delivered(&zero),
        Err(AppError::Expired { .. })
    ));

    println!("✓ Messages honour priority and TTL");
}

#[tokio::test]
async fn test_request_reply_conversation() {
    let s = services();
    let request = s
        .messages
        .send_message(
            "client",
            "server",
            MessageType::Command,
            json!({"op": "ping"}),
            SendOptions::default().with_correlation_id("conv-1"),
        )
        .unwrap();
    s.clock.advance(chrono::Duration::seconds(1));
    let reply = s
        .messages
        .send_reply(&request, "server", json!({"op": "pong"}))
        .unwrap();

    let reply = s.messages.get_message(&reply).unwrap();
    assert_eq!(reply.to_agent_id, "client");
    assert_eq!(reply.correlation_id.as_deref(), Some("conv-1"));

    let conversation = s.messages.get_conversation("conv-1");
    let ids: Vec<&str> = conversation.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec![request.as_str(), reply.id.as_str()]);

    println!("✓ Replies join the conversation");
}

/// A task request message polled for an agent becomes a task on it
#[tokio::test]
async fn test_message_to_task_through_poller() {
    let runtime = RuntimeManager::new(ManagerConfig::default());
    let agent = runtime
        .create_agent(AgentSpec::new("receiver", "worker"))
        .await
        .unwrap();
    runtime.start_agent(agent.id()).await.unwrap();

    let s = services();
    let (tx, mut rx) = mpsc::channel(8);
    let poller = CommunicationPoller::new(
        agent.id(),
        s.messages.clone(),
        s.pubsub.clone(),
        PollerConfig::default(),
        tx,
    )
    .unwrap();

    let message_id = s
        .messages
        .send_message(
            "client",
            agent.id(),
            MessageType::TaskRequest,
            json!({"task_type": "echo", "payload": {"hello": "world"}, "priority": 9}),
            SendOptions::default(),
        )
        .unwrap();

    assert_eq!(poller.poll_once().await.unwrap(), 1);
    let Some(Inbound::Message(message)) = rx.recv().await else {
        panic!("expected a message");
    };
    assert_eq!(s.messages.get_message(&message_id).unwrap().status, MessageStatus::Delivered);

    let spec = message.to_task_spec().unwrap();
    assert_eq!(spec.priority, 9);
    let task_id = runtime.submit_task(agent.id(), spec).await.unwrap();
    let result = runtime
        .wait_for_task(agent.id(), &task_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Succeeded);
    assert_eq!(result.output.unwrap()["echo"], json!({"hello": "world"}));

    s.messages.acknowledge(&message_id).unwrap();
    assert!(s.messages.get_message(&message_id).unwrap().acknowledged_at.is_some());

    println!("✓ Task request message executed via poller");
}
