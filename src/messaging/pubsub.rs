//! Topic publish/subscribe
//!
//! Publications are retained until their TTL runs out and replayed to
//! every query made within it, except `status_change` publications,
//! which each subscriber sees at most once whether through a live
//! listener or a query.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    generate_publication_id, generate_subscription_id, MessagingConfig, Publication,
    PublishOptions, Subscription, SubscriptionFilters, SubscriptionMatcher,
};
use crate::{
    error::{AppError, AppResult},
    runtime::Clock,
};

#[derive(Debug, Clone)]
struct StoredPublication {
    seq: u64,
    publication: Publication,
}

pub struct PubSubService {
    publications: DashMap<String, StoredPublication>,
    seq: AtomicU64,
    subscriptions: DashMap<String, Subscription>,
    matcher: SubscriptionMatcher,
    /// At-most-once publications already handed to each agent
    delivered: DashMap<String, HashSet<String>>,
    listeners: DashMap<String, Vec<mpsc::UnboundedSender<Publication>>>,
    config: MessagingConfig,
    clock: Arc<dyn Clock>,
}

impl PubSubService {
    pub fn new(config: MessagingConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            publications: DashMap::new(),
            seq: AtomicU64::new(0),
            subscriptions: DashMap::new(),
            matcher: SubscriptionMatcher::new(),
            delivered: DashMap::new(),
            listeners: DashMap::new(),
            config,
            clock,
        }
    }

    pub fn matcher(&self) -> &SubscriptionMatcher {
        &self.matcher
    }

    /// Record a publication and fan it out to live listeners
    pub fn publish(
        &self,
        publisher_id: &str,
        publisher_type: &str,
        event_name: &str,
        payload: Value,
        options: PublishOptions,
    ) -> AppResult<String> {
        if publisher_id.trim().is_empty() {
            return Err(AppError::validation("publisher_agent_id is required"));
        }
        if event_name.trim().is_empty() {
            return Err(AppError::validation("event_name is required"));
        }

        let now = self.clock.now();
        let ttl_seconds = options
            .ttl_seconds
            .unwrap_or(self.config.default_publication_ttl_seconds);
        let ttl = chrono::Duration::from_std(std::time::Duration::from_secs(ttl_seconds))
            .map_err(|_| AppError::validation("publication ttl is too large"))?;

        let publication = Publication {
            id: generate_publication_id(),
            publisher_agent_id: publisher_id.to_string(),
            publisher_agent_type: publisher_type.to_string(),
            publication_type: options.publication_type,
            event_name: event_name.to_string(),
            payload,
            published_at: now,
            ttl_seconds,
            expires_at: now + ttl,
            metadata: options.metadata,
        };
        let id = publication.id.clone();

        self.publications.insert(
            id.clone(),
            StoredPublication {
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                publication: publication.clone(),
            },
        );

        let notified = self.fan_out(&publication, now);
        debug!(
            "Published {} '{}' from {} ({} live subscribers)",
            publication.publication_type, event_name, publisher_id, notified
        );
        Ok(id)
    }

    /// Push to every subscribing agent with a listener; returns agents reached
    fn fan_out(&self, publication: &Publication, now: DateTime<Utc>) -> usize {
        if publication.is_expired_at(now) {
            return 0;
        }

        let mut matched_subs = Vec::new();
        let mut agents: Vec<String> = Vec::new();
        for entry in self.subscriptions.iter() {
            if self.matcher.matches_subscription(publication, entry.value()) {
                matched_subs.push(entry.key().clone());
                if !agents.contains(&entry.subscriber_agent_id) {
                    agents.push(entry.subscriber_agent_id.clone());
                }
            }
        }
        self.touch(&matched_subs, now);

        let at_most_once = publication.publication_type.at_most_once();
        let mut reached = 0;
        for agent_id in agents {
            if !self.listeners.contains_key(&agent_id) {
                continue;
            }
            // Claim before sending so a concurrent query cannot deliver it too
            if at_most_once && !self.claim(&agent_id, &publication.id) {
                continue;
            }

            let any_open = match self.listeners.get_mut(&agent_id) {
                Some(mut senders) => {
                    senders.retain(|tx| tx.send(publication.clone()).is_ok());
                    !senders.is_empty()
                }
                None => false,
            };

            if any_open {
                reached += 1;
            } else {
                if at_most_once {
                    self.unclaim(&agent_id, &publication.id);
                }
                self.listeners.remove_if(&agent_id, |_, senders| senders.is_empty());
            }
        }
        reached
    }

    /// Record delivery of an at-most-once publication; false if already taken
    fn claim(&self, agent_id: &str, publication_id: &str) -> bool {
        self.delivered
            .entry(agent_id.to_string())
            .or_default()
            .insert(publication_id.to_string())
    }

    fn unclaim(&self, agent_id: &str, publication_id: &str) {
        if let Some(mut seen) = self.delivered.get_mut(agent_id) {
            seen.remove(publication_id);
        }
    }

    fn touch(&self, subscription_ids: &[String], now: DateTime<Utc>) {
        for id in subscription_ids {
            if let Some(mut sub) = self.subscriptions.get_mut(id) {
                sub.last_matched_at = Some(now);
            }
        }
    }

    pub fn get_publication(&self, publication_id: &str) -> AppResult<Publication> {
        self.publications
            .get(publication_id)
            .map(|entry| entry.publication.clone())
            .ok_or_else(|| AppError::not_found("publication", publication_id))
    }

    pub fn subscribe(
        &self,
        subscriber_id: &str,
        subscriber_type: &str,
        event_pattern: &str,
        filters: SubscriptionFilters,
    ) -> AppResult<String> {
        if subscriber_id.trim().is_empty() {
            return Err(AppError::validation("subscriber_agent_id is required"));
        }
        if event_pattern.trim().is_empty() {
            return Err(AppError::validation("event_pattern is required"));
        }
        self.matcher.compile(event_pattern)?;

        let now = self.clock.now();
        let subscription = Subscription {
            id: generate_subscription_id(),
            subscriber_agent_id: subscriber_id.to_string(),
            subscriber_agent_type: subscriber_type.to_string(),
            event_pattern: event_pattern.to_string(),
            filters,
            created_at: now,
            updated_at: now,
            active: true,
            last_matched_at: None,
        };
        let id = subscription.id.clone();
        info!(
            "Agent {} subscribed to '{}' ({})",
            subscriber_id, event_pattern, id
        );
        self.subscriptions.insert(id.clone(), subscription);
        Ok(id)
    }

    /// Deactivate a subscription; it stays queryable
    pub fn unsubscribe(&self, subscription_id: &str) -> AppResult<()> {
        let mut sub = self
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| AppError::not_found("subscription", subscription_id))?;
        sub.active = false;
        sub.updated_at = self.clock.now();
        Ok(())
    }

    pub fn delete_subscription(&self, subscription_id: &str) -> AppResult<()> {
        self.subscriptions
            .remove(subscription_id)
            .map(|_| ())
            .ok_or_else(|| AppError::not_found("subscription", subscription_id))
    }

    pub fn get_subscription(&self, subscription_id: &str) -> AppResult<Subscription> {
        self.subscriptions
            .get(subscription_id)
            .map(|sub| sub.clone())
            .ok_or_else(|| AppError::not_found("subscription", subscription_id))
    }

    pub fn get_active_subscriptions(&self, agent_id: &str) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .subscriptions
            .iter()
            .filter(|sub| sub.active && sub.subscriber_agent_id == agent_id)
            .map(|sub| sub.clone())
            .collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        subs
    }

    /// Unexpired publications matching the agent's active subscriptions
    ///
    /// `since` is inclusive. Results are in publication order.
    pub fn get_matching_publications(
        &self,
        agent_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Vec<Publication> {
        let subs = self.get_active_subscriptions(agent_id);
        if subs.is_empty() {
            return Vec::new();
        }
        let now = self.clock.now();

        let mut candidates: Vec<(u64, Publication)> = self
            .publications
            .iter()
            .filter(|entry| {
                let p = &entry.publication;
                !p.is_expired_at(now) && since.map_or(true, |since| p.published_at >= since)
            })
            .map(|entry| (entry.seq, entry.publication.clone()))
            .collect();
        candidates.sort_by(|(seq_a, a), (seq_b, b)| {
            a.published_at.cmp(&b.published_at).then(seq_a.cmp(seq_b))
        });

        let mut matched_subs: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for (_, publication) in candidates {
            let hits = self.matcher.matching_subscriptions(&publication, &subs);
            if hits.is_empty() {
                continue;
            }
            if publication.publication_type.at_most_once()
                && !self.claim(agent_id, &publication.id)
            {
                continue;
            }
            matched_subs.extend(hits.into_iter().map(|s| s.id.clone()));
            out.push(publication);
        }

        let matched_subs: Vec<String> = matched_subs.into_iter().collect();
        self.touch(&matched_subs, now);
        out
    }

    /// Live feed of matching publications for an agent
    pub fn register_listener(&self, agent_id: &str) -> mpsc::UnboundedReceiver<Publication> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .entry(agent_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Drop expired publications; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed_ids = HashSet::new();
        self.publications.retain(|id, stored| {
            let keep = !stored.publication.is_expired_at(now);
            if !keep {
                removed_ids.insert(id.clone());
            }
            keep
        });

        if !removed_ids.is_empty() {
            for mut seen in self.delivered.iter_mut() {
                seen.retain(|id| !removed_ids.contains(id));
            }
            info!("Cleaned up {} expired publications", removed_ids.len());
        }
        removed_ids.len()
    }

    pub fn publication_count(&self) -> usize {
        self.publications.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}
