//! Pluggable persistence for agent, task and pool records
//!
//! The runtime keeps its live state in memory and writes records
//! through a [`StateStore`]. [`InMemoryStore`] is the default backend.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{agent::AgentInfo, task::TaskResult};
use crate::{error::AppResult, pool::PoolInfo};

/// Durable store keyed by ID
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_agent(&self, agent: &AgentInfo) -> AppResult<()>;

    async fn delete_agent(&self, agent_id: &str) -> AppResult<()>;

    async fn list_agents(&self) -> AppResult<Vec<AgentInfo>>;

    async fn save_task_result(&self, result: &TaskResult) -> AppResult<()>;

    async fn load_task_result(&self, task_id: &str) -> AppResult<Option<TaskResult>>;

    async fn save_pool(&self, pool: &PoolInfo) -> AppResult<()>;

    async fn delete_pool(&self, pool_id: &str) -> AppResult<()>;

    async fn list_pools(&self) -> AppResult<Vec<PoolInfo>>;
}

/// Process-local store backed by concurrent maps
#[derive(Debug, Default)]
pub struct InMemoryStore {
    agents: DashMap<String, AgentInfo>,
    task_results: DashMap<String, TaskResult>,
    pools: DashMap<String, PoolInfo>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn save_agent(&self, agent: &AgentInfo) -> AppResult<()> {
        self.agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn delete_agent(&self, agent_id: &str) -> AppResult<()> {
        self.agents.remove(agent_id);
        Ok(())
    }

    async fn list_agents(&self) -> AppResult<Vec<AgentInfo>> {
        Ok(self.agents.iter().map(|entry| entry.value().clone()).collect())
    }

    async fn save_task_result(&self, result: &TaskResult) -> AppResult<()> {
        self.task_results
            .insert(result.task_id.clone(), result.clone());
        Ok(())
    }

    async fn load_task_result(&self, task_id: &str) -> AppResult<Option<TaskResult>> {
        Ok(self
            .task_results
            .get(task_id)
            .map(|entry| entry.value().clone()))
    }

    async fn save_pool(&self, pool: &PoolInfo) -> AppResult<()> {
        self.pools.insert(pool.id.clone(), pool.clone());
        Ok(())
    }

    async fn delete_pool(&self, pool_id: &str) -> AppResult<()> {
        self.pools.remove(pool_id);
        Ok(())
    }

    async fn list_pools(&self) -> AppResult<Vec<PoolInfo>> {
        Ok(self.pools.iter().map(|entry| entry.value().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        agent::{AgentConfig, AgentState},
        task::TaskStatus,
    };
    use chrono::Utc;
    use std::{collections::HashMap, time::Duration};

    fn agent_info(id: &str) -> AgentInfo {
        AgentInfo {
            id: id.to_string(),
            name: "worker".to_string(),
            agent_type: "worker".to_string(),
            state: AgentState::Created,
            config: AgentConfig::default(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_heartbeat: Utc::now(),
            healthy: true,
            running_tasks: 0,
            pending_tasks: 0,
        }
    }

    #[tokio::test]
    async fn test_agent_records() {
        let store = InMemoryStore::new();
        store.save_agent(&agent_info("agent-1")).await.unwrap();
        store.save_agent(&agent_info("agent-2")).await.unwrap();

        assert_eq!(store.list_agents().await.unwrap().len(), 2);

        store.delete_agent("agent-1").await.unwrap();
        let remaining = store.list_agents().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "agent-2");
    }

    #[tokio::test]
    async fn test_task_results() {
        let store = InMemoryStore::new();
        let result = TaskResult {
            task_id: "task_1".to_string(),
            agent_id: "agent-1".to_string(),
            status: TaskStatus::Succeeded,
            output: None,
            error: None,
            attempts: 1,
            started_at: None,
            completed_at: Utc::now(),
            duration: Duration::from_millis(3),
        };

        store.save_task_result(&result).await.unwrap();
        let loaded = store.load_task_result("task_1").await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Succeeded);
    }
}
