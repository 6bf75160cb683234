//! The memory store collaborator interface.
//!
//! The pipeline only ever talks to [`MemoryStore`]; the bundled in-memory
//! implementation backs tests and single-process deployments, while real
//! deployments plug in their own store behind the same trait.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Memory, MemoryInput, MemoryType};

#[derive(Debug, thiserror::Error)]
pub enum MemoryStoreError {
    #[error("Memory not found: {0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    DbError(String),
    #[error("Serialization/Deserialization error: {0}")]
    CodecError(String),
    #[error("Other memory store error: {0}")]
    Other(String),
}

/// Filter for [`MemoryStore::query`].
#[derive(Debug, Clone, Default)]
pub struct MemoryQuery {
    pub agent_id: String,
    /// Restrict to these types when non-empty.
    pub types: Vec<MemoryType>,
    /// Only memories that carry an embedding.
    pub with_embeddings: bool,
    /// Skip expired memories.
    pub exclude_expired: bool,
}

impl MemoryQuery {
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        MemoryQuery {
            agent_id: agent_id.into(),
            types: Vec::new(),
            with_embeddings: false,
            exclude_expired: true,
        }
    }

    fn matches(&self, memory: &Memory) -> bool {
        if memory.agent_id != self.agent_id {
            return false;
        }
        if !self.types.is_empty() && !self.types.contains(&memory.memory_type) {
            return false;
        }
        if self.with_embeddings && memory.embedding.is_empty() {
            return false;
        }
        if self.exclude_expired
            && let Some(expiry) = memory.expires_at
            && expiry <= Utc::now()
        {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait MemoryStore: Send + Sync + 'static {
    async fn query(&self, filter: &MemoryQuery) -> Result<Vec<Memory>, MemoryStoreError>;

    async fn create(&self, input: MemoryInput) -> Result<Memory, MemoryStoreError>;

    async fn get(&self, id: &str) -> Result<Option<Memory>, MemoryStoreError>;

    /// Bump access counters and stamp `accessed_at` for the given ids.
    async fn record_access(&self, ids: &[String]) -> Result<(), MemoryStoreError>;
}

/// An in-memory implementation of the [`MemoryStore`] trait.
pub struct InMemoryMemoryStore {
    memories: Arc<Mutex<HashMap<String, Memory>>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self {
            memories: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn query(&self, filter: &MemoryQuery) -> Result<Vec<Memory>, MemoryStoreError> {
        let memories = self.memories.lock().await;
        Ok(memories.values().filter(|m| filter.matches(m)).cloned().collect())
    }

    async fn create(&self, input: MemoryInput) -> Result<Memory, MemoryStoreError> {
        let memory = input.into_memory();
        let mut memories = self.memories.lock().await;
        memories.insert(memory.id.clone(), memory.clone());
        Ok(memory)
    }

    async fn get(&self, id: &str) -> Result<Option<Memory>, MemoryStoreError> {
        let memories = self.memories.lock().await;
        Ok(memories.get(id).cloned())
    }

    async fn record_access(&self, ids: &[String]) -> Result<(), MemoryStoreError> {
        let mut memories = self.memories.lock().await;
        let now = Utc::now();
        for id in ids {
            if let Some(memory) = memories.get_mut(id) {
                memory.access_count += 1;
                memory.accessed_at = Some(now);
            }
        }
        Ok(())
    }
}
