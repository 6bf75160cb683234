//! Long-term memory: the data model, the store collaborator interface, and
//! the retrieval/augmentation stages that fold memories into prompts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod augment;
pub mod retriever;
pub mod store;

pub use augment::{AugmentOptions, AugmentOutcome, PromptAugmenter, SessionInjectionSet};
pub use retriever::{MemoryRetriever, RetrievalOptions, ScoredMemory};
pub use store::{InMemoryMemoryStore, MemoryQuery, MemoryStore, MemoryStoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Fact,
    Preference,
    Rule,
    Decision,
    Health,
    Reminder,
    Relationship,
}

impl MemoryType {
    /// Label shown in the injected context block; plain facts and
    /// preferences stay unlabelled.
    pub fn label(&self) -> Option<&'static str> {
        match self {
            MemoryType::Decision => Some("Decision"),
            MemoryType::Rule => Some("Rule"),
            MemoryType::Health => Some("Health"),
            MemoryType::Reminder => Some("Reminder"),
            _ => None,
        }
    }

    /// Relative retrieval weight of this memory type.
    pub fn default_weight(&self) -> f32 {
        match self {
            MemoryType::Rule => 1.5,
            MemoryType::Decision => 1.3,
            MemoryType::Preference => 1.2,
            MemoryType::Fact | MemoryType::Health | MemoryType::Relationship => 1.0,
            MemoryType::Reminder => 0.8,
        }
    }
}

/// A persisted, semantically indexed note scoped to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// May be empty until the embedding provider has run.
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub confidence: Option<f32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub accessed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_session: Option<String>,
}

/// Input for creating a memory; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct MemoryInput {
    pub agent_id: String,
    pub memory_type: MemoryType,
    pub content: String,
    pub tags: Vec<String>,
    pub embedding: Vec<f32>,
    pub confidence: Option<f32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub source_session: Option<String>,
}

impl MemoryInput {
    pub fn new(agent_id: impl Into<String>, memory_type: MemoryType, content: impl Into<String>) -> Self {
        MemoryInput {
            agent_id: agent_id.into(),
            memory_type,
            content: content.into(),
            tags: Vec::new(),
            embedding: Vec::new(),
            confidence: None,
            expires_at: None,
            source_session: None,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = embedding;
        self
    }

    pub(crate) fn into_memory(self) -> Memory {
        Memory {
            id: Uuid::new_v4().to_string(),
            agent_id: self.agent_id,
            memory_type: self.memory_type,
            content: self.content,
            tags: self.tags,
            embedding: self.embedding,
            confidence: self.confidence,
            created_at: Utc::now(),
            accessed_at: None,
            access_count: 0,
            expires_at: self.expires_at,
            source_session: self.source_session,
        }
    }
}

/// Rough token estimate used for retrieval budgeting.
pub(crate) fn estimate_tokens(content: &str) -> u32 {
    (content.chars().count() as f64 / 4.0).ceil() as u32
}
