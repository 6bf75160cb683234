//! Semantic memory retrieval.
//!
//! Embeds the query, cosine-ranks the agent's memories, applies type weights
//! and recency decay, drops low scores, and trims to a token budget. An
//! embedding failure degrades to an empty result so the pipeline keeps
//! serving.

use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::{estimate_tokens, Memory, MemoryQuery, MemoryStore, MemoryType};
use crate::embedding::EmbeddingService;
use crate::error::GatewayError;

fn default_min_score() -> f32 {
    0.3
}
fn default_limit() -> usize {
    10
}
fn default_half_life_hours() -> f32 {
    168.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalOptions {
    pub types: Vec<MemoryType>,
    pub type_weights: HashMap<MemoryType, f32>,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    #[serde(default = "default_limit")]
    pub limit: usize,
    pub recency_boost: bool,
    #[serde(default = "default_half_life_hours")]
    pub half_life_hours: f32,
    /// Trim results so their summed token estimate stays inside this budget.
    pub token_budget: Option<u32>,
    pub record_access: bool,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        RetrievalOptions {
            types: Vec::new(),
            type_weights: HashMap::new(),
            min_score: default_min_score(),
            limit: default_limit(),
            recency_boost: true,
            half_life_hours: default_half_life_hours(),
            token_budget: None,
            record_access: true,
        }
    }
}

impl RetrievalOptions {
    fn weight_for(&self, memory_type: MemoryType) -> f32 {
        self.type_weights
            .get(&memory_type)
            .copied()
            .unwrap_or_else(|| memory_type.default_weight())
    }
}

/// A memory plus its retrieval score.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f32,
}

pub struct MemoryRetriever {
    store: Arc<dyn MemoryStore>,
    embeddings: Arc<dyn EmbeddingService>,
}

impl MemoryRetriever {
    pub fn new(store: Arc<dyn MemoryStore>, embeddings: Arc<dyn EmbeddingService>) -> Self {
        MemoryRetriever { store, embeddings }
    }

    pub async fn retrieve(
        &self,
        agent_id: &str,
        query: &str,
        options: &RetrievalOptions,
    ) -> Result<Vec<ScoredMemory>, GatewayError> {
        let query_embedding = match self.embeddings.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!("query embedding failed, skipping retrieval: {e}");
                return Ok(Vec::new());
            }
        };

        let mut filter = MemoryQuery::for_agent(agent_id);
        filter.types = options.types.clone();
        filter.with_embeddings = true;
        let candidates = self
            .store
            .query(&filter)
            .await
            .map_err(|e| GatewayError::Internal(format!("memory store: {e}")))?;

        let now = Utc::now();
        let mut scored: Vec<ScoredMemory> = candidates
            .into_iter()
            .filter_map(|memory| {
                let similarity = cosine(&query_embedding, &memory.embedding)?;
                let weight = options.weight_for(memory.memory_type);
                let recency = if options.recency_boost {
                    let age_hours =
                        (now - memory.created_at).num_minutes() as f32 / 60.0;
                    recency_factor(age_hours.max(0.0), options.half_life_hours)
                } else {
                    1.0
                };
                let score = similarity * weight * recency;
                (score >= options.min_score).then_some(ScoredMemory { memory, score })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(options.limit);

        if let Some(budget) = options.token_budget {
            scored = apply_token_budget(scored, budget);
        }

        if options.record_access && !scored.is_empty() {
            let ids: Vec<String> = scored.iter().map(|s| s.memory.id.clone()).collect();
            if let Err(e) = self.store.record_access(&ids).await {
                warn!("failed to record memory access: {e}");
            }
        }

        Ok(scored)
    }
}

/// `0.7 + 0.3 * 2^(-age/half_life)`: fresh memories score 1.0, old ones
/// asymptote at 0.7.
fn recency_factor(age_hours: f32, half_life_hours: f32) -> f32 {
    0.7 + 0.3 * (-age_hours / half_life_hours.max(f32::EPSILON)).exp2()
}

fn cosine(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}

/// Greedy budget trim that keeps at least the top result when possible.
fn apply_token_budget(scored: Vec<ScoredMemory>, budget: u32) -> Vec<ScoredMemory> {
    let mut kept = Vec::new();
    let mut spent: u32 = 0;
    for entry in scored {
        let cost = estimate_tokens(&entry.memory.content);
        if spent + cost > budget && !kept.is_empty() {
            break;
        }
        spent += cost;
        kept.push(entry);
        if spent > budget {
            break;
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryMemoryStore, MemoryInput};
    use async_trait::async_trait;

    /// Embeds each configured keyword onto its own axis.
    struct KeywordEmbedding {
        keywords: Vec<&'static str>,
    }

    impl KeywordEmbedding {
        fn vector(&self, text: &str) -> Vec<f32> {
            let lower = text.to_lowercase();
            self.keywords
                .iter()
                .map(|k| if lower.contains(k) { 1.0 } else { 0.0 })
                .collect()
        }
    }

    #[async_trait]
    impl EmbeddingService for KeywordEmbedding {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
            Ok(self.vector(text))
        }

        fn dimensions(&self) -> usize {
            self.keywords.len()
        }
    }

    struct FailingEmbedding;

    #[async_trait]
    impl EmbeddingService for FailingEmbedding {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, GatewayError> {
            Err(GatewayError::HttpError("embedding service down".to_string()))
        }

        fn dimensions(&self) -> usize {
            0
        }
    }

    fn embedder() -> Arc<KeywordEmbedding> {
        Arc::new(KeywordEmbedding {
            keywords: vec!["dark", "coffee", "meeting"],
        })
    }

    async fn seeded_store(embedder: &KeywordEmbedding) -> Arc<InMemoryMemoryStore> {
        let store = Arc::new(InMemoryMemoryStore::new());
        for (ty, content) in [
            (MemoryType::Preference, "User prefers dark mode"),
            (MemoryType::Fact, "User drinks coffee at 9am"),
            (MemoryType::Reminder, "Standup meeting on Mondays"),
        ] {
            store
                .create(
                    MemoryInput::new("a1", ty, content).with_embedding(embedder.vector(content)),
                )
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn retrieves_semantically_closest() {
        let embedder = embedder();
        let store = seeded_store(&embedder).await;
        let retriever = MemoryRetriever::new(store, embedder);

        let results = retriever
            .retrieve("a1", "switch to dark theme", &RetrievalOptions::default())
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].memory.content, "User prefers dark mode");
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_empty() {
        let store = Arc::new(InMemoryMemoryStore::new());
        let retriever = MemoryRetriever::new(store, Arc::new(FailingEmbedding));
        let results = retriever
            .retrieve("a1", "anything", &RetrievalOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn min_score_drops_unrelated() {
        let embedder = embedder();
        let store = seeded_store(&embedder).await;
        let retriever = MemoryRetriever::new(store, embedder);

        let results = retriever
            .retrieve("a1", "completely unrelated topic", &RetrievalOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn type_weight_orders_results() {
        let embedder = Arc::new(KeywordEmbedding {
            keywords: vec!["mode"],
        });
        let store = Arc::new(InMemoryMemoryStore::new());
        store
            .create(
                MemoryInput::new("a1", MemoryType::Fact, "mode fact")
                    .with_embedding(embedder.vector("mode fact")),
            )
            .await
            .unwrap();
        store
            .create(
                MemoryInput::new("a1", MemoryType::Rule, "mode rule")
                    .with_embedding(embedder.vector("mode rule")),
            )
            .await
            .unwrap();
        let retriever = MemoryRetriever::new(store, embedder);

        let results = retriever
            .retrieve("a1", "mode", &RetrievalOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        // Rule weight 1.5 beats fact weight 1.0 at equal similarity.
        assert_eq!(results[0].memory.memory_type, MemoryType::Rule);
    }

    #[tokio::test]
    async fn token_budget_keeps_at_least_one() {
        let embedder = Arc::new(KeywordEmbedding {
            keywords: vec!["topic"],
        });
        let store = Arc::new(InMemoryMemoryStore::new());
        let long = format!("topic {}", "x".repeat(400));
        store
            .create(
                MemoryInput::new("a1", MemoryType::Fact, long.clone())
                    .with_embedding(embedder.vector(&long)),
            )
            .await
            .unwrap();
        let retriever = MemoryRetriever::new(store, embedder);

        let options = RetrievalOptions {
            token_budget: Some(10),
            ..Default::default()
        };
        let results = retriever.retrieve("a1", "topic", &options).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn record_access_side_effect() {
        let embedder = embedder();
        let store = seeded_store(&embedder).await;
        let retriever = MemoryRetriever::new(store.clone(), embedder);

        let results = retriever
            .retrieve("a1", "dark mode please", &RetrievalOptions::default())
            .await
            .unwrap();
        let id = results[0].memory.id.clone();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.access_count, 1);

        let options = RetrievalOptions {
            record_access: false,
            ..Default::default()
        };
        retriever.retrieve("a1", "dark mode please", &options).await.unwrap();
        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.access_count, 1);
    }

    #[test]
    fn recency_decay_math() {
        assert!((recency_factor(0.0, 168.0) - 1.0).abs() < 1e-6);
        assert!((recency_factor(168.0, 168.0) - 0.85).abs() < 1e-6);
        assert!(recency_factor(10_000.0, 168.0) < 0.71);
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine(&[], &[]), None);
        assert_eq!(cosine(&[1.0], &[1.0, 0.0]), None);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), None);
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-6);
    }
}
