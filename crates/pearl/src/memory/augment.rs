//! Prompt augmentation.
//!
//! Folds retrieved memories into the conversation's system message inside a
//! `<pearl:memories>` block. Injection is deduplicated per session: once a
//! memory id has been surfaced into a session it is never injected there
//! again. The session sets live in a bounded LRU cache with a TTL so
//! abandoned sessions age out.

use moka::sync::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::{estimate_tokens, MemoryRetriever, RetrievalOptions, ScoredMemory};
use crate::chat::{Message, Role};
use crate::error::GatewayError;

const BLOCK_OPEN: &str = "<pearl:memories>";
const BLOCK_HEADING: &str = "## Relevant Context";
const BLOCK_CLOSE: &str = "</pearl:memories>";

fn default_query_context_messages() -> usize {
    1
}
fn default_token_budget() -> u32 {
    600
}
fn default_session_capacity() -> u64 {
    10_000
}
fn default_session_ttl_seconds() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentOptions {
    #[serde(flatten)]
    pub retrieval: RetrievalOptions,
    /// How many trailing user messages form the retrieval query.
    #[serde(default = "default_query_context_messages")]
    pub query_context_messages: usize,
    /// Budget for the whole injected block, wrapper overhead included.
    #[serde(default = "default_token_budget")]
    pub token_budget: u32,
    #[serde(default)]
    pub skip_session_tracking: bool,
    #[serde(default = "default_session_capacity")]
    pub session_capacity: u64,
    #[serde(default = "default_session_ttl_seconds")]
    pub session_ttl_seconds: u64,
}

impl Default for AugmentOptions {
    fn default() -> Self {
        AugmentOptions {
            retrieval: RetrievalOptions::default(),
            query_context_messages: default_query_context_messages(),
            token_budget: default_token_budget(),
            skip_session_tracking: false,
            session_capacity: default_session_capacity(),
            session_ttl_seconds: default_session_ttl_seconds(),
        }
    }
}

/// Per-session record of already-injected memory ids.
pub struct SessionInjectionSet {
    sessions: Cache<String, Arc<Mutex<HashSet<String>>>>,
}

impl SessionInjectionSet {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        SessionInjectionSet {
            sessions: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    fn set_for(&self, session_id: &str) -> Arc<Mutex<HashSet<String>>> {
        self.sessions
            .get_with(session_id.to_string(), || Arc::new(Mutex::new(HashSet::new())))
    }

    pub fn contains(&self, session_id: &str, memory_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|set| set.lock().contains(memory_id))
            .unwrap_or(false)
    }

    pub fn record(&self, session_id: &str, memory_ids: &[String]) {
        let set = self.set_for(session_id);
        let mut guard = set.lock();
        for id in memory_ids {
            guard.insert(id.clone());
        }
    }

    /// Drop a finished session's record immediately.
    pub fn end_session(&self, session_id: &str) {
        self.sessions.invalidate(session_id);
    }
}

/// Result of one augmentation pass.
#[derive(Debug, Clone)]
pub struct AugmentOutcome {
    pub messages: Vec<Message>,
    pub injected: Vec<String>,
    pub tokens_used: u32,
}

pub struct PromptAugmenter {
    retriever: MemoryRetriever,
    sessions: SessionInjectionSet,
    options: AugmentOptions,
}

impl PromptAugmenter {
    pub fn new(retriever: MemoryRetriever, options: AugmentOptions) -> Self {
        let sessions = SessionInjectionSet::new(
            options.session_capacity,
            Duration::from_secs(options.session_ttl_seconds),
        );
        PromptAugmenter {
            retriever,
            sessions,
            options,
        }
    }

    pub fn sessions(&self) -> &SessionInjectionSet {
        &self.sessions
    }

    /// Retrieve memories for `agent_id` and fold them into a copy of
    /// `messages`. The input is never mutated.
    pub async fn augment(
        &self,
        agent_id: &str,
        messages: &[Message],
        session_id: Option<&str>,
    ) -> Result<AugmentOutcome, GatewayError> {
        let mut outcome = AugmentOutcome {
            messages: messages.to_vec(),
            injected: Vec::new(),
            tokens_used: 0,
        };

        let query = build_query(messages, self.options.query_context_messages);
        if query.is_empty() {
            return Ok(outcome);
        }

        let mut candidates = self
            .retriever
            .retrieve(agent_id, &query, &self.options.retrieval)
            .await?;

        let tracking = session_id.filter(|_| !self.options.skip_session_tracking);
        if let Some(session) = tracking {
            candidates.retain(|c| !self.sessions.contains(session, &c.memory.id));
        }
        if candidates.is_empty() {
            return Ok(outcome);
        }

        let overhead = block_overhead();
        let budget = self.options.token_budget.saturating_sub(overhead);
        let selected = select_within_budget(candidates, budget);
        if selected.is_empty() {
            return Ok(outcome);
        }

        let block = format_block(&selected);
        outcome.tokens_used = estimate_tokens(&block);
        outcome.injected = selected.iter().map(|s| s.memory.id.clone()).collect();
        inject_block(&mut outcome.messages, &block);

        if let Some(session) = tracking {
            self.sessions.record(session, &outcome.injected);
        }

        Ok(outcome)
    }
}

fn build_query(messages: &[Message], context_messages: usize) -> String {
    let mut parts: Vec<&str> = messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::User)
        .take(context_messages.max(1))
        .map(|m| m.content.as_str())
        .collect();
    parts.reverse();
    parts.join("\n").trim().to_string()
}

fn block_overhead() -> u32 {
    estimate_tokens(BLOCK_OPEN) + estimate_tokens(BLOCK_HEADING) + estimate_tokens(BLOCK_CLOSE)
}

/// Greedy selection. The block budget is a hard ceiling: a candidate that
/// does not fit is dropped along with everything ranked below it.
fn select_within_budget(candidates: Vec<ScoredMemory>, budget: u32) -> Vec<ScoredMemory> {
    let mut kept = Vec::new();
    let mut spent: u32 = 0;
    for candidate in candidates {
        let cost = estimate_tokens(&candidate.memory.content) + 1;
        if spent + cost > budget {
            break;
        }
        spent += cost;
        kept.push(candidate);
    }
    kept
}

fn format_block(selected: &[ScoredMemory]) -> String {
    let mut block = String::new();
    block.push_str(BLOCK_OPEN);
    block.push('\n');
    block.push_str(BLOCK_HEADING);
    block.push('\n');
    for entry in selected {
        match entry.memory.memory_type.label() {
            Some(label) => {
                block.push_str(&format!("- [{label}] {}\n", entry.memory.content));
            }
            None => {
                block.push_str(&format!("- {}\n", entry.memory.content));
            }
        }
    }
    block.push_str(BLOCK_CLOSE);
    block
}

fn inject_block(messages: &mut Vec<Message>, block: &str) {
    match messages.iter_mut().find(|m| m.role == Role::System) {
        Some(system) => {
            system.content = format!("{block}\n\n{}", system.content);
        }
        None => {
            messages.insert(0, Message::system(block.to_string()));
        }
    }
}
