//! Session transcripts.
//!
//! The pipeline appends one entry per completed exchange, fire-and-forget;
//! cancellation skips the append. The JSONL store writes one file per
//! session under the configured directory so transcripts survive restarts
//! and can be replayed for recovery or summarization.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::chat::Usage;

#[derive(Debug, thiserror::Error)]
pub enum TranscriptStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization/Deserialization error: {0}")]
    CodecError(String),
    #[error("Other transcript store error: {0}")]
    Other(String),
}

/// One completed exchange inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub rule: String,
    pub account_id: String,
    pub user_content: String,
    pub assistant_content: String,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub warning: Option<String>,
}

#[async_trait]
pub trait TranscriptStore: Send + Sync + 'static {
    async fn append(
        &self,
        session_id: &str,
        entry: TranscriptEntry,
    ) -> Result<(), TranscriptStoreError>;

    async fn load(&self, session_id: &str) -> Result<Vec<TranscriptEntry>, TranscriptStoreError>;
}

/// One JSONL file per session under a root directory.
pub struct JsonlTranscriptStore {
    root: PathBuf,
}

impl JsonlTranscriptStore {
    pub fn new(root: PathBuf) -> Self {
        JsonlTranscriptStore { root }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        // keep the filename shell-safe regardless of what the caller put in
        // the session id
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.jsonl"))
    }
}

#[async_trait]
impl TranscriptStore for JsonlTranscriptStore {
    async fn append(
        &self,
        session_id: &str,
        entry: TranscriptEntry,
    ) -> Result<(), TranscriptStoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| TranscriptStoreError::CodecError(e.to_string()))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(session_id))
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<TranscriptEntry>, TranscriptStoreError> {
        let path = self.path_for(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l).map_err(|e| TranscriptStoreError::CodecError(e.to_string()))
            })
            .collect()
    }
}

/// In-memory transcript store for tests and embedded use.
pub struct InMemoryTranscriptStore {
    sessions: Mutex<HashMap<String, Vec<TranscriptEntry>>>,
}

impl InMemoryTranscriptStore {
    pub fn new() -> Self {
        InMemoryTranscriptStore {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryTranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn append(
        &self,
        session_id: &str,
        entry: TranscriptEntry,
    ) -> Result<(), TranscriptStoreError> {
        self.sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<TranscriptEntry>, TranscriptStoreError> {
        Ok(self
            .sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(content: &str) -> TranscriptEntry {
        TranscriptEntry {
            timestamp: Utc::now(),
            model: "anthropic/claude-sonnet-4".to_string(),
            rule: "default".to_string(),
            account_id: "a".to_string(),
            user_content: "hello".to_string(),
            assistant_content: content.to_string(),
            usage: Some(Usage {
                input_tokens: 3,
                output_tokens: 7,
            }),
            warning: None,
        }
    }

    #[tokio::test]
    async fn jsonl_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::new(dir.path().to_path_buf());

        store.append("s1", entry("first")).await.unwrap();
        store.append("s1", entry("second")).await.unwrap();
        store.append("s2", entry("other")).await.unwrap();

        let loaded = store.load("s1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].assistant_content, "first");
        assert_eq!(loaded[1].assistant_content, "second");
        assert_eq!(store.load("s2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_session_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::new(dir.path().to_path_buf());
        assert!(store.load("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_ids_are_sanitized_for_filenames() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlTranscriptStore::new(dir.path().to_path_buf());
        store.append("../../etc/passwd", entry("x")).await.unwrap();
        let loaded = store.load("../../etc/passwd").await.unwrap();
        assert_eq!(loaded.len(), 1);
        // nothing escaped the root
        assert!(dir.path().join("______etc_passwd.jsonl").exists());
    }

    #[tokio::test]
    async fn in_memory_store_round_trip() {
        let store = InMemoryTranscriptStore::new();
        store.append("s1", entry("a")).await.unwrap();
        assert_eq!(store.load("s1").await.unwrap().len(), 1);
        assert!(store.load("s2").await.unwrap().is_empty());
    }
}
