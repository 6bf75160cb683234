//! Chat data model shared by the HTTP front, the pipeline and the backend
//! adapters.
//!
//! Inbound requests arrive in the OpenAI Chat Completions shape and stay
//! immutable for the lifetime of the request; the streamed response is a
//! sequence of [`ChatChunk`] values whose final element (the terminal chunk)
//! carries the finish reason and aggregated token usage.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

use crate::error::GatewayError;
use futures::Stream;

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Caller-supplied routing and identity hints.
///
/// Accepted from the request body's `metadata` object; the HTTP front also
/// mirrors them from `x-pearl-*` headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default, rename = "agentId", alias = "agent_id")]
    pub agent_id: Option<String>,
    #[serde(default, rename = "sessionId", alias = "session_id")]
    pub session_id: Option<String>,
    #[serde(default, rename = "userId", alias = "user_id")]
    pub user_id: Option<String>,
    #[serde(default, rename = "isAdmin", alias = "is_admin")]
    pub is_admin: bool,
    #[serde(default, rename = "emergencyBypass", alias = "emergency_bypass")]
    pub emergency_bypass: Option<String>,
    #[serde(default, rename = "forceSunrise", alias = "force_sunrise")]
    pub force_sunrise: bool,
    /// Free-form keys matched against rule metadata extensions.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// An inbound chat completion request. Immutable once it enters the pipeline.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl ChatRequest {
    /// Content of the most recent user message, or `""` when there is none.
    pub fn last_user_content(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Token usage for one exchange, tolerant of every provider's field names.
#[derive(Debug, Serialize, Deserialize, Clone, Default, Eq, PartialEq)]
pub struct Usage {
    #[serde(
        alias = "prompt_tokens",     // OpenAI and compatibles
        alias = "input_tokens",      // Anthropic
        alias = "prompt_eval_count"  // Ollama
    )]
    pub input_tokens: u32,
    #[serde(
        alias = "completion_tokens",
        alias = "output_tokens",
        alias = "eval_count"
    )]
    pub output_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Reason the stream finished, in OpenAI terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
}

impl FinishReason {
    /// Map a provider stop reason string onto the OpenAI vocabulary.
    pub fn from_stop_reason(reason: &str) -> Self {
        match reason {
            "length" | "max_tokens" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "tool_use" | "tool_calls" => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }
}

/// Incremental tool call data inside a streamed delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionDelta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// The incremental payload of one streamed choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    pub finish_reason: Option<FinishReason>,
}

/// One element of the streamed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatChunk {
    pub fn text(id: &str, created: u64, model: &str, content: String) -> Self {
        ChatChunk {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: Some(content),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    pub fn tool_calls(id: &str, created: u64, model: &str, calls: Vec<ToolCallDelta>) -> Self {
        ChatChunk {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: None,
                    content: None,
                    tool_calls: Some(calls),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    pub fn terminal(
        id: &str,
        created: u64,
        model: &str,
        finish_reason: FinishReason,
        usage: Option<Usage>,
    ) -> Self {
        ChatChunk {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(finish_reason),
            }],
            usage,
        }
    }

    /// The finish reason of the first choice, when this is a terminal chunk.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.first().and_then(|c| c.finish_reason)
    }

    pub fn content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.delta.content.as_deref())
    }
}

/// Provider-agnostic events parsed out of an upstream stream body.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text content delta
    Text(String),
    /// Tool use block started
    ToolUseStart {
        index: usize,
        id: String,
        name: String,
    },
    /// Partial JSON for a tool call's arguments
    ToolUseInputDelta { index: usize, partial_json: String },
    /// Token counts, possibly partial (anthropic sends input early)
    Usage(Usage),
    /// Stream ended with the provider's stop reason
    Done { stop_reason: String },
}

/// A lazily produced, single-pass stream of chunks.
pub type ChatChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, GatewayError>> + Send>>;

/// A fully buffered chat completion, for non-streaming callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub message: CompletionMessage,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: Role,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_user_content_picks_latest() {
        let req = ChatRequest {
            messages: vec![
                Message::system("sys"),
                Message::user("first"),
                Message::assistant("mid"),
                Message::user("second"),
            ],
            ..Default::default()
        };
        assert_eq!(req.last_user_content(), "second");
    }

    #[test]
    fn last_user_content_empty_when_absent() {
        let req = ChatRequest {
            messages: vec![Message::system("sys")],
            ..Default::default()
        };
        assert_eq!(req.last_user_content(), "");
    }

    #[test]
    fn usage_accepts_provider_aliases() {
        let anthropic: Usage =
            serde_json::from_str(r#"{"input_tokens": 3, "output_tokens": 5}"#).unwrap();
        let openai: Usage =
            serde_json::from_str(r#"{"prompt_tokens": 3, "completion_tokens": 5}"#).unwrap();
        let ollama: Usage =
            serde_json::from_str(r#"{"prompt_eval_count": 3, "eval_count": 5}"#).unwrap();
        assert_eq!(anthropic, openai);
        assert_eq!(openai, ollama);
        assert_eq!(ollama.total(), 8);
    }

    #[test]
    fn metadata_accepts_both_casings() {
        let camel: RequestMetadata =
            serde_json::from_str(r#"{"agentId":"a","sessionId":"s","isAdmin":true}"#).unwrap();
        assert_eq!(camel.agent_id.as_deref(), Some("a"));
        assert!(camel.is_admin);

        let snake: RequestMetadata =
            serde_json::from_str(r#"{"agent_id":"a","user_id":"u"}"#).unwrap();
        assert_eq!(snake.agent_id.as_deref(), Some("a"));
        assert_eq!(snake.user_id.as_deref(), Some("u"));
    }

    #[test]
    fn terminal_chunk_round_trips() {
        let chunk = ChatChunk::terminal(
            "chatcmpl-1",
            0,
            "anthropic/claude",
            FinishReason::Stop,
            Some(Usage {
                input_tokens: 10,
                output_tokens: 5,
            }),
        );
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains(r#""finish_reason":"stop""#));
        let back: ChatChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back.finish_reason(), Some(FinishReason::Stop));
        assert_eq!(back.usage.unwrap().total(), 15);
    }
}
