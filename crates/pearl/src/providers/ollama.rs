//! Ollama adapter.
//!
//! Ollama streams newline-delimited JSON records instead of SSE; the
//! terminal record has `done: true` and carries `prompt_eval_count` /
//! `eval_count` for usage. Local models get a longer deadline and a wider
//! backoff cap.

use http::{header::CONTENT_TYPE, Method, Request, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use super::{AdapterParams, BackendAdapter, BackendChatResponse};
use crate::chat::{FinishReason, Message, Role, StreamEvent, Usage};
use crate::error::{classify_upstream_error, GatewayError};
use crate::routing::accounts::{Account, Provider};

const LOCAL_TIMEOUT: Duration = Duration::from_secs(120);
const LOCAL_BACKOFF_CAP: Duration = Duration::from_secs(30);

pub struct Ollama {
    base_url: Url,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    timeout: Duration,
}

#[derive(Serialize)]
struct OllamaMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize, Default)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct OllamaChatRecord {
    message: Option<OllamaResponseMessage>,
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: Option<String>,
}

impl Ollama {
    pub fn new(
        account: &Account,
        model: &str,
        params: &AdapterParams,
    ) -> Result<Self, GatewayError> {
        let base_url = match &account.base_url {
            Some(url) => url.clone(),
            None => Url::parse("http://localhost:11434/")?,
        };
        Ok(Ollama {
            base_url,
            model: model.to_string(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            timeout: params.timeout.unwrap_or(LOCAL_TIMEOUT),
        })
    }

    fn map_done_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("length") => FinishReason::Length,
            _ => FinishReason::Stop,
        }
    }
}

impl BackendAdapter for Ollama {
    fn provider(&self) -> Provider {
        Provider::Ollama
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn chat_request(
        &self,
        messages: &[Message],
        stream: bool,
    ) -> Result<Request<Vec<u8>>, GatewayError> {
        let body = OllamaChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| OllamaMessage {
                    role: match m.role {
                        Role::System => "system",
                        Role::Assistant => "assistant",
                        _ => "user",
                    },
                    content: &m.content,
                })
                .collect(),
            stream,
            options: OllamaOptions {
                num_predict: self.max_tokens,
                temperature: self.temperature,
                top_p: self.top_p,
            },
        };

        let json_req = serde_json::to_vec(&body)?;
        let url = self.base_url.join("api/chat")?;
        Ok(Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(json_req)?)
    }

    fn parse_chat(&self, resp: Response<Vec<u8>>) -> Result<BackendChatResponse, GatewayError> {
        if !resp.status().is_success() {
            return Err(classify_upstream_error(resp));
        }
        let parsed: OllamaChatRecord =
            serde_json::from_slice(resp.body()).map_err(|e| GatewayError::ResponseFormatError {
                message: format!("failed to parse Ollama response: {e}"),
                raw_response: String::from_utf8_lossy(resp.body()).into_owned(),
            })?;

        let usage = parsed.prompt_eval_count.map(|input_tokens| Usage {
            input_tokens,
            output_tokens: parsed.eval_count.unwrap_or(0),
        });
        Ok(BackendChatResponse {
            text: parsed
                .message
                .and_then(|m| m.content)
                .unwrap_or_default(),
            finish_reason: Self::map_done_reason(parsed.done_reason.as_deref()),
            usage,
        })
    }

    fn parse_stream_chunk(&self, chunk: &[u8]) -> Result<Vec<StreamEvent>, GatewayError> {
        let text =
            std::str::from_utf8(chunk).map_err(|e| GatewayError::Internal(e.to_string()))?;
        let mut events = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: OllamaChatRecord =
                serde_json::from_str(line).map_err(|e| GatewayError::ResponseFormatError {
                    message: format!("failed to parse Ollama stream record: {e}"),
                    raw_response: line.to_string(),
                })?;

            if let Some(content) = record.message.as_ref().and_then(|m| m.content.as_deref())
                && !content.is_empty()
            {
                events.push(StreamEvent::Text(content.to_string()));
            }

            if record.done {
                if let Some(input_tokens) = record.prompt_eval_count {
                    events.push(StreamEvent::Usage(Usage {
                        input_tokens,
                        output_tokens: record.eval_count.unwrap_or(0),
                    }));
                }
                events.push(StreamEvent::Done {
                    stop_reason: record.done_reason.unwrap_or_else(|| "stop".to_string()),
                });
            }
        }
        Ok(events)
    }

    fn models_request(&self) -> Result<Request<Vec<u8>>, GatewayError> {
        let url = self.base_url.join("api/tags")?;
        Ok(Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .body(Vec::new())?)
    }

    fn parse_models(&self, resp: Response<Vec<u8>>) -> Result<Vec<String>, GatewayError> {
        if !resp.status().is_success() {
            return Err(classify_upstream_error(resp));
        }
        #[derive(Deserialize)]
        struct TagsResponse {
            models: Vec<TagEntry>,
        }
        #[derive(Deserialize)]
        struct TagEntry {
            name: String,
        }
        let parsed: TagsResponse = serde_json::from_slice(resp.body())?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    fn request_timeout(&self) -> Duration {
        self.timeout
    }

    fn backoff_cap(&self) -> Duration {
        LOCAL_BACKOFF_CAP
    }
}
