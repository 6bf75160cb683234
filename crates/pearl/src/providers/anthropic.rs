//! Anthropic Messages API adapter.

use http::{header::CONTENT_TYPE, Method, Request, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use super::{AdapterParams, BackendAdapter, BackendChatResponse};
use crate::chat::{FinishReason, Message, Role, StreamEvent, Usage};
use crate::error::{classify_upstream_error, GatewayError};
use crate::routing::accounts::{Account, Provider};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct Anthropic {
    api_key: String,
    base_url: Url,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    top_p: Option<f32>,
    timeout: Duration,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Request payload for the messages endpoint.
#[derive(Serialize)]
struct AnthropicChatRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Deserialize)]
struct AnthropicChatResponse {
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: Option<String>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicStreamResponse {
    #[serde(rename = "type")]
    response_type: String,
    index: Option<usize>,
    content_block: Option<AnthropicStreamContentBlock>,
    delta: Option<AnthropicDelta>,
    message: Option<AnthropicStreamMessage>,
    usage: Option<AnthropicStreamUsage>,
}

#[derive(Deserialize)]
struct AnthropicStreamMessage {
    usage: Option<AnthropicStreamUsage>,
}

#[derive(Deserialize, Default)]
struct AnthropicStreamUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct AnthropicStreamContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicDelta {
    text: Option<String>,
    partial_json: Option<String>,
    stop_reason: Option<String>,
}

impl Anthropic {
    pub fn new(
        account: &Account,
        model: &str,
        params: &AdapterParams,
    ) -> Result<Self, GatewayError> {
        let base_url = match &account.base_url {
            Some(url) => url.clone(),
            None => Url::parse("https://api.anthropic.com/v1/")?,
        };
        Ok(Anthropic {
            api_key: account.resolved_credential(),
            base_url,
            model: model.to_string(),
            max_tokens: params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: params.temperature,
            top_p: params.top_p,
            timeout: params.timeout.unwrap_or(Duration::from_secs(30)),
        })
    }

    fn map_stop_reason(reason: Option<&str>) -> FinishReason {
        match reason {
            Some("max_tokens") => FinishReason::Length,
            Some("tool_use") => FinishReason::ToolCalls,
            _ => FinishReason::Stop,
        }
    }
}

impl BackendAdapter for Anthropic {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn chat_request(
        &self,
        messages: &[Message],
        stream: bool,
    ) -> Result<Request<Vec<u8>>, GatewayError> {
        if self.api_key.is_empty() {
            return Err(GatewayError::AuthError(
                "Missing Anthropic API key".to_string(),
            ));
        }

        // The messages endpoint takes the system prompt as a top-level field.
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let system = if system.is_empty() {
            None
        } else {
            Some(system.join("\n\n"))
        };

        let body = AnthropicChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| AnthropicMessage {
                    role: match m.role {
                        Role::Assistant => "assistant",
                        _ => "user",
                    },
                    content: &m.content,
                })
                .collect(),
            max_tokens: self.max_tokens,
            system,
            temperature: self.temperature,
            top_p: self.top_p,
            stream: stream.then_some(true),
        };

        let json_req = serde_json::to_vec(&body)?;
        let url = self.base_url.join("messages")?;
        Ok(Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(CONTENT_TYPE, "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .body(json_req)?)
    }

    fn parse_chat(&self, resp: Response<Vec<u8>>) -> Result<BackendChatResponse, GatewayError> {
        if !resp.status().is_success() {
            return Err(classify_upstream_error(resp));
        }
        let parsed: AnthropicChatResponse =
            serde_json::from_slice(resp.body()).map_err(|e| GatewayError::ResponseFormatError {
                message: format!("failed to parse Anthropic response: {e}"),
                raw_response: String::from_utf8_lossy(resp.body()).into_owned(),
            })?;

        let text = parsed
            .content
            .iter()
            .filter(|c| {
                c.content_type.as_deref() == Some("text") || c.content_type.is_none()
            })
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(BackendChatResponse {
            text,
            finish_reason: Self::map_stop_reason(parsed.stop_reason.as_deref()),
            usage: parsed.usage,
        })
    }

    fn parse_stream_chunk(&self, chunk: &[u8]) -> Result<Vec<StreamEvent>, GatewayError> {
        let text =
            std::str::from_utf8(chunk).map_err(|e| GatewayError::Internal(e.to_string()))?;
        let mut events = Vec::new();

        for line in text.lines() {
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }

            let stream_resp: AnthropicStreamResponse =
                serde_json::from_str(data).map_err(|e| GatewayError::ResponseFormatError {
                    message: format!("failed to parse Anthropic stream data: {e}"),
                    raw_response: data.to_string(),
                })?;

            match stream_resp.response_type.as_str() {
                "message_start" => {
                    if let Some(usage) = stream_resp.message.and_then(|m| m.usage) {
                        events.push(StreamEvent::Usage(Usage {
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                        }));
                    }
                }
                "content_block_start" => {
                    if let (Some(index), Some(block)) =
                        (stream_resp.index, stream_resp.content_block)
                        && block.block_type == "tool_use"
                    {
                        events.push(StreamEvent::ToolUseStart {
                            index,
                            id: block.id.unwrap_or_default(),
                            name: block.name.unwrap_or_default(),
                        });
                    }
                }
                "content_block_delta" => {
                    if let (Some(index), Some(delta)) = (stream_resp.index, stream_resp.delta) {
                        if let Some(text) = delta.text {
                            events.push(StreamEvent::Text(text));
                        } else if let Some(partial_json) = delta.partial_json {
                            events.push(StreamEvent::ToolUseInputDelta {
                                index,
                                partial_json,
                            });
                        }
                    }
                }
                "message_delta" => {
                    if let Some(usage) = stream_resp.usage {
                        events.push(StreamEvent::Usage(Usage {
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                        }));
                    }
                    if let Some(delta) = stream_resp.delta
                        && let Some(stop_reason) = delta.stop_reason
                    {
                        events.push(StreamEvent::Done { stop_reason });
                    }
                }
                // message_stop, ping and friends carry nothing we need
                _ => {}
            }
        }
        Ok(events)
    }

    fn models_request(&self) -> Result<Request<Vec<u8>>, GatewayError> {
        let url = self.base_url.join("models")?;
        Ok(Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .body(Vec::new())?)
    }

    fn parse_models(&self, resp: Response<Vec<u8>>) -> Result<Vec<String>, GatewayError> {
        if !resp.status().is_success() {
            return Err(classify_upstream_error(resp));
        }
        #[derive(Deserialize)]
        struct ModelsResponse {
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }
        let parsed: ModelsResponse = serde_json::from_slice(resp.body())?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }

    fn request_timeout(&self) -> Duration {
        self.timeout
    }
}
