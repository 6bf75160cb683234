//! OpenAI Chat Completions adapter.

use http::{header::CONTENT_TYPE, Method, Request, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use super::{AdapterParams, BackendAdapter, BackendChatResponse};
use crate::chat::{FinishReason, Message, StreamEvent, Usage};
use crate::error::{classify_upstream_error, GatewayError};
use crate::routing::accounts::{Account, Provider};

pub struct OpenAi {
    api_key: String,
    base_url: Url,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    timeout: Duration,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OpenAiStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Deserialize)]
struct OpenAiToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Deserialize)]
struct OpenAiFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

impl OpenAi {
    pub fn new(
        account: &Account,
        model: &str,
        params: &AdapterParams,
    ) -> Result<Self, GatewayError> {
        let base_url = match &account.base_url {
            Some(url) => url.clone(),
            None => Url::parse("https://api.openai.com/v1/")?,
        };
        Ok(OpenAi {
            api_key: account.resolved_credential(),
            base_url,
            model: model.to_string(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            timeout: params.timeout.unwrap_or(Duration::from_secs(30)),
        })
    }
}

impl BackendAdapter for OpenAi {
    fn provider(&self) -> Provider {
        Provider::Openai
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
            return Err(GatewayError::AuthError("Missing OpenAI API key".to_string()));
        }

        let body = OpenAiChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: match m.role {
                        crate::chat::Role::System => "system",
                        crate::chat::Role::User => "user",
                        crate::chat::Role::Assistant => "assistant",
                        crate::chat::Role::Tool => "tool",
                    },
                    content: &m.content,
                })
                .collect(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            stream: stream.then_some(true),
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        };

        let json_req = serde_json::to_vec(&body)?;
        let url = self.base_url.join("chat/completions")?;
        Ok(Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(CONTENT_TYPE, "application/json")
            .header("authorization", format!("Bearer {}", self.api_key))
            .body(json_req)?)
    }

    fn parse_chat(&self, resp: Response<Vec<u8>>) -> Result<BackendChatResponse, GatewayError> {
        if !resp.status().is_success() {
            return Err(classify_upstream_error(resp));
        }
        let parsed: OpenAiChatResponse =
            serde_json::from_slice(resp.body()).map_err(|e| GatewayError::ResponseFormatError {
                message: format!("failed to parse OpenAI response: {e}"),
                raw_response: String::from_utf8_lossy(resp.body()).into_owned(),
            })?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::ResponseFormatError {
                message: "OpenAI response carries no choices".to_string(),
                raw_response: String::new(),
            })?;

        Ok(BackendChatResponse {
            text: choice.message.content.unwrap_or_default(),
            finish_reason: choice
                .finish_reason
                .as_deref()
                .map(FinishReason::from_stop_reason)
                .unwrap_or(FinishReason::Stop),
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
            if data.is_empty() || data == "[DONE]" {
                // the finish_reason chunk precedes the sentinel
                continue;
            }

            let parsed: OpenAiStreamChunk =
                serde_json::from_str(data).map_err(|e| GatewayError::ResponseFormatError {
                    message: format!("failed to parse OpenAI stream data: {e}"),
                    raw_response: data.to_string(),
                })?;

            if let Some(usage) = parsed.usage {
                events.push(StreamEvent::Usage(usage));
            }

            for choice in parsed.choices {
                if let Some(content) = choice.delta.content
                    && !content.is_empty()
                {
                    events.push(StreamEvent::Text(content));
                }
                if let Some(tool_calls) = choice.delta.tool_calls {
                    for call in tool_calls {
                        if let Some(id) = call.id {
                            let name = call
                                .function
                                .as_ref()
                                .and_then(|f| f.name.clone())
                                .unwrap_or_default();
                            events.push(StreamEvent::ToolUseStart {
                                index: call.index,
                                id,
                                name,
                            });
                        }
                        if let Some(arguments) =
                            call.function.and_then(|f| f.arguments).filter(|a| !a.is_empty())
                        {
                            events.push(StreamEvent::ToolUseInputDelta {
                                index: call.index,
                                partial_json: arguments,
                            });
                        }
                    }
                }
                if let Some(reason) = choice.finish_reason {
                    events.push(StreamEvent::Done {
                        stop_reason: reason,
                    });
                }
            }
        }
        Ok(events)
    }

    fn models_request(&self) -> Result<Request<Vec<u8>>, GatewayError> {
        let url = self.base_url.join("models")?;
        Ok(Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .header("authorization", format!("Bearer {}", self.api_key))
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
