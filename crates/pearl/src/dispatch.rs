//! Backend dispatch: opening and decoding upstream streams.
//!
//! Retry applies to stream *creation* only. Once the first chunk has been
//! parsed we are committed: tokens may already have reached the caller and
//! cannot be rolled back. Stream bodies arrive as arbitrary network chunks;
//! a line buffer reassembles complete lines before the adapter parses them,
//! and one upstream chunk is read only after the previous events were
//! consumed, so caller backpressure propagates to the socket.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::chat::{Message, StreamEvent};
use crate::error::{classify_upstream_error, GatewayError};
use crate::outbound::{stream_outbound, ByteStream};
use crate::providers::BackendAdapter;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, GatewayError>> + Send>>;

fn default_retries() -> u32 {
    3
}
fn default_backoff_base_secs() -> u64 {
    1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Attempts at opening the upstream stream (including the first).
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            retries: default_retries(),
            backoff_base_secs: default_backoff_base_secs(),
        }
    }
}

/// Seam between the pipeline and the network. Tests plug in scripted
/// transports; production uses [`HttpChatTransport`].
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(
        &self,
        adapter: Arc<dyn BackendAdapter>,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<EventStream, GatewayError>;
}

pub struct HttpChatTransport {
    config: DispatchConfig,
}

impl HttpChatTransport {
    pub fn new(config: DispatchConfig) -> Self {
        HttpChatTransport { config }
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn open(
        &self,
        adapter: Arc<dyn BackendAdapter>,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<EventStream, GatewayError> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }

            let req = adapter.chat_request(messages, true)?;
            let outcome = stream_outbound(req, Some(adapter.request_timeout())).await;

            let err = match outcome {
                Ok(Ok(bytes)) => {
                    debug!(
                        "stream open: {}/{} (attempt {attempt})",
                        adapter.provider(),
                        adapter.model()
                    );
                    return Ok(decode_events(bytes, adapter));
                }
                Ok(Err(buffered)) => classify_upstream_error(buffered),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= self.config.retries {
                return Err(err);
            }

            let wait = match &err {
                GatewayError::RateLimited {
                    retry_after_secs: Some(secs),
                    ..
                } => Duration::from_secs(*secs),
                _ => backoff_delay(
                    attempt,
                    Duration::from_secs(self.config.backoff_base_secs),
                    adapter.backoff_cap(),
                ),
            };
            info!(
                "{}/{} attempt {attempt}/{} failed ({err}), retrying in {wait:?}",
                adapter.provider(),
                adapter.model(),
                self.config.retries
            );
            if wait_with_cancellation(wait, cancel).await {
                return Err(GatewayError::Cancelled);
            }
        }
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(cap)
}

/// Returns `true` if cancelled before the wait completed.
async fn wait_with_cancellation(wait: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => false,
        _ = cancel.cancelled() => true,
    }
}

struct DecodeState {
    bytes: Option<ByteStream>,
    adapter: Arc<dyn BackendAdapter>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<StreamEvent, GatewayError>>,
}

/// Turn the raw byte stream into adapter events, reassembling lines that
/// straddle network chunk boundaries.
pub fn decode_events(bytes: ByteStream, adapter: Arc<dyn BackendAdapter>) -> EventStream {
    let state = DecodeState {
        bytes: Some(bytes),
        adapter,
        buffer: Vec::new(),
        pending: VecDeque::new(),
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            let Some(bytes) = state.bytes.as_mut() else {
                return None;
            };

            match bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    // hand the adapter everything up to the last newline
                    if let Some(pos) = state.buffer.iter().rposition(|b| *b == b'\n') {
                        let complete: Vec<u8> = state.buffer.drain(..=pos).collect();
                        match state.adapter.parse_stream_chunk(&complete) {
                            Ok(events) => {
                                state.pending.extend(events.into_iter().map(Ok));
                            }
                            Err(e) => {
                                state.bytes = None;
                                state.pending.push_back(Err(e));
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    state.bytes = None;
                    state.pending.push_back(Err(e));
                }
                None => {
                    state.bytes = None;
                    if !state.buffer.is_empty() {
                        let rest = std::mem::take(&mut state.buffer);
                        match state.adapter.parse_stream_chunk(&rest) {
                            Ok(events) => state.pending.extend(events.into_iter().map(Ok)),
                            Err(e) => state.pending.push_back(Err(e)),
                        }
                    }
                    if state.pending.is_empty() {
                        return None;
                    }
                }
            }
        }
    }))
}

/// Open a buffered (non-streaming) chat exchange with the same retry policy.
pub async fn call_buffered(
    config: &DispatchConfig,
    adapter: &dyn BackendAdapter,
    messages: &[Message],
    cancel: &CancellationToken,
) -> Result<crate::providers::BackendChatResponse, GatewayError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let req = adapter.chat_request(messages, false)?;
        let result = crate::outbound::call_outbound_with_timeout(
            req,
            Some(adapter.request_timeout()),
        )
        .await
        .and_then(|resp| adapter.parse_chat(resp));

        match result {
            Ok(resp) => return Ok(resp),
            Err(err) if err.is_retryable() && attempt < config.retries => {
                let wait = backoff_delay(
                    attempt,
                    Duration::from_secs(config.backoff_base_secs),
                    adapter.backoff_cap(),
                );
                warn!("buffered chat attempt {attempt} failed ({err}), retrying in {wait:?}");
                if wait_with_cancellation(wait, cancel).await {
                    return Err(GatewayError::Cancelled);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Usage;
    use crate::providers::{AdapterParams, Ollama};
    use crate::routing::accounts::{Account, AuthKind, Provider};
    use bytes::Bytes;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(10);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, base, cap), Duration::from_secs(10));
    }

    fn ollama_adapter() -> Arc<dyn BackendAdapter> {
        let account = Account {
            id: "local".to_string(),
            provider: Provider::Ollama,
            auth: AuthKind::ApiKey,
            credential: String::new(),
            credential_env: None,
            base_url: None,
            default_model: None,
            budget_monthly_usd: None,
            usage_current_month_usd: 0.0,
            enabled: true,
            last_used_at: None,
        };
        Arc::new(Ollama::new(&account, "llama3.2", &AdapterParams::default()).unwrap())
    }

    fn byte_stream(chunks: Vec<&'static str>) -> ByteStream {
        Box::pin(futures::stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from(c))),
        ))
    }

    #[tokio::test]
    async fn reassembles_lines_across_chunk_boundaries() {
        // one JSONL record split in the middle of its JSON
        let stream = byte_stream(vec![
            "{\"message\":{\"content\":\"Hel",
            "lo\"},\"done\":false}\n{\"message\":{\"content\":\"\"},\"done\":true,",
            "\"done_reason\":\"stop\",\"prompt_eval_count\":3,\"eval_count\":1}\n",
        ]);
        let events: Vec<_> = decode_events(stream, ollama_adapter())
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Text("Hello".to_string()),
                StreamEvent::Usage(Usage {
                    input_tokens: 3,
                    output_tokens: 1
                }),
                StreamEvent::Done {
                    stop_reason: "stop".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_parsed() {
        let stream = byte_stream(vec![
            "{\"message\":{\"content\":\"hi\"},\"done\":true,\"done_reason\":\"stop\"}",
        ]);
        let events: Vec<_> = decode_events(stream, ollama_adapter())
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Text("hi".to_string()));
    }

    #[tokio::test]
    async fn upstream_error_surfaces_and_ends_stream() {
        let stream: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from("{\"message\":{\"content\":\"a\"},\"done\":false}\n")),
            Err(GatewayError::HttpError("reset".to_string())),
        ]));
        let events: Vec<_> = decode_events(stream, ollama_adapter()).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(events[1].is_err());
    }

    #[tokio::test]
    async fn garbage_line_yields_format_error() {
        let stream = byte_stream(vec!["not json at all\n"]);
        let events: Vec<_> = decode_events(stream, ollama_adapter()).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            Err(GatewayError::ResponseFormatError { .. })
        ));
    }
}
