//! Backend provider adapters.
//!
//! Each adapter translates the gateway's generic chat shape into one
//! provider's wire format: it builds an `http::Request<Vec<u8>>`, parses a
//! buffered `http::Response<Vec<u8>>`, and parses streamed body lines into
//! [`StreamEvent`]s. Adding a provider means adding one module here; the
//! dispatcher and pipeline stay untouched.

use http::{Request, Response};
use std::sync::Arc;
use std::time::Duration;

use crate::chat::{FinishReason, Message, StreamEvent, Usage};
use crate::error::GatewayError;
use crate::outbound::call_outbound;
use crate::routing::accounts::{Account, Provider};

pub mod anthropic;
pub mod ollama;
pub mod openai;

pub use anthropic::Anthropic;
pub use ollama::Ollama;
pub use openai::OpenAi;

/// Generation parameters shared by every adapter.
#[derive(Debug, Clone, Default)]
pub struct AdapterParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    /// Overall request deadline.
    pub timeout: Option<Duration>,
}

/// A buffered (non-streaming) chat response in provider-neutral form.
#[derive(Debug, Clone)]
pub struct BackendChatResponse {
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: Option<Usage>,
}

/// Provider-specific translator and request builder.
pub trait BackendAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// The bare model name (without the provider prefix).
    fn model(&self) -> &str;

    fn chat_request(
        &self,
        messages: &[Message],
        stream: bool,
    ) -> Result<Request<Vec<u8>>, GatewayError>;

    fn parse_chat(&self, resp: Response<Vec<u8>>) -> Result<BackendChatResponse, GatewayError>;

    /// Parse complete stream-body lines into events. The dispatcher hands in
    /// whole lines only; partial network chunks never reach the adapter.
    fn parse_stream_chunk(&self, chunk: &[u8]) -> Result<Vec<StreamEvent>, GatewayError>;

    fn models_request(&self) -> Result<Request<Vec<u8>>, GatewayError>;

    fn parse_models(&self, resp: Response<Vec<u8>>) -> Result<Vec<String>, GatewayError>;

    /// Request deadline for this adapter.
    fn request_timeout(&self) -> Duration;

    /// Ceiling for retry backoff; local backends tolerate longer waits.
    fn backoff_cap(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// Build the adapter for `account` serving `model_name`.
pub fn adapter_for(
    account: &Account,
    model_name: &str,
    params: &AdapterParams,
) -> Result<Arc<dyn BackendAdapter>, GatewayError> {
    match account.provider {
        Provider::Anthropic => Ok(Arc::new(Anthropic::new(account, model_name, params)?)),
        Provider::Openai => Ok(Arc::new(OpenAi::new(account, model_name, params)?)),
        Provider::Ollama => Ok(Arc::new(Ollama::new(account, model_name, params)?)),
    }
}

/// Split a `<provider>/<name>` model string.
pub fn split_model(model: &str) -> Result<(Provider, &str), GatewayError> {
    let (prefix, name) = model.split_once('/').ok_or_else(|| {
        GatewayError::InvalidRequest(format!(
            "model '{model}' is not of the form <provider>/<name>"
        ))
    })?;
    let provider = Provider::parse(prefix)
        .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown provider: {prefix}")))?;
    if name.is_empty() {
        return Err(GatewayError::InvalidRequest(format!(
            "model '{model}' has an empty model name"
        )));
    }
    Ok((provider, name))
}

/// List the adapter's models. Used by the models endpoint and health probes.
pub async fn fetch_models(adapter: &dyn BackendAdapter) -> Result<Vec<String>, GatewayError> {
    let req = adapter.models_request()?;
    let resp = call_outbound(req).await?;
    adapter.parse_models(resp)
}

/// Liveness probe: a reachable, well-formed models listing counts as healthy.
pub async fn probe_health(adapter: &dyn BackendAdapter) -> bool {
    fetch_models(adapter).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_provider_prefix() {
        let (provider, name) = split_model("anthropic/claude-sonnet-4").unwrap();
        assert_eq!(provider, Provider::Anthropic);
        assert_eq!(name, "claude-sonnet-4");
    }

    #[test]
    fn rejects_malformed_models() {
        assert!(split_model("claude-sonnet-4").is_err());
        assert!(split_model("anthropic/").is_err());
        assert!(split_model("mystery/model").is_err());
    }
}
