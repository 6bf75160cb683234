//! Embedding collaborator interface.
//!
//! Retrieval embeds queries through this trait; failures are non-fatal to
//! the pipeline (the retriever degrades to returning nothing).

use async_trait::async_trait;
use http::{header::CONTENT_TYPE, Method, Request, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{classify_upstream_error, GatewayError};
use crate::outbound::call_outbound;

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError>;

    fn dimensions(&self) -> usize;
}

/// OpenAI-compatible `/embeddings` endpoint client.
pub struct HttpEmbeddingService {
    base_url: Url,
    api_key: String,
    model: String,
    dimensions: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl HttpEmbeddingService {
    pub fn new(base_url: Url, api_key: String, model: String, dimensions: usize) -> Self {
        HttpEmbeddingService {
            base_url,
            api_key,
            model,
            dimensions,
        }
    }

    fn embed_request(&self, input: &str) -> Result<Request<Vec<u8>>, GatewayError> {
        let body = serde_json::to_vec(&EmbeddingRequest {
            model: &self.model,
            input,
        })?;
        let url = self.base_url.join("embeddings")?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .header(CONTENT_TYPE, "application/json");
        if !self.api_key.is_empty() {
            builder = builder.header("authorization", format!("Bearer {}", self.api_key));
        }
        Ok(builder.body(body)?)
    }

    fn parse_embed(&self, resp: Response<Vec<u8>>) -> Result<Vec<f32>, GatewayError> {
        if !resp.status().is_success() {
            return Err(classify_upstream_error(resp));
        }
        let parsed: EmbeddingResponse = serde_json::from_slice(resp.body())?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| GatewayError::ResponseFormatError {
                message: "embedding response carries no data".to_string(),
                raw_response: String::new(),
            })
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, GatewayError> {
        let req = self.embed_request(text)?;
        let resp = call_outbound(req).await?;
        self.parse_embed(resp)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> HttpEmbeddingService {
        HttpEmbeddingService::new(
            Url::parse("https://api.openai.com/v1/").unwrap(),
            "sk-test".to_string(),
            "text-embedding-3-small".to_string(),
            1536,
        )
    }

    #[test]
    fn builds_authorized_request() {
        let req = service().embed_request("hello").unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri(), "https://api.openai.com/v1/embeddings");
        assert!(req
            .headers()
            .get("authorization")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("Bearer "));
        let body: serde_json::Value = serde_json::from_slice(req.body()).unwrap();
        assert_eq!(body["input"], "hello");
    }

    #[test]
    fn parses_embedding_payload() {
        let body = br#"{"data":[{"embedding":[0.1,0.2,0.3],"index":0}],"model":"x"}"#.to_vec();
        let resp = Response::builder().status(200).body(body).unwrap();
        let vector = service().parse_embed(resp).unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn upstream_error_is_classified() {
        let resp = Response::builder().status(500).body(Vec::new()).unwrap();
        assert!(service().parse_embed(resp).unwrap_err().is_retryable());
    }
}
