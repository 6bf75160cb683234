//! Outbound HTTP execution.
//!
//! One global pooled client serves every backend adapter. Adapters build
//! plain `http::Request<Vec<u8>>` values; this module translates them to
//! reqwest and back so the adapters stay transport-agnostic.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::{Request, Response};
use once_cell::sync::Lazy;
use reqwest::Client;
use std::pin::Pin;
use std::time::Duration;

use crate::error::GatewayError;

/// A single, global client, built once. Connections are pooled per host.
pub static CLIENT: Lazy<Client> = Lazy::new(Client::new);

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

fn to_reqwest(
    req: Request<Vec<u8>>,
    timeout: Option<Duration>,
) -> Result<reqwest::RequestBuilder, GatewayError> {
    let method = req
        .method()
        .as_str()
        .parse::<reqwest::Method>()
        .map_err(|e| GatewayError::Internal(format!("invalid method: {e}")))?;

    let mut rb = CLIENT.request(method, req.uri().to_string());
    for (name, value) in req.headers().iter() {
        let val_str = value
            .to_str()
            .map_err(|e| GatewayError::Internal(format!("invalid header value: {e}")))?;
        rb = rb.header(name.as_str(), val_str);
    }
    if let Some(t) = timeout {
        rb = rb.timeout(t);
    }
    Ok(rb.body(req.into_body()))
}

/// Execute a request and buffer the whole response body.
///
/// Error statuses are returned as responses, not errors; callers classify
/// them so retry decisions stay with the dispatcher.
pub async fn call_outbound(req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, GatewayError> {
    call_outbound_with_timeout(req, None).await
}

pub async fn call_outbound_with_timeout(
    req: Request<Vec<u8>>,
    timeout: Option<Duration>,
) -> Result<Response<Vec<u8>>, GatewayError> {
    let resp = to_reqwest(req, timeout)?.send().await?;

    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.bytes().await?.to_vec();

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in headers.iter() {
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder
        .body(bytes)
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

/// Execute a request and hand back the body as a byte stream.
///
/// A non-success status is read to completion and returned as a buffered
/// error response so the caller can classify it; only success responses
/// stream. Dropping the stream releases the underlying connection.
pub async fn stream_outbound(
    req: Request<Vec<u8>>,
    timeout: Option<Duration>,
) -> Result<Result<ByteStream, Response<Vec<u8>>>, GatewayError> {
    let resp = to_reqwest(req, timeout)?.send().await?;

    let status = resp.status();
    if !status.is_success() {
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await?.to_vec();
        let mut builder = Response::builder().status(status.as_u16());
        for (name, value) in headers.iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        let buffered = builder
            .body(bytes)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        return Ok(Err(buffered));
    }

    let stream = resp
        .bytes_stream()
        .map(|item| item.map_err(GatewayError::from));
    Ok(Ok(Box::pin(stream)))
}
