use std::fmt;

/// Error types that can occur while a request moves through the gateway.
#[derive(Debug)]
pub enum GatewayError {
    /// Malformed or unsupported inbound request
    InvalidRequest(String),
    /// Authentication and authorization errors (inbound or upstream)
    AuthError(String),
    /// The injection detector blocked the request
    PolicyBlock { reason: String, severity: String },
    /// Rate limited, either by the detector or upstream
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },
    /// Strict budget routing failed: every candidate account is exhausted
    BudgetExhausted(String),
    /// HTTP transport errors (connect, TLS, body read)
    HttpError(String),
    /// Retryable errors returned by the upstream provider (5xx)
    ProviderError(String),
    /// Non-retryable upstream rejection (4xx other than 429)
    BackendFatal(String),
    /// Upstream response could not be parsed
    ResponseFormatError {
        message: String,
        raw_response: String,
    },
    /// JSON serialization/deserialization errors
    JsonError(String),
    /// Caller disconnected or the deadline passed
    Cancelled,
    /// Unexpected internal fault
    Internal(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::InvalidRequest(e) => write!(f, "Invalid Request: {}", e),
            GatewayError::AuthError(e) => write!(f, "Auth Error: {}", e),
            GatewayError::PolicyBlock { reason, severity } => {
                write!(f, "Blocked ({}): {}", severity, reason)
            }
            GatewayError::RateLimited { message, .. } => write!(f, "Rate Limited: {}", message),
            GatewayError::BudgetExhausted(e) => write!(f, "Budget Exhausted: {}", e),
            GatewayError::HttpError(e) => write!(f, "HTTP Error: {}", e),
            GatewayError::ProviderError(e) => write!(f, "Provider Error: {}", e),
            GatewayError::BackendFatal(e) => write!(f, "Backend Error: {}", e),
            GatewayError::ResponseFormatError {
                message,
                raw_response,
            } => {
                write!(
                    f,
                    "Response Format Error: {}. Raw response: {}",
                    message, raw_response
                )
            }
            GatewayError::JsonError(e) => write!(f, "JSON Parse Error: {}", e),
            GatewayError::Cancelled => write!(f, "Cancelled"),
            GatewayError::Internal(e) => write!(f, "Internal Error: {}", e),
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// Whether the dispatcher may retry the request on this error.
    /// Network faults, upstream 5xx and 429 are retryable; everything else
    /// surfaces immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::HttpError(_)
                | GatewayError::ProviderError(_)
                | GatewayError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::HttpError(err.to_string())
    }
}

impl From<http::Error> for GatewayError {
    fn from(err: http::Error) -> Self {
        GatewayError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::JsonError(format!(
            "{} at line {} column {}",
            err,
            err.line(),
            err.column()
        ))
    }
}

impl From<url::ParseError> for GatewayError {
    fn from(err: url::ParseError) -> Self {
        GatewayError::InvalidRequest(format!("Error parsing provided url: {}", err))
    }
}

/// Classify a non-success upstream response into a [`GatewayError`].
///
/// Rate-limit responses carry the `retry-after` hint when the provider sent
/// one; some providers only expose `x-ratelimit-reset-requests` in the
/// `"6m0s"` / `"1s"` format, which is folded into the same hint.
pub fn classify_upstream_error(resp: http::Response<Vec<u8>>) -> GatewayError {
    let status = resp.status();
    let status_code = status.as_u16();

    let retry_after_secs = if status_code == 429 {
        resp.headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .or_else(|| {
                resp.headers()
                    .get("x-ratelimit-reset-requests")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_reset_duration)
            })
    } else {
        None
    };

    let error_text = String::from_utf8(resp.into_body()).unwrap_or_default();
    let clean_message = if let Ok(json) = serde_json::from_str::<serde_json::Value>(&error_text) {
        json.pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("API returned error status: {}", status))
    } else {
        format!("API returned error status: {}", status)
    };

    match status_code {
        401 | 403 => GatewayError::AuthError(clean_message),
        429 => GatewayError::RateLimited {
            message: clean_message,
            retry_after_secs,
        },
        400..=499 => GatewayError::BackendFatal(clean_message),
        _ => GatewayError::ProviderError(format!("Server error: {}", clean_message)),
    }
}

/// Parse `x-ratelimit-reset-requests` values like "6m0s" or "1s" into seconds.
fn parse_reset_duration(s: &str) -> Option<u64> {
    if !s.ends_with('s') {
        return None;
    }
    let num_part = s.trim_end_matches('s');
    if let Some(m_pos) = num_part.find('m') {
        let minutes = num_part[..m_pos].parse::<u64>().ok()?;
        let seconds = num_part[m_pos + 1..].parse::<u64>().unwrap_or(0);
        Some(minutes * 60 + seconds)
    } else {
        num_part.parse::<u64>().ok()
    }
}
