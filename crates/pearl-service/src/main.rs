use anyhow::Result;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use clap::Parser;
use futures::StreamExt;
use futures::stream as futures_stream;
use pearl::{
    ChatRequest, GatewayConfig, GatewayError, Pipeline,
    pipeline::collect,
    providers::fetch_models,
};
use serde::Serialize;
use serde_json::json;
use std::{convert::Infallible, path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the gateway config file
    #[arg(long, env = "PEARL_CONFIG", default_value = "pearl.yaml")]
    config: PathBuf,
    /// Override the bind address from config
    #[arg(long)]
    addr: Option<String>,
}

#[derive(Clone)]
struct ServerState {
    pipeline: Arc<Pipeline>,
    api_key: Option<String>,
    api_key_header: String,
    budget_http_status: StatusCode,
}

#[derive(Serialize)]
struct ModelInfo {
    id: String,
    object: &'static str,
    created: u64,
    owned_by: String,
}

#[derive(Serialize)]
struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelInfo>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, kind: &str, message: String) -> ApiError {
    (
        status,
        Json(json!({
            "error": { "message": message, "type": kind, "code": status.as_u16() }
        })),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pearl_service=info,pearl=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let args = Args::parse();
    let config = GatewayConfig::load(&args.config)
        .map_err(|e| anyhow::anyhow!("config error: {e}"))?;

    let addr = args.addr.unwrap_or_else(|| config.server.bind_addr.clone());
    let api_key = config.server.api_key.clone();
    let api_key_header = config.server.api_key_header.clone();
    let budget_http_status = StatusCode::from_u16(config.server.budget_http_status)
        .unwrap_or(StatusCode::PAYMENT_REQUIRED);

    info!(
        addr = %addr,
        config = %args.config.display(),
        auth = %api_key.as_ref().map(|_| "enabled").unwrap_or("disabled"),
        "starting gateway"
    );

    let pipeline = Arc::new(
        Pipeline::builder(config)
            .build()
            .map_err(|e| anyhow::anyhow!("pipeline build error: {e}"))?,
    );

    // hourly sweep of stale per-user rate-limit entries
    {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                pipeline.detector().rate_limits().sweep(24);
            }
        });
    }

    let state = ServerState {
        pipeline,
        api_key,
        api_key_header,
        budget_http_status,
    };

    let app = Router::new()
        .route("/v1/chat/completions", post(handle_chat))
        .route("/v1/models", get(handle_models))
        .route("/v1/health", get(handle_health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Shared-secret check. Fail-closed: a configured key with no key presented
/// is a 503, a wrong key is a 401.
fn check_auth(state: &ServerState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.api_key else {
        return Ok(());
    };
    let presented = headers
        .get(state.api_key_header.as_str())
        .and_then(|v| v.to_str().ok());
    match presented {
        None => Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "auth_error",
            "API key required".to_string(),
        )),
        Some(key) if key == expected => Ok(()),
        Some(_) => {
            warn!("unauthorized request");
            Err(api_error(
                StatusCode::UNAUTHORIZED,
                "auth_error",
                "Invalid API key".to_string(),
            ))
        }
    }
}

/// Metadata may arrive in the body or mirrored as `x-pearl-*` headers; the
/// body wins where both are present.
fn overlay_header_metadata(request: &mut ChatRequest, headers: &HeaderMap) {
    let header_str =
        |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(String::from);

    let metadata = &mut request.metadata;
    if metadata.agent_id.is_none() {
        metadata.agent_id = header_str("x-pearl-agent-id");
    }
    if metadata.session_id.is_none() {
        metadata.session_id = header_str("x-pearl-session-id");
    }
    if metadata.user_id.is_none() {
        metadata.user_id = header_str("x-pearl-user-id");
    }
    if !metadata.is_admin {
        metadata.is_admin = header_str("x-pearl-admin")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
    }
    if metadata.emergency_bypass.is_none() {
        metadata.emergency_bypass = header_str("x-pearl-bypass");
    }
}

fn map_error(state: &ServerState, err: GatewayError) -> ApiError {
    let message = err.to_string();
    match err {
        GatewayError::InvalidRequest(_) | GatewayError::JsonError(_) => {
            api_error(StatusCode::BAD_REQUEST, "invalid_request_error", message)
        }
        GatewayError::AuthError(_) => api_error(StatusCode::UNAUTHORIZED, "auth_error", message),
        GatewayError::RateLimited { .. } => {
            api_error(StatusCode::TOO_MANY_REQUESTS, "rate_limit_error", message)
        }
        GatewayError::BudgetExhausted(_) => {
            api_error(state.budget_http_status, "budget_exhausted", message)
        }
        GatewayError::PolicyBlock { .. } => {
            api_error(StatusCode::FORBIDDEN, "policy_block", message)
        }
        GatewayError::Cancelled => api_error(
            StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "cancelled",
            message,
        ),
        GatewayError::HttpError(_)
        | GatewayError::ProviderError(_)
        | GatewayError::BackendFatal(_)
        | GatewayError::ResponseFormatError { .. } => {
            api_error(StatusCode::BAD_GATEWAY, "upstream_error", message)
        }
        GatewayError::Internal(_) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            message,
        ),
    }
}

async fn handle_chat(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(mut request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    overlay_header_metadata(&mut request, &headers);

    let stream_requested = request.stream;
    let cancel = CancellationToken::new();

    let stream = state
        .pipeline
        .chat(request, cancel.clone())
        .await
        .map_err(|e| {
            error!(error = %e, "chat request failed");
            map_error(&state, e)
        })?;

    if !stream_requested {
        let completion = collect(stream).await.map_err(|e| {
            error!(error = %e, "chat aggregation failed");
            map_error(&state, e)
        })?;
        return Ok(Json(completion).into_response());
    }

    // Dropping the SSE body (client disconnect) drops the chunk stream and
    // with it the upstream reader; the token mirrors that to the pipeline.
    let guard = cancel.clone().drop_guard();
    let sse_stream = stream
        .map(move |item| {
            let _held = &guard;
            match item {
                Ok(chunk) => vec![Event::default().data(
                    serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string()),
                )],
                Err(e) => {
                    error!(error = %e, "stream chunk failed");
                    vec![Event::default().data(
                        json!({
                            "error": { "message": e.to_string(), "type": "upstream_error" }
                        })
                        .to_string(),
                    )]
                }
            }
        })
        .chain(futures_stream::once(async {
            vec![Event::default().data("[DONE]")]
        }))
        .flat_map(|events| futures_stream::iter(events.into_iter().map(Ok::<_, Infallible>)));

    let response = Sse::new(sse_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    );
    Ok(response.into_response())
}

async fn handle_models(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<Json<ModelsResponse>, ApiError> {
    check_auth(&state, &headers)?;

    let created = now_unix_seconds();
    let mut data = Vec::new();
    for adapter in state.pipeline.adapters_for_accounts() {
        // Model listing is best-effort: an unreachable backend should not
        // take the whole endpoint down.
        match fetch_models(adapter.as_ref()).await {
            Ok(models) => {
                let provider = adapter.provider();
                data.extend(models.into_iter().map(|m| ModelInfo {
                    id: format!("{provider}/{m}"),
                    object: "model",
                    created,
                    owned_by: provider.to_string(),
                }));
            }
            Err(e) => {
                warn!(provider = %adapter.provider(), error = %e, "list models failed; skipping provider");
            }
        }
    }

    Ok(Json(ModelsResponse {
        object: "list",
        data,
    }))
}

async fn handle_health(State(state): State<ServerState>) -> Response {
    // Health bypasses auth. The gateway is serving as long as at least one
    // backend answers its probe.
    let adapters = state.pipeline.adapters_for_accounts();
    let mut any_healthy = adapters.is_empty();
    for adapter in &adapters {
        if pearl::providers::probe_health(adapter.as_ref()).await {
            any_healthy = true;
            break;
        }
    }

    if any_healthy {
        Json(json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
        }))
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "version": env!("CARGO_PKG_VERSION"),
            })),
        )
            .into_response()
    }
}

fn now_unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
