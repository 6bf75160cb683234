//! The request pipeline.
//!
//! One request flows classify → screen → route → augment → dispatch →
//! stream, with usage recording and a transcript append on completion. The
//! pipeline owns the per-request envelope; the components it sequences are
//! leaves and never call back into it.
//!
//! Per request the state machine is:
//!
//! ```text
//! RECEIVED → CLASSIFIED → SCREENED → {BLOCKED | ROUTED} →
//!           AUGMENTED → DISPATCHED → STREAMING → {COMPLETED | CANCELLED | FAILED}
//! ```
//!
//! A block produces a synthetic `content_filter` terminal chunk and never
//! touches a backend. A dispatch failure makes one fallback attempt when the
//! matched rule names a usable fallback account. Cancellation ends the
//! stream without a terminal chunk; no usage is recorded and no transcript
//! is appended.

use chrono::Utc;
use futures::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chat::{
    ChatChunk, ChatChunkStream, ChatCompletion, ChatRequest, CompletionChoice, CompletionMessage,
    FinishReason, Role, StreamEvent, ToolCallDelta, Usage,
};
use crate::classify::Classifier;
use crate::config::GatewayConfig;
use crate::detection::{DetectionAction, InjectionDetector, LlmScreen, SecurityContext};
use crate::dispatch::{ChatTransport, EventStream, HttpChatTransport};
use crate::embedding::{EmbeddingService, HttpEmbeddingService};
use crate::error::GatewayError;
use crate::filter::ResponseFilter;
use crate::memory::{InMemoryMemoryStore, MemoryRetriever, MemoryStore, PromptAugmenter};
use crate::providers::{adapter_for, AdapterParams, BackendAdapter};
use crate::routing::accounts::{Account, AccountRegistry};
use crate::routing::router::AccountRouter;
use crate::routing::rules::RuleEngine;
use crate::transcript::{
    InMemoryTranscriptStore, JsonlTranscriptStore, TranscriptEntry, TranscriptStore,
};
use crate::usage::UsageRecorder;

pub struct Pipeline {
    classifier: Classifier,
    router: AccountRouter,
    detector: InjectionDetector,
    augmenter: Option<PromptAugmenter>,
    transport: Arc<dyn ChatTransport>,
    filter: Arc<ResponseFilter>,
    recorder: Arc<UsageRecorder>,
    transcripts: Arc<dyn TranscriptStore>,
    config: GatewayConfig,
}

pub struct PipelineBuilder {
    config: GatewayConfig,
    memory_store: Option<Arc<dyn MemoryStore>>,
    embeddings: Option<Arc<dyn EmbeddingService>>,
    transport: Option<Arc<dyn ChatTransport>>,
    transcripts: Option<Arc<dyn TranscriptStore>>,
    llm_screen: Option<Arc<dyn LlmScreen>>,
}

impl PipelineBuilder {
    pub fn memory_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.memory_store = Some(store);
        self
    }

    pub fn embeddings(mut self, embeddings: Arc<dyn EmbeddingService>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn transcripts(mut self, transcripts: Arc<dyn TranscriptStore>) -> Self {
        self.transcripts = Some(transcripts);
        self
    }

    pub fn llm_screen(mut self, screen: Arc<dyn LlmScreen>) -> Self {
        self.llm_screen = Some(screen);
        self
    }

    pub fn build(self) -> Result<Pipeline, GatewayError> {
        let config = self.config;
        config.validate()?;

        let registry = Arc::new(AccountRegistry::new(config.accounts.clone()));
        let router = AccountRouter::new(
            RuleEngine::new(config.rules.clone()),
            registry.clone(),
            config.routing,
        );

        let mut detector = InjectionDetector::new(config.detection.clone());
        if let Some(screen) = self.llm_screen {
            detector = detector.with_llm_screen(screen);
        } else if let Some(account_id) = &config.detection.llm_account {
            let account = config
                .accounts
                .iter()
                .find(|a| a.id == *account_id)
                .ok_or_else(|| {
                    GatewayError::InvalidRequest(format!(
                        "detection.llm_account names unknown account '{account_id}'"
                    ))
                })?;
            let model = account.default_model.as_deref().ok_or_else(|| {
                GatewayError::InvalidRequest(format!(
                    "screening account '{account_id}' has no default model"
                ))
            })?;
            let (_, name) = crate::providers::split_model(model)?;
            let adapter = adapter_for(account, name, &AdapterParams::default())?;
            detector = detector
                .with_llm_screen(Arc::new(crate::detection::llm::BackendLlmScreen::new(adapter)));
        }

        let augmenter = if config.memory.enabled {
            let embeddings: Arc<dyn EmbeddingService> = match self.embeddings {
                Some(e) => e,
                None => {
                    let embedding_config = config.embedding.as_ref().ok_or_else(|| {
                        GatewayError::InvalidRequest(
                            "memory enabled without an embedding service".to_string(),
                        )
                    })?;
                    Arc::new(HttpEmbeddingService::new(
                        embedding_config.base_url.clone(),
                        embedding_config.resolved_api_key(),
                        embedding_config.model.clone(),
                        embedding_config.dimensions,
                    ))
                }
            };
            let store = self
                .memory_store
                .unwrap_or_else(|| Arc::new(InMemoryMemoryStore::new()));
            let retriever = MemoryRetriever::new(store, embeddings);
            Some(PromptAugmenter::new(retriever, config.memory.augment.clone()))
        } else {
            None
        };

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpChatTransport::new(config.dispatch)));

        let transcripts: Arc<dyn TranscriptStore> = match self.transcripts {
            Some(t) => t,
            None => match &config.transcript_dir {
                Some(dir) => Arc::new(JsonlTranscriptStore::new(dir.clone())),
                None => Arc::new(InMemoryTranscriptStore::new()),
            },
        };

        let filter = Arc::new(ResponseFilter::new(&config.filter)?);
        let recorder = Arc::new(UsageRecorder::new(config.pricing.clone(), registry));

        Ok(Pipeline {
            classifier: Classifier::new(),
            router,
            detector,
            augmenter,
            transport,
            filter,
            recorder,
            transcripts,
            config,
        })
    }
}

/// Bookkeeping shared by the stream wrapper.
struct StreamContext {
    id: String,
    created: u64,
    model: String,
    account: Account,
    rule: String,
    warning: Option<String>,
    session_id: Option<String>,
    agent_id: Option<String>,
    user_content: String,
}

impl Pipeline {
    pub fn builder(config: GatewayConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            memory_store: None,
            embeddings: None,
            transport: None,
            transcripts: None,
            llm_screen: None,
        }
    }

    pub fn recorder(&self) -> &Arc<UsageRecorder> {
        &self.recorder
    }

    pub fn detector(&self) -> &InjectionDetector {
        &self.detector
    }

    pub fn router(&self) -> &AccountRouter {
        &self.router
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Accounts flattened into adapters for models listing and health.
    pub fn adapters_for_accounts(&self) -> Vec<Arc<dyn BackendAdapter>> {
        self.router
            .registry()
            .snapshot()
            .into_iter()
            .filter(|a| a.enabled)
            .filter_map(|account| {
                let model = account.default_model.as_deref()?;
                let (_, name) = crate::providers::split_model(model).ok()?;
                adapter_for(&account, name, &AdapterParams::default()).ok()
            })
            .collect()
    }

    /// Run one request through the pipeline and return its chunk stream.
    pub async fn chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<ChatChunkStream, GatewayError> {
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "messages must not be empty".to_string(),
            ));
        }

        let id = format!("chatcmpl-{}", Uuid::new_v4());
        let created = Utc::now().timestamp().max(0) as u64;
        let user_content = request.last_user_content().to_string();

        // CLASSIFIED
        let classification = self.classifier.classify(&request.messages);
        debug!(
            "classified: complexity={:?} type={:?} sensitive={} tokens={}",
            classification.complexity,
            classification.task_type,
            classification.sensitive,
            classification.estimated_tokens
        );

        // SCREENED
        let security = security_context(&request);
        let detection = self.detector.analyze(&user_content, &security).await;
        let mut warning = None;
        match detection.action {
            DetectionAction::Block => {
                info!(
                    "request blocked: {} (severity {})",
                    detection.reasoning,
                    detection.severity.as_str()
                );
                return Ok(blocked_stream(&id, created, &request.model, &detection.reasoning));
            }
            DetectionAction::Warn => {
                warn!("request flagged: {}", detection.reasoning);
                warning = Some(format!("screening: {}", detection.reasoning));
            }
            DetectionAction::Log => {
                info!("screening note: {}", detection.reasoning);
            }
            DetectionAction::Allow => {}
        }

        // ROUTED
        let routing = self
            .router
            .route(&classification, &request.metadata, &request.model)?;
        if let Some(route_warning) = &routing.warning {
            warn!(
                "routing warning for account '{}': {route_warning}",
                routing.account.id
            );
            warning.get_or_insert_with(|| format!("routing: {route_warning}"));
        }
        info!(
            "routed to {} via rule '{}' ({})",
            routing.model, routing.rule, routing.reason
        );

        // AUGMENTED
        let mut messages = request.messages.clone();
        if let (Some(augmenter), Some(agent_id)) =
            (&self.augmenter, request.metadata.agent_id.as_deref())
        {
            match augmenter
                .augment(agent_id, &messages, request.metadata.session_id.as_deref())
                .await
            {
                Ok(outcome) => {
                    if !outcome.injected.is_empty() {
                        debug!(
                            "injected {} memories ({} tokens)",
                            outcome.injected.len(),
                            outcome.tokens_used
                        );
                    }
                    messages = outcome.messages;
                }
                Err(e) => warn!("memory augmentation failed, continuing without: {e}"),
            }
        }

        // DISPATCHED
        let params = AdapterParams {
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            timeout: None,
        };
        let adapter = build_adapter(&routing.account, &routing.model, &params)?;
        let events = match self.transport.open(adapter, &messages, &cancel).await {
            Ok(events) => events,
            Err(primary_err) => {
                let Some(fallback) = self.router.fallback_account(&routing) else {
                    return Err(primary_err);
                };
                warn!(
                    "dispatch to '{}' failed ({primary_err}), trying fallback '{}'",
                    routing.account.id, fallback.id
                );
                let fallback_model = fallback_model(&fallback, &routing.model)?;
                let adapter = build_adapter(&fallback, &fallback_model, &params)?;
                match self.transport.open(adapter, &messages, &cancel).await {
                    Ok(events) => {
                        return Ok(self.wrap_stream(
                            events,
                            StreamContext {
                                id,
                                created,
                                model: fallback_model,
                                account: fallback,
                                rule: routing.rule,
                                warning,
                                session_id: request.metadata.session_id.clone(),
                                agent_id: request.metadata.agent_id.clone(),
                                user_content,
                            },
                            cancel,
                        ));
                    }
                    Err(fallback_err) => {
                        warn!("fallback dispatch failed too: {fallback_err}");
                        return Err(primary_err);
                    }
                }
            }
        };

        // STREAMING
        Ok(self.wrap_stream(
            events,
            StreamContext {
                id,
                created,
                model: routing.model,
                account: routing.account,
                rule: routing.rule,
                warning,
                session_id: request.metadata.session_id.clone(),
                agent_id: request.metadata.agent_id.clone(),
                user_content,
            },
            cancel,
        ))
    }

    fn wrap_stream(
        &self,
        events: EventStream,
        ctx: StreamContext,
        cancel: CancellationToken,
    ) -> ChatChunkStream {
        struct WrapState {
            events: Option<EventStream>,
            ctx: StreamContext,
            cancel: CancellationToken,
            filter: Arc<ResponseFilter>,
            recorder: Arc<UsageRecorder>,
            transcripts: Arc<dyn TranscriptStore>,
            usage: Usage,
            saw_usage: bool,
            saw_tool_calls: bool,
            collected: String,
            finished: bool,
        }

        let state = WrapState {
            events: Some(events),
            ctx,
            cancel,
            filter: self.filter.clone(),
            recorder: self.recorder.clone(),
            transcripts: self.transcripts.clone(),
            usage: Usage::default(),
            saw_usage: false,
            saw_tool_calls: false,
            collected: String::new(),
            finished: false,
        };

        Box::pin(futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.finished {
                    return None;
                }
                let Some(events) = state.events.as_mut() else {
                    return None;
                };

                let next = tokio::select! {
                    biased;
                    _ = state.cancel.cancelled() => {
                        // release the upstream reader; no terminal chunk, no
                        // usage, no transcript
                        debug!("stream cancelled for {}", state.ctx.id);
                        state.events = None;
                        return None;
                    }
                    next = events.next() => next,
                };

                match next {
                    Some(Ok(StreamEvent::Text(text))) => {
                        let filtered = state.filter.apply(&text);
                        if filtered.is_empty() {
                            continue;
                        }
                        state.collected.push_str(&filtered);
                        let chunk = ChatChunk::text(
                            &state.ctx.id,
                            state.ctx.created,
                            &state.ctx.model,
                            filtered,
                        );
                        return Some((Ok(chunk), state));
                    }
                    Some(Ok(StreamEvent::ToolUseStart { index, id, name })) => {
                        state.saw_tool_calls = true;
                        let chunk = ChatChunk::tool_calls(
                            &state.ctx.id,
                            state.ctx.created,
                            &state.ctx.model,
                            vec![ToolCallDelta {
                                index,
                                id: Some(id),
                                call_type: "function".to_string(),
                                function: crate::chat::FunctionDelta {
                                    name: Some(name),
                                    arguments: None,
                                },
                            }],
                        );
                        return Some((Ok(chunk), state));
                    }
                    Some(Ok(StreamEvent::ToolUseInputDelta {
                        index,
                        partial_json,
                    })) => {
                        let chunk = ChatChunk::tool_calls(
                            &state.ctx.id,
                            state.ctx.created,
                            &state.ctx.model,
                            vec![ToolCallDelta {
                                index,
                                id: None,
                                call_type: "function".to_string(),
                                function: crate::chat::FunctionDelta {
                                    name: None,
                                    arguments: Some(partial_json),
                                },
                            }],
                        );
                        return Some((Ok(chunk), state));
                    }
                    Some(Ok(StreamEvent::Usage(usage))) => {
                        // anthropic reports input and output in separate
                        // frames; merge field-wise
                        state.saw_usage = true;
                        state.usage.input_tokens = state.usage.input_tokens.max(usage.input_tokens);
                        state.usage.output_tokens =
                            state.usage.output_tokens.max(usage.output_tokens);
                        continue;
                    }
                    Some(Ok(StreamEvent::Done { stop_reason })) => {
                        state.finished = true;
                        state.events = None;

                        let finish_reason = if state.saw_tool_calls {
                            FinishReason::ToolCalls
                        } else {
                            FinishReason::from_stop_reason(&stop_reason)
                        };
                        let usage = state.saw_usage.then(|| state.usage.clone());

                        // COMPLETED: exactly one usage record per delivered
                        // terminal chunk
                        if let Some(usage) = &usage {
                            let mut metadata = HashMap::new();
                            metadata.insert("rule".to_string(), state.ctx.rule.clone());
                            if let Some(session) = &state.ctx.session_id {
                                metadata.insert("session_id".to_string(), session.clone());
                            }
                            let (_, model_name) =
                                crate::providers::split_model(&state.ctx.model)
                                    .unwrap_or((state.ctx.account.provider, state.ctx.model.as_str()));
                            state.recorder.record(
                                &state.ctx.account.id,
                                state.ctx.account.provider,
                                model_name,
                                usage,
                                state.ctx.agent_id.as_deref(),
                                metadata,
                            );
                        }

                        if let Some(session) = state.ctx.session_id.clone() {
                            let entry = TranscriptEntry {
                                timestamp: Utc::now(),
                                model: state.ctx.model.clone(),
                                rule: state.ctx.rule.clone(),
                                account_id: state.ctx.account.id.clone(),
                                user_content: state.ctx.user_content.clone(),
                                assistant_content: state.collected.clone(),
                                usage: usage.clone(),
                                warning: state.ctx.warning.clone(),
                            };
                            let transcripts = state.transcripts.clone();
                            tokio::spawn(async move {
                                if let Err(e) = transcripts.append(&session, entry).await {
                                    warn!("transcript append failed: {e}");
                                }
                            });
                        }

                        let chunk = ChatChunk::terminal(
                            &state.ctx.id,
                            state.ctx.created,
                            &state.ctx.model,
                            finish_reason,
                            usage,
                        );
                        return Some((Ok(chunk), state));
                    }
                    Some(Err(e)) => {
                        // FAILED mid-stream: surface and stop; no record
                        state.finished = true;
                        state.events = None;
                        return Some((Err(e), state));
                    }
                    None => {
                        // upstream ended without a terminal frame
                        state.events = None;
                        return None;
                    }
                }
            }
        }))
    }
}

fn security_context(request: &ChatRequest) -> SecurityContext {
    let risk_score = request
        .metadata
        .extra
        .get("riskScore")
        .or_else(|| request.metadata.extra.get("risk_score"))
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0) as f32;

    // prior user messages of this conversation, excluding the one under
    // analysis
    let mut history: Vec<String> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .collect();
    history.pop();

    SecurityContext {
        user_id: request.metadata.user_id.clone(),
        is_admin: request.metadata.is_admin,
        risk_score,
        session_history: history,
        emergency_bypass: request.metadata.emergency_bypass.clone(),
    }
}

fn blocked_stream(id: &str, created: u64, model: &str, reason: &str) -> ChatChunkStream {
    let mut chunk = ChatChunk::terminal(
        id,
        created,
        if model.is_empty() { "pearl" } else { model },
        FinishReason::ContentFilter,
        None,
    );
    chunk.choices[0].delta.content = Some(format!("Request blocked by security policy: {reason}"));
    Box::pin(futures::stream::iter(vec![Ok(chunk)]))
}

/// The adapter serves the account's provider; a model qualified for a
/// different provider falls back to the account's own default model.
fn build_adapter(
    account: &Account,
    model: &str,
    params: &AdapterParams,
) -> Result<Arc<dyn BackendAdapter>, GatewayError> {
    let (provider, name) = crate::providers::split_model(model)?;
    if provider == account.provider {
        return adapter_for(account, name, params);
    }
    let own_model = account.default_model.as_deref().ok_or_else(|| {
        GatewayError::InvalidRequest(format!(
            "model '{model}' does not match provider '{}' of account '{}'",
            account.provider, account.id
        ))
    })?;
    let (_, own_name) = crate::providers::split_model(own_model)?;
    adapter_for(account, own_name, params)
}

fn fallback_model(fallback: &Account, routed_model: &str) -> Result<String, GatewayError> {
    match crate::providers::split_model(routed_model) {
        Ok((provider, _)) if provider == fallback.provider => Ok(routed_model.to_string()),
        _ => fallback.default_model.clone().ok_or_else(|| {
            GatewayError::InvalidRequest(format!(
                "fallback account '{}' has no default model",
                fallback.id
            ))
        }),
    }
}

/// Drain a chunk stream into one buffered completion.
pub async fn collect(mut stream: ChatChunkStream) -> Result<ChatCompletion, GatewayError> {
    let mut id = String::new();
    let mut created = 0u64;
    let mut model = String::new();
    let mut content = String::new();
    let mut finish_reason = None;
    let mut usage = None;

    while let Some(item) = stream.next().await {
        let chunk = item?;
        id = chunk.id.clone();
        created = chunk.created;
        model = chunk.model.clone();
        if let Some(text) = chunk.content() {
            content.push_str(text);
        }
        if let Some(reason) = chunk.finish_reason() {
            finish_reason = Some(reason);
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
    }

    Ok(ChatCompletion {
        id,
        object: "chat.completion".to_string(),
        created,
        model,
        choices: vec![CompletionChoice {
            index: 0,
            message: CompletionMessage {
                role: Role::Assistant,
                content,
            },
            finish_reason,
        }],
        usage,
    })
}
