//! C12 — chat orchestrator. Ties together C1/C3/C4 context, C5 commands, optionally C10 RAG,
//! C8/C9 provider selection, C7 retry, the persistence collaborator, and idempotency caching.

use crate::airborne::commands::{self, ParsedCommand};
use crate::airborne::errors::GatewayError;
use crate::airborne::image_gen::{GeneratedImage, ImageGenRequest, ImageGenerator};
use crate::airborne::persistence::{PersistenceCollaborator, TurnDebug};
use crate::airborne::provider::{
    ChunkStream, Citation, CodeExecutionRecord, FeatureToggles, GenerateParams, HistoryMessage,
    ProviderAdapter, ProviderRequestConfig, Role, StreamChunk, StructuredMetadata, TokenUsage,
    ToolCallRequest,
};
use crate::airborne::rag::embedder::Embedder;
use crate::airborne::rag::orchestrator::{self as rag_orchestrator, RetrieveParams};
use crate::airborne::rag::vector_store::VectorStore;
use crate::airborne::rate_limit::{CounterBackend, RateLimiter};
use crate::airborne::retry::{is_retryable, run_with_retry, CancellationFlag};
use crate::airborne::tenant::TenantConfig;
use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

const MAX_USER_INPUT_BYTES: usize = 100 * 1024;
const MAX_INSTRUCTIONS_BYTES: usize = 50 * 1024;
const MAX_HISTORY_LEN: usize = 100;
const MAX_METADATA_ENTRIES: usize = 50;
const HISTORY_CHAR_BUDGET: usize = 30_000;
const ASSISTANT_TRUNCATE_CHARS: usize = 500;
const ASSISTANT_FULL_COUNT: usize = 3;
const ASSISTANT_MAX_COUNT: usize = 6;
const IDEMPOTENCY_PROCESSING_TTL_SECS: i64 = 300;
const IDEMPOTENCY_RESPONSE_TTL_SECS: i64 = 86_400;
const PROCESSING_SENTINEL: &str = "__processing__";

/// One turn of prior conversation, richer than the provider-facing `HistoryMessage`: carries the
/// response id so `previous-response-id` can be recovered during compression.
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
    pub response_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub tenant_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub user_input: String,
    pub instructions: Option<String>,
    pub history: Vec<HistoryTurn>,
    pub metadata: HashMap<String, String>,
    pub preferred_provider: Option<String>,
    pub base_url_override: Option<String>,
    pub model_override: Option<String>,
    pub enable_file_search: bool,
    pub store_id: Option<String>,
    pub request_id: Option<String>,
    pub image_triggers: Vec<String>,
    /// The authenticated client's own `tokens_per_minute` limit (§3 `KeyLimits`), forwarded by
    /// the caller so `RecordTokens` can weigh it against the tenant's override.
    pub client_tpm: u32,
    /// Set by the caller to abandon this request; observed by C7's retry loop between attempts
    /// and backoff sleeps (§4.7/§5 "when the outer context is cancelled").
    pub cancelled: CancellationFlag,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub citations: Vec<Citation>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub code_executions: Vec<CodeExecutionRecord>,
    pub structured_metadata: Option<StructuredMetadata>,
    pub images: Vec<GeneratedImage>,
    pub response_id: Option<String>,
}

/// The lightweight subset of a response serialized into the idempotency cache.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CachedGenerateResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub response_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum GenerateOutcome {
    Fresh(GenerateResponse),
    Cached(CachedGenerateResponse),
}

/// Validate message/history/metadata sizes (§4.12 step 2).
pub fn validate_sizes(req: &GenerateRequest) -> Result<(), GatewayError> {
    if req.user_input.len() > MAX_USER_INPUT_BYTES {
        return Err(GatewayError::invalid_argument("user input exceeds 100 KiB"));
    }
    if let Some(instructions) = &req.instructions {
        if instructions.len() > MAX_INSTRUCTIONS_BYTES {
            return Err(GatewayError::invalid_argument("instructions exceed 50 KiB"));
        }
    }
    if req.history.len() > MAX_HISTORY_LEN {
        return Err(GatewayError::invalid_argument("history exceeds 100 messages"));
    }
    if req.metadata.len() > MAX_METADATA_ENTRIES {
        return Err(GatewayError::invalid_argument("metadata exceeds 50 entries"));
    }
    Ok(())
}

fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars).collect();
    format!("{}...", truncated)
}

/// History compression (§4.12): newest-first scan, full text for the three most recent
/// assistant turns, 500-char truncation for the next three, drop anything older; user messages
/// accumulate up to a 30 000-char budget and stop being added once it's exceeded. Returns the
/// compressed history in chronological order plus the latest non-empty assistant response id.
pub fn compress_history(history: &[HistoryTurn]) -> (Vec<HistoryMessage>, Option<String>) {
    let mut latest_response_id: Option<String> = None;
    let mut assistant_count = 0usize;
    let mut user_chars = 0usize;
    let mut user_budget_exhausted = false;
    let mut included: Vec<(usize, HistoryMessage)> = Vec::new();

    for (idx, turn) in history.iter().enumerate().rev() {
        match &turn.role {
            Role::Assistant => {
                assistant_count += 1;
                if latest_response_id.is_none() {
                    if let Some(rid) = &turn.response_id {
                        if !rid.is_empty() {
                            latest_response_id = Some(rid.clone());
                        }
                    }
                }
                if assistant_count > ASSISTANT_MAX_COUNT {
                    continue;
                }
                let content = if assistant_count <= ASSISTANT_FULL_COUNT {
                    turn.content.clone()
                } else {
                    truncate_with_ellipsis(&turn.content, ASSISTANT_TRUNCATE_CHARS)
                };
                included.push((idx, HistoryMessage { role: Role::Assistant, content }));
            }
            Role::User => {
                if user_budget_exhausted {
                    continue;
                }
                if user_chars + turn.content.len() > HISTORY_CHAR_BUDGET {
                    user_budget_exhausted = true;
                    continue;
                }
                user_chars += turn.content.len();
                included.push((idx, HistoryMessage { role: Role::User, content: turn.content.clone() }));
            }
            other => {
                included.push((idx, HistoryMessage { role: other.clone(), content: turn.content.clone() }));
            }
        }
    }

    included.sort_by_key(|(idx, _)| *idx);
    (included.into_iter().map(|(_, m)| m).collect(), latest_response_id)
}

/// Order failover candidates: the caller's preference first if it's in the failover list and
/// capability-compatible, then the remaining failover entries in configured order, each filtered
/// to configured + capable adapters (§4.12 step 7).
fn ordered_candidates<'a>(
    providers: &'a HashMap<String, Arc<dyn ProviderAdapter>>,
    failover: &[String],
    preferred: Option<&str>,
    need_file_search: bool,
) -> Vec<&'a Arc<dyn ProviderAdapter>> {
    let capable = |adapter: &Arc<dyn ProviderAdapter>| !need_file_search || adapter.capabilities().file_search;

    let mut order: Vec<&str> = Vec::new();
    if let Some(preferred) = preferred {
        if failover.iter().any(|f| f == preferred) {
            order.push(preferred);
        }
    }
    for candidate in failover {
        if !order.contains(&candidate.as_str()) {
            order.push(candidate);
        }
    }

    order
        .into_iter()
        .filter_map(|name| providers.get(name))
        .filter(|adapter| capable(adapter))
        .collect()
}

/// Select a single provider: the first entry `ordered_candidates` would try.
pub fn select_provider<'a>(
    providers: &'a HashMap<String, Arc<dyn ProviderAdapter>>,
    failover: &[String],
    preferred: Option<&str>,
    need_file_search: bool,
) -> Option<&'a Arc<dyn ProviderAdapter>> {
    ordered_candidates(providers, failover, preferred, need_file_search)
        .into_iter()
        .next()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    Proceed,
    Conflict,
    Cached(String),
}

/// Atomic set-if-absent-with-TTL primitive backing idempotency (§4.12), mirroring the
/// request/token counter backend split used by C1.
#[async_trait]
pub trait IdempotencyBackend: Send + Sync {
    async fn set_if_absent(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<bool, String>;
    async fn get(&self, key: &str) -> Result<Option<String>, String>;
    async fn set(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), String>;
    async fn remove(&self, key: &str) -> Result<(), String>;
}

pub struct RedisIdempotencyBackend {
    manager: redis::aio::ConnectionManager,
}

impl RedisIdempotencyBackend {
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(RedisIdempotencyBackend { manager })
    }
}

#[async_trait]
impl IdempotencyBackend for RedisIdempotencyBackend {
    async fn set_if_absent(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<bool, String> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map(|v| v.is_some())
            .map_err(|e| e.to_string())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let mut conn = self.manager.clone();
        redis::cmd("GET").arg(key).query_async(&mut conn).await.map_err(|e| e.to_string())
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), String> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| e.to_string())
    }

    async fn remove(&self, key: &str) -> Result<(), String> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await.map_err(|e| e.to_string())
    }
}

/// In-memory idempotency backend for tests; TTLs are honored via wall-clock expiry checks.
#[derive(Default)]
pub struct InMemoryIdempotencyBackend {
    entries: std::sync::Mutex<HashMap<String, (String, Instant, i64)>>,
}

impl InMemoryIdempotencyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn expired(entry: &(String, Instant, i64)) -> bool {
        entry.1.elapsed().as_secs() as i64 >= entry.2
    }
}

#[async_trait]
impl IdempotencyBackend for InMemoryIdempotencyBackend {
    async fn set_if_absent(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<bool, String> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(key) {
            if !Self::expired(existing) {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (value.to_string(), Instant::now(), ttl_seconds));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).filter(|e| !Self::expired(e)).map(|e| e.0.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: i64) -> Result<(), String> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), Instant::now(), ttl_seconds));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), String> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

pub fn idempotency_key(tenant_id: &str, thread_id: &str, request_id: &str) -> String {
    format!("chat:idem:{}:{}:{}", tenant_id, thread_id, request_id)
}

/// An unreachable idempotency store must never block user traffic: a failed `set_if_absent` or
/// `get` logs a warning and falls through to `Proceed` rather than surfacing an error.
async fn acquire_idempotency(
    backend: &dyn IdempotencyBackend,
    key: &str,
) -> Result<IdempotencyOutcome, GatewayError> {
    let acquired = match backend
        .set_if_absent(key, PROCESSING_SENTINEL, IDEMPOTENCY_PROCESSING_TTL_SECS)
        .await
    {
        Ok(acquired) => acquired,
        Err(e) => {
            log::warn!("idempotency store unreachable, proceeding without it: {}", e);
            return Ok(IdempotencyOutcome::Proceed);
        }
    };
    if acquired {
        return Ok(IdempotencyOutcome::Proceed);
    }
    match backend.get(key).await {
        Ok(Some(value)) if value == PROCESSING_SENTINEL => Ok(IdempotencyOutcome::Conflict),
        Ok(Some(value)) => Ok(IdempotencyOutcome::Cached(value)),
        Ok(None) => Ok(IdempotencyOutcome::Conflict),
        Err(e) => {
            log::warn!("idempotency store unreachable, proceeding without it: {}", e);
            Ok(IdempotencyOutcome::Proceed)
        }
    }
}

pub struct RagCollaborators {
    pub embedder: Arc<dyn Embedder>,
    pub store: Arc<dyn VectorStore>,
}

/// The chat orchestrator. Generic over the rate limiter's counter backend, matching C1's own
/// generic shape; persistence, idempotency, and RAG collaborators are trait objects since they
/// vary independently of the counter storage.
pub struct ChatOrchestrator<B: CounterBackend> {
    pub providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    pub rate_limiter: Arc<RateLimiter<B>>,
    pub persistence: Arc<dyn PersistenceCollaborator>,
    pub idempotency: Arc<dyn IdempotencyBackend>,
    pub image_generators: HashMap<String, Arc<dyn ImageGenerator>>,
    pub rag: Option<RagCollaborators>,
}

impl<B: CounterBackend + 'static> ChatOrchestrator<B> {
    /// Enforces a tenant-wide request cap (§3 `RateLimitOverrides`), aggregated across every
    /// client belonging to the tenant rather than per-client — the per-client rpm/rpd cap is
    /// already applied upstream in C4 before the tenant is even resolved, so this is a distinct
    /// counter keyed by tenant id, not a second check of the same budget.
    async fn check_tenant_rate_limit(&self, tenant: &TenantConfig) -> Result<(), GatewayError> {
        if tenant.rate_limits.rpm == 0 && tenant.rate_limits.rpd == 0 {
            return Ok(());
        }
        let tenant_key = format!("tenant:{}", tenant.id);
        let outcome = self
            .rate_limiter
            .allow(&tenant_key, 0, 0, tenant.rate_limits.rpm, tenant.rate_limits.rpd)
            .await;
        if outcome == crate::airborne::rate_limit::LimitOutcome::Denied {
            return Err(GatewayError::resource_exhausted(format!(
                "tenant '{}' rate limit exceeded",
                tenant.id
            )));
        }
        Ok(())
    }

    fn parse_command(&self, req: &GenerateRequest) -> ParsedCommand {
        commands::parse(&req.user_input, &req.image_triggers)
    }

    async fn run_image_generation(
        &self,
        req: &GenerateRequest,
        prompt: &str,
        tenant: &TenantConfig,
    ) -> Result<GenerateResponse, GatewayError> {
        let image_gen = &tenant.image_gen;
        let provider = image_gen.provider.as_str();
        let credential = tenant.providers.get(provider).ok_or_else(|| {
            GatewayError::failed_precondition(format!("no credential configured for image provider '{}'", provider))
        })?;
        let generator = self
            .image_generators
            .get(provider)
            .ok_or_else(|| GatewayError::failed_precondition(format!("no image generator configured for '{}'", provider)))?;
        let model = if image_gen.model.is_empty() { None } else { Some(image_gen.model.clone()) };
        let images = generator
            .generate(&ImageGenRequest {
                prompt: prompt.to_string(),
                provider: provider.to_string(),
                model,
                max_images: image_gen.max_images,
                api_key: credential.api_key.clone(),
            })
            .await
            .map_err(GatewayError::internal)?;
        let _ = req;
        Ok(GenerateResponse {
            text: String::new(),
            provider: provider.to_string(),
            model: String::new(),
            usage: TokenUsage::default(),
            citations: Vec::new(),
            tool_calls: Vec::new(),
            code_executions: Vec::new(),
            structured_metadata: None,
            images,
            response_id: None,
        })
    }

    async fn maybe_retrieve_rag_context(
        &self,
        req: &GenerateRequest,
    ) -> Result<Option<Vec<rag_orchestrator::RetrievedChunk>>, GatewayError> {
        if !req.enable_file_search {
            return Ok(None);
        }
        let Some(store_id) = &req.store_id else { return Ok(None) };
        let Some(rag) = &self.rag else { return Ok(None) };
        let chunks = rag_orchestrator::retrieve(
            RetrieveParams {
                tenant_id: req.tenant_id.clone(),
                store_id: store_id.clone(),
                thread_id: Some(req.thread_id.clone()),
                query: req.user_input.clone(),
                top_k: 5,
            },
            rag.embedder.as_ref(),
            rag.store.as_ref(),
        )
        .await?;
        Ok(Some(chunks))
    }

    fn inject_rag_context(instructions: Option<String>, chunks: &[rag_orchestrator::RetrievedChunk]) -> Option<String> {
        if chunks.is_empty() {
            return instructions;
        }
        let mut context = String::from("Relevant retrieved context:\n");
        for (i, chunk) in chunks.iter().enumerate() {
            context.push_str(&format!("[{}] ({}#{}) {}\n", i + 1, chunk.filename, chunk.chunk_index, chunk.text));
        }
        match instructions {
            Some(existing) => Some(format!("{}\n\n{}", existing, context)),
            None => Some(context),
        }
    }

    /// Unary `Generate` (§4.12).
    pub async fn generate(
        &self,
        req: GenerateRequest,
        tenant: &TenantConfig,
    ) -> Result<GenerateOutcome, GatewayError> {
        validate_sizes(&req)?;
        let request_id = crate::airborne::context::validate_or_generate_request_id(
            req.request_id.as_deref(),
        )?;

        let idem_key = idempotency_key(&req.tenant_id, &req.thread_id, &request_id);
        match acquire_idempotency(self.idempotency.as_ref(), &idem_key).await? {
            IdempotencyOutcome::Conflict => return Err(GatewayError::conflict("request already in progress")),
            IdempotencyOutcome::Cached(serialized) => match serde_json::from_str(&serialized) {
                Ok(cached) => return Ok(GenerateOutcome::Cached(cached)),
                Err(e) => {
                    log::warn!("cached idempotent response failed to parse, treating as cache miss: {}", e);
                }
            },
            IdempotencyOutcome::Proceed => {}
        }

        let result = self.generate_inner(req, tenant).await;

        match &result {
            Ok(response) => {
                let cached = CachedGenerateResponse {
                    text: response.text.clone(),
                    provider: response.provider.clone(),
                    model: response.model.clone(),
                    response_id: response.response_id.clone(),
                };
                if let Ok(serialized) = serde_json::to_string(&cached) {
                    let _ = self
                        .idempotency
                        .set(&idem_key, &serialized, IDEMPOTENCY_RESPONSE_TTL_SECS)
                        .await;
                }
            }
            Err(_) => {
                let _ = self.idempotency.remove(&idem_key).await;
            }
        }

        result.map(GenerateOutcome::Fresh)
    }

    async fn generate_inner(
        &self,
        req: GenerateRequest,
        tenant: &TenantConfig,
    ) -> Result<GenerateResponse, GatewayError> {
        if let Some(base_url) = &req.base_url_override {
            crate::airborne::url_validator::validate(base_url).map_err(|e| GatewayError::invalid_argument(e.to_string()))?;
        }

        self.check_tenant_rate_limit(tenant).await?;

        let parsed = self.parse_command(&req);
        if let Some(prompt) = &parsed.image_prompt {
            if !tenant.image_gen.enabled {
                return Err(GatewayError::failed_precondition("image generation is not enabled for this tenant"));
            }
            return self.run_image_generation(&req, prompt, tenant).await;
        }
        if parsed.skip_ai {
            return Ok(GenerateResponse {
                text: String::new(),
                provider: String::new(),
                model: String::new(),
                usage: TokenUsage::default(),
                citations: Vec::new(),
                tool_calls: Vec::new(),
                code_executions: Vec::new(),
                structured_metadata: None,
                images: Vec::new(),
                response_id: None,
            });
        }

        let retrieved = self.maybe_retrieve_rag_context(&req).await?;
        let instructions = match &retrieved {
            Some(chunks) => Self::inject_rag_context(req.instructions.clone(), chunks),
            None => req.instructions.clone(),
        };
        let citations: Vec<Citation> = retrieved
            .as_ref()
            .map(|chunks| {
                chunks
                    .iter()
                    .map(|c| Citation {
                        url: None,
                        file_id: Some(c.filename.clone()),
                        start_index: None,
                        end_index: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (history, previous_response_id) = compress_history(&req.history);
        let candidates: Vec<Arc<dyn ProviderAdapter>> = ordered_candidates(
            &self.providers,
            &tenant.failover,
            req.preferred_provider.as_deref(),
            req.enable_file_search,
        )
        .into_iter()
        .cloned()
        .collect();
        if candidates.is_empty() {
            return Err(GatewayError::failed_precondition("no configured provider satisfies the request"));
        }

        // Try each failover candidate in order; a candidate that exhausts its own retry budget
        // (C7) hands off to the next one rather than failing the whole request (§4.12 step 7).
        let mut last_err: Option<String> = None;
        let mut succeeded: Option<(Arc<dyn ProviderAdapter>, crate::airborne::provider::GenerateResult, u64)> = None;

        for adapter in candidates {
            let credential = match tenant.providers.get(adapter.name()) {
                Some(c) => c,
                None => {
                    last_err = Some(format!("no credential configured for provider '{}'", adapter.name()));
                    continue;
                }
            };
            let use_native_continuity = adapter.capabilities().native_continuity && previous_response_id.is_some();
            let params = GenerateParams {
                system_instructions: instructions.clone(),
                user_input: parsed.processed_text.clone(),
                history: if use_native_continuity { Vec::new() } else { history.clone() },
                inline_files: Vec::new(),
                tools: Vec::new(),
                config: ProviderRequestConfig {
                    api_key: credential.api_key.clone(),
                    base_url_override: req.base_url_override.clone().or_else(|| credential.base_url_override.clone()),
                    model_override: req.model_override.clone().or_else(|| Some(credential.default_model.clone())),
                    temperature: None,
                    top_p: None,
                    max_output_tokens: None,
                    extra_options: credential.extra_options.clone(),
                },
                features: FeatureToggles {
                    enable_file_search: if req.enable_file_search { req.store_id.clone() } else { None },
                    enable_web_search: false,
                    enable_code_execution: false,
                    enable_structured_output: false,
                },
                previous_response_id: if use_native_continuity { previous_response_id.clone() } else { None },
                request_id: req.request_id.clone().unwrap_or_default(),
                client_id: req.user_id.clone(),
                cancelled: req.cancelled.clone(),
            };

            let start = Instant::now();
            let generate_result = run_with_retry(
                |_attempt| {
                    let adapter = adapter.clone();
                    let params = params.clone();
                    async move { adapter.generate(params).await }
                },
                |msg| is_retryable(msg, None),
                &req.cancelled,
            )
            .await;

            match generate_result {
                Ok(r) => {
                    succeeded = Some((adapter, r, start.elapsed().as_millis() as u64));
                    break;
                }
                Err(e) => {
                    let cancelled = req.cancelled.is_cancelled();
                    log::warn!(
                        "provider '{}' exhausted its retry budget{}: {}",
                        adapter.name(),
                        if cancelled { "; request was cancelled" } else { ", falling over to the next candidate" },
                        e
                    );
                    last_err = Some(e);
                    if cancelled {
                        break;
                    }
                }
            }
        }

        let (adapter, result, processing_ms) = match succeeded {
            Some(v) => v,
            None => {
                let msg = last_err.unwrap_or_else(|| "no provider candidate succeeded".to_string());
                return Err(if req.cancelled.is_cancelled() {
                    GatewayError::deadline_exceeded(msg)
                } else {
                    GatewayError::unavailable(msg)
                });
            }
        };
        let provider_name = adapter.name().to_string();

        self.rate_limiter
            .record_tokens(&req.user_id, result.usage.total_tokens as i64, tenant.rate_limits.tpm, req.client_tpm)
            .await;

        let persistence = self.persistence.clone();
        let thread_id = req.thread_id.clone();
        let tenant_id = req.tenant_id.clone();
        let user_id = req.user_id.clone();
        let user_content = parsed.processed_text.clone();
        let assistant_content = result.text.clone();
        let model = result.model.clone();
        let response_id = result.response_id.clone();
        let input_tokens = result.usage.input_tokens;
        let output_tokens = result.usage.output_tokens;
        let cost_usd = 0.0;
        let debug = TurnDebug {
            system_prompt: None,
            raw_request: result.raw_request.clone(),
            raw_response: result.raw_response.clone(),
        };
        tokio::spawn(async move {
            let _ = persistence
                .persist_conversation_turn_with_debug(
                    &thread_id,
                    &tenant_id,
                    &user_id,
                    &user_content,
                    &assistant_content,
                    &provider_name,
                    &model,
                    response_id.as_deref(),
                    input_tokens,
                    output_tokens,
                    processing_ms,
                    cost_usd,
                    debug,
                )
                .await;
        });

        Ok(GenerateResponse {
            text: result.text,
            provider: adapter.name().to_string(),
            model: result.model,
            usage: result.usage,
            citations: if citations.is_empty() { result.citations } else { citations },
            tool_calls: result.tool_calls,
            code_executions: result.code_executions,
            structured_metadata: result.structured_metadata,
            images: Vec::new(),
            response_id: result.response_id,
        })
    }

    /// Streaming `GenerateStream` (§4.12). Prep identical to `generate`; persistence and token
    /// recording happen on the stream's completion event rather than up front.
    pub async fn generate_stream(
        &self,
        req: GenerateRequest,
        tenant: &TenantConfig,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, String>> + Send>>, GatewayError> {
        validate_sizes(&req)?;

        if let Some(base_url) = &req.base_url_override {
            crate::airborne::url_validator::validate(base_url).map_err(|e| GatewayError::invalid_argument(e.to_string()))?;
        }

        self.check_tenant_rate_limit(tenant).await?;

        let parsed = self.parse_command(&req);
        if parsed.skip_ai || parsed.image_prompt.is_some() {
            // Image-only and no-op turns are not streamed; callers should route them through
            // `generate` instead (§4.11 applies to the unary path only for images here).
            return Ok(Box::pin(stream::empty()));
        }

        let retrieved = self.maybe_retrieve_rag_context(&req).await?;
        let instructions = match &retrieved {
            Some(chunks) => Self::inject_rag_context(req.instructions.clone(), chunks),
            None => req.instructions.clone(),
        };

        let (history, previous_response_id) = compress_history(&req.history);
        let candidates: Vec<Arc<dyn ProviderAdapter>> = ordered_candidates(
            &self.providers,
            &tenant.failover,
            req.preferred_provider.as_deref(),
            req.enable_file_search,
        )
        .into_iter()
        .cloned()
        .filter(|a| a.capabilities().streaming)
        .collect();
        if candidates.is_empty() {
            return Err(GatewayError::failed_precondition("no configured provider satisfies the request"));
        }

        // Failover happens at stream establishment (§4.12 step 7): once a candidate's stream is
        // open its chunks are surfaced as-is, retry/fallback only covers the opening call.
        let mut last_err: Option<String> = None;
        let mut opened: Option<(Arc<dyn ProviderAdapter>, ChunkStream)> = None;

        for adapter in candidates {
            let credential = match tenant.providers.get(adapter.name()) {
                Some(c) => c,
                None => {
                    last_err = Some(format!("no credential configured for provider '{}'", adapter.name()));
                    continue;
                }
            };
            let use_native_continuity = adapter.capabilities().native_continuity && previous_response_id.is_some();
            let params = GenerateParams {
                system_instructions: instructions.clone(),
                user_input: parsed.processed_text.clone(),
                history: if use_native_continuity { Vec::new() } else { history.clone() },
                inline_files: Vec::new(),
                tools: Vec::new(),
                config: ProviderRequestConfig {
                    api_key: credential.api_key.clone(),
                    base_url_override: req.base_url_override.clone().or_else(|| credential.base_url_override.clone()),
                    model_override: req.model_override.clone().or_else(|| Some(credential.default_model.clone())),
                    temperature: None,
                    top_p: None,
                    max_output_tokens: None,
                    extra_options: credential.extra_options.clone(),
                },
                features: FeatureToggles {
                    enable_file_search: if req.enable_file_search { req.store_id.clone() } else { None },
                    ..FeatureToggles::default()
                },
                previous_response_id: if use_native_continuity { previous_response_id.clone() } else { None },
                request_id: req.request_id.clone().unwrap_or_default(),
                client_id: req.user_id.clone(),
                cancelled: req.cancelled.clone(),
            };

            let open_result = run_with_retry(
                |_attempt| {
                    let adapter = adapter.clone();
                    let params = params.clone();
                    async move { adapter.generate_stream(params).await }
                },
                |msg| is_retryable(msg, None),
                &req.cancelled,
            )
            .await;

            match open_result {
                Ok(stream) => {
                    opened = Some((adapter, stream));
                    break;
                }
                Err(e) => {
                    let cancelled = req.cancelled.is_cancelled();
                    log::warn!(
                        "provider '{}' exhausted its retry budget opening a stream{}: {}",
                        adapter.name(),
                        if cancelled { "; request was cancelled" } else { ", falling over to the next candidate" },
                        e
                    );
                    last_err = Some(e);
                    if cancelled {
                        break;
                    }
                }
            }
        }

        let (adapter, inner) = match opened {
            Some(v) => v,
            None => {
                let msg = last_err.unwrap_or_else(|| "no provider candidate succeeded".to_string());
                return Err(if req.cancelled.is_cancelled() {
                    GatewayError::deadline_exceeded(msg)
                } else {
                    GatewayError::unavailable(msg)
                });
            }
        };

        let persistence = self.persistence.clone();
        let rate_limiter = self.rate_limiter.clone();
        let thread_id = req.thread_id.clone();
        let tenant_id = req.tenant_id.clone();
        let user_id = req.user_id.clone();
        let user_content = req.user_input.clone();
        let provider_name = adapter.name().to_string();
        let tenant_tpm = tenant.rate_limits.tpm;
        let client_tpm = req.client_tpm;
        let start = Instant::now();

        let mapped = inner.then(move |item| {
            let persistence = persistence.clone();
            let rate_limiter = rate_limiter.clone();
            let thread_id = thread_id.clone();
            let tenant_id = tenant_id.clone();
            let user_id = user_id.clone();
            let user_content = user_content.clone();
            let provider_name = provider_name.clone();
            async move {
                if let Ok(StreamChunk::Complete { usage, model, response_id, raw_request, raw_response, .. }) = &item {
                    let processing_ms = start.elapsed().as_millis() as u64;
                    rate_limiter.record_tokens(&user_id, usage.total_tokens as i64, tenant_tpm, client_tpm).await;
                    let debug = TurnDebug {
                        system_prompt: None,
                        raw_request: raw_request.clone(),
                        raw_response: raw_response.clone(),
                    };
                    let _ = persistence
                        .persist_conversation_turn_with_debug(
                            &thread_id,
                            &tenant_id,
                            &user_id,
                            &user_content,
                            "",
                            &provider_name,
                            model,
                            response_id.as_deref(),
                            usage.input_tokens,
                            usage.output_tokens,
                            processing_ms,
                            0.0,
                            debug,
                        )
                        .await;
                }
                item
            }
        });

        Ok(Box::pin(mapped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: Role, content: &str, response_id: Option<&str>) -> HistoryTurn {
        HistoryTurn { role, content: content.to_string(), response_id: response_id.map(|s| s.to_string()) }
    }

    #[test]
    fn validate_sizes_rejects_oversize_user_input() {
        let mut req = GenerateRequest::default();
        req.user_input = "a".repeat(MAX_USER_INPUT_BYTES + 1);
        assert!(validate_sizes(&req).is_err());
    }

    #[test]
    fn validate_sizes_rejects_oversize_history() {
        let mut req = GenerateRequest::default();
        req.history = (0..101).map(|_| turn(Role::User, "hi", None)).collect();
        assert!(validate_sizes(&req).is_err());
    }

    #[test]
    fn compress_history_keeps_three_full_assistant_turns() {
        let history: Vec<HistoryTurn> = (0..5)
            .map(|i| turn(Role::Assistant, &format!("reply {}", i), None))
            .collect();
        let (compressed, _) = compress_history(&history);
        assert_eq!(compressed.len(), 5);
        assert_eq!(compressed[4].content, "reply 4");
        assert!(compressed[1].content.ends_with("..."));
    }

    #[test]
    fn compress_history_drops_assistant_turns_past_the_sixth() {
        let history: Vec<HistoryTurn> = (0..10)
            .map(|i| turn(Role::Assistant, &format!("reply {}", i), None))
            .collect();
        let (compressed, _) = compress_history(&history);
        assert_eq!(compressed.len(), 6);
    }

    #[test]
    fn compress_history_recovers_latest_response_id() {
        let history = vec![
            turn(Role::Assistant, "old", Some("resp-old")),
            turn(Role::User, "hi", None),
            turn(Role::Assistant, "new", Some("resp-new")),
        ];
        let (_, response_id) = compress_history(&history);
        assert_eq!(response_id.as_deref(), Some("resp-new"));
    }

    #[test]
    fn compress_history_stops_adding_user_messages_past_budget() {
        let history: Vec<HistoryTurn> = (0..5)
            .map(|i| turn(Role::User, &"x".repeat(HISTORY_CHAR_BUDGET / 3), None))
            .map(|mut t| {
                t.content = format!("{}-{}", t.content, 0);
                t
            })
            .collect();
        let (compressed, _) = compress_history(&history);
        assert!(compressed.len() < 5);
    }

    #[tokio::test]
    async fn idempotency_proceeds_then_conflicts_while_processing() {
        let backend = InMemoryIdempotencyBackend::new();
        let key = idempotency_key("acme", "thread-1", "req-1");
        assert_eq!(acquire_idempotency(&backend, &key).await.unwrap(), IdempotencyOutcome::Proceed);
        assert_eq!(acquire_idempotency(&backend, &key).await.unwrap(), IdempotencyOutcome::Conflict);
    }

    #[tokio::test]
    async fn idempotency_returns_cached_response_after_completion() {
        let backend = InMemoryIdempotencyBackend::new();
        let key = idempotency_key("acme", "thread-1", "req-2");
        assert_eq!(acquire_idempotency(&backend, &key).await.unwrap(), IdempotencyOutcome::Proceed);
        backend.set(&key, "serialized-response", 86_400).await.unwrap();
        assert_eq!(
            acquire_idempotency(&backend, &key).await.unwrap(),
            IdempotencyOutcome::Cached("serialized-response".to_string())
        );
    }
}
