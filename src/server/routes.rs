//! Route handlers. Each mirrors one RPC from the external interfaces in §5: extract the
//! credential, run the auth pipeline, translate the wire body into the engine's own request
//! type, and translate the engine's result back into JSON (or SSE, for the streaming chat RPC).

use super::AppState;
use crate::airborne::context::RequestContext;
use crate::airborne::errors::GatewayError;
use crate::airborne::keys::{KeyRepository, Permission};
use crate::airborne::orchestrator::{GenerateOutcome, GenerateRequest, HistoryTurn};
use crate::airborne::provider::{Role, StreamChunk};
use crate::airborne::rate_limit::CounterBackend;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            "unauthenticated" => StatusCode::UNAUTHORIZED,
            "permission-denied" => StatusCode::FORBIDDEN,
            "invalid-argument" => StatusCode::BAD_REQUEST,
            "not-found" => StatusCode::NOT_FOUND,
            "resource-exhausted" => StatusCode::TOO_MANY_REQUESTS,
            "failed-precondition" => StatusCode::UNPROCESSABLE_ENTITY,
            "deadline-exceeded" => StatusCode::GATEWAY_TIMEOUT,
            "conflict" => StatusCode::CONFLICT,
            "unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        log::warn!("request failed: {}", self);
        (status, Json(ErrorBody { error: self.sanitize().to_string(), kind: self.kind().to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: String,
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({"version": env!("CARGO_PKG_VERSION")}))
}

#[derive(Deserialize)]
pub struct HistoryTurnDto {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub response_id: Option<String>,
}

fn parse_role(s: &str) -> Role {
    match s {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool { call_id: String::new() },
        _ => Role::User,
    }
}

#[derive(Deserialize)]
pub struct ChatRequestBody {
    pub thread_id: String,
    #[serde(default)]
    pub user_id: String,
    pub user_input: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryTurnDto>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub preferred_provider: Option<String>,
    #[serde(default)]
    pub base_url_override: Option<String>,
    #[serde(default)]
    pub model_override: Option<String>,
    #[serde(default)]
    pub enable_file_search: bool,
    #[serde(default)]
    pub store_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Steps 1-5 of §4.4, shared by the unary and streaming chat routes: extract the credential,
/// validate it, check the caller's permission, and resolve the tenant from `x-tenant-id`.
async fn authenticate_chat<R, B>(
    state: &AppState<R, B>,
    headers: &HeaderMap,
    permission: Permission,
) -> Result<RequestContext, GatewayError>
where
    R: KeyRepository + Send + Sync + 'static,
    B: CounterBackend + Send + Sync + 'static,
{
    let authorization = headers.get("authorization").and_then(|v| v.to_str().ok());
    let x_api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    let request_id = crate::airborne::context::validate_or_generate_request_id(
        headers.get("x-request-id").and_then(|v| v.to_str().ok()),
    )?;

    let context = state.auth.authenticate(authorization, x_api_key, request_id).await?;
    if !context.client.has_permission(permission) {
        return Err(GatewayError::permission_denied("missing required permission"));
    }
    let raw_tenant_id = headers.get("x-tenant-id").and_then(|v| v.to_str().ok()).unwrap_or("");
    state.auth.resolve_tenant(context, raw_tenant_id)
}

fn build_generate_request(
    body: ChatRequestBody,
    tenant_id: String,
    client_id: String,
    image_triggers: Vec<String>,
    client_tpm: u32,
) -> GenerateRequest {
    GenerateRequest {
        tenant_id,
        thread_id: body.thread_id,
        user_id: if body.user_id.is_empty() { client_id } else { body.user_id },
        user_input: body.user_input,
        instructions: body.instructions,
        history: body
            .history
            .into_iter()
            .map(|h| HistoryTurn { role: parse_role(&h.role), content: h.content, response_id: h.response_id })
            .collect(),
        metadata: body.metadata,
        preferred_provider: body.preferred_provider,
        base_url_override: body.base_url_override,
        model_override: body.model_override,
        enable_file_search: body.enable_file_search,
        store_id: body.store_id,
        request_id: body.request_id,
        image_triggers,
        client_tpm,
    }
}

#[derive(Serialize)]
pub struct ChatResponseBody {
    pub cached: bool,
    pub text: String,
    pub provider: String,
    pub model: String,
    pub response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageDto>,
}

#[derive(Serialize)]
pub struct UsageDto {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

pub async fn chat<R, B>(
    State(state): State<Arc<AppState<R, B>>>,
    headers: HeaderMap,
    Json(body): Json<ChatRequestBody>,
) -> Result<Json<ChatResponseBody>, GatewayError>
where
    R: KeyRepository + Send + Sync + 'static,
    B: CounterBackend + Send + Sync + 'static,
{
    let context = authenticate_chat(&state, &headers, Permission::Chat).await?;
    let tenant = context
        .tenant
        .clone()
        .ok_or_else(|| GatewayError::invalid_argument("tenant id is required"))?;

    let req = build_generate_request(
        body,
        tenant.id.clone(),
        context.client.client_id.clone(),
        tenant.image_gen.trigger_phrases.clone(),
        context.client.limits.tokens_per_minute,
    );
    let outcome = state.orchestrator.generate(req, &tenant).await?;
    Ok(Json(match outcome {
        GenerateOutcome::Fresh(r) => ChatResponseBody {
            cached: false,
            text: r.text,
            provider: r.provider,
            model: r.model,
            response_id: r.response_id,
            usage: Some(UsageDto {
                input_tokens: r.usage.input_tokens,
                output_tokens: r.usage.output_tokens,
                total_tokens: r.usage.total_tokens,
            }),
        },
        GenerateOutcome::Cached(c) => ChatResponseBody {
            cached: true,
            text: c.text,
            provider: c.provider,
            model: c.model,
            response_id: c.response_id,
            usage: None,
        },
    }))
}

#[derive(Serialize)]
struct StreamEventDto {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_id: Option<String>,
}

fn chunk_to_event(chunk: Result<StreamChunk, String>) -> Event {
    let dto = match chunk {
        Ok(StreamChunk::Text { delta }) => StreamEventDto { kind: "text", delta: Some(delta), message: None, model: None, response_id: None },
        Ok(StreamChunk::Thinking { delta }) => StreamEventDto { kind: "thinking", delta: Some(delta), message: None, model: None, response_id: None },
        Ok(StreamChunk::ToolCall(_)) => StreamEventDto { kind: "tool-call", delta: None, message: None, model: None, response_id: None },
        Ok(StreamChunk::CodeExecution(_)) => StreamEventDto { kind: "code-execution", delta: None, message: None, model: None, response_id: None },
        Ok(StreamChunk::Error { message, .. }) => StreamEventDto { kind: "error", delta: None, message: Some(message), model: None, response_id: None },
        Ok(StreamChunk::Complete { model, response_id, .. }) => {
            StreamEventDto { kind: "complete", delta: None, message: None, model: Some(model), response_id }
        }
        Err(message) => StreamEventDto { kind: "error", delta: None, message: Some(message), model: None, response_id: None },
    };
    Event::default().json_data(dto).unwrap_or_else(|_| Event::default().data("{}"))
}

pub async fn chat_stream<R, B>(
    State(state): State<Arc<AppState<R, B>>>,
    headers: HeaderMap,
    Json(body): Json<ChatRequestBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError>
where
    R: KeyRepository + Send + Sync + 'static,
    B: CounterBackend + Send + Sync + 'static,
{
    let context = authenticate_chat(&state, &headers, Permission::ChatStream).await?;
    let tenant = context
        .tenant
        .clone()
        .ok_or_else(|| GatewayError::invalid_argument("tenant id is required"))?;

    let req = build_generate_request(
        body,
        tenant.id.clone(),
        context.client.client_id.clone(),
        tenant.image_gen.trigger_phrases.clone(),
        context.client.limits.tokens_per_minute,
    );
    let inner = state.orchestrator.generate_stream(req, &tenant).await?;
    let events = inner.map(|item| Ok::<Event, Infallible>(chunk_to_event(item)));
    Ok(Sse::new(events))
}

#[derive(Deserialize)]
pub struct RagIngestBody {
    pub store_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
    pub filename: String,
    #[serde(default = "default_mime")]
    pub mime_type: String,
    /// Base64-encoded document bytes.
    pub content_base64: String,
}

fn default_mime() -> String {
    "application/octet-stream".to_string()
}

#[derive(Serialize)]
pub struct RagIngestResponse {
    pub collection: String,
    pub file_id: String,
    pub chunks_ingested: usize,
}

pub async fn rag_ingest<R, B>(
    State(state): State<Arc<AppState<R, B>>>,
    headers: HeaderMap,
    Json(body): Json<RagIngestBody>,
) -> Result<Json<RagIngestResponse>, GatewayError>
where
    R: KeyRepository + Send + Sync + 'static,
    B: CounterBackend + Send + Sync + 'static,
{
    let context = authenticate_chat(&state, &headers, Permission::Files).await?;
    let tenant = context
        .tenant
        .clone()
        .ok_or_else(|| GatewayError::invalid_argument("tenant id is required"))?;
    let rag = state
        .orchestrator
        .rag
        .as_ref()
        .ok_or_else(|| GatewayError::failed_precondition("file search is not configured"))?;

    let bytes = crate::airborne::image_gen::decode_inline_image(&body.content_base64)
        .map_err(GatewayError::invalid_argument)?;

    let outcome = crate::airborne::rag::orchestrator::ingest(
        crate::airborne::rag::orchestrator::IngestParams {
            tenant_id: tenant.id.clone(),
            store_id: body.store_id,
            thread_id: body.thread_id,
            file_id: body.file_id,
            filename: body.filename,
            mime_type: body.mime_type,
            bytes,
            conversion_service_url: None,
            chunk_params: crate::airborne::rag::chunker::ChunkParams::default(),
        },
        rag.embedder.as_ref(),
        rag.store.as_ref(),
    )
    .await?;

    Ok(Json(RagIngestResponse {
        collection: outcome.collection,
        file_id: outcome.file_id,
        chunks_ingested: outcome.chunks_ingested,
    }))
}

#[derive(Deserialize)]
pub struct FileSearchStoreUploadBody {
    pub provider: String,
    pub store_id: String,
    pub filename: String,
    #[serde(default = "default_mime")]
    pub mime_type: String,
    /// Base64-encoded document bytes.
    pub content_base64: String,
}

/// Uploads a document into a provider-hosted file-search store (§4.9), distinct from
/// `/v1/rag/ingest`'s tenant-owned vector store: this is the provider's own store, populated via
/// that provider's two-step upload workaround where one exists.
pub async fn file_search_store_upload<R, B>(
    State(state): State<Arc<AppState<R, B>>>,
    headers: HeaderMap,
    Json(body): Json<FileSearchStoreUploadBody>,
) -> Result<StatusCode, GatewayError>
where
    R: KeyRepository + Send + Sync + 'static,
    B: CounterBackend + Send + Sync + 'static,
{
    let context = authenticate_chat(&state, &headers, Permission::Files).await?;
    let tenant = context
        .tenant
        .clone()
        .ok_or_else(|| GatewayError::invalid_argument("tenant id is required"))?;

    let adapter = state
        .orchestrator
        .providers
        .get(&body.provider)
        .ok_or_else(|| GatewayError::invalid_argument(format!("unknown provider '{}'", body.provider)))?;
    let credential = tenant.providers.get(&body.provider).ok_or_else(|| {
        GatewayError::failed_precondition(format!("no credential configured for provider '{}'", body.provider))
    })?;

    let bytes = crate::airborne::image_gen::decode_inline_image(&body.content_base64)
        .map_err(GatewayError::invalid_argument)?;

    let config = crate::airborne::provider::ProviderRequestConfig {
        api_key: credential.api_key.clone(),
        base_url_override: credential.base_url_override.clone(),
        extra_options: credential.extra_options.clone(),
        ..Default::default()
    };

    adapter
        .upload_to_file_search_store(&config, &body.store_id, bytes, &body.filename, &body.mime_type)
        .await
        .map_err(GatewayError::failed_precondition)?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct RagRetrieveBody {
    pub store_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub query: String,
    #[serde(default)]
    pub top_k: usize,
}

#[derive(Serialize)]
pub struct RetrievedChunkDto {
    pub text: String,
    pub filename: String,
    pub chunk_index: usize,
    pub score: f32,
}

pub async fn rag_retrieve<R, B>(
    State(state): State<Arc<AppState<R, B>>>,
    headers: HeaderMap,
    Json(body): Json<RagRetrieveBody>,
) -> Result<Json<Vec<RetrievedChunkDto>>, GatewayError>
where
    R: KeyRepository + Send + Sync + 'static,
    B: CounterBackend + Send + Sync + 'static,
{
    let context = authenticate_chat(&state, &headers, Permission::Files).await?;
    let tenant = context
        .tenant
        .clone()
        .ok_or_else(|| GatewayError::invalid_argument("tenant id is required"))?;
    let rag = state
        .orchestrator
        .rag
        .as_ref()
        .ok_or_else(|| GatewayError::failed_precondition("file search is not configured"))?;

    let chunks = crate::airborne::rag::orchestrator::retrieve(
        crate::airborne::rag::orchestrator::RetrieveParams {
            tenant_id: tenant.id.clone(),
            store_id: body.store_id,
            thread_id: body.thread_id,
            query: body.query,
            top_k: body.top_k,
        },
        rag.embedder.as_ref(),
        rag.store.as_ref(),
    )
    .await?;

    Ok(Json(
        chunks
            .into_iter()
            .map(|c| RetrievedChunkDto { text: c.text, filename: c.filename, chunk_index: c.chunk_index, score: c.score })
            .collect(),
    ))
}
