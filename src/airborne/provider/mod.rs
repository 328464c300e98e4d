//! C8 — provider contract. The uniform interface every family-specific adapter (C9) satisfies.
//!
//! A generalization of the teacher's `ClientWrapper` trait: capability flags, streaming chunk
//! variants, citations, tool calls, code-execution records, and structured metadata are added
//! per §4.8, replacing the teacher's narrower chat-only contract.

pub mod common;
pub mod compat;
pub mod anthropic;
pub mod gemini;
pub mod openai;

use crate::airborne::retry::CancellationFlag;
use async_trait::async_trait;
use futures_util::stream::Stream;
use std::collections::HashMap;
use std::pin::Pin;

/// Conversation role, mirroring the teacher's `Role` but flattened to plain data so it can be
/// translated into any vendor's wire shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool { call_id: String },
}

#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct InlineFileRef {
    pub uri: String,
    pub mime_type: String,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Capability flags an adapter advertises; stable for the lifetime of the adapter instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub file_search: bool,
    pub web_search: bool,
    pub native_continuity: bool,
    pub streaming: bool,
}

/// The known extensible provider option keys (§9 design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyThreshold {
    BlockNone,
    LowAndAbove,
    MediumAndAbove,
    OnlyHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingLevel {
    Minimal,
    Low,
    Medium,
    High,
}

/// Typed view over the tenant's extra-options map; unknown keys are ignored.
#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    pub safety_threshold: Option<SafetyThreshold>,
    pub thinking_level: Option<ThinkingLevel>,
    pub thinking_budget: Option<i64>,
    pub include_thoughts: Option<bool>,
}

impl ProviderOptions {
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let safety_threshold = map.get("safety_threshold").and_then(|v| match v.as_str() {
            "BLOCK_NONE" => Some(SafetyThreshold::BlockNone),
            "LOW_AND_ABOVE" => Some(SafetyThreshold::LowAndAbove),
            "MEDIUM_AND_ABOVE" => Some(SafetyThreshold::MediumAndAbove),
            "ONLY_HIGH" => Some(SafetyThreshold::OnlyHigh),
            _ => None,
        });
        let thinking_level = map.get("thinking_level").and_then(|v| match v.as_str() {
            "MINIMAL" => Some(ThinkingLevel::Minimal),
            "LOW" => Some(ThinkingLevel::Low),
            "MEDIUM" => Some(ThinkingLevel::Medium),
            "HIGH" => Some(ThinkingLevel::High),
            _ => None,
        });
        let thinking_budget = map.get("thinking_budget").and_then(|v| v.parse().ok());
        let include_thoughts = map.get("include_thoughts").and_then(|v| v.parse().ok());
        ProviderOptions {
            safety_threshold,
            thinking_level,
            thinking_budget,
            include_thoughts,
        }
    }
}

/// Feature toggles carried on a per-request basis.
#[derive(Debug, Clone, Default)]
pub struct FeatureToggles {
    pub enable_file_search: Option<String>,
    pub enable_web_search: bool,
    pub enable_code_execution: bool,
    pub enable_structured_output: bool,
}

/// Per-request provider configuration.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequestConfig {
    pub api_key: String,
    pub base_url_override: Option<String>,
    pub model_override: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub extra_options: HashMap<String, String>,
}

/// Parameters carried into `Generate`/`GenerateStream`.
#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub system_instructions: Option<String>,
    pub user_input: String,
    pub history: Vec<HistoryMessage>,
    pub inline_files: Vec<InlineFileRef>,
    pub tools: Vec<ToolDefinition>,
    pub config: ProviderRequestConfig,
    pub features: FeatureToggles,
    pub previous_response_id: Option<String>,
    pub request_id: String,
    pub client_id: String,
    /// Observed by C7's retry loop; set once the caller gives up on this request (§4.7/§5).
    pub cancelled: CancellationFlag,
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cached_tokens: u64,
    pub reasoning_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct Citation {
    pub url: Option<String>,
    pub file_id: Option<String>,
    pub start_index: Option<u32>,
    pub end_index: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CodeExecutionRecord {
    pub code: String,
    pub language: String,
    pub stdout: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Default)]
pub struct StructuredMetadata {
    pub intent: Option<String>,
    pub entities: Vec<(String, String)>,
    pub topics: Vec<String>,
    pub scheduling_signal: Option<String>,
}

/// Result of a unary `Generate` call.
#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
    pub citations: Vec<Citation>,
    pub response_id: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub code_executions: Vec<CodeExecutionRecord>,
    pub structured_metadata: Option<StructuredMetadata>,
    pub raw_request: Option<serde_json::Value>,
    pub raw_response: Option<serde_json::Value>,
}

/// Stream chunks: a tagged union over text delta, tool call, code-execution event, thinking
/// delta, error, and completion.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Text { delta: String },
    ToolCall(ToolCallRequest),
    CodeExecution(CodeExecutionRecord),
    /// Intermediate reasoning delta; surfaced as text by callers that don't distinguish kinds.
    Thinking { delta: String },
    Error { message: String, retryable: bool },
    Complete {
        usage: TokenUsage,
        model: String,
        tool_calls: Vec<ToolCallRequest>,
        response_id: Option<String>,
        raw_request: Option<serde_json::Value>,
        raw_response: Option<serde_json::Value>,
    },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, String>> + Send>>;

/// The uniform contract every concrete provider adapter satisfies.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier, e.g. `"openai"`, `"anthropic"`, `"gemini"`, `"groq"`.
    fn name(&self) -> &str;

    /// Capability flags; stable for the lifetime of this adapter instance.
    fn capabilities(&self) -> Capabilities;

    /// Blocking unary call.
    async fn generate(&self, params: GenerateParams) -> Result<GenerateResult, String>;

    /// Lazy sequence of chunks; closes on completion or error. Adapters without native
    /// streaming support may return `Err` with a `failed-precondition`-style message; the
    /// orchestrator checks `capabilities().streaming` before calling this.
    async fn generate_stream(&self, params: GenerateParams) -> Result<ChunkStream, String>;

    /// Upload a document into this provider's own hosted file-search store (§4.9), for
    /// providers that host one. Adapters without a native store return an error; callers
    /// should check `capabilities().file_search` first.
    async fn upload_to_file_search_store(
        &self,
        _config: &ProviderRequestConfig,
        _store_id: &str,
        _bytes: Vec<u8>,
        _filename: &str,
        _mime_type: &str,
    ) -> Result<(), String> {
        Err(format!("{} does not host a native file-search store", self.name()))
    }
}
