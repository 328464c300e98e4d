//! Anthropic adapter. Talks to the native Messages API (not routed through the OpenAI-compatible
//! path) so thinking deltas and cache-read token accounting — both absent from the
//! OpenAI-compatible surface — are available. Thinking deltas are surfaced as text-typed stream
//! chunks per §4.9/§9.

use super::common::{shared_http_client, SseDecoder};
use super::{
    Capabilities, ChunkStream, GenerateParams, GenerateResult, ProviderAdapter, ProviderOptions,
    Role, StreamChunk, ThinkingLevel, TokenUsage,
};
use crate::airborne::retry::{is_retryable, run_with_retry};
use crate::airborne::url_validator;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-sonnet-4-0";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter;

impl AnthropicAdapter {
    pub fn new() -> Self {
        AnthropicAdapter
    }

    fn base_url(&self, config: &super::ProviderRequestConfig) -> Result<String, String> {
        let url = config
            .base_url_override
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        url_validator::validate(&url).map_err(|e| e.to_string())?;
        Ok(url.trim_end_matches('/').to_string())
    }

    fn build_body(&self, params: &GenerateParams, model: &str) -> Value {
        let mut messages = Vec::new();
        for turn in &params.history {
            let role = match &turn.role {
                Role::User | Role::Tool { .. } => "user",
                Role::Assistant | Role::System => "assistant",
            };
            messages.push(json!({"role": role, "content": turn.content}));
        }
        messages.push(json!({"role": "user", "content": params.user_input}));

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": params.config.max_output_tokens.unwrap_or(4096),
        });
        if let Some(system) = &params.system_instructions {
            body["system"] = json!(system);
        }
        if let Some(temp) = params.config.temperature {
            body["temperature"] = json!(temp);
        }
        let options = ProviderOptions::from_map(&params.config.extra_options);
        if matches!(options.thinking_level, Some(ThinkingLevel::High) | Some(ThinkingLevel::Medium)) {
            let budget = options.thinking_budget.filter(|b| *b > 0).unwrap_or(8000) as u32;
            body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        }
        body
    }

    fn parse_result(&self, model: &str, body: &Value) -> GenerateResult {
        let text = body["content"]
            .as_array()
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| b["type"] == "text")
                    .and_then(|b| b["text"].as_str())
            })
            .unwrap_or("")
            .to_string();

        let usage = TokenUsage {
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
            total_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0)
                + body["usage"]["output_tokens"].as_u64().unwrap_or(0),
            cached_tokens: body["usage"]["cache_read_input_tokens"].as_u64().unwrap_or(0),
            reasoning_tokens: 0,
        };

        GenerateResult {
            text,
            usage,
            model: model.to_string(),
            citations: Vec::new(),
            response_id: body["id"].as_str().map(|s| s.to_string()),
            tool_calls: Vec::new(),
            code_executions: Vec::new(),
            structured_metadata: None,
            raw_request: None,
            raw_response: Some(body.clone()),
        }
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            file_search: false,
            web_search: false,
            native_continuity: false,
            streaming: true,
        }
    }

    async fn generate(&self, params: GenerateParams) -> Result<GenerateResult, String> {
        let base_url = self.base_url(&params.config)?;
        let model = params.config.model_override.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let body = self.build_body(&params, &model);
        let api_key = params.config.api_key.clone();
        let url = format!("{}/messages", base_url);

        let response_body = run_with_retry(
            |_attempt| {
                let client = shared_http_client();
                let url = url.clone();
                let api_key = api_key.clone();
                let body = body.clone();
                async move {
                    let resp = client
                        .post(&url)
                        .header("x-api-key", &api_key)
                        .header("anthropic-version", ANTHROPIC_VERSION)
                        .json(&body)
                        .send()
                        .await
                        .map_err(|e| e.to_string())?;
                    let status = resp.status();
                    let text = resp.text().await.map_err(|e| e.to_string())?;
                    if !status.is_success() {
                        return Err(format!("{} {}", status.as_u16(), text));
                    }
                    serde_json::from_str::<Value>(&text).map_err(|e| e.to_string())
                }
            },
            |msg| {
                let status = msg.split_whitespace().next().and_then(|s| s.parse::<u16>().ok());
                is_retryable(msg, status)
            },
            &params.cancelled,
        )
        .await?;

        let mut result = self.parse_result(&model, &response_body);
        result.raw_request = Some(body);
        Ok(result)
    }

    async fn generate_stream(&self, params: GenerateParams) -> Result<ChunkStream, String> {
        let base_url = self.base_url(&params.config)?;
        let model = params.config.model_override.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let mut body = self.build_body(&params, &model);
        body["stream"] = json!(true);
        let api_key = params.config.api_key.clone();
        let url = format!("{}/messages", base_url);

        let client = shared_http_client();
        let resp = client
            .post(&url)
            .header("x-api-key", &api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("{} {}", status.as_u16(), text));
        }

        let byte_stream = resp.bytes_stream();
        let model_owned = model.clone();
        let stream = stream::unfold(
            (byte_stream, SseDecoder::new()),
            move |(mut byte_stream, mut decoder)| {
                let model_owned = model_owned.clone();
                async move {
                    loop {
                        match byte_stream.next().await {
                            Some(Ok(bytes)) => {
                                let events = decoder.feed(&bytes);
                                if let Some(event) = events.into_iter().next() {
                                    let chunk = decode_anthropic_event(&event, &model_owned);
                                    return Some((chunk, (byte_stream, decoder)));
                                }
                            }
                            Some(Err(e)) => {
                                return Some((
                                    Ok(StreamChunk::Error { message: e.to_string(), retryable: true }),
                                    (byte_stream, decoder),
                                ));
                            }
                            None => return None,
                        }
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }
}

fn decode_anthropic_event(
    event: &super::common::SseEvent,
    model: &str,
) -> Result<StreamChunk, String> {
    let value: Value = serde_json::from_str(&event.data).map_err(|e| e.to_string())?;
    match value["type"].as_str() {
        Some("content_block_delta") => match value["delta"]["type"].as_str() {
            Some("text_delta") => Ok(StreamChunk::Text {
                delta: value["delta"]["text"].as_str().unwrap_or("").to_string(),
            }),
            // Thinking deltas surface as text-kind chunks so consumers see intermediate
            // reasoning without a dedicated variant (§9).
            Some("thinking_delta") => Ok(StreamChunk::Thinking {
                delta: value["delta"]["thinking"].as_str().unwrap_or("").to_string(),
            }),
            _ => Ok(StreamChunk::Text { delta: String::new() }),
        },
        Some("message_delta") => Ok(StreamChunk::Complete {
            usage: TokenUsage {
                input_tokens: 0,
                output_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0),
                total_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0),
                cached_tokens: value["usage"]["cache_read_input_tokens"].as_u64().unwrap_or(0),
                reasoning_tokens: 0,
            },
            model: model.to_string(),
            tool_calls: Vec::new(),
            response_id: None,
            raw_request: None,
            raw_response: Some(value.clone()),
        }),
        _ => Ok(StreamChunk::Text { delta: String::new() }),
    }
}
