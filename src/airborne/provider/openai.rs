//! OpenAI adapter. Uses the Responses API shape when a `previous_response_id` is supplied
//! (native continuity); otherwise falls back to Chat Completions. Streams via SSE deltas.

use super::common::{shared_http_client, SseDecoder};
use super::{
    Capabilities, ChunkStream, GenerateParams, GenerateResult, ProviderAdapter, Role, StreamChunk,
    TokenUsage,
};
use crate::airborne::retry::{is_retryable, run_with_retry};
use crate::airborne::url_validator;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4.1-mini";

pub struct OpenAiAdapter;

impl OpenAiAdapter {
    pub fn new() -> Self {
        OpenAiAdapter
    }

    fn base_url(&self, config: &super::ProviderRequestConfig) -> Result<String, String> {
        let url = config
            .base_url_override
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        url_validator::validate(&url).map_err(|e| e.to_string())?;
        Ok(url.trim_end_matches('/').to_string())
    }

    fn build_responses_body(&self, params: &GenerateParams, model: &str) -> Value {
        let mut input = Vec::new();
        if let Some(system) = &params.system_instructions {
            input.push(json!({"role": "system", "content": system}));
        }
        for turn in &params.history {
            let role = match &turn.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool { .. } => "tool",
            };
            input.push(json!({"role": role, "content": turn.content}));
        }
        input.push(json!({"role": "user", "content": params.user_input}));

        let mut body = json!({
            "model": model,
            "input": input,
        });
        if let Some(prev) = &params.previous_response_id {
            body["previous_response_id"] = json!(prev);
        }
        if params.features.enable_structured_output {
            body["text"] = json!({
                "format": {
                    "type": "json_schema",
                    "name": "airborne_structured_reply",
                    "schema": structured_output_schema(),
                }
            });
        }
        if params.features.enable_web_search {
            body["tools"] = json!([{"type": "web_search"}]);
        }
        if let Some(max_tokens) = params.config.max_output_tokens {
            body["max_output_tokens"] = json!(max_tokens);
        }
        body
    }

    fn parse_responses_result(&self, model: &str, body: &Value) -> GenerateResult {
        let text = body["output"]
            .as_array()
            .and_then(|items| {
                items.iter().find_map(|item| {
                    item["content"].as_array().and_then(|contents| {
                        contents.iter().find_map(|c| c["text"].as_str())
                    })
                })
            })
            .unwrap_or("")
            .to_string();

        let usage = TokenUsage {
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
            total_tokens: body["usage"]["total_tokens"].as_u64().unwrap_or(0),
            cached_tokens: body["usage"]["input_tokens_details"]["cached_tokens"]
                .as_u64()
                .unwrap_or(0),
            reasoning_tokens: body["usage"]["output_tokens_details"]["reasoning_tokens"]
                .as_u64()
                .unwrap_or(0),
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

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed, provider-agnostic intent/entity extraction schema (§9 design notes).
pub fn structured_output_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "reply": {"type": "string"},
            "intent": {"type": "string"},
            "requires_user_action": {"type": "boolean"},
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "type": {"type": "string"}
                    },
                    "required": ["name", "type"]
                }
            },
            "topics": {"type": "array", "items": {"type": "string"}},
            "scheduling_intent": {"type": "string"}
        },
        "required": ["reply", "intent", "requires_user_action", "entities", "topics", "scheduling_intent"]
    })
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            file_search: true,
            web_search: true,
            native_continuity: true,
            streaming: true,
        }
    }

    async fn generate(&self, params: GenerateParams) -> Result<GenerateResult, String> {
        let base_url = self.base_url(&params.config)?;
        let model = params.config.model_override.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let body = self.build_responses_body(&params, &model);
        let api_key = params.config.api_key.clone();
        let url = format!("{}/responses", base_url);

        let response_body = run_with_retry(
            |_attempt| {
                let client = shared_http_client();
                let url = url.clone();
                let api_key = api_key.clone();
                let body = body.clone();
                async move {
                    let resp = client
                        .post(&url)
                        .bearer_auth(&api_key)
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

        let mut result = self.parse_responses_result(&model, &response_body);
        result.raw_request = Some(body);
        Ok(result)
    }

    async fn generate_stream(&self, params: GenerateParams) -> Result<ChunkStream, String> {
        let base_url = self.base_url(&params.config)?;
        let model = params.config.model_override.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let mut body = self.build_responses_body(&params, &model);
        body["stream"] = json!(true);
        let api_key = params.config.api_key.clone();
        let url = format!("{}/responses", base_url);

        let client = shared_http_client();
        let resp = client
            .post(&url)
            .bearer_auth(&api_key)
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
            (byte_stream, SseDecoder::new(), false),
            move |(mut byte_stream, mut decoder, done)| {
                let model_owned = model_owned.clone();
                async move {
                    if done {
                        return None;
                    }
                    loop {
                        match byte_stream.next().await {
                            Some(Ok(bytes)) => {
                                let events = decoder.feed(&bytes);
                                if let Some(event) = events.into_iter().next() {
                                    let chunk = decode_event(&event, &model_owned);
                                    return Some((chunk, (byte_stream, decoder, false)));
                                }
                            }
                            Some(Err(e)) => {
                                return Some((
                                    Ok(StreamChunk::Error { message: e.to_string(), retryable: true }),
                                    (byte_stream, decoder, true),
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

fn decode_event(
    event: &super::common::SseEvent,
    model: &str,
) -> Result<StreamChunk, String> {
    if event.data == "[DONE]" {
        return Ok(StreamChunk::Complete {
            usage: TokenUsage::default(),
            model: model.to_string(),
            tool_calls: Vec::new(),
            response_id: None,
            raw_request: None,
            raw_response: None,
        });
    }
    let value: Value = serde_json::from_str(&event.data).map_err(|e| e.to_string())?;
    match value["type"].as_str() {
        Some("response.output_text.delta") => Ok(StreamChunk::Text {
            delta: value["delta"].as_str().unwrap_or("").to_string(),
        }),
        Some("response.completed") => Ok(StreamChunk::Complete {
            usage: TokenUsage {
                input_tokens: value["response"]["usage"]["input_tokens"].as_u64().unwrap_or(0),
                output_tokens: value["response"]["usage"]["output_tokens"].as_u64().unwrap_or(0),
                total_tokens: value["response"]["usage"]["total_tokens"].as_u64().unwrap_or(0),
                cached_tokens: 0,
                reasoning_tokens: 0,
            },
            model: model.to_string(),
            tool_calls: Vec::new(),
            response_id: value["response"]["id"].as_str().map(|s| s.to_string()),
            raw_request: None,
            raw_response: Some(value.clone()),
        }),
        _ => Ok(StreamChunk::Text { delta: String::new() }),
    }
}
