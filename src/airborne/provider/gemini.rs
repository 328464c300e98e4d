//! Gemini adapter. `generateContent`/`streamGenerateContent`, the FileSearchStore two-step
//! upload workaround (`upload_to_file_search_store`), Google Search grounding (mutually
//! exclusive with file search in the same request), code execution, and the fixed
//! structured-output schema.

use super::common::{shared_http_client, SseDecoder};
use super::{
    Capabilities, ChunkStream, CodeExecutionRecord, GenerateParams, GenerateResult, ProviderAdapter,
    ProviderOptions, ProviderRequestConfig, Role, SafetyThreshold, StreamChunk, StructuredMetadata,
    ThinkingLevel, TokenUsage,
};
use crate::airborne::retry::{is_retryable, run_with_retry};
use crate::airborne::url_validator;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use reqwest::multipart;
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";

const GEMINI_HARM_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

fn thinking_level_wire(level: ThinkingLevel) -> &'static str {
    match level {
        ThinkingLevel::Minimal => "MINIMAL",
        ThinkingLevel::Low => "LOW",
        ThinkingLevel::Medium => "MEDIUM",
        ThinkingLevel::High => "HIGH",
    }
}

fn safety_threshold_wire(threshold: SafetyThreshold) -> &'static str {
    match threshold {
        SafetyThreshold::BlockNone => "BLOCK_NONE",
        SafetyThreshold::LowAndAbove => "BLOCK_LOW_AND_ABOVE",
        SafetyThreshold::MediumAndAbove => "BLOCK_MEDIUM_AND_ABOVE",
        SafetyThreshold::OnlyHigh => "BLOCK_ONLY_HIGH",
    }
}

fn import_file_body(file_name: &str) -> Value {
    json!({ "fileName": file_name })
}

fn extract_uploaded_file_name(response: &Value) -> Result<String, String> {
    response["file"]["name"]
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| "file upload response is missing the file name".to_string())
}

pub struct GeminiAdapter;

impl GeminiAdapter {
    pub fn new() -> Self {
        GeminiAdapter
    }

    fn base_url(&self, config: &super::ProviderRequestConfig) -> Result<String, String> {
        let url = config
            .base_url_override
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        url_validator::validate(&url).map_err(|e| e.to_string())?;
        Ok(url.trim_end_matches('/').to_string())
    }

    /// HIGH for Pro-tier models, disabled for Flash-tier models, unless the tenant overrode it.
    fn effective_thinking_level(&self, model: &str, override_level: Option<ThinkingLevel>) -> Option<&'static str> {
        if let Some(level) = override_level {
            return Some(thinking_level_wire(level));
        }
        if model.contains("pro") {
            Some("HIGH")
        } else {
            None
        }
    }

    fn build_body(&self, params: &GenerateParams, model: &str) -> Value {
        let mut contents = Vec::new();
        for turn in &params.history {
            let role = match &turn.role {
                Role::User | Role::Tool { .. } => "user",
                Role::Assistant | Role::System => "model",
            };
            contents.push(json!({"role": role, "parts": [{"text": turn.content}]}));
        }
        contents.push(json!({"role": "user", "parts": [{"text": params.user_input}]}));

        let mut body = json!({ "contents": contents });

        if let Some(system) = &params.system_instructions {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        let mut generation_config = json!({});
        if let Some(temp) = params.config.temperature {
            generation_config["temperature"] = json!(temp);
        }
        if let Some(top_p) = params.config.top_p {
            generation_config["topP"] = json!(top_p);
        }
        if let Some(max_tokens) = params.config.max_output_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }

        if params.features.enable_structured_output {
            generation_config["responseMimeType"] = json!("application/json");
            generation_config["responseJsonSchema"] = structured_output_schema();
        }

        let options = ProviderOptions::from_map(&params.config.extra_options);
        if let Some(level) = self.effective_thinking_level(model, options.thinking_level) {
            generation_config["thinkingConfig"] = json!({
                "thinkingLevel": level,
                "includeThoughts": options.include_thoughts.unwrap_or(false),
            });
        }

        if !generation_config.as_object().unwrap().is_empty() {
            body["generationConfig"] = generation_config;
        }

        if let Some(threshold) = options.safety_threshold {
            let wire_threshold = safety_threshold_wire(threshold);
            body["safetySettings"] = json!(GEMINI_HARM_CATEGORIES
                .iter()
                .map(|category| json!({"category": category, "threshold": wire_threshold}))
                .collect::<Vec<_>>());
        }

        // Google Search grounding and file search are mutually exclusive in the same request;
        // file search (via the tenant's configured store) takes priority when both are set.
        if let Some(store_id) = &params.features.enable_file_search {
            body["tools"] = json!([{"fileSearch": {"fileSearchStoreNames": [store_id]}}]);
        } else if params.features.enable_web_search {
            body["tools"] = json!([{"googleSearch": {}}]);
        }
        if params.features.enable_code_execution {
            let existing = body["tools"].as_array().cloned().unwrap_or_default();
            let mut tools = existing;
            tools.push(json!({"codeExecution": {}}));
            body["tools"] = json!(tools);
        }

        body
    }

    fn parse_result(&self, model: &str, body: &Value, structured_requested: bool) -> GenerateResult {
        let candidate = &body["candidates"][0];
        let parts = candidate["content"]["parts"].as_array().cloned().unwrap_or_default();

        let mut text_parts = Vec::new();
        let mut code_executions = Vec::new();
        for part in &parts {
            if let Some(t) = part["text"].as_str() {
                text_parts.push(t.to_string());
            }
            if let Some(code) = part["executableCode"]["code"].as_str() {
                code_executions.push(CodeExecutionRecord {
                    code: code.to_string(),
                    language: part["executableCode"]["language"].as_str().unwrap_or("").to_string(),
                    stdout: String::new(),
                    exit_code: 0,
                });
            }
            if let Some(stdout) = part["codeExecutionResult"]["output"].as_str() {
                if let Some(last) = code_executions.last_mut() {
                    last.stdout = stdout.to_string();
                }
            }
        }
        let text = text_parts.join("");

        let structured_metadata = if structured_requested {
            serde_json::from_str::<Value>(&text).ok().map(|v| StructuredMetadata {
                intent: v["intent"].as_str().map(|s| s.to_string()),
                entities: v["entities"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|e| {
                                Some((e["name"].as_str()?.to_string(), e["type"].as_str()?.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
                topics: v["topics"]
                    .as_array()
                    .map(|arr| arr.iter().filter_map(|t| t.as_str().map(|s| s.to_string())).collect())
                    .unwrap_or_default(),
                scheduling_signal: v["scheduling_intent"].as_str().map(|s| s.to_string()),
            })
            // When structured output is requested but the response does not parse as JSON, the
            // adapter returns the raw text with no metadata (§4.9).
        } else {
            None
        };

        let usage = TokenUsage {
            input_tokens: body["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
            output_tokens: body["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
            total_tokens: body["usageMetadata"]["totalTokenCount"].as_u64().unwrap_or(0),
            cached_tokens: body["usageMetadata"]["cachedContentTokenCount"].as_u64().unwrap_or(0),
            reasoning_tokens: body["usageMetadata"]["thoughtsTokenCount"].as_u64().unwrap_or(0),
        };

        GenerateResult {
            text,
            usage,
            model: model.to_string(),
            citations: Vec::new(),
            response_id: None,
            tool_calls: Vec::new(),
            code_executions,
            structured_metadata,
            raw_request: None,
            raw_response: Some(body.clone()),
        }
    }
}

/// The fixed, provider-agnostic intent/entity extraction schema, expressed as Gemini's
/// `responseJsonSchema` shape.
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
                    "properties": {"name": {"type": "string"}, "type": {"type": "string"}},
                    "required": ["name", "type"]
                }
            },
            "topics": {"type": "array", "items": {"type": "string"}},
            "scheduling_intent": {"type": "string"}
        },
        "required": ["reply", "intent", "requires_user_action", "entities", "topics", "scheduling_intent"]
    })
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            file_search: true,
            web_search: true,
            native_continuity: false,
            streaming: true,
        }
    }

    async fn generate(&self, params: GenerateParams) -> Result<GenerateResult, String> {
        let base_url = self.base_url(&params.config)?;
        let model = params.config.model_override.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let structured = params.features.enable_structured_output;
        let body = self.build_body(&params, &model);
        let api_key = params.config.api_key.clone();
        let url = format!("{}/models/{}:generateContent", base_url, model);

        let response_body = run_with_retry(
            |_attempt| {
                let client = shared_http_client();
                let url = url.clone();
                let api_key = api_key.clone();
                let body = body.clone();
                async move {
                    let resp = client
                        .post(&url)
                        .header("x-goog-api-key", &api_key)
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

        let mut result = self.parse_result(&model, &response_body, structured);
        result.raw_request = Some(body);
        Ok(result)
    }

    async fn generate_stream(&self, params: GenerateParams) -> Result<ChunkStream, String> {
        let base_url = self.base_url(&params.config)?;
        let model = params.config.model_override.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let body = self.build_body(&params, &model);
        let api_key = params.config.api_key.clone();
        let url = format!("{}/models/{}:streamGenerateContent?alt=sse", base_url, model);

        let client = shared_http_client();
        let resp = client
            .post(&url)
            .header("x-goog-api-key", &api_key)
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
                                    let chunk = decode_gemini_event(&event, &model_owned);
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

    /// Uploads to the Files API, imports the upload into the named FileSearchStore, then
    /// deletes the Files API copy — the workaround for document formats the store's direct
    /// import endpoint refuses (§4.9). The Files API copy is deleted whether or not the import
    /// itself succeeded, so a failed import never leaves an orphaned upload behind.
    async fn upload_to_file_search_store(
        &self,
        config: &ProviderRequestConfig,
        store_id: &str,
        bytes: Vec<u8>,
        filename: &str,
        mime_type: &str,
    ) -> Result<(), String> {
        let base_url = self.base_url(config)?;
        let api_key = config.api_key.clone();
        let client = shared_http_client();

        let part = multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime_type)
            .map_err(|e| e.to_string())?;
        let form = multipart::Form::new()
            .text("metadata", json!({"file": {"display_name": filename}}).to_string())
            .part("file", part);

        let resp = client
            .post(format!("{}/files", base_url))
            .header("x-goog-api-key", &api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("{} {}", status.as_u16(), text));
        }
        let uploaded: Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
        let file_name = extract_uploaded_file_name(&uploaded)?;

        let import_resp = client
            .post(format!("{}/{}:importFile", base_url, store_id))
            .header("x-goog-api-key", &api_key)
            .json(&import_file_body(&file_name))
            .send()
            .await
            .map_err(|e| e.to_string());

        let _ = client
            .delete(format!("{}/{}", base_url, file_name))
            .header("x-goog-api-key", &api_key)
            .send()
            .await;

        let import_resp = import_resp?;
        let import_status = import_resp.status();
        if !import_status.is_success() {
            let import_text = import_resp.text().await.unwrap_or_default();
            return Err(format!("{} {}", import_status.as_u16(), import_text));
        }
        Ok(())
    }
}

fn decode_gemini_event(event: &super::common::SseEvent, model: &str) -> Result<StreamChunk, String> {
    let value: Value = serde_json::from_str(&event.data).map_err(|e| e.to_string())?;
    let candidate = &value["candidates"][0];
    let finish_reason = candidate["finishReason"].as_str();
    let parts = candidate["content"]["parts"].as_array().cloned().unwrap_or_default();
    let text: String = parts.iter().filter_map(|p| p["text"].as_str()).collect();

    if finish_reason.is_some() {
        return Ok(StreamChunk::Complete {
            usage: TokenUsage {
                input_tokens: value["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
                output_tokens: value["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
                total_tokens: value["usageMetadata"]["totalTokenCount"].as_u64().unwrap_or(0),
                cached_tokens: value["usageMetadata"]["cachedContentTokenCount"].as_u64().unwrap_or(0),
                reasoning_tokens: value["usageMetadata"]["thoughtsTokenCount"].as_u64().unwrap_or(0),
            },
            model: model.to_string(),
            tool_calls: Vec::new(),
            response_id: None,
            raw_request: None,
            raw_response: Some(value.clone()),
        });
    }
    Ok(StreamChunk::Text { delta: text })
}
