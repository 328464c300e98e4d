//! Shared fixtures for the scenario integration tests in this directory: a recording/scriptable
//! `ProviderAdapter` fake and a couple of small tenant builders.

use airborne::airborne::image_gen::{GeneratedImage, ImageGenRequest, ImageGenerator};
use airborne::airborne::provider::{
    Capabilities, ChunkStream, GenerateParams, GenerateResult, ProviderAdapter, TokenUsage,
};
use airborne::airborne::tenant::{ImageGenConfig, ProviderCredential, RateLimitOverrides, TenantConfig};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// What a [`RecordingAdapter`] does when `generate` is called.
#[allow(dead_code)]
pub enum Behavior {
    AlwaysOk,
    AlwaysErr(String),
}

/// A `ProviderAdapter` fake that records every `user_input` it receives and answers according to
/// a fixed, scriptable `Behavior` — either always succeeding or always failing with a given
/// message (so a test can drive C7's retry/failover logic deterministically).
pub struct RecordingAdapter {
    pub name: String,
    pub calls: Mutex<Vec<String>>,
    pub delay: Duration,
    pub behavior: Behavior,
}

#[allow(dead_code)]
impl RecordingAdapter {
    pub fn ok(name: &str) -> Self {
        RecordingAdapter { name: name.to_string(), calls: Mutex::new(Vec::new()), delay: Duration::ZERO, behavior: Behavior::AlwaysOk }
    }

    pub fn ok_after(name: &str, delay: Duration) -> Self {
        RecordingAdapter { name: name.to_string(), calls: Mutex::new(Vec::new()), delay, behavior: Behavior::AlwaysOk }
    }

    pub fn always_failing(name: &str, message: &str) -> Self {
        RecordingAdapter {
            name: name.to_string(),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            behavior: Behavior::AlwaysErr(message.to_string()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn generate(&self, params: GenerateParams) -> Result<GenerateResult, String> {
        self.calls.lock().unwrap().push(params.user_input.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behavior {
            Behavior::AlwaysOk => Ok(GenerateResult {
                text: "ok".to_string(),
                usage: TokenUsage { input_tokens: 5, output_tokens: 5, total_tokens: 10, ..Default::default() },
                model: "fake-model".to_string(),
                citations: Vec::new(),
                response_id: Some("resp-1".to_string()),
                tool_calls: Vec::new(),
                code_executions: Vec::new(),
                structured_metadata: None,
                raw_request: None,
                raw_response: None,
            }),
            Behavior::AlwaysErr(message) => Err(message.clone()),
        }
    }

    async fn generate_stream(&self, _params: GenerateParams) -> Result<ChunkStream, String> {
        Err("streaming not supported by this fake".to_string())
    }
}

/// An `ImageGenerator` fake that echoes the prompt back as a single 1-byte "image".
pub struct FakeImageGenerator {
    pub provider: String,
}

#[async_trait]
impl ImageGenerator for FakeImageGenerator {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn generate(&self, request: &ImageGenRequest) -> Result<Vec<GeneratedImage>, String> {
        Ok(vec![GeneratedImage {
            bytes: vec![0xFF],
            mime_type: "image/jpeg".to_string(),
            width: 1,
            height: 1,
            alt_text: request.prompt.clone(),
        }])
    }
}

/// A single-provider tenant (`openai`), with image generation disabled by default.
#[allow(dead_code)]
pub fn sample_tenant(id: &str, failover: &[&str]) -> TenantConfig {
    let mut providers = HashMap::new();
    for name in failover {
        providers.insert(
            name.to_string(),
            ProviderCredential {
                api_key: "sk-test".to_string(),
                base_url_override: None,
                default_model: "fake-model".to_string(),
                extra_options: HashMap::new(),
            },
        );
    }
    TenantConfig {
        id: id.to_string(),
        display_name: "Test Tenant".to_string(),
        failover: failover.iter().map(|s| s.to_string()).collect(),
        providers,
        rate_limits: RateLimitOverrides::default(),
        image_gen: ImageGenConfig::default(),
    }
}

/// A tenant with image generation enabled against the given provider.
#[allow(dead_code)]
pub fn tenant_with_image_gen(id: &str, image_provider: &str) -> TenantConfig {
    let mut tenant = sample_tenant(id, &["openai"]);
    tenant.providers.insert(
        image_provider.to_string(),
        ProviderCredential {
            api_key: "sk-image-test".to_string(),
            base_url_override: None,
            default_model: String::new(),
            extra_options: HashMap::new(),
        },
    );
    tenant.image_gen = ImageGenConfig {
        enabled: true,
        provider: image_provider.to_string(),
        model: String::new(),
        trigger_phrases: vec!["/image".to_string()],
        max_images: 1,
        fallback_on_error: false,
    };
    tenant
}
