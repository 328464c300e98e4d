//! Gateway binary entry point. Wires config, logging, the tenant registry, the key store, the
//! rate limiter, the provider adapters, and (optionally) RAG collaborators into the axum router
//! and serves it.
//!
//! Tenant and credential provisioning here is intentionally minimal — a single tenant built
//! from the standard `<PROVIDER>_API_KEY` environment variables, plus a bootstrap admin key
//! logged once at start-up. A real deployment's tenant store and key issuance flow are external
//! collaborators (see `config.rs`'s own note on config-file loading being out of scope).

use airborne::airborne::auth::AuthMiddleware;
use airborne::airborne::config::{GatewayConfig, StartupMode};
use airborne::airborne::image_gen::{GeminiImageGenerator, ImageGenerator, OpenAiImageGenerator};
use airborne::airborne::keys::{InMemoryKeyRepository, KeyStore, Permission};
use airborne::airborne::orchestrator::{
    ChatOrchestrator, InMemoryIdempotencyBackend, RagCollaborators, RedisIdempotencyBackend,
};
use airborne::airborne::persistence::InMemoryPersistence;
use airborne::airborne::provider::compat::{known_profiles, CompatAdapter};
use airborne::airborne::provider::anthropic::AnthropicAdapter;
use airborne::airborne::provider::gemini::GeminiAdapter;
use airborne::airborne::provider::openai::OpenAiAdapter;
use airborne::airborne::provider::ProviderAdapter;
use airborne::airborne::rag::embedder::HttpEmbedder;
use airborne::airborne::rag::vector_store::QdrantStore;
use airborne::airborne::rate_limit::RedisCounterBackend;
use airborne::airborne::tenant::{ImageGenConfig, ProviderCredential, RateLimitOverrides, TenantConfig, TenantRegistry};
use airborne::server::{build_router, AppState};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;

/// Read `<PREFIX>_API_KEY` and register the provider under `name` in both the tenant's
/// credential map and its failover list, if the key is present.
fn register_provider(
    providers: &mut HashMap<String, ProviderCredential>,
    failover: &mut Vec<String>,
    name: &str,
    env_var: &str,
    default_model: &str,
) {
    if let Ok(api_key) = env::var(env_var) {
        if !api_key.is_empty() {
            providers.insert(
                name.to_string(),
                ProviderCredential {
                    api_key,
                    base_url_override: None,
                    default_model: default_model.to_string(),
                    extra_options: HashMap::new(),
                },
            );
            failover.push(name.to_string());
        }
    }
}

fn bootstrap_tenant() -> TenantConfig {
    let mut providers = HashMap::new();
    let mut failover = Vec::new();
    register_provider(&mut providers, &mut failover, "openai", "OPENAI_API_KEY", "gpt-4.1-mini");
    register_provider(&mut providers, &mut failover, "anthropic", "ANTHROPIC_API_KEY", "claude-sonnet-4-0");
    register_provider(&mut providers, &mut failover, "gemini", "GEMINI_API_KEY", "gemini-2.5-flash");
    for profile in known_profiles() {
        register_provider(&mut providers, &mut failover, profile.name, &format!("{}_API_KEY", profile.name.to_uppercase()), profile.default_model);
    }

    let image_gen_enabled = env::var("AIBOX_IMAGE_GEN_ENABLED").as_deref() == Ok("true");
    TenantConfig {
        id: env::var("AIBOX_TENANT_ID").unwrap_or_else(|_| "default".to_string()),
        display_name: env::var("AIBOX_TENANT_NAME").unwrap_or_else(|_| "Default Tenant".to_string()),
        failover,
        providers,
        rate_limits: RateLimitOverrides::default(),
        image_gen: ImageGenConfig { enabled: image_gen_enabled, ..ImageGenConfig::default() },
    }
}

fn build_providers() -> HashMap<String, Arc<dyn ProviderAdapter>> {
    let mut map: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
    map.insert("openai".to_string(), Arc::new(OpenAiAdapter::new()));
    map.insert("anthropic".to_string(), Arc::new(AnthropicAdapter::new()));
    map.insert("gemini".to_string(), Arc::new(GeminiAdapter::new()));
    for profile in known_profiles() {
        map.insert(profile.name.to_string(), Arc::new(CompatAdapter::new(profile)));
    }
    map
}

fn build_image_generators() -> HashMap<String, Arc<dyn ImageGenerator>> {
    let mut map: HashMap<String, Arc<dyn ImageGenerator>> = HashMap::new();
    map.insert("gemini".to_string(), Arc::new(GeminiImageGenerator));
    map.insert("openai".to_string(), Arc::new(OpenAiImageGenerator));
    map
}

/// RAG collaborators, built only when `AIBOX_QDRANT_URL` is configured.
fn build_rag() -> Option<RagCollaborators> {
    let qdrant_url = env::var("AIBOX_QDRANT_URL").ok()?;
    let embedder_url = env::var("AIBOX_EMBEDDER_URL").unwrap_or_else(|_| "http://127.0.0.1:11434".to_string());
    let model = env::var("AIBOX_EMBEDDER_MODEL").unwrap_or_else(|_| "nomic-embed-text".to_string());
    let dims = env::var("AIBOX_EMBEDDER_DIMENSIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .or_else(|| HttpEmbedder::known_dimensions(&model))
        .unwrap_or(768);
    Some(RagCollaborators {
        embedder: Arc::new(HttpEmbedder::new(embedder_url, model, dims)),
        store: Arc::new(QdrantStore::new(qdrant_url)),
    })
}

#[tokio::main]
async fn main() {
    let config = GatewayConfig::from_env();
    config.init_logging();

    let tenant = bootstrap_tenant();
    if tenant.providers.is_empty() {
        log::warn!("no provider API keys configured (set OPENAI_API_KEY/ANTHROPIC_API_KEY/GEMINI_API_KEY/...); chat requests will fail until one is set");
    }
    let tenant_id = tenant.id.clone();
    let tenants = Arc::new(TenantRegistry::from_configs(vec![tenant]).expect("tenant configuration is invalid"));

    let counter_backend = RedisCounterBackend::connect(&config.redis_url())
        .await
        .unwrap_or_else(|e| panic!("failed to connect to redis at {}: {}", config.redis_url(), e));
    let rate_limiter = airborne::airborne::rate_limit::RateLimiter::new(counter_backend, "airborne")
        .disabled(config.startup_mode == StartupMode::Development && env::var("AIBOX_FORCE_RATE_LIMIT").is_err());

    let keys = KeyStore::new(InMemoryKeyRepository::new());
    let mut auth = AuthMiddleware::new(keys, rate_limiter, tenants.clone());
    if let Ok(token) = env::var("AIBOX_STATIC_TOKEN") {
        auth = auth.with_static_token(token);
        log::info!("static-token auth mode enabled");
    } else {
        let mut perms = std::collections::HashSet::new();
        perms.insert(Permission::Chat);
        perms.insert(Permission::ChatStream);
        perms.insert(Permission::Files);
        perms.insert(Permission::Admin);
        let (cleartext, _) = auth
            .keys
            .issue_key("bootstrap-admin", perms, Default::default(), None, HashMap::new())
            .expect("failed to issue bootstrap key");
        log::info!("bootstrap admin key for tenant '{}' (save this, it is shown once): {}", tenant_id, cleartext);
    }

    let idempotency_backend = RedisIdempotencyBackend::connect(&config.redis_url()).await;
    let orchestrator = ChatOrchestrator {
        providers: build_providers(),
        rate_limiter: Arc::new(airborne::airborne::rate_limit::RateLimiter::new(
            RedisCounterBackend::connect(&config.redis_url()).await.expect("redis unavailable for token accounting"),
            "airborne",
        )),
        persistence: Arc::new(InMemoryPersistence::new()),
        idempotency: match idempotency_backend {
            Ok(backend) => Arc::new(backend),
            Err(e) => {
                log::warn!("redis idempotency backend unavailable ({}), falling back to in-memory", e);
                Arc::new(InMemoryIdempotencyBackend::new())
            }
        },
        image_generators: build_image_generators(),
        rag: build_rag(),
    };

    let state = AppState { auth: Arc::new(auth), orchestrator: Arc::new(orchestrator) };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.host)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {}: {}", config.host, e));
    log::info!("airborne gateway listening on {}", config.host);
    axum::serve(listener, router).await.expect("server error");
}
