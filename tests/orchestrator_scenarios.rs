//! Scenarios 1, 2, 3, 5 from the testable-properties list: command-only image generation,
//! mixed-ignore stripping, the multi-tenant missing-tenant-id rejection, and idempotent replay.

mod common;

use airborne::airborne::auth::AuthMiddleware;
use airborne::airborne::errors::GatewayError;
use airborne::airborne::keys::InMemoryKeyRepository;
use airborne::airborne::orchestrator::{ChatOrchestrator, GenerateOutcome, GenerateRequest, InMemoryIdempotencyBackend};
use airborne::airborne::persistence::InMemoryPersistence;
use airborne::airborne::provider::ProviderAdapter;
use airborne::airborne::rate_limit::{InMemoryCounterBackend, RateLimiter};
use airborne::airborne::tenant::TenantRegistry;
use common::{sample_tenant, tenant_with_image_gen, FakeImageGenerator, RecordingAdapter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn orchestrator_with(
    provider: Arc<RecordingAdapter>,
    image_generators: HashMap<String, Arc<dyn airborne::airborne::image_gen::ImageGenerator>>,
) -> (ChatOrchestrator<InMemoryCounterBackend>, Arc<InMemoryPersistence>) {
    let mut providers: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
    providers.insert(provider.name.clone(), provider);
    let persistence = Arc::new(InMemoryPersistence::new());
    let orchestrator = ChatOrchestrator {
        providers,
        rate_limiter: Arc::new(RateLimiter::new(InMemoryCounterBackend::new(), "test-orch").disabled(true)),
        persistence: persistence.clone() as Arc<dyn airborne::airborne::persistence::PersistenceCollaborator>,
        idempotency: Arc::new(InMemoryIdempotencyBackend::new()),
        image_generators,
        rag: None,
    };
    (orchestrator, persistence)
}

#[tokio::test]
async fn command_only_image_skips_the_provider_and_persistence() {
    let provider = Arc::new(RecordingAdapter::ok("openai"));
    let mut image_generators: HashMap<String, Arc<dyn airborne::airborne::image_gen::ImageGenerator>> = HashMap::new();
    image_generators.insert("gemini".to_string(), Arc::new(FakeImageGenerator { provider: "gemini".to_string() }));
    let (orchestrator, persistence) = orchestrator_with(provider.clone(), image_generators);
    let tenant = tenant_with_image_gen("acme", "gemini");

    let req = GenerateRequest {
        tenant_id: "acme".to_string(),
        thread_id: "thread-1".to_string(),
        user_id: "user-1".to_string(),
        user_input: "/image a red cube".to_string(),
        image_triggers: vec!["/image".to_string()],
        request_id: Some("req-1".to_string()),
        ..Default::default()
    };

    let outcome = orchestrator.generate(req, &tenant).await.unwrap();
    let response = match outcome {
        GenerateOutcome::Fresh(r) => r,
        GenerateOutcome::Cached(_) => panic!("expected a fresh response"),
    };

    assert_eq!(response.text, "");
    assert_eq!(response.images.len(), 1);
    assert_eq!(response.images[0].alt_text, "a red cube");
    assert!(provider.calls.lock().unwrap().is_empty(), "no LLM call should happen for an image-only turn");
    assert!(persistence.turns_for("thread-1").is_empty(), "no assistant text turn should be persisted");
}

#[tokio::test]
async fn mixed_ignore_strips_the_tagged_line_before_reaching_the_provider() {
    let provider = Arc::new(RecordingAdapter::ok("openai"));
    let (orchestrator, _persistence) = orchestrator_with(provider.clone(), HashMap::new());
    let tenant = sample_tenant("acme", &["openai"]);

    let req = GenerateRequest {
        tenant_id: "acme".to_string(),
        thread_id: "thread-1".to_string(),
        user_id: "user-1".to_string(),
        user_input: "Hello\n/ignore secret\nWorld".to_string(),
        request_id: Some("req-2".to_string()),
        ..Default::default()
    };

    orchestrator.generate(req, &tenant).await.unwrap();

    let calls = provider.calls.lock().unwrap();
    assert_eq!(calls.as_slice(), ["Hello\nWorld".to_string()]);
}

#[tokio::test]
async fn multi_tenant_missing_tenant_id_is_rejected_before_any_provider_call() {
    let keys = airborne::airborne::keys::KeyStore::new(InMemoryKeyRepository::new());
    let limiter = RateLimiter::new(InMemoryCounterBackend::new(), "test-auth");
    let tenants = Arc::new(
        TenantRegistry::from_configs(vec![sample_tenant("acme", &["openai"]), sample_tenant("globex", &["openai"])]).unwrap(),
    );
    let middleware = AuthMiddleware::new(keys, limiter, tenants);

    let (cleartext, _) = middleware
        .keys
        .issue_key(
            "agent",
            [airborne::airborne::keys::Permission::Chat].into_iter().collect(),
            Default::default(),
            None,
            HashMap::new(),
        )
        .unwrap();
    let header = format!("Bearer {}", cleartext);
    let context = middleware.authenticate(Some(&header), None, "req-3".to_string()).await.unwrap();

    let err = middleware.resolve_tenant(context, "").unwrap_err();
    assert_eq!(err.kind(), "invalid-argument");
    assert!(matches!(err, GatewayError::InvalidArgument(msg) if msg.contains("required")));
}

#[tokio::test]
async fn idempotent_replay_conflicts_then_serves_the_cached_response() {
    let provider = Arc::new(RecordingAdapter::ok_after("openai", Duration::from_millis(300)));
    let (orchestrator, _persistence) = orchestrator_with(provider.clone(), HashMap::new());
    let orchestrator = Arc::new(orchestrator);
    let tenant = sample_tenant("acme", &["openai"]);

    let build_req = || GenerateRequest {
        tenant_id: "acme".to_string(),
        thread_id: "thread-1".to_string(),
        user_id: "user-1".to_string(),
        user_input: "hello".to_string(),
        request_id: Some("req-dup".to_string()),
        ..Default::default()
    };

    let first_orchestrator = orchestrator.clone();
    let first_tenant = tenant.clone();
    let first = tokio::spawn(async move { first_orchestrator.generate(build_req(), &first_tenant).await });

    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = orchestrator.generate(build_req(), &tenant).await;
    assert!(matches!(second, Err(GatewayError::Conflict(_))), "a duplicate in-flight request must conflict");

    let first_result = first.await.unwrap();
    assert!(first_result.is_ok(), "the original in-flight request must still succeed");

    let third = orchestrator.generate(build_req(), &tenant).await.unwrap();
    match third {
        GenerateOutcome::Cached(cached) => assert_eq!(cached.text, "ok"),
        GenerateOutcome::Fresh(_) => panic!("expected the replayed request to be served from the idempotency cache"),
    }

    assert_eq!(provider.call_count(), 1, "the provider must only ever be invoked once across the whole replay");
}
