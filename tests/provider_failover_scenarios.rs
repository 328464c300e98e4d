//! Scenario 6: a tenant configured with failover `[openai, gemini]` whose openai credential
//! always fails with a retryable error. C7 exhausts its 3-attempt budget against openai, then the
//! orchestrator falls over to gemini; the response carries `provider=gemini`.

mod common;

use airborne::airborne::orchestrator::{ChatOrchestrator, GenerateOutcome, GenerateRequest, InMemoryIdempotencyBackend};
use airborne::airborne::persistence::InMemoryPersistence;
use airborne::airborne::provider::ProviderAdapter;
use airborne::airborne::rate_limit::{InMemoryCounterBackend, RateLimiter};
use airborne::airborne::retry::CancellationFlag;
use common::{sample_tenant, RecordingAdapter};
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn openai_exhausting_retries_falls_over_to_gemini() {
    let openai = Arc::new(RecordingAdapter::always_failing("openai", "503 overloaded, service unavailable"));
    let gemini = Arc::new(RecordingAdapter::ok("gemini"));

    let mut providers: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
    providers.insert("openai".to_string(), openai.clone());
    providers.insert("gemini".to_string(), gemini.clone());

    let orchestrator = ChatOrchestrator {
        providers,
        rate_limiter: Arc::new(RateLimiter::new(InMemoryCounterBackend::new(), "test-failover").disabled(true)),
        persistence: Arc::new(InMemoryPersistence::new()) as Arc<dyn airborne::airborne::persistence::PersistenceCollaborator>,
        idempotency: Arc::new(InMemoryIdempotencyBackend::new()),
        image_generators: HashMap::new(),
        rag: None,
    };

    let tenant = sample_tenant("acme", &["openai", "gemini"]);
    let req = GenerateRequest {
        tenant_id: "acme".to_string(),
        thread_id: "thread-1".to_string(),
        user_id: "user-1".to_string(),
        user_input: "hello".to_string(),
        request_id: Some("req-failover".to_string()),
        ..Default::default()
    };

    let outcome = orchestrator.generate(req, &tenant).await.unwrap();
    let response = match outcome {
        GenerateOutcome::Fresh(r) => r,
        GenerateOutcome::Cached(_) => panic!("expected a fresh response"),
    };

    assert_eq!(response.provider, "gemini");
    assert_eq!(openai.call_count(), 3, "C7 should exhaust all 3 attempts against openai before giving up on it");
    assert_eq!(gemini.call_count(), 1, "gemini should be tried exactly once after openai's budget is exhausted");
}

#[tokio::test]
async fn every_candidate_exhausted_is_unavailable() {
    let openai = Arc::new(RecordingAdapter::always_failing("openai", "503 overloaded"));
    let gemini = Arc::new(RecordingAdapter::always_failing("gemini", "rate limit exceeded"));

    let mut providers: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
    providers.insert("openai".to_string(), openai.clone());
    providers.insert("gemini".to_string(), gemini.clone());

    let orchestrator = ChatOrchestrator {
        providers,
        rate_limiter: Arc::new(RateLimiter::new(InMemoryCounterBackend::new(), "test-failover-2").disabled(true)),
        persistence: Arc::new(InMemoryPersistence::new()) as Arc<dyn airborne::airborne::persistence::PersistenceCollaborator>,
        idempotency: Arc::new(InMemoryIdempotencyBackend::new()),
        image_generators: HashMap::new(),
        rag: None,
    };

    let tenant = sample_tenant("acme", &["openai", "gemini"]);
    let req = GenerateRequest {
        tenant_id: "acme".to_string(),
        thread_id: "thread-1".to_string(),
        user_id: "user-1".to_string(),
        user_input: "hello".to_string(),
        request_id: Some("req-failover-2".to_string()),
        ..Default::default()
    };

    let err = orchestrator.generate(req, &tenant).await.unwrap_err();
    assert_eq!(err.kind(), "unavailable");
    assert_eq!(openai.call_count(), 3);
    assert_eq!(gemini.call_count(), 3);
}

#[tokio::test]
async fn cancelled_request_does_not_fall_over_to_the_next_candidate() {
    let openai = Arc::new(RecordingAdapter::always_failing("openai", "503 overloaded"));
    let gemini = Arc::new(RecordingAdapter::ok("gemini"));

    let mut providers: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
    providers.insert("openai".to_string(), openai.clone());
    providers.insert("gemini".to_string(), gemini.clone());

    let orchestrator = ChatOrchestrator {
        providers,
        rate_limiter: Arc::new(RateLimiter::new(InMemoryCounterBackend::new(), "test-failover-3").disabled(true)),
        persistence: Arc::new(InMemoryPersistence::new()) as Arc<dyn airborne::airborne::persistence::PersistenceCollaborator>,
        idempotency: Arc::new(InMemoryIdempotencyBackend::new()),
        image_generators: HashMap::new(),
        rag: None,
    };

    let cancelled = CancellationFlag::new();
    cancelled.cancel();

    let tenant = sample_tenant("acme", &["openai", "gemini"]);
    let req = GenerateRequest {
        tenant_id: "acme".to_string(),
        thread_id: "thread-1".to_string(),
        user_id: "user-1".to_string(),
        user_input: "hello".to_string(),
        request_id: Some("req-failover-3".to_string()),
        cancelled,
        ..Default::default()
    };

    let err = orchestrator.generate(req, &tenant).await.unwrap_err();
    assert_eq!(openai.call_count(), 0, "a pre-cancelled request must not even try the first candidate");
    assert_eq!(gemini.call_count(), 0, "a cancelled failover loop must not fall over to the next candidate");
    assert_eq!(err.kind(), "deadline-exceeded");
}
