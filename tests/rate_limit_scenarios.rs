//! Scenario 4: a client with `rpm=10` sends 11 requests in quick succession through the auth
//! middleware; the first 10 succeed and the 11th is rejected `resource-exhausted`.

mod common;

use airborne::airborne::auth::AuthMiddleware;
use airborne::airborne::errors::GatewayError;
use airborne::airborne::keys::{InMemoryKeyRepository, KeyLimits, KeyStore, Permission};
use airborne::airborne::rate_limit::{InMemoryCounterBackend, RateLimiter};
use airborne::airborne::tenant::TenantRegistry;
use common::sample_tenant;
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn burst_of_eleven_with_rpm_ten_denies_only_the_eleventh() {
    let keys = KeyStore::new(InMemoryKeyRepository::new());
    let limiter = RateLimiter::new(InMemoryCounterBackend::new(), "test-rl");
    let tenants = Arc::new(TenantRegistry::from_configs(vec![sample_tenant("acme", &["openai"])]).unwrap());
    let middleware = AuthMiddleware::new(keys, limiter, tenants);

    let limits = KeyLimits { requests_per_minute: 10, requests_per_day: 10_000, tokens_per_minute: 0 };
    let (cleartext, _) = middleware
        .keys
        .issue_key("agent", [Permission::Chat].into_iter().collect(), limits, None, HashMap::new())
        .unwrap();
    let header = format!("Bearer {}", cleartext);

    let mut outcomes = Vec::new();
    for i in 0..11 {
        let request_id = format!("req-{}", i);
        outcomes.push(middleware.authenticate(Some(&header), None, request_id).await);
    }

    for (i, outcome) in outcomes.iter().take(10).enumerate() {
        assert!(outcome.is_ok(), "request {} should have been allowed", i);
    }
    let eleventh = outcomes.into_iter().nth(10).unwrap();
    let err = eleventh.unwrap_err();
    assert_eq!(err.kind(), "resource-exhausted");
    assert!(matches!(err, GatewayError::ResourceExhausted(_)));
}
