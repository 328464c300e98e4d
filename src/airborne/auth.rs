//! C4 — auth middleware. Extract credential → client identity → tenant → context.
//!
//! Generalizes the teacher's single-process auth checks into the five-step pipeline in §4.4:
//! extract credential, validate against C2, check C1, resolve tenant via C3, tag the context.
//! The stream variant caches its resolved tenant behind a `Mutex` so a concurrent reader of the
//! stream's context never observes a half-initialized tenant while the first message is still
//! being read.

use crate::airborne::context::RequestContext;
use crate::airborne::errors::GatewayError;
use crate::airborne::keys::{ClientKeyRecord, KeyRepository, KeyStore, Permission, ValidateOutcome};
use crate::airborne::rate_limit::{CounterBackend, LimitOutcome, RateLimiter};
use crate::airborne::tenant::{ResolveOutcome, TenantRegistry};
use std::sync::{Arc, Mutex};

/// RPC methods this middleware treats as a no-op: health, readiness, version, file-store CRUD.
pub const ALLOW_LIST: &[&str] = &["health", "readiness", "version", "files.get", "files.put", "files.delete"];

pub fn is_allow_listed(method: &str) -> bool {
    ALLOW_LIST.contains(&method)
}

/// Extract the bearer token from `authorization` (stripping the `Bearer ` prefix), falling back
/// to `x-api-key`. Neither present is `unauthenticated`.
pub fn extract_credential(
    authorization: Option<&str>,
    x_api_key: Option<&str>,
) -> Result<String, GatewayError> {
    if let Some(value) = authorization {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }
    }
    if let Some(key) = x_api_key {
        if !key.is_empty() {
            return Ok(key.to_string());
        }
    }
    Err(GatewayError::unauthenticated("missing credential"))
}

/// Constant-time comparison against a configured static secret, for the static-token variant.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    use sha2::{Digest, Sha256};
    use subtle::ConstantTimeEq;
    let ha = Sha256::digest(a.as_bytes());
    let hb = Sha256::digest(b.as_bytes());
    ha.ct_eq(&hb).into()
}

/// Synthesize the client record a static-token credential resolves to: full permissions.
pub fn static_token_client_record(client_id: impl Into<String>) -> ClientKeyRecord {
    use std::collections::{HashMap, HashSet};
    let mut permissions = HashSet::new();
    permissions.insert(Permission::Chat);
    permissions.insert(Permission::ChatStream);
    permissions.insert(Permission::Files);
    permissions.insert(Permission::Admin);
    ClientKeyRecord {
        key_id: "static".to_string(),
        secret_hash: String::new(),
        client_id: client_id.into(),
        name: "static-token".to_string(),
        permissions,
        limits: Default::default(),
        created_at: chrono::Utc::now(),
        expires_at: None,
        last_used_at: None,
        metadata: HashMap::new(),
    }
}

/// The auth middleware: holds the collaborators needed to run the five-step pipeline.
pub struct AuthMiddleware<R: KeyRepository, B: CounterBackend> {
    pub keys: KeyStore<R>,
    pub rate_limiter: RateLimiter<B>,
    pub tenants: Arc<TenantRegistry>,
    pub static_token: Option<String>,
}

impl<R: KeyRepository, B: CounterBackend> AuthMiddleware<R, B> {
    pub fn new(keys: KeyStore<R>, rate_limiter: RateLimiter<B>, tenants: Arc<TenantRegistry>) -> Self {
        AuthMiddleware { keys, rate_limiter, tenants, static_token: None }
    }

    pub fn with_static_token(mut self, token: impl Into<String>) -> Self {
        self.static_token = Some(token.into());
        self
    }

    /// Steps 1-3: credential extraction, C2 validation, C1 check. Does not resolve a tenant —
    /// callers needing one must call `resolve_tenant` once the request field or first stream
    /// message is known.
    pub async fn authenticate(
        &self,
        authorization: Option<&str>,
        x_api_key: Option<&str>,
        request_id: String,
    ) -> Result<RequestContext, GatewayError> {
        let credential = extract_credential(authorization, x_api_key)?;

        let client = if let Some(token) = &self.static_token {
            if constant_time_eq(&credential, token) {
                static_token_client_record("static-admin")
            } else {
                return Err(GatewayError::unauthenticated("invalid credential"));
            }
        } else {
            match self.keys.validate(&credential) {
                ValidateOutcome::Valid(record) => record,
                ValidateOutcome::Expired => return Err(GatewayError::unauthenticated("credential expired")),
                ValidateOutcome::Invalid | ValidateOutcome::NotFound | ValidateOutcome::Corrupted(_) => {
                    return Err(GatewayError::unauthenticated("invalid credential"));
                }
            }
        };

        let rpm = client.limits.requests_per_minute;
        let rpd = client.limits.requests_per_day;
        let outcome = self.rate_limiter.allow(&client.client_id, 0, 0, rpm, rpd).await;
        if outcome == LimitOutcome::Denied {
            return Err(GatewayError::resource_exhausted("rate limit exceeded"));
        }

        Ok(RequestContext::new(credential, Arc::new(client), request_id))
    }

    /// Step 4-5: resolve the tenant from the caller-supplied raw id and tag the context.
    pub fn resolve_tenant(
        &self,
        context: RequestContext,
        raw_tenant_id: &str,
    ) -> Result<RequestContext, GatewayError> {
        match self.tenants.resolve(raw_tenant_id) {
            ResolveOutcome::Found(tenant) => Ok(context.with_tenant(tenant)),
            ResolveOutcome::NotFound => Err(GatewayError::not_found(format!(
                "unknown tenant '{}'",
                raw_tenant_id
            ))),
            ResolveOutcome::Required => Err(GatewayError::invalid_argument(
                "tenant id is required when more than one tenant is configured",
            )),
        }
    }
}

/// Caches a stream's resolved tenant behind a mutex: the wrapper's `Context()`-equivalent
/// accessor may run concurrently with the task still reading the stream's first message.
pub struct StreamTenantCache {
    resolved: Mutex<Option<RequestContext>>,
}

impl StreamTenantCache {
    pub fn new() -> Self {
        StreamTenantCache { resolved: Mutex::new(None) }
    }

    /// Called once, from the task reading the first stream message.
    pub fn set(&self, context: RequestContext) {
        *self.resolved.lock().unwrap() = Some(context);
    }

    /// Safe to call concurrently with `set` from another task; returns `None` until the first
    /// message has been resolved.
    pub fn get(&self) -> Option<RequestContext> {
        self.resolved.lock().unwrap().clone()
    }
}

impl Default for StreamTenantCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::airborne::keys::InMemoryKeyRepository;
    use crate::airborne::rate_limit::InMemoryCounterBackend;
    use crate::airborne::tenant::{ProviderCredential, RateLimitOverrides, TenantConfig};
    use std::collections::HashMap;

    #[test]
    fn is_allow_listed_covers_health_and_file_crud() {
        assert!(is_allow_listed("health"));
        assert!(is_allow_listed("files.put"));
        assert!(!is_allow_listed("chat"));
    }

    #[test]
    fn extract_credential_prefers_bearer_then_falls_back() {
        assert_eq!(extract_credential(Some("Bearer abc"), None).unwrap(), "abc");
        assert_eq!(extract_credential(None, Some("abc")).unwrap(), "abc");
        assert!(extract_credential(None, None).is_err());
        assert!(extract_credential(Some("Basic abc"), None).is_err());
    }

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "other"));
    }

    fn middleware() -> AuthMiddleware<InMemoryKeyRepository, InMemoryCounterBackend> {
        let keys = KeyStore::new(InMemoryKeyRepository::new());
        let limiter = RateLimiter::new(InMemoryCounterBackend::new(), "test-auth");
        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderCredential {
                api_key: "sk-test".to_string(),
                base_url_override: None,
                default_model: "gpt-4.1-mini".to_string(),
                extra_options: HashMap::new(),
            },
        );
        let tenant = TenantConfig {
            id: "acme".to_string(),
            display_name: "Acme".to_string(),
            failover: vec!["openai".to_string()],
            providers,
            rate_limits: RateLimitOverrides::default(),
            image_gen: Default::default(),
        };
        let tenants = Arc::new(TenantRegistry::from_configs(vec![tenant]).unwrap());
        AuthMiddleware::new(keys, limiter, tenants)
    }

    #[tokio::test]
    async fn missing_credential_is_unauthenticated() {
        let mw = middleware();
        let err = mw.authenticate(None, None, "r1".to_string()).await.unwrap_err();
        assert_eq!(err.kind(), "unauthenticated");
    }

    #[tokio::test]
    async fn valid_key_authenticates_and_resolves_tenant() {
        let mw = middleware();
        let (cleartext, _) = mw
            .keys
            .issue_key(
                "agent",
                [Permission::Chat].into_iter().collect(),
                Default::default(),
                None,
                HashMap::new(),
            )
            .unwrap();
        let header = format!("Bearer {}", cleartext);
        let ctx = mw.authenticate(Some(&header), None, "r1".to_string()).await.unwrap();
        let ctx = mw.resolve_tenant(ctx, "acme").unwrap();
        assert_eq!(ctx.tenant.unwrap().id, "acme");
    }

    #[tokio::test]
    async fn static_token_mode_synthesizes_admin_client() {
        let mw = middleware().with_static_token("shared-secret");
        let ctx = mw
            .authenticate(Some("Bearer shared-secret"), None, "r1".to_string())
            .await
            .unwrap();
        assert!(ctx.client.has_permission(Permission::Admin));
    }

    #[test]
    fn stream_tenant_cache_starts_empty() {
        let cache = StreamTenantCache::new();
        assert!(cache.get().is_none());
    }
}
