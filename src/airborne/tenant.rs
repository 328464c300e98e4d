//! C3 — tenant registry. In-memory map of tenant configs, read-mostly after start-up.

use crate::airborne::errors::GatewayError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Per-provider credential and defaults owned by a tenant.
#[derive(Debug, Clone)]
pub struct ProviderCredential {
    pub api_key: String,
    pub base_url_override: Option<String>,
    pub default_model: String,
    /// Extra options keyed by string; only the keys enumerated in the design notes
    /// (`safety_threshold`, `thinking_level`, `thinking_budget`, `include_thoughts`) are
    /// interpreted by adapters. Unknown keys are ignored.
    pub extra_options: HashMap<String, String>,
}

/// Image-generation configuration owned by a tenant.
#[derive(Debug, Clone)]
pub struct ImageGenConfig {
    pub enabled: bool,
    pub provider: String,
    pub model: String,
    pub trigger_phrases: Vec<String>,
    pub max_images: u32,
    pub fallback_on_error: bool,
}

impl Default for ImageGenConfig {
    fn default() -> Self {
        ImageGenConfig {
            enabled: false,
            provider: "gemini".to_string(),
            model: String::new(),
            trigger_phrases: Vec::new(),
            max_images: 1,
            fallback_on_error: false,
        }
    }
}

/// Per-tenant rate-limit overrides; zero means "use the engine default for this dimension".
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitOverrides {
    pub rpm: u32,
    pub rpd: u32,
    pub tpm: u32,
}

/// A tenant's full configuration, keyed by its normalized id.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub id: String,
    pub display_name: String,
    /// Ordered provider identifiers; traversed on compatibility match and on retryable failure.
    pub failover: Vec<String>,
    pub providers: HashMap<String, ProviderCredential>,
    pub rate_limits: RateLimitOverrides,
    pub image_gen: ImageGenConfig,
}

impl TenantConfig {
    /// Enforce the invariant: every identifier in `failover` must appear in `providers`.
    pub fn validate(&self) -> Result<(), GatewayError> {
        for provider_id in &self.failover {
            if !self.providers.contains_key(provider_id) {
                return Err(GatewayError::invalid_argument(format!(
                    "tenant '{}' failover list references unconfigured provider '{}'",
                    self.id, provider_id
                )));
            }
        }
        Ok(())
    }
}

/// Normalize a raw tenant id: trim and lowercase.
pub fn normalize_tenant_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Validate a normalized tenant (or store) id against `[A-Za-z0-9][A-Za-z0-9_-]*`, ≤128 chars.
pub fn is_valid_identifier(id: &str) -> bool {
    if id.is_empty() || id.len() > 128 {
        return false;
    }
    let mut chars = id.bytes();
    match chars.next() {
        Some(b) if b.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Outcome of resolving a tenant id.
pub enum ResolveOutcome {
    Found(Arc<TenantConfig>),
    NotFound,
    /// Empty id with more than one tenant configured.
    Required,
}

/// In-memory tenant registry. Read-mostly after start-up; guarded by `RwLock` so concurrent
/// `resolve` calls never block each other.
pub struct TenantRegistry {
    tenants: RwLock<HashMap<String, Arc<TenantConfig>>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        TenantRegistry {
            tenants: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_configs(configs: Vec<TenantConfig>) -> Result<Self, GatewayError> {
        let registry = TenantRegistry::new();
        for config in configs {
            registry.insert(config)?;
        }
        Ok(registry)
    }

    pub fn insert(&self, config: TenantConfig) -> Result<(), GatewayError> {
        config.validate()?;
        let id = normalize_tenant_id(&config.id);
        if !is_valid_identifier(&id) {
            return Err(GatewayError::invalid_argument(format!(
                "invalid tenant id '{}'",
                config.id
            )));
        }
        let mut tenants = config;
        tenants.id = id.clone();
        self.tenants.write().unwrap().insert(id, Arc::new(tenants));
        Ok(())
    }

    /// `Resolve(raw-id) → config | not-found | required`.
    pub fn resolve(&self, raw_id: &str) -> ResolveOutcome {
        let normalized = normalize_tenant_id(raw_id);
        let tenants = self.tenants.read().unwrap();
        if normalized.is_empty() {
            return if tenants.len() == 1 {
                ResolveOutcome::Found(tenants.values().next().unwrap().clone())
            } else {
                ResolveOutcome::Required
            };
        }
        match tenants.get(&normalized) {
            Some(config) => ResolveOutcome::Found(config.clone()),
            None => ResolveOutcome::NotFound,
        }
    }
}

impl Default for TenantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tenant(id: &str) -> TenantConfig {
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
        TenantConfig {
            id: id.to_string(),
            display_name: "Test Tenant".to_string(),
            failover: vec!["openai".to_string()],
            providers,
            rate_limits: RateLimitOverrides::default(),
            image_gen: ImageGenConfig::default(),
        }
    }

    #[test]
    fn rejects_failover_referencing_unconfigured_provider() {
        let mut t = sample_tenant("acme");
        t.failover.push("gemini".to_string());
        assert!(t.validate().is_err());
    }

    #[test]
    fn single_tenant_mode_resolves_empty_id() {
        let registry = TenantRegistry::from_configs(vec![sample_tenant("acme")]).unwrap();
        match registry.resolve("") {
            ResolveOutcome::Found(cfg) => assert_eq!(cfg.id, "acme"),
            _ => panic!("expected single-tenant resolution"),
        }
    }

    #[test]
    fn multi_tenant_mode_requires_explicit_id() {
        let registry =
            TenantRegistry::from_configs(vec![sample_tenant("acme"), sample_tenant("globex")])
                .unwrap();
        assert!(matches!(registry.resolve(""), ResolveOutcome::Required));
    }

    #[test]
    fn normalizes_case_and_whitespace() {
        let registry = TenantRegistry::from_configs(vec![sample_tenant("Acme")]).unwrap();
        match registry.resolve("  ACME  ") {
            ResolveOutcome::Found(cfg) => assert_eq!(cfg.id, "acme"),
            _ => panic!("expected normalized resolution"),
        }
    }

    #[test]
    fn unknown_tenant_not_found() {
        let registry =
            TenantRegistry::from_configs(vec![sample_tenant("acme"), sample_tenant("globex")])
                .unwrap();
        assert!(matches!(registry.resolve("nope"), ResolveOutcome::NotFound));
    }

    #[test]
    fn identifier_validation() {
        assert!(is_valid_identifier("acme-1"));
        assert!(!is_valid_identifier("-acme"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier(&"a".repeat(129)));
    }
}
