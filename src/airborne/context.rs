//! Per-RPC request context, propagated through every component until the response is emitted.

use crate::airborne::keys::ClientKeyRecord;
use crate::airborne::tenant::TenantConfig;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Validate a request-id / trace-id style token: `[A-Za-z0-9_-]+`, length 1..=max.
pub fn is_valid_token(s: &str, max_len: usize) -> bool {
    if s.is_empty() || s.len() > max_len {
        return false;
    }
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Context threaded through an in-flight RPC.
#[derive(Clone)]
pub struct RequestContext {
    /// Raw credential as presented (never logged).
    pub credential: Arc<str>,
    /// Resolved client key record.
    pub client: Arc<ClientKeyRecord>,
    /// Resolved tenant configuration, once C3 has run.
    pub tenant: Option<Arc<TenantConfig>>,
    /// Validated or generated request id, `[A-Za-z0-9_-]+`, ≤128 chars.
    pub request_id: String,
    /// Trace id propagated from an inbound trace header, or equal to `request_id` if absent.
    pub trace_id: String,
    pub received_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(credential: impl Into<Arc<str>>, client: Arc<ClientKeyRecord>, request_id: String) -> Self {
        let trace_id = request_id.clone();
        RequestContext {
            credential: credential.into(),
            client,
            tenant: None,
            request_id,
            trace_id,
            received_at: Utc::now(),
        }
    }

    pub fn with_tenant(mut self, tenant: Arc<TenantConfig>) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn with_trace_id(mut self, trace_id: String) -> Self {
        self.trace_id = trace_id;
        self
    }
}

/// Validate a caller-supplied request-id, or mint a fresh UUID-shaped one if absent.
pub fn validate_or_generate_request_id(
    raw: Option<&str>,
) -> Result<String, crate::airborne::errors::GatewayError> {
    match raw {
        None => Ok(uuid::Uuid::new_v4().to_string()),
        Some(s) if s.is_empty() => Ok(uuid::Uuid::new_v4().to_string()),
        Some(s) if is_valid_token(s, 128) => Ok(s.to_string()),
        Some(_) => Err(crate::airborne::errors::GatewayError::invalid_argument(
            "request_id must match [A-Za-z0-9_-]+ and be at most 128 characters",
        )),
    }
}
