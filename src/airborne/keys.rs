//! C2 — key store. Issue, persist, validate, list, delete API keys.
//!
//! Cleartext shape: `aibox_sk_<8-char-keyid>_<secret>`, minimum total length 20 (§6). Only the
//! bcrypt hash of the secret is ever persisted.

use crate::airborne::errors::GatewayError;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

pub const KEY_PREFIX: &str = "aibox_sk_";

/// Permissions drawn from `{chat, chat-stream, files, admin}`. `admin` implicitly grants all
/// others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Chat,
    ChatStream,
    Files,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Chat => "chat",
            Permission::ChatStream => "chat-stream",
            Permission::Files => "files",
            Permission::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat" => Some(Permission::Chat),
            "chat-stream" => Some(Permission::ChatStream),
            "files" => Some(Permission::Files),
            "admin" => Some(Permission::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyLimits {
    pub requests_per_minute: u32,
    pub requests_per_day: u32,
    pub tokens_per_minute: u32,
}

/// Persisted client-key record. The bcrypt hash is the only form of the secret ever stored.
#[derive(Debug, Clone)]
pub struct ClientKeyRecord {
    pub key_id: String,
    pub secret_hash: String,
    pub client_id: String,
    pub name: String,
    pub permissions: HashSet<Permission>,
    pub limits: KeyLimits,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

impl ClientKeyRecord {
    pub fn has_permission(&self, perm: Permission) -> bool {
        self.permissions.contains(&Permission::Admin) || self.permissions.contains(&perm)
    }

    /// A copy of this record with the hash redacted, for `List` responses.
    pub fn redacted(&self) -> ClientKeyRecord {
        let mut redacted = self.clone();
        redacted.secret_hash = String::new();
        redacted
    }
}

#[derive(Debug)]
pub enum ValidateOutcome {
    Valid(ClientKeyRecord),
    Invalid,
    Expired,
    NotFound,
    /// A corrupted serialized record, tagged with the offending key-id.
    Corrupted(String),
}

fn random_alnum(len: usize) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Parse a cleartext presented credential into `(key_id, secret)`.
fn parse_cleartext(cleartext: &str) -> Option<(String, String)> {
    let rest = cleartext.strip_prefix(KEY_PREFIX)?;
    if cleartext.len() < 20 {
        return None;
    }
    let mut parts = rest.splitn(2, '_');
    let key_id = parts.next()?.to_string();
    let secret = parts.next()?.to_string();
    if key_id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((key_id, secret))
}

/// Storage abstraction so the engine can be scoped per tenant (key prefix includes tenant id)
/// or kept global, and so tests can substitute an in-memory fake.
pub trait KeyRepository: Send + Sync {
    fn get(&self, key_id: &str) -> Option<ClientKeyRecord>;
    fn put(&self, record: ClientKeyRecord);
    fn delete(&self, key_id: &str) -> bool;
    fn list(&self) -> Vec<ClientKeyRecord>;
}

/// In-memory reference implementation; a real deployment backs `KeyRepository` with its own
/// database.
pub struct InMemoryKeyRepository {
    records: RwLock<HashMap<String, ClientKeyRecord>>,
}

impl InMemoryKeyRepository {
    pub fn new() -> Self {
        InMemoryKeyRepository {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryKeyRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRepository for InMemoryKeyRepository {
    fn get(&self, key_id: &str) -> Option<ClientKeyRecord> {
        self.records.read().unwrap().get(key_id).cloned()
    }

    fn put(&self, record: ClientKeyRecord) {
        self.records.write().unwrap().insert(record.key_id.clone(), record);
    }

    fn delete(&self, key_id: &str) -> bool {
        self.records.write().unwrap().remove(key_id).is_some()
    }

    fn list(&self) -> Vec<ClientKeyRecord> {
        self.records.read().unwrap().values().cloned().collect()
    }
}

/// The key store: bcrypt-backed validation in front of a pluggable [`KeyRepository`].
pub struct KeyStore<R: KeyRepository> {
    repository: R,
}

impl<R: KeyRepository> KeyStore<R> {
    pub fn new(repository: R) -> Self {
        KeyStore { repository }
    }

    /// `IssueKey(name, permissions, limits) → (cleartext, record)`.
    pub fn issue_key(
        &self,
        name: impl Into<String>,
        permissions: HashSet<Permission>,
        limits: KeyLimits,
        expires_at: Option<DateTime<Utc>>,
        metadata: HashMap<String, String>,
    ) -> Result<(String, ClientKeyRecord), GatewayError> {
        let key_id = random_alnum(8).to_lowercase();
        let secret = random_alnum(32);
        let cleartext = format!("{}{}_{}", KEY_PREFIX, key_id, secret);
        let secret_hash = bcrypt::hash(&secret, bcrypt::DEFAULT_COST)
            .map_err(|e| GatewayError::internal(format!("bcrypt hash failed: {}", e)))?;

        let record = ClientKeyRecord {
            key_id: key_id.clone(),
            secret_hash,
            client_id: random_alnum(12),
            name: name.into(),
            permissions,
            limits,
            created_at: Utc::now(),
            expires_at,
            last_used_at: None,
            metadata,
        };
        self.repository.put(record.clone());
        Ok((cleartext, record))
    }

    /// `Validate(cleartext) → record | invalid | expired | not-found`.
    pub fn validate(&self, cleartext: &str) -> ValidateOutcome {
        let (key_id, secret) = match parse_cleartext(cleartext) {
            Some(parts) => parts,
            None => return ValidateOutcome::Invalid,
        };
        let record = match self.repository.get(&key_id) {
            Some(r) => r,
            None => return ValidateOutcome::NotFound,
        };
        if record.secret_hash.is_empty() {
            return ValidateOutcome::Corrupted(key_id);
        }
        match bcrypt::verify(&secret, &record.secret_hash) {
            Ok(true) => {}
            Ok(false) => return ValidateOutcome::Invalid,
            Err(_) => return ValidateOutcome::Corrupted(key_id),
        }
        if let Some(expiry) = record.expires_at {
            if expiry < Utc::now() {
                return ValidateOutcome::Expired;
            }
        }
        ValidateOutcome::Valid(record)
    }

    pub fn get(&self, key_id: &str) -> Option<ClientKeyRecord> {
        self.repository.get(key_id)
    }

    /// `List()` — redacts the hash on every returned record.
    pub fn list(&self) -> Vec<ClientKeyRecord> {
        self.repository.list().into_iter().map(|r| r.redacted()).collect()
    }

    pub fn delete(&self, key_id: &str) -> bool {
        self.repository.delete(key_id)
    }
}
