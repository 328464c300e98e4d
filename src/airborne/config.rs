//! Configuration for Airborne.
//!
//! Mirrors the teacher's minimalist config philosophy: a plain struct populated from the
//! environment, no TOML/YAML parsing dependency. Config-file loading and env override layering
//! are an external collaborator; `from_env` is the convenience constructor the binary entry
//! point and tests use.

use std::env;
use std::time::Duration;

/// Process start-up mode. `Production` requires the rate-limit store to be reachable at
/// start-up; `Development` permits degraded start-up with authentication and rate limiting
/// disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupMode {
    Production,
    Development,
}

/// Global configuration for the gateway process.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub tls_enabled: bool,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    pub log_level: String,
    pub log_format: String,
    pub redis_addr: String,
    pub redis_password: Option<String>,
    pub redis_db: i64,
    pub startup_mode: StartupMode,
    /// Per-attempt provider call timeout applied by the retry policy when the caller did not
    /// supply one (§5 "on the order of minutes").
    pub default_provider_timeout: Duration,
}

impl GatewayConfig {
    /// Build a config from the environment variables named in the external interfaces.
    ///
    /// Unset variables fall back to development-friendly defaults; production deployments are
    /// expected to set `REDIS_ADDR` and `AIBOX_HOST` explicitly through their own config loader,
    /// which populates the process environment before this is called.
    pub fn from_env() -> Self {
        let startup_mode = match env::var("AIBOX_STARTUP_MODE").as_deref() {
            Ok("production") => StartupMode::Production,
            _ => StartupMode::Development,
        };

        GatewayConfig {
            host: env::var("AIBOX_HOST").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            tls_enabled: env::var("AIBOX_TLS_ENABLED").as_deref() == Ok("true"),
            tls_cert_file: env::var("AIBOX_TLS_CERT_FILE").ok(),
            tls_key_file: env::var("AIBOX_TLS_KEY_FILE").ok(),
            log_level: env::var("AIBOX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: env::var("AIBOX_LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
            redis_addr: env::var("REDIS_ADDR").unwrap_or_else(|_| "127.0.0.1:6379".to_string()),
            redis_password: env::var("REDIS_PASSWORD").ok(),
            redis_db: env::var("REDIS_DB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            startup_mode,
            default_provider_timeout: Duration::from_secs(120),
        }
    }

    /// Build the `redis://` connection URL from the discrete address/password/db fields.
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(pw) if !pw.is_empty() => {
                format!("redis://:{}@{}/{}", pw, self.redis_addr, self.redis_db)
            }
            _ => format!("redis://{}/{}", self.redis_addr, self.redis_db),
        }
    }

    /// Initialize the `env_logger` backend according to `log_level`/`log_format`.
    ///
    /// Call once from the binary entry point. Tests that need logging call this guarded by
    /// `try_init` semantics so repeated test-binary invocations don't panic.
    pub fn init_logging(&self) {
        let mut builder = env_logger::Builder::new();
        builder.parse_filters(&self.log_level);
        if self.log_format == "json" {
            builder.format(|buf, record| {
                use std::io::Write;
                writeln!(
                    buf,
                    "{{\"level\":\"{}\",\"target\":\"{}\",\"message\":{}}}",
                    record.level(),
                    record.target(),
                    serde_json::to_string(&record.args().to_string())
                        .unwrap_or_else(|_| "\"\"".to_string())
                )
            });
        }
        let _ = builder.try_init();
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            host: "0.0.0.0:8080".to_string(),
            tls_enabled: false,
            tls_cert_file: None,
            tls_key_file: None,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            redis_addr: "127.0.0.1:6379".to_string(),
            redis_password: None,
            redis_db: 0,
            startup_mode: StartupMode::Development,
            default_provider_timeout: Duration::from_secs(120),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_without_password() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.redis_url(), "redis://127.0.0.1:6379/0");
    }

    #[test]
    fn redis_url_with_password() {
        let mut cfg = GatewayConfig::default();
        cfg.redis_password = Some("s3cret".to_string());
        assert_eq!(cfg.redis_url(), "redis://:s3cret@127.0.0.1:6379/0");
    }
}
