//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` and can be set via
//! `-f` or `TURNPIKE_CONFIG`.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - base configuration
//! 2. **Environment variables** - `TURNPIKE_`-prefixed variables override
//!    YAML values; nested fields use double underscores
//!    (`TURNPIKE_DATABASE__URL=...`)
//! 3. **DATABASE_URL / REDIS_URL** - conventional overrides for the two
//!    connection strings
//!
//! Budget *limits* live in the database (`budget_defaults`,
//! `tenant_budget_overrides`); this file only configures transports and
//! process-level knobs.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Simple CLI args - just for specifying the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "TURNPIKE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Conventional DATABASE_URL override; folded into `database.url` on load
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Conventional REDIS_URL override; folded into `redis.url` on load
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    /// Master key material for catalog credentials at rest. Required in
    /// production; a process-local random key is generated when absent.
    pub secret_key: Option<String>,
    /// Fallback limits applied when neither tenant nor key set an override
    pub limits: LimitsConfig,
    pub router: RouterConfig,
    pub streaming: StreamingConfig,
    pub idempotency: IdempotencyConfig,
    pub guardrails: GuardrailsConfig,
    pub file_storage: FileStorageConfig,
    pub batches: BatchesConfig,
    pub alerts: AlertsConfig,
    /// Offset applied to UTC when resolving budget windows, in minutes
    pub reporting_utc_offset_minutes: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3100,
            database_url: None,
            redis_url: None,
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            secret_key: None,
            limits: LimitsConfig::default(),
            router: RouterConfig::default(),
            streaming: StreamingConfig::default(),
            idempotency: IdempotencyConfig::default(),
            guardrails: GuardrailsConfig::default(),
            file_storage: FileStorageConfig::default(),
            batches: BatchesConfig::default(),
            alerts: AlertsConfig::default(),
            reporting_utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/turnpike".to_string(),
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Fallback rate limits. 0 means unlimited.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub rpm_default: i64,
    pub tpm_default: i64,
    pub max_parallel_default: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rpm_default: 0,
            tpm_default: 0,
            max_parallel_default: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterConfig {
    /// How often the catalog is re-read and the route table swapped
    #[serde(with = "humantime_serde")]
    pub reload_interval: Duration,
    /// Health monitor sweep interval
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,
    /// Per-route health check timeout
    #[serde(with = "humantime_serde")]
    pub health_timeout: Duration,
    /// Consecutive failures before a route's breaker opens
    pub breaker_failure_threshold: u32,
    /// How long an open breaker keeps the route out of selection
    #[serde(with = "humantime_serde")]
    pub breaker_cooldown: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            reload_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(60),
            health_timeout: Duration::from_secs(10),
            breaker_failure_threshold: 3,
            breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamingConfig {
    /// A stream that produces no chunk for this long is torn down
    #[serde(with = "humantime_serde")]
    pub idle_chunk_timeout: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            idle_chunk_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdempotencyConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub capacity: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardrailsConfig {
    /// Moderation webhook timeout when the policy does not set one
    #[serde(with = "humantime_serde")]
    pub webhook_timeout: Duration,
    /// Body substituted for a completion blocked post-generation
    pub redaction_sentinel: String,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            webhook_timeout: Duration::from_secs(5),
            redaction_sentinel: "[content removed by policy]".to_string(),
        }
    }
}

/// Blob storage backend selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageBackendConfig {
    Local {
        path: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        region: Option<String>,
        /// Endpoint override for S3-compatible stores
        #[serde(default)]
        endpoint: Option<String>,
    },
}

impl Default for StorageBackendConfig {
    fn default() -> Self {
        StorageBackendConfig::Local {
            path: PathBuf::from(".turnpike_data/files"),
        }
    }
}

// no deny_unknown_fields here: serde cannot combine it with flatten
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FileStorageConfig {
    #[serde(flatten)]
    pub backend: StorageBackendConfig,
    /// Base64 AES key (16, 24, or 32 bytes) enabling envelope encryption
    pub encryption_key: Option<String>,
    /// Default TTL applied to uploads; None keeps files until deleted
    #[serde(default, with = "humantime_serde")]
    pub upload_ttl: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub ttl_sweep_interval: Duration,
    pub max_upload_bytes: usize,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendConfig::default(),
            encryption_key: None,
            upload_ttl: None,
            ttl_sweep_interval: Duration::from_secs(300),
            max_upload_bytes: 200 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchesConfig {
    /// Whether the in-process worker claims batches
    pub worker_enabled: bool,
    /// Hard cap on requests per batch file
    pub max_requests: usize,
    /// Per-line buffer cap while parsing NDJSON
    pub max_line_bytes: usize,
    /// Upper bound on concurrent item executions across all batches
    pub global_max_concurrency: usize,
    /// Per-batch default when the create request does not set one
    pub default_item_concurrency: i32,
    #[serde(with = "humantime_serde")]
    pub claim_interval: Duration,
    /// Lifetime of a batch and, transitively, its output files
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for BatchesConfig {
    fn default() -> Self {
        Self {
            worker_enabled: true,
            max_requests: 50_000,
            max_line_bytes: 16 * 1024 * 1024,
            global_max_concurrency: 32,
            default_item_concurrency: 8,
            claim_interval: Duration::from_secs(2),
            ttl: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AlertsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<AlertWebhookConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AlertWebhookConfig {
    pub url: String,
    #[serde(default)]
    pub auth_header: Option<String>,
    #[serde(default)]
    pub auth_value: Option<String>,
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        // Conventional overrides take precedence over the structured fields
        if let Some(url) = config.database_url.take() {
            config.database.url = url;
        }
        if let Some(url) = config.redis_url.take() {
            config.redis.url = url;
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// The figment used by [`Config::load`]; exposed for tests.
    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("TURNPIKE_").split("__"))
            .merge(Env::raw().only(&["DATABASE_URL", "REDIS_URL"]))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be non-zero");
        }
        if self.router.breaker_failure_threshold == 0 {
            anyhow::bail!("router.breaker_failure_threshold must be at least 1");
        }
        if self.batches.max_requests == 0 {
            anyhow::bail!("batches.max_requests must be at least 1");
        }
        if let Some(key) = &self.file_storage.encryption_key {
            use base64::Engine as _;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(key)
                .map_err(|_| anyhow::anyhow!("file_storage.encryption_key must be base64"))?;
            if ![16, 24, 32].contains(&decoded.len()) {
                anyhow::bail!("file_storage.encryption_key must decode to 16, 24, or 32 bytes");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.router.breaker_failure_threshold, 3);
        assert_eq!(config.batches.max_requests, 50_000);
    }

    #[test]
    fn test_yaml_and_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
                port: 9200
                database:
                  url: postgres://db.internal:5432/gateway
                router:
                  breaker_cooldown: 30s
                "#,
            )?;
            jail.set_env("TURNPIKE_PORT", "9300");
            jail.set_env("TURNPIKE_REDIS__URL", "redis://cache.internal:6379");

            let args = Args {
                config: "config.yaml".to_string(),
                validate: false,
            };
            let config = Config::load(&args).expect("config should load");
            assert_eq!(config.port, 9300);
            assert_eq!(config.database.url, "postgres://db.internal:5432/gateway");
            assert_eq!(config.redis.url, "redis://cache.internal:6379");
            assert_eq!(config.router.breaker_cooldown, Duration::from_secs(30));
            Ok(())
        });
    }

    #[test]
    fn test_database_url_env_wins() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.yaml", "database:\n  url: postgres://from-yaml/db\n")?;
            jail.set_env("DATABASE_URL", "postgres://from-env/db");

            let args = Args {
                config: "config.yaml".to_string(),
                validate: false,
            };
            let config = Config::load(&args).expect("config should load");
            assert_eq!(config.database.url, "postgres://from-env/db");
            Ok(())
        });
    }

    #[test]
    fn test_bad_encryption_key_rejected() {
        let mut config = Config::default();
        config.file_storage.encryption_key = Some("not-base64!!".to_string());
        assert!(config.validate().is_err());

        use base64::Engine as _;
        config.file_storage.encryption_key =
            Some(base64::engine::general_purpose::STANDARD.encode([0u8; 20]));
        assert!(config.validate().is_err());

        config.file_storage.encryption_key =
            Some(base64::engine::general_purpose::STANDARD.encode([0u8; 32]));
        assert!(config.validate().is_ok());
    }
}
