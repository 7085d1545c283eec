//! Configuration for CensusGate.
//!
//! Settings are loaded with priority: env var > TOML config file > default.
//! `./.env` is loaded via dotenvy early in startup and never overrides real
//! environment variables.

pub(crate) mod helpers;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use helpers::{optional_env, parse_env, parse_env_bool, parse_env_ms};

/// Main configuration for the gateway.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub audit: AuditConfig,
    pub server: ServerConfig,
    pub validator: ValidatorConfig,
}

/// Embedded analytical database + connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Filesystem path to the analytical database file.
    pub path: PathBuf,
    pub pool_min: usize,
    pub pool_max: usize,
    pub acquire_timeout: Duration,
    pub query_timeout: Duration,
    /// Memory cap passed to the engine (e.g. "4GB").
    pub memory_limit: String,
    /// Worker-thread count for the engine.
    pub threads: u32,
    /// Interval between idle-handle health probes.
    pub health_interval: Duration,
}

/// LLM translator backend.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Credential for the external service. Absent in stub-only deployments.
    pub api_key: Option<SecretString>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

/// Circuit breaker defaults for protected dependencies.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub timeout: Duration,
    pub window: Duration,
}

/// Sliding-window rate limit policy.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max: u64,
}

/// Session lifecycle policy.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub ttl: Duration,
    pub cap: usize,
}

/// Audit log sink.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub path: PathBuf,
    /// When set, the original question is dropped from audit records.
    pub redact_questions: bool,
}

/// Protocol server surface.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub cors_allow_origin: Vec<String>,
    /// Directory holding UI resource bundles served to MCP clients.
    pub ui_resource_dir: Option<PathBuf>,
}

/// SQL validator policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    /// Hard row cap injected/enforced on every statement.
    pub max_limit: u64,
    /// Ceiling for the coarse cost proxy (scans x limit).
    pub cost_ceiling: u64,
}

/// Optional TOML overlay, merged below env vars.
#[derive(Debug, Clone, Default, Deserialize)]
struct Overlay {
    #[serde(default)]
    database: OverlayDatabase,
    #[serde(default)]
    llm: OverlayLlm,
    #[serde(default)]
    server: OverlayServer,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OverlayDatabase {
    path: Option<String>,
    pool_min: Option<usize>,
    pool_max: Option<usize>,
    memory_limit: Option<String>,
    threads: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OverlayLlm {
    model: Option<String>,
    base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct OverlayServer {
    bind_addr: Option<String>,
    cors_allow_origin: Option<Vec<String>>,
    ui_resource_dir: Option<String>,
}

impl Overlay {
    fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = explicit_path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ParseError(format!("config file {}: {e}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("config file {}: {e}", path.display())))
    }
}

impl Config {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env with an optional TOML config file overlay.
    pub fn from_env_with_toml(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let overlay = Overlay::load(toml_path)?;

        Ok(Self {
            database: DatabaseConfig::resolve(&overlay)?,
            llm: LlmConfig::resolve(&overlay)?,
            breaker: BreakerConfig::resolve()?,
            rate_limit: RateLimitConfig::resolve()?,
            session: SessionConfig::resolve()?,
            audit: AuditConfig::resolve()?,
            server: ServerConfig::resolve(&overlay)?,
            validator: ValidatorConfig::resolve()?,
        })
    }
}

impl DatabaseConfig {
    fn resolve(overlay: &Overlay) -> Result<Self, ConfigError> {
        let path = optional_env("DATABASE_PATH")
            .or_else(|| overlay.database.path.clone())
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "DATABASE_PATH".to_string(),
                hint: "Set it to the analytical database file populated by the loader."
                    .to_string(),
            })?;

        let pool_min = parse_env::<usize>("POOL_MIN")?
            .or(overlay.database.pool_min)
            .unwrap_or(2);
        let pool_max = parse_env::<usize>("POOL_MAX")?
            .or(overlay.database.pool_max)
            .unwrap_or(10);
        if pool_max == 0 {
            return Err(ConfigError::InvalidValue {
                key: "POOL_MAX".to_string(),
                message: "must be > 0".to_string(),
            });
        }
        if pool_min > pool_max {
            return Err(ConfigError::InvalidValue {
                key: "POOL_MIN".to_string(),
                message: format!("must be <= POOL_MAX ({pool_max})"),
            });
        }

        Ok(Self {
            path,
            pool_min,
            pool_max,
            acquire_timeout: parse_env_ms("POOL_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or(Duration::from_millis(5_000)),
            query_timeout: parse_env_ms("QUERY_TIMEOUT_MS")?
                .unwrap_or(Duration::from_millis(30_000)),
            memory_limit: optional_env("DB_MEMORY_LIMIT")
                .or_else(|| overlay.database.memory_limit.clone())
                .unwrap_or_else(|| "4GB".to_string()),
            threads: parse_env::<u32>("DB_THREADS")?
                .or(overlay.database.threads)
                .unwrap_or(4),
            health_interval: parse_env_ms("POOL_HEALTH_INTERVAL_MS")?
                .unwrap_or(Duration::from_secs(60)),
        })
    }
}

impl LlmConfig {
    fn resolve(overlay: &Overlay) -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: optional_env("LLM_API_KEY").map(SecretString::from),
            model: optional_env("LLM_MODEL")
                .or_else(|| overlay.llm.model.clone())
                .unwrap_or_else(|| "claude-sonnet-4-5".to_string()),
            base_url: optional_env("LLM_BASE_URL")
                .or_else(|| overlay.llm.base_url.clone())
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            timeout: parse_env_ms("LLM_TIMEOUT_MS")?.unwrap_or(Duration::from_millis(30_000)),
            max_retries: parse_env::<u32>("LLM_MAX_RETRIES")?.unwrap_or(2),
        })
    }
}

impl BreakerConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            threshold: match parse_env::<u32>("BREAKER_THRESHOLD")? {
                Some(0) => {
                    return Err(ConfigError::InvalidValue {
                        key: "BREAKER_THRESHOLD".to_string(),
                        message: "must be > 0".to_string(),
                    });
                }
                Some(n) => n,
                None => 5,
            },
            timeout: parse_env_ms("BREAKER_TIMEOUT_MS")?.unwrap_or(Duration::from_secs(30)),
            window: parse_env_ms("BREAKER_WINDOW_MS")?.unwrap_or(Duration::from_secs(60)),
        })
    }
}

impl RateLimitConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            window: parse_env_ms("RATE_LIMIT_WINDOW_MS")?.unwrap_or(Duration::from_secs(60)),
            max: match parse_env::<u64>("RATE_LIMIT_MAX")? {
                Some(0) => {
                    return Err(ConfigError::InvalidValue {
                        key: "RATE_LIMIT_MAX".to_string(),
                        message: "must be > 0".to_string(),
                    });
                }
                Some(n) => n,
                None => 60,
            },
        })
    }
}

impl SessionConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            ttl: parse_env_ms("SESSION_TTL_MS")?.unwrap_or(Duration::from_millis(1_800_000)),
            cap: match parse_env::<usize>("SESSION_CAP")? {
                Some(0) => {
                    return Err(ConfigError::InvalidValue {
                        key: "SESSION_CAP".to_string(),
                        message: "must be > 0".to_string(),
                    });
                }
                Some(n) => n,
                None => 1_000,
            },
        })
    }
}

impl AuditConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            path: optional_env("AUDIT_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("censusgate-audit.jsonl")),
            redact_questions: parse_env_bool("AUDIT_REDACT_QUESTIONS")?.unwrap_or(false),
        })
    }
}

impl ServerConfig {
    fn resolve(overlay: &Overlay) -> Result<Self, ConfigError> {
        let raw_addr = optional_env("BIND_ADDR")
            .or_else(|| overlay.server.bind_addr.clone())
            .unwrap_or_else(|| "127.0.0.1:8765".to_string());
        let bind_addr = raw_addr.parse().map_err(|e| ConfigError::InvalidValue {
            key: "BIND_ADDR".to_string(),
            message: format!("could not parse '{raw_addr}' as a socket address: {e}"),
        })?;

        let cors_allow_origin = optional_env("CORS_ALLOW_ORIGIN")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .or_else(|| overlay.server.cors_allow_origin.clone())
            .unwrap_or_default();

        Ok(Self {
            bind_addr,
            cors_allow_origin,
            ui_resource_dir: optional_env("UI_RESOURCE_DIR")
                .or_else(|| overlay.server.ui_resource_dir.clone())
                .map(PathBuf::from),
        })
    }
}

impl ValidatorConfig {
    fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            max_limit: 1_000,
            cost_ceiling: parse_env::<u64>("COST_CEILING")?.unwrap_or(100_000),
        })
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_limit: 1_000,
            cost_ceiling: 100_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_gateway_env() {
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            for key in [
                "DATABASE_PATH",
                "POOL_MIN",
                "POOL_MAX",
                "POOL_ACQUIRE_TIMEOUT_MS",
                "QUERY_TIMEOUT_MS",
                "LLM_API_KEY",
                "LLM_MODEL",
                "LLM_TIMEOUT_MS",
                "BREAKER_THRESHOLD",
                "RATE_LIMIT_MAX",
                "SESSION_CAP",
                "BIND_ADDR",
                "CORS_ALLOW_ORIGIN",
            ] {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn resolves_defaults_with_database_path() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_gateway_env();
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe { std::env::set_var("DATABASE_PATH", "/tmp/census.duckdb") };

        let config = Config::from_env().expect("config resolves");
        assert_eq!(config.database.pool_min, 2);
        assert_eq!(config.database.pool_max, 10);
        assert_eq!(config.database.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.database.query_timeout, Duration::from_secs(30));
        assert_eq!(config.session.ttl, Duration::from_secs(1_800));
        assert_eq!(config.session.cap, 1_000);
        assert_eq!(config.validator.max_limit, 1_000);

        clear_gateway_env();
    }

    #[test]
    fn missing_database_path_is_reported() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_gateway_env();

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingRequired { key, .. } => assert_eq!(key, "DATABASE_PATH"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn pool_min_above_max_is_rejected() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_gateway_env();
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("DATABASE_PATH", "/tmp/census.duckdb");
            std::env::set_var("POOL_MIN", "12");
            std::env::set_var("POOL_MAX", "4");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "POOL_MIN"),
            other => panic!("unexpected error: {other}"),
        }

        clear_gateway_env();
    }

    #[test]
    fn cors_origins_split_on_commas() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_gateway_env();
        // SAFETY: Guarded by ENV_MUTEX in tests.
        unsafe {
            std::env::set_var("DATABASE_PATH", "/tmp/census.duckdb");
            std::env::set_var(
                "CORS_ALLOW_ORIGIN",
                "http://localhost:3000, https://census.example.com",
            );
        }

        let config = Config::from_env().expect("config resolves");
        assert_eq!(
            config.server.cors_allow_origin,
            vec![
                "http://localhost:3000".to_string(),
                "https://census.example.com".to_string()
            ]
        );

        clear_gateway_env();
    }
}
