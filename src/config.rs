use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::capture::DuplicatePolicy;
use crate::error::ConfigError;
use crate::mode::Mode;

// ─── Defaults ────────────────────────────────────────────────────

/// Reserved prefix for everything the profiler serves itself.
pub const ROUTE_PREFIX: &str = "/mini_profiler";

fn default_identity_header() -> String {
    "x-authenticated-user".into()
}
fn default_ttl_secs() -> u64 {
    600
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".into()
}
fn default_query_timeout_ms() -> u64 {
    2_000
}
fn default_max_logs() -> usize {
    1_000
}
fn default_max_entries() -> usize {
    10_000
}
fn default_assets_dir() -> PathBuf {
    PathBuf::from("static/mini_profiler")
}

// ─── Types ───────────────────────────────────────────────────────

/// Where the application is running. Development profiles everyone who
/// has not opted out; production only profiles allow-listed callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfilerConfig {
    #[serde(default)]
    pub environment: Environment,

    /// Caller identities allowed to see profiles in production.
    #[serde(default)]
    pub enabled_users: Vec<String>,

    /// Request header the host's auth layer fills with the caller identity.
    ///
    /// Clients can send this header too. The host must strip or overwrite
    /// it at its edge, or insert
    /// [`AuthenticatedUser`](crate::policy::AuthenticatedUser) instead,
    /// which takes precedence.
    #[serde(default = "default_identity_header")]
    pub identity_header: String,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default)]
    pub store: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Mode used when the request asks for none (or for an unknown one).
    #[serde(default)]
    pub default_mode: Mode,

    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,

    /// Upper bound on any single store call.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Log lines kept per request; the rest are only counted.
    #[serde(default = "default_max_logs")]
    pub max_logs: usize,

    /// Capacity of the in-memory store.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_assets_dir")]
    pub assets_dir: PathBuf,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            enabled_users: Vec::new(),
            identity_header: default_identity_header(),
            ttl_secs: default_ttl_secs(),
            store: StoreBackend::default(),
            redis_url: default_redis_url(),
            default_mode: Mode::default(),
            duplicate_policy: DuplicatePolicy::default(),
            query_timeout_ms: default_query_timeout_ms(),
            max_logs: default_max_logs(),
            max_entries: default_max_entries(),
            assets_dir: default_assets_dir(),
        }
    }
}

impl ProfilerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Read `MINI_PROFILER_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MINI_PROFILER_ENV") {
            config.environment = match v.trim() {
                "development" | "dev" => Environment::Development,
                "production" | "prod" => Environment::Production,
                _ => return Err(invalid("MINI_PROFILER_ENV", v.clone(), "expected development or production")),
            };
        }
        if let Some(v) = get("MINI_PROFILER_USERS") {
            config.enabled_users = v
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(v) = get("MINI_PROFILER_IDENTITY_HEADER") {
            config.identity_header = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = get("MINI_PROFILER_TTL_SECS") {
            config.ttl_secs = parse_number("MINI_PROFILER_TTL_SECS", v)?;
        }
        if let Some(v) = get("MINI_PROFILER_STORE") {
            config.store = match v.trim() {
                "memory" => StoreBackend::Memory,
                "redis" => StoreBackend::Redis,
                _ => return Err(invalid("MINI_PROFILER_STORE", v.clone(), "expected memory or redis")),
            };
        }
        if let Some(v) = get("MINI_PROFILER_REDIS_URL") {
            config.redis_url = v;
        }
        if let Some(v) = get("MINI_PROFILER_MODE") {
            config.default_mode = v
                .parse()
                .map_err(|e: crate::mode::UnknownMode| invalid("MINI_PROFILER_MODE", v.clone(), e))?;
        }
        if let Some(v) = get("MINI_PROFILER_DUPLICATES") {
            config.duplicate_policy = match v.trim() {
                "category_and_params" => DuplicatePolicy::CategoryAndParams,
                "category_only" => DuplicatePolicy::CategoryOnly,
                _ => {
                    return Err(invalid(
                        "MINI_PROFILER_DUPLICATES",
                        v.clone(),
                        "expected category_and_params or category_only",
                    ))
                }
            };
        }
        if let Some(v) = get("MINI_PROFILER_QUERY_TIMEOUT_MS") {
            config.query_timeout_ms = parse_number("MINI_PROFILER_QUERY_TIMEOUT_MS", v)?;
        }
        if let Some(v) = get("MINI_PROFILER_MAX_LOGS") {
            config.max_logs = parse_number("MINI_PROFILER_MAX_LOGS", v)?;
        }
        if let Some(v) = get("MINI_PROFILER_MAX_ENTRIES") {
            config.max_entries = parse_number("MINI_PROFILER_MAX_ENTRIES", v)?;
        }
        if let Some(v) = get("MINI_PROFILER_ASSETS") {
            config.assets_dir = PathBuf::from(v);
        }

        if config.ttl_secs == 0 {
            return Err(invalid("MINI_PROFILER_TTL_SECS", "0".into(), "must be positive"));
        }
        Ok(config)
    }
}

fn parse_number<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, value.clone(), e))
}

fn invalid(key: &'static str, value: String, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value,
        reason: reason.to_string(),
    }
}
