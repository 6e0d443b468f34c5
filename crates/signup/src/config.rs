//! Service configuration.
//!
//! Everything comes from the environment and is validated once at startup.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `SIGNUP_PORT` | `9999` |
//! | `SIGNUP_IDENTITY_STORE` | `postgres` (`memory` for local runs) |
//! | `SIGNUP_DATABASE_URL` | required with `postgres` |
//! | `SIGNUP_DATABASE_PASSWORD` | overrides the URL password |
//! | `SIGNUP_GUARD` | `local` (`none`, `distributed`, `layered`) |
//! | `SIGNUP_REDIS_URL` | required with `distributed` / `layered` |
//! | `SIGNUP_LOCK_TTL_MS` | `5000` |
//! | `SIGNUP_ACQUIRE_TIMEOUT_MS` | `1000` |
//! | `SIGNUP_ACQUIRE_RETRY_MS` | `50` |
//! | `SIGNUP_LOCK_SWEEP_SECS` | `60` (`0` disables) |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_PORT: &str = "SIGNUP_PORT";
pub const ENV_IDENTITY_STORE: &str = "SIGNUP_IDENTITY_STORE";
pub const ENV_DATABASE_URL: &str = "SIGNUP_DATABASE_URL";
pub const ENV_DATABASE_PASSWORD: &str = "SIGNUP_DATABASE_PASSWORD";
pub const ENV_GUARD: &str = "SIGNUP_GUARD";
pub const ENV_REDIS_URL: &str = "SIGNUP_REDIS_URL";
pub const ENV_LOCK_TTL_MS: &str = "SIGNUP_LOCK_TTL_MS";
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "SIGNUP_ACQUIRE_TIMEOUT_MS";
pub const ENV_ACQUIRE_RETRY_MS: &str = "SIGNUP_ACQUIRE_RETRY_MS";
pub const ENV_LOCK_SWEEP_SECS: &str = "SIGNUP_LOCK_SWEEP_SECS";

const DEFAULT_PORT: u16 = 9999;
const DEFAULT_LOCK_TTL_MS: u64 = 5_000;
const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_ACQUIRE_RETRY_MS: u64 = 50;
const DEFAULT_LOCK_SWEEP_SECS: u64 = 60;

/// Which identity store backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown identity store '{other}'")),
        }
    }
}

/// Which guard strategy the coordinator uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    None,
    Local,
    Distributed,
    Layered,
}

impl GuardKind {
    #[must_use]
    pub fn needs_coordination_store(self) -> bool {
        matches!(self, Self::Distributed | Self::Layered)
    }

    #[must_use]
    pub fn uses_local_table(self) -> bool {
        matches!(self, Self::Local | Self::Layered)
    }
}

impl FromStr for GuardKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "local" => Ok(Self::Local),
            "distributed" | "redis" => Ok(Self::Distributed),
            "layered" => Ok(Self::Layered),
            other => Err(format!("unknown guard '{other}'")),
        }
    }
}

/// Validated service configuration.
#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub store: StoreKind,
    pub database: Option<tokio_postgres::Config>,
    pub guard: GuardKind,
    pub redis_url: Option<String>,
    pub lock_ttl: Duration,
    pub acquire_timeout: Duration,
    pub acquire_retry: Duration,
    /// `None` disables the idle-lock sweeper.
    pub lock_sweep_interval: Option<Duration>,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = parse_or(&get, ENV_PORT, DEFAULT_PORT)?;
        let store = parse_or(&get, ENV_IDENTITY_STORE, StoreKind::Postgres)?;
        let guard = parse_or(&get, ENV_GUARD, GuardKind::Local)?;

        let database = match store {
            StoreKind::Memory => None,
            StoreKind::Postgres => {
                let url = get(ENV_DATABASE_URL).ok_or_else(|| missing(ENV_DATABASE_URL))?;
                let mut pg: tokio_postgres::Config =
                    url.parse().map_err(|e: tokio_postgres::Error| ConfigError::Invalid {
                        key: ENV_DATABASE_URL.to_string(),
                        reason: e.to_string(),
                    })?;
                if let Some(password) = get(ENV_DATABASE_PASSWORD) {
                    pg.password(password);
                }
                Some(pg)
            }
        };

        let redis_url = get(ENV_REDIS_URL);
        if guard.needs_coordination_store() && redis_url.is_none() {
            return Err(missing(ENV_REDIS_URL));
        }

        let lock_ttl = millis(&get, ENV_LOCK_TTL_MS, DEFAULT_LOCK_TTL_MS)?;
        let acquire_timeout = millis(&get, ENV_ACQUIRE_TIMEOUT_MS, DEFAULT_ACQUIRE_TIMEOUT_MS)?;
        let acquire_retry = millis(&get, ENV_ACQUIRE_RETRY_MS, DEFAULT_ACQUIRE_RETRY_MS)?;
        if acquire_retry > acquire_timeout {
            return Err(ConfigError::Invalid {
                key: ENV_ACQUIRE_RETRY_MS.to_string(),
                reason: format!(
                    "retry interval {}ms exceeds acquire timeout {}ms",
                    acquire_retry.as_millis(),
                    acquire_timeout.as_millis()
                ),
            });
        }

        let sweep_secs: u64 = parse_or(&get, ENV_LOCK_SWEEP_SECS, DEFAULT_LOCK_SWEEP_SECS)?;
        let lock_sweep_interval = (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs));

        Ok(Self {
            port,
            store,
            database,
            guard,
            redis_url,
            lock_ttl,
            acquire_timeout,
            acquire_retry,
            lock_sweep_interval,
        })
    }
}

/// Credentials stay out of logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("store", &self.store)
            .field(
                "database",
                &self.database.as_ref().map(|db| (db.get_hosts().len(), db.get_dbname())),
            )
            .field("guard", &self.guard)
            .field("redis_url", &self.redis_url.as_deref().map(redact_url))
            .field("lock_ttl", &self.lock_ttl)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("acquire_retry", &self.acquire_retry)
            .field("lock_sweep_interval", &self.lock_sweep_interval)
            .finish()
    }
}

/// Strip userinfo from a URL: `redis://:secret@host` becomes `redis://***@host`.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn missing(key: &str) -> ConfigError {
    ConfigError::Missing {
        key: key.to_string(),
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn millis<G>(get: &G, key: &str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let ms: u64 = parse_or(get, key, default)?;
    if ms == 0 {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}
