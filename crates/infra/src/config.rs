//! Process configuration loaded once from the environment.

use core::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use admitq_core::{ConfigError, Environment, QueueConfig};

pub const DEFAULT_NAMESPACE: &str = "admitq";

/// Queue profile plus backing-store address.
#[derive(Debug, Clone)]
pub struct Settings {
    pub queue: QueueConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub address: StoreAddress,
    /// Prefix of every key the store writes
    pub namespace: String,
}

/// Where the store lives. The URL form is secret as a whole because it may
/// embed credentials.
#[derive(Clone)]
pub enum StoreAddress {
    Url(SecretString),
    Discrete {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<SecretString>,
        db: i64,
    },
}

impl StoreAddress {
    /// Human-readable location with credentials removed; safe to log.
    pub fn redacted(&self) -> String {
        match self {
            StoreAddress::Url(url) => redact_url(url.expose_secret()),
            StoreAddress::Discrete { host, port, db, .. } => format!("redis://{host}:{port}/{db}"),
        }
    }
}

impl core::fmt::Debug for StoreAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreAddress::Url(_) => f
                .debug_tuple("Url")
                .field(&self.redacted())
                .finish(),
            StoreAddress::Discrete {
                host,
                port,
                username,
                password,
                db,
            } => f
                .debug_struct("Discrete")
                .field("host", host)
                .field("port", port)
                .field("username", username)
                .field("password", &password.as_ref().map(|_| "[REDACTED]"))
                .field("db", db)
                .finish(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: StoreAddress::Discrete {
                host: "localhost".to_string(),
                port: 6379,
                username: None,
                password: None,
                db: 0,
            },
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return "[REDACTED]".to_string();
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://[REDACTED]@{host}"),
        None => url.to_string(),
    }
}

impl Settings {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`] over an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = match get("ADMITQ_ENV") {
            Some(name) => name.parse::<Environment>()?,
            None => {
                warn!("ADMITQ_ENV not set; using the development profile");
                Environment::Development
            }
        };

        let mut queue = QueueConfig::for_environment(environment);
        let limits = &mut queue.rate_limit;
        override_with(&get, "ADMITQ_REQUESTS_PER_MINUTE", &mut limits.requests_per_minute)?;
        override_with(&get, "ADMITQ_TOKENS_PER_MINUTE", &mut limits.tokens_per_minute)?;
        override_with(&get, "ADMITQ_MAX_RETRIES", &mut queue.retry.max_retries)?;
        override_millis(&get, "ADMITQ_BASE_DELAY_MS", &mut queue.retry.base_delay)?;
        override_millis(&get, "ADMITQ_MAX_DELAY_MS", &mut queue.retry.max_delay)?;
        override_with(
            &get,
            "ADMITQ_FAILURE_THRESHOLD",
            &mut queue.circuit_breaker.failure_threshold,
        )?;
        override_millis(
            &get,
            "ADMITQ_CIRCUIT_BREAKER_TIMEOUT_MS",
            &mut queue.circuit_breaker.reset_timeout,
        )?;
        override_with(&get, "ADMITQ_MAX_QUEUE_SIZE", &mut queue.max_queue_size)?;
        override_with(&get, "ADMITQ_WORKERS", &mut queue.worker.workers)?;
        override_millis(&get, "ADMITQ_CALL_TIMEOUT_MS", &mut queue.worker.call_timeout)?;
        override_millis(
            &get,
            "ADMITQ_VISIBILITY_TIMEOUT_MS",
            &mut queue.worker.visibility_timeout,
        )?;
        queue.validate()?;

        let address = match get("REDIS_URL") {
            Some(url) => StoreAddress::Url(SecretString::new(url)),
            None => {
                let mut port = 6379u16;
                override_with(&get, "REDIS_PORT", &mut port)?;
                let mut db = 0i64;
                override_with(&get, "REDIS_DB", &mut db)?;
                StoreAddress::Discrete {
                    host: get("REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
                    port,
                    username: get("REDIS_USERNAME"),
                    password: get("REDIS_PASSWORD").map(SecretString::new),
                    db,
                }
            }
        };
        let namespace = get("ADMITQ_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        Ok(Self {
            queue,
            store: StoreConfig { address, namespace },
        })
    }
}

fn override_with<T, G>(get: &G, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

fn override_millis<G>(get: &G, key: &str, target: &mut Duration) -> Result<(), ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let mut millis = target.as_millis() as u64;
    override_with(get, key, &mut millis)?;
    *target = Duration::from_millis(millis);
    Ok(())
}
