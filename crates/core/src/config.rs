//! Environment-scoped configuration profiles.
//!
//! Profiles are resolved once at process start and passed by value into each
//! component; nothing re-reads them per call.

use core::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown environment '{0}' (expected development or production)")]
    UnknownEnvironment(String),

    #[error("{key} is not a valid number: '{value}'")]
    InvalidNumber { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Deployment environment selecting the numeric profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

impl core::fmt::Display for Environment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider throughput ceilings per 60-second window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a probe is admitted
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Worker pool sizing and timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub workers: usize,
    /// Deadline for one executor call; expiry is a retryable failure
    pub call_timeout: Duration,
    /// Lease length on a claimed job; must exceed `call_timeout`
    pub visibility_timeout: Duration,
    pub sweep_interval: Duration,
    /// Pause after an empty dequeue or an admission denial
    pub idle_wait: Duration,
    pub store_backoff_base: Duration,
    pub store_backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "admitq".to_string(),
            workers: 2,
            call_timeout: Duration::from_secs(90),
            visibility_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(15),
            idle_wait: Duration::from_millis(250),
            store_backoff_base: Duration::from_millis(200),
            store_backoff_max: Duration::from_secs(10),
        }
    }
}

/// Complete queue configuration for one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub environment: Environment,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub max_queue_size: usize,
    pub worker: WorkerConfig,
}

impl QueueConfig {
    /// Profile for an environment. Development is looser so local iteration
    /// is not throttled; production protects spend.
    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Development => Self::development(),
            Environment::Production => Self::production(),
        }
    }

    pub fn development() -> Self {
        Self {
            environment: Environment::Development,
            rate_limit: RateLimitConfig {
                requests_per_minute: 120,
                tokens_per_minute: 180_000,
            },
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            max_queue_size: 1_000,
            worker: WorkerConfig::default(),
        }
    }

    pub fn production() -> Self {
        Self {
            environment: Environment::Production,
            rate_limit: RateLimitConfig {
                requests_per_minute: 50,
                tokens_per_minute: 75_000,
            },
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            max_queue_size: 10_000,
            worker: WorkerConfig {
                workers: 3,
                ..WorkerConfig::default()
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.requests_per_minute == 0 {
            return Err(ConfigError::Invalid("requests_per_minute must be > 0".into()));
        }
        if self.rate_limit.tokens_per_minute == 0 {
            return Err(ConfigError::Invalid("tokens_per_minute must be > 0".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure_threshold must be > 0".into()));
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::Invalid("max_queue_size must be > 0".into()));
        }
        if self.worker.workers == 0 {
            return Err(ConfigError::Invalid("workers must be > 0".into()));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid("base_delay exceeds max_delay".into()));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::Invalid("jitter must be in [0, 1)".into()));
        }
        if self.worker.visibility_timeout <= self.worker.call_timeout {
            return Err(ConfigError::Invalid(
                "visibility_timeout must exceed call_timeout".into(),
            ));
        }
        Ok(())
    }
}
