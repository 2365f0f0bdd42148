//! Building blocks for the admission-controlled job queue.
//!
//! This crate is pure: it never touches the store or spawns tasks. Everything
//! time-dependent reads a [`Clock`], and the configuration profiles here are
//! consumed by `admitq-infra`.

pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod priority;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CircuitBreakerConfig, ConfigError, Environment, QueueConfig, RateLimitConfig, WorkerConfig,
};
pub use error::{ExecutionError, QueueError, QueueResult};
pub use id::{JobId, LeaseId};
pub use job::{DeadLetterEntry, EnqueueRequest, Job, JobStatus, Lease, Submission};
pub use priority::Priority;
pub use retry::RetryPolicy;
