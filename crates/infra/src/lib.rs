//! Runtime side of the queue: storage backends, admission control, dispatch
//! and the worker pool.

pub mod circuit_breaker;
pub mod config;
pub mod dispatcher;
pub mod queue;
pub mod rate_limiter;
pub mod store;

pub use circuit_breaker::{CircuitBreaker, CircuitEvent, CircuitSnapshot, CircuitState, CircuitTransition};
pub use config::{Settings, StoreAddress, StoreConfig};
pub use dispatcher::{
    AdmissionDenied, Dispatcher, ExecutionReport, FnExecutor, HealthReport, JobExecutor,
    JobOutcome, PoolStats, Tick, WorkerPool, WorkerPoolHandle,
};
pub use queue::JobQueue;
pub use rate_limiter::{Acquire, RateLimiter, Window};
pub use store::{
    AdmissionStore, CancelOutcome, InMemoryAdmissionStore, InMemoryJobStore, JobStore, QueueStats,
    RequeueOutcome,
};
