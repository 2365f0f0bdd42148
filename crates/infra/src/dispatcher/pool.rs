//! Worker tasks and the visibility-timeout sweeper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use admitq_core::{JobStatus, QueueError, WorkerConfig};

use super::{Dispatcher, JobOutcome, Tick};
use crate::circuit_breaker::CircuitState;

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub cancelled: u64,
    /// Claimed jobs put back because of rate limiting or an open circuit
    pub deferred: u64,
    pub reclaimed: u64,
    pub lease_lost: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub store_available: bool,
    pub circuit: CircuitState,
    /// False while the store is unreachable or the pool is shutting down
    pub ready: bool,
}

#[derive(Debug)]
struct Shared {
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    stats: Mutex<PoolStats>,
    store_available: AtomicBool,
    /// Last breaker state read from the admission store
    circuit: Mutex<CircuitState>,
    started: Instant,
}

impl Shared {
    fn record(&self, tick: &Tick) {
        let mut stats = self.stats.lock();
        match tick {
            Tick::Idle | Tick::Paused => return,
            Tick::Deferred { .. } => {
                stats.deferred += 1;
                return;
            }
            Tick::LeaseLost(_) => stats.lease_lost += 1,
            Tick::Settled(outcome) => match outcome.status {
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::Failed => stats.retried += 1,
                JobStatus::DeadLettered => stats.dead_lettered += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Pending | JobStatus::InFlight => {}
            },
        }
        stats.processed += 1;
    }

    fn mark_store(&self, available: bool) {
        let was = self.store_available.swap(available, Ordering::SeqCst);
        if was && !available {
            warn!(pool = %self.config.name, "store unavailable; pool not ready");
        } else if !was && available {
            info!(pool = %self.config.name, "store reachable again");
        }
    }
}

/// Fixed-size pool of worker tasks sharing one [`Dispatcher`].
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.workers` worker tasks plus the sweeper on the current runtime.
    pub fn spawn(dispatcher: Arc<Dispatcher>, config: WorkerConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            dispatcher,
            config,
            stats: Mutex::new(PoolStats::default()),
            store_available: AtomicBool::new(true),
            circuit: Mutex::new(CircuitState::Closed),
            started: Instant::now(),
        });

        let mut tasks = Vec::with_capacity(shared.config.workers + 1);
        for index in 0..shared.config.workers {
            let name = format!("{}-worker-{index}", shared.config.name);
            tasks.push(tokio::spawn(worker_loop(name, shared.clone(), shutdown_rx.clone())));
        }
        tasks.push(tokio::spawn(sweeper_loop(shared.clone(), shutdown_rx)));

        info!(
            pool = %shared.config.name,
            workers = shared.config.workers,
            "worker pool started"
        );

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            tasks,
            shared,
        }
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl WorkerPoolHandle {
    /// Stop claiming new jobs and wait for in-flight executions to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(pool = %self.shared.config.name, error = %e, "worker task panicked");
            }
        }
        info!(pool = %self.shared.config.name, "worker pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self.shared.stats.lock().clone();
        stats.uptime_secs = self.shared.started.elapsed().as_secs();
        stats
    }

    /// Cached store flag plus the breaker's state. When the breaker cannot
    /// be read the last state seen is reported and the store is marked down.
    pub async fn health(&self) -> HealthReport {
        let circuit = match self.shared.dispatcher.breaker().state().await {
            Ok(state) => {
                *self.shared.circuit.lock() = state;
                state
            }
            Err(e) => {
                if e.is_store_unavailable() {
                    self.shared.mark_store(false);
                }
                *self.shared.circuit.lock()
            }
        };
        let store_available = self.shared.store_available.load(Ordering::SeqCst);
        HealthReport {
            store_available,
            circuit,
            ready: store_available && !*self.shutdown.borrow(),
        }
    }

    /// Probe the store, update the cached flag and report.
    pub async fn check_health(&self) -> HealthReport {
        let reachable = self.shared.dispatcher.queue().ping().await.is_ok();
        self.shared.mark_store(reachable);
        self.health().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.shared.dispatcher.subscribe()
    }
}

async fn worker_loop(name: String, shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let config = &shared.config;
    let mut store_backoff = config.store_backoff_base;
    debug!(worker = %name, "worker started");

    while !*shutdown.borrow() {
        let pause = match shared.dispatcher.run_once().await {
            Ok(tick) => {
                shared.mark_store(true);
                store_backoff = config.store_backoff_base;
                shared.record(&tick);
                match tick {
                    Tick::Idle | Tick::Paused | Tick::Deferred { .. } => Some(config.idle_wait),
                    Tick::Settled(_) | Tick::LeaseLost(_) => None,
                }
            }
            Err(QueueError::StoreUnavailable(reason)) => {
                shared.mark_store(false);
                warn!(
                    worker = %name,
                    error = %reason,
                    backoff_ms = store_backoff.as_millis() as u64,
                    "store unavailable; backing off"
                );
                let wait = store_backoff;
                store_backoff = (store_backoff * 2).min(config.store_backoff_max);
                Some(wait)
            }
            Err(e) => {
                error!(worker = %name, error = %e, "dispatch iteration failed");
                Some(config.idle_wait)
            }
        };

        if let Some(pause) = pause {
            if sleep_or_shutdown(pause, &mut shutdown).await {
                break;
            }
        }
    }

    debug!(worker = %name, "worker stopped");
}

async fn sweeper_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let interval = shared.config.sweep_interval;
    loop {
        if sleep_or_shutdown(interval, &mut shutdown).await || *shutdown.borrow() {
            break;
        }
        match shared.dispatcher.queue().reclaim_expired().await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                shared.mark_store(true);
                shared.stats.lock().reclaimed += reclaimed.len() as u64;
                info!(pool = %shared.config.name, count = reclaimed.len(), "reclaimed expired leases");
            }
            Ok(_) => shared.mark_store(true),
            Err(e) if e.is_store_unavailable() => shared.mark_store(false),
            Err(e) => error!(pool = %shared.config.name, error = %e, "lease sweep failed"),
        }
    }
}

/// Returns true when shutdown was signalled (or the handle was dropped).
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => true,
    }
}
