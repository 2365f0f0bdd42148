//! Operator CLI over the Redis-backed queue.

mod cli;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{error, warn};

use admitq_core::{EnqueueRequest, QueueConfig, QueueResult, SystemClock};
use admitq_infra::store::redis::{RedisAdmissionStore, RedisJobStore, StoreClient};
use admitq_infra::{CircuitBreaker, CircuitSnapshot, JobQueue, RateLimiter, Settings, Window};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    admitq_observability::init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::from_env().context("loading configuration")?;
    let json = cli.json;

    match cli.command {
        Command::Health => return health(&settings, json).await,
        Command::Stats => {
            let queue = connect(&settings).await?;
            let stats = queue.stats().await?;
            print(json, &stats, || {
                format!(
                    "pending: {}\ndelayed: {}\nin_flight: {}\ndead_lettered: {}\nsucceeded: {}\ncancelled: {}",
                    stats.pending,
                    stats.delayed,
                    stats.in_flight,
                    stats.dead_lettered,
                    stats.succeeded,
                    stats.cancelled
                )
            })?;
        }
        Command::DeadLetters { limit } => {
            let queue = connect(&settings).await?;
            let entries = queue.dead_letters(limit).await?;
            print(json, &entries, || {
                entries
                    .iter()
                    .map(|e| {
                        format!(
                            "{}  {}  attempts={}  {}  {}",
                            e.job.id,
                            e.job.priority,
                            e.job.attempt,
                            e.dead_lettered_at.to_rfc3339(),
                            e.reason
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Command::Replay { job_id } => {
            let queue = connect(&settings).await?;
            let job = queue.replay_dead_letter(job_id).await?;
            print(json, &job, || format!("replayed {} ({})", job.id, job.priority))?;
        }
        Command::Delete { job_id } => {
            let queue = connect(&settings).await?;
            queue.delete_dead_letter(job_id).await?;
            print(json, &serde_json::json!({ "deleted": job_id }), || {
                format!("deleted {job_id}")
            })?;
        }
        Command::Cancel { job_id } => {
            let queue = connect(&settings).await?;
            let outcome = queue.cancel(job_id).await?;
            print(json, &outcome, || format!("{job_id}: {outcome:?}"))?;
        }
        Command::Submit {
            priority,
            payload,
            tokens,
            key,
        } => {
            let queue = connect(&settings).await?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            let mut request = EnqueueRequest::new(priority, payload).estimated_tokens(tokens);
            if let Some(key) = key {
                request = request.idempotency_key(key);
            }
            let submission = queue.submit(request).await?;
            let duplicate = matches!(submission, admitq_core::Submission::Duplicate(_));
            let report = serde_json::json!({
                "job_id": submission.job_id(),
                "duplicate": duplicate,
            });
            print(json, &report, || {
                if duplicate {
                    format!("duplicate of {}", submission.job_id())
                } else {
                    format!("submitted {}", submission.job_id())
                }
            })?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn connect(settings: &Settings) -> Result<JobQueue> {
    let store = RedisJobStore::connect(&settings.store)
        .await
        .with_context(|| format!("connecting to {}", settings.store.address.redacted()))?;
    Ok(JobQueue::from_config(
        std::sync::Arc::new(store),
        SystemClock::arc(),
        &settings.queue,
    ))
}

async fn health(settings: &Settings, json: bool) -> Result<ExitCode> {
    let state = inspect_store(settings).await;
    let reachable = state.is_some();
    let report = serde_json::json!({
        "environment": settings.queue.environment,
        "store_available": reachable,
        "ready": reachable,
        "circuit": state.map(|(circuit, _)| circuit),
        "rate_limit_window": state.map(|(_, window)| window),
    });
    print(json, &report, || match state {
        Some((circuit, window)) => format!(
            "ok\ncircuit: {} ({} consecutive failures)\nwindow: {} requests, {} tokens since {}",
            circuit.state.as_str(),
            circuit.consecutive_failures,
            window.requests,
            window.tokens,
            window.started_at.to_rfc3339()
        ),
        None => "store unreachable".to_string(),
    })?;
    Ok(if reachable { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Connects on its own so an unreachable store is reported, not raised.
async fn inspect_store(settings: &Settings) -> Option<(CircuitSnapshot, Window)> {
    match StoreClient::connect(&settings.store).await {
        Ok(client) => admission_state(client, &settings.queue)
            .await
            .map_err(|e| warn!(error = %e, "admission state unreadable"))
            .ok(),
        Err(e) => {
            warn!(store = %settings.store.address.redacted(), error = %e, "store unreachable");
            None
        }
    }
}

async fn admission_state(
    client: StoreClient,
    config: &QueueConfig,
) -> QueueResult<(CircuitSnapshot, Window)> {
    let store = RedisAdmissionStore::arc(client);
    let clock = SystemClock::arc();
    let breaker = CircuitBreaker::new(config.circuit_breaker, clock.clone(), store.clone());
    let limiter = RateLimiter::new(config.rate_limit, clock, store);
    Ok((breaker.snapshot().await?, limiter.snapshot().await?))
}

fn print<T, F>(json: bool, value: &T, human: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce() -> String,
{
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", human());
    }
    Ok(())
}
