//! Command-line surface of the operator tool.

use clap::{Parser, Subcommand};

use admitq_core::{JobId, Priority};

/// admitq-admin - inspect and operate the job queue
#[derive(Parser, Debug)]
#[command(name = "admitq-admin", version, about = "Operate the admission-controlled job queue")]
pub struct Cli {
    /// Print machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show queue statistics
    Stats,

    /// Check store connectivity and show the shared breaker and rate-limit window;
    /// exits non-zero when the store is unreachable
    Health,

    /// List dead-lettered jobs, oldest first
    DeadLetters {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Return a dead-lettered job to the queue with its attempts reset
    Replay { job_id: JobId },

    /// Permanently delete a dead-lettered job
    Delete { job_id: JobId },

    /// Cancel a pending job, or flag an in-flight one
    Cancel { job_id: JobId },

    /// Submit a job
    Submit {
        /// high, medium or low
        #[arg(long, short = 'p', default_value = "medium")]
        priority: Priority,

        /// Job payload as a JSON string
        #[arg(long)]
        payload: String,

        /// Estimated token usage, pre-charged at dispatch
        #[arg(long, default_value_t = 0)]
        tokens: u64,

        /// Idempotency key; duplicates of a resident job are ignored
        #[arg(long)]
        key: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_submit() {
        let cli = Cli::try_parse_from([
            "admitq-admin",
            "submit",
            "--priority",
            "high",
            "--payload",
            r#"{"prompt":"hi"}"#,
            "--tokens",
            "1200",
        ])
        .unwrap();
        match cli.command {
            Command::Submit { priority, tokens, key, .. } => {
                assert_eq!(priority, Priority::High);
                assert_eq!(tokens, 1_200);
                assert!(key.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_job_id() {
        assert!(Cli::try_parse_from(["admitq-admin", "replay", "not-a-uuid"]).is_err());
    }
}
