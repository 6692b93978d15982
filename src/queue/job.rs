use chrono::{DateTime, Duration, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state of a queued job (PostgreSQL enum `job_state`).
///
/// `Stalled` is terminal: the job's lease expired more times than the
/// stall budget allows. `Aborted` means a child with the fail-parent flag
/// failed before this job ever ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[postgres(name = "job_state")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[postgres(name = "waiting")]
    Waiting,
    #[postgres(name = "active")]
    Active,
    #[postgres(name = "completed")]
    Completed,
    #[postgres(name = "failed")]
    Failed,
    #[postgres(name = "stalled")]
    Stalled,
    #[postgres(name = "aborted")]
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Stalled | JobState::Aborted
        )
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, JobState::Failed | JobState::Stalled | JobState::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Stalled => "stalled",
            JobState::Aborted => "aborted",
        }
    }
}

/// A claimed job row, as handed to a worker.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub name: String,
    pub job_key: Option<String>,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub stall_count: i32,
    pub run_at: DateTime<Utc>,
    pub parent_id: Option<Uuid>,
    pub fail_parent_on_failure: bool,
    pub created_at: DateTime<Utc>,
}

/// How a handler failed, which decides whether the job retries.
///
/// `Domain` failures are permanent by construction (bad payload, guard
/// violation); retrying would fail identically. `Transient` covers
/// infrastructure trouble and always retries within the attempt budget.
/// `Defect` is a handler panic, retried on the assumption the panic may
/// be environmental.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Domain(String),
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
    #[error("handler defect: {0}")]
    Defect(String),
}

impl JobError {
    pub fn domain(msg: impl Into<String>) -> Self {
        JobError::Domain(msg.into())
    }

    pub fn retryable(&self) -> bool {
        !matches!(self, JobError::Domain(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Domain(_) => "domain",
            JobError::Transient(_) => "transient",
            JobError::Defect(_) => "defect",
        }
    }
}

/// Why an enqueue request was rejected.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("unknown queue {0}")]
    UnknownQueue(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

/// Per-job options accepted on enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOpts {
    /// Dedupe key: while a job with this key is waiting or active on the
    /// queue, further enqueues return the existing job.
    pub job_key: Option<String>,
    /// Higher runs first.
    pub priority: i32,
    /// Defer the first run.
    pub delay: Option<Duration>,
    /// Override the queue's attempt budget.
    pub max_attempts: Option<i32>,
}

/// Receipt for an accepted job.
#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub queue: String,
    /// True when a keyed enqueue matched an existing waiting/active job.
    pub deduplicated: bool,
}

/// A repeatable job definition, materialized into job rows by the
/// scheduler.
#[derive(Debug, Clone)]
pub struct JobSchedule {
    pub queue: String,
    pub job_name: String,
    pub cron_pattern: String,
    pub payload: serde_json::Value,
}

/// Exponential backoff before retry attempt `attempt` (1-based):
/// `base * 2^(attempt - 1)`.
pub fn backoff_delay(base_ms: u64, attempt: i32) -> Duration {
    let exp = attempt.saturating_sub(1).clamp(0, 20) as u32;
    Duration::milliseconds(base_ms.saturating_mul(2u64.pow(exp)) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1000, 1), Duration::milliseconds(1000));
        assert_eq!(backoff_delay(1000, 2), Duration::milliseconds(2000));
        assert_eq!(backoff_delay(1000, 3), Duration::milliseconds(4000));
    }

    #[test]
    fn test_backoff_clamps_extremes() {
        // Attempt 0 and negative behave like the first attempt
        assert_eq!(backoff_delay(1000, 0), Duration::milliseconds(1000));
        assert_eq!(backoff_delay(1000, -3), Duration::milliseconds(1000));
        // Huge attempt counts do not overflow
        let capped = backoff_delay(1000, 10_000);
        assert_eq!(capped, Duration::milliseconds(1000 * (1 << 20)));
    }

    #[test]
    fn test_error_retryability() {
        assert!(!JobError::domain("week already processed").retryable());
        assert!(JobError::Transient(anyhow::anyhow!("db down")).retryable());
        assert!(JobError::Defect("panicked".into()).retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(JobError::domain("x").kind(), "domain");
        assert_eq!(JobError::Transient(anyhow::anyhow!("x")).kind(), "transient");
        assert_eq!(JobError::Defect("x".into()).kind(), "defect");
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Stalled.is_terminal());
        assert!(JobState::Aborted.is_terminal());

        assert!(!JobState::Completed.is_terminal_failure());
        assert!(JobState::Stalled.is_terminal_failure());
    }

    #[test]
    fn test_state_serde_is_snake_case() {
        let json = serde_json::to_string(&JobState::Waiting).unwrap();
        assert_eq!(json, "\"waiting\"");
        let back: JobState = serde_json::from_str("\"stalled\"").unwrap();
        assert_eq!(back, JobState::Stalled);
    }
}
