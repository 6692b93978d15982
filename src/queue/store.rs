use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::error;
use serde_json::Value;
use tokio_postgres::{GenericClient, Transaction};
use uuid::Uuid;

use crate::db::postgres::{sanitize_string, PostgresClient};
use crate::queue::job::{Job, JobSchedule, JobState};

const JOB_COLUMNS: &str = r#"
    id, queue, name, job_key, payload, state, priority, attempts,
    max_attempts, stall_count, run_at, parent_id, fail_parent_on_failure,
    created_at
"#;

/// A fully resolved job row ready for insertion.
#[derive(Debug, Clone)]
pub(crate) struct NewJob {
    pub id: Uuid,
    pub queue: String,
    pub name: String,
    pub job_key: Option<String>,
    pub payload: Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
    pub parent_id: Option<Uuid>,
    pub pending_children: i32,
    pub fail_parent_on_failure: bool,
}

/// What a sweep pass did, as (job id, queue) pairs.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub requeued: Vec<(Uuid, String)>,
    pub stalled: Vec<(Uuid, String)>,
    pub aborted: Vec<(Uuid, String)>,
}

/// Durable job storage on top of the `jobs` table.
///
/// Claiming uses `FOR UPDATE SKIP LOCKED` so any number of workers can
/// poll the same queue without handing out a job twice.
#[derive(Clone)]
pub struct JobStore {
    db: Arc<PostgresClient>,
}

impl JobStore {
    pub fn new(db: Arc<PostgresClient>) -> Self {
        Self {
            db,
        }
    }

    // ==================== ENQUEUE ====================

    /// Insert one job. A keyed insert that collides with a waiting/active
    /// job of the same key returns the existing job's id instead.
    pub(crate) async fn insert_job(&self, job: &NewJob) -> anyhow::Result<(Uuid, bool)> {
        let client = self.db.pool.get().await?;

        let inserted = insert_one(&**client, job).await?;
        if inserted {
            return Ok((job.id, false));
        }

        // Deduplicated: surface the live job holding the key
        let existing = client
            .query_one(
                r#"
                SELECT id FROM incentives.jobs
                WHERE queue = $1 AND job_key = $2 AND state IN ('waiting', 'active')
                LIMIT 1
                "#,
                &[&job.queue, &job.job_key],
            )
            .await?;

        Ok((existing.get("id"), true))
    }

    /// Insert a job graph atomically; `jobs[0]` must be the root. When the
    /// root deduplicates against an existing keyed job, nothing is
    /// inserted and the existing root id is returned.
    pub(crate) async fn insert_dag(&self, jobs: &[NewJob]) -> anyhow::Result<(Uuid, bool)> {
        let root = jobs
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty job graph"))?;

        let mut client = self.db.pool.get().await?;
        let tx = client.transaction().await?;

        let inserted = insert_one(&*tx, root).await?;
        if !inserted {
            tx.rollback().await?;
            let client = self.db.pool.get().await?;
            let existing = client
                .query_one(
                    r#"
                    SELECT id FROM incentives.jobs
                    WHERE queue = $1 AND job_key = $2 AND state IN ('waiting', 'active')
                    LIMIT 1
                    "#,
                    &[&root.queue, &root.job_key],
                )
                .await?;
            return Ok((existing.get("id"), true));
        }

        for job in &jobs[1..] {
            insert_one(&*tx, job).await?;
        }

        tx.commit().await?;
        Ok((root.id, false))
    }

    // ==================== CLAIM & LEASE ====================

    /// Claim the next runnable job on a queue, taking an exclusive lease
    /// of `lock_secs`. Jobs with incomplete children are not runnable.
    pub async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lock_secs: f64,
    ) -> anyhow::Result<Option<Job>> {
        let client = self.db.pool.get().await?;
        let query = format!(
            r#"
            UPDATE incentives.jobs
            SET state = 'active',
                attempts = attempts + 1,
                lock_until = NOW() + make_interval(secs => $3),
                locked_by = $2,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM incentives.jobs
                WHERE queue = $1 AND state = 'waiting'
                  AND run_at <= NOW() AND pending_children = 0
                ORDER BY priority DESC, run_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = client
            .query_opt(&query, &[&queue, &worker_id, &lock_secs])
            .await?;

        Ok(row.map(|row| row_to_job(&row)))
    }

    /// Push the lease of an active job forward. Returns false when the
    /// job is no longer active (swept or finished elsewhere).
    pub async fn extend_lease(&self, job_id: Uuid, lock_secs: f64) -> anyhow::Result<bool> {
        let client = self.db.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE incentives.jobs
                SET lock_until = NOW() + make_interval(secs => $2), updated_at = NOW()
                WHERE id = $1 AND state = 'active'
                "#,
                &[&job_id, &lock_secs],
            )
            .await?;

        Ok(updated == 1)
    }

    // ==================== OUTCOMES ====================

    /// Mark a job completed and release its parent's child count.
    pub async fn complete(&self, job_id: Uuid, output: &Value) -> anyhow::Result<()> {
        let mut client = self.db.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                r#"
                UPDATE incentives.jobs
                SET state = 'completed', output = $2, lock_until = NULL, locked_by = NULL,
                    completed_at = NOW(), updated_at = NOW()
                WHERE id = $1 AND state = 'active'
                RETURNING parent_id
                "#,
                &[&job_id, &output],
            )
            .await?;

        if let Some(row) = row {
            let parent_id: Option<Uuid> = row.get("parent_id");
            if let Some(parent_id) = parent_id {
                tx.execute(
                    r#"
                    UPDATE incentives.jobs
                    SET pending_children = pending_children - 1, updated_at = NOW()
                    WHERE id = $1 AND pending_children > 0
                    "#,
                    &[&parent_id],
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Put a failed job back on the queue for a later attempt.
    pub async fn retry(
        &self,
        job_id: Uuid,
        run_at: DateTime<Utc>,
        error_msg: &str,
        error_kind: &str,
    ) -> anyhow::Result<()> {
        let client = self.db.pool.get().await?;
        client
            .execute(
                r#"
                UPDATE incentives.jobs
                SET state = 'waiting', run_at = $2, error = $3, error_kind = $4,
                    lock_until = NULL, locked_by = NULL, updated_at = NOW()
                WHERE id = $1 AND state = 'active'
                "#,
                &[&job_id, &run_at, &sanitize_string(error_msg), &error_kind],
            )
            .await
            .map_err(|e| {
                error!("Failed to requeue job {}: {:?}", job_id, e);
                e
            })?;

        Ok(())
    }

    /// Fail a job permanently. When the job carries the fail-parent flag
    /// its waiting ancestors are aborted in the same transaction; the
    /// aborted (id, queue) pairs are returned.
    pub async fn fail(
        &self,
        job: &Job,
        error_msg: &str,
        error_kind: &str,
    ) -> anyhow::Result<Vec<(Uuid, String)>> {
        let mut client = self.db.pool.get().await?;
        let tx = client.transaction().await?;

        tx.execute(
            r#"
            UPDATE incentives.jobs
            SET state = 'failed', error = $2, error_kind = $3,
                lock_until = NULL, locked_by = NULL,
                completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND state = 'active'
            "#,
            &[&job.id, &sanitize_string(error_msg), &error_kind],
        )
        .await?;

        let aborted = if job.fail_parent_on_failure {
            let reason = format!("aborted by failed job {}", job.id);
            abort_ancestors(&tx, job.parent_id, &reason).await?
        } else {
            Vec::new()
        };

        tx.commit().await?;
        Ok(aborted)
    }

    // ==================== STALL SWEEP ====================

    /// Requeue every active job whose lease has expired; jobs that have
    /// exhausted the stall budget go to the terminal stalled state and
    /// propagate aborts like a failure.
    pub async fn sweep(&self, max_stalled: i32) -> anyhow::Result<SweepOutcome> {
        let mut client = self.db.pool.get().await?;
        let tx = client.transaction().await?;

        let rows = tx
            .query(
                r#"
                WITH expired AS (
                    SELECT id FROM incentives.jobs
                    WHERE state = 'active' AND lock_until < NOW()
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE incentives.jobs j
                SET state = CASE WHEN j.stall_count + 1 >= $1
                        THEN 'stalled'::incentives.job_state
                        ELSE 'waiting'::incentives.job_state END,
                    stall_count = j.stall_count + 1,
                    lock_until = NULL,
                    locked_by = NULL,
                    error = CASE WHEN j.stall_count + 1 >= $1
                        THEN 'lease expired too many times' ELSE j.error END,
                    error_kind = CASE WHEN j.stall_count + 1 >= $1
                        THEN 'stalled' ELSE j.error_kind END,
                    completed_at = CASE WHEN j.stall_count + 1 >= $1
                        THEN NOW() ELSE j.completed_at END,
                    updated_at = NOW()
                FROM expired
                WHERE j.id = expired.id
                RETURNING j.id, j.queue, j.state, j.parent_id, j.fail_parent_on_failure
                "#,
                &[&max_stalled],
            )
            .await?;

        let mut outcome = SweepOutcome::default();
        for row in &rows {
            let id: Uuid = row.get("id");
            let queue: String = row.get("queue");
            let state: JobState = row.get("state");

            if state == JobState::Stalled {
                let fail_parent: bool = row.get("fail_parent_on_failure");
                if fail_parent {
                    let reason = format!("aborted by stalled job {}", id);
                    let parent_id: Option<Uuid> = row.get("parent_id");
                    let aborted = abort_ancestors(&tx, parent_id, &reason).await?;
                    outcome.aborted.extend(aborted);
                }
                outcome.stalled.push((id, queue));
            } else {
                outcome.requeued.push((id, queue));
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    // ==================== INTROSPECTION & CLEANUP ====================

    /// Job counts per (queue, state), for the metrics gauges.
    pub async fn counts_by_state(&self) -> anyhow::Result<Vec<(String, JobState, i64)>> {
        let client = self.db.pool.get().await?;
        let rows = client
            .query(
                "SELECT queue, state, COUNT(*) AS jobs FROM incentives.jobs GROUP BY queue, state",
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("queue"), row.get("state"), row.get("jobs")))
            .collect())
    }

    /// Delete terminal jobs finished before `older_than`. Returns the
    /// number of rows removed.
    pub async fn purge_terminal_jobs(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let client = self.db.pool.get().await?;
        let deleted = client
            .execute(
                r#"
                DELETE FROM incentives.jobs
                WHERE state IN ('completed', 'failed', 'stalled', 'aborted')
                  AND COALESCE(completed_at, updated_at) < $1
                "#,
                &[&older_than],
            )
            .await?;

        Ok(deleted)
    }

    // ==================== SCHEDULES ====================

    /// Register or update a repeatable job definition.
    pub async fn upsert_schedule(&self, schedule: &JobSchedule) -> anyhow::Result<()> {
        let client = self.db.pool.get().await?;
        client
            .execute(
                r#"
                INSERT INTO incentives.job_schedules (queue, job_name, cron_pattern, payload, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (queue, job_name) DO UPDATE SET
                    cron_pattern = EXCLUDED.cron_pattern,
                    payload = EXCLUDED.payload,
                    updated_at = NOW()
                "#,
                &[
                    &schedule.queue,
                    &schedule.job_name,
                    &schedule.cron_pattern,
                    &schedule.payload,
                ],
            )
            .await
            .map_err(|e| {
                error!(
                    "Failed to upsert schedule {}/{}: {:?}",
                    schedule.queue, schedule.job_name, e
                );
                e
            })?;

        Ok(())
    }

    pub async fn list_schedules(&self) -> anyhow::Result<Vec<JobSchedule>> {
        let client = self.db.pool.get().await?;
        let rows = client
            .query(
                "SELECT queue, job_name, cron_pattern, payload FROM incentives.job_schedules",
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| JobSchedule {
                queue: row.get("queue"),
                job_name: row.get("job_name"),
                cron_pattern: row.get("cron_pattern"),
                payload: row.get("payload"),
            })
            .collect())
    }
}

// ==================== HELPER FUNCTIONS ====================

/// Insert a single row; false means a keyed dedupe conflict skipped it.
async fn insert_one<C: GenericClient>(client: &C, job: &NewJob) -> anyhow::Result<bool> {
    let inserted = client
        .execute(
            r#"
            INSERT INTO incentives.jobs (
                id, queue, name, job_key, payload, priority, max_attempts,
                run_at, parent_id, pending_children, fail_parent_on_failure
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (queue, job_key)
                WHERE job_key IS NOT NULL AND state IN ('waiting', 'active')
                DO NOTHING
            "#,
            &[
                &job.id,
                &job.queue,
                &job.name,
                &job.job_key,
                &job.payload,
                &job.priority,
                &job.max_attempts,
                &job.run_at,
                &job.parent_id,
                &job.pending_children,
                &job.fail_parent_on_failure,
            ],
        )
        .await?;

    Ok(inserted == 1)
}

fn row_to_job(row: &tokio_postgres::Row) -> Job {
    Job {
        id: row.get("id"),
        queue: row.get("queue"),
        name: row.get("name"),
        job_key: row.get("job_key"),
        payload: row.get("payload"),
        state: row.get("state"),
        priority: row.get("priority"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        stall_count: row.get("stall_count"),
        run_at: row.get("run_at"),
        parent_id: row.get("parent_id"),
        fail_parent_on_failure: row.get("fail_parent_on_failure"),
        created_at: row.get("created_at"),
    }
}

/// Walk up the parent chain aborting every still-waiting ancestor while
/// the fail-parent flag keeps propagating.
async fn abort_ancestors(
    tx: &Transaction<'_>,
    mut parent: Option<Uuid>,
    reason: &str,
) -> anyhow::Result<Vec<(Uuid, String)>> {
    let mut aborted = Vec::new();

    while let Some(parent_id) = parent {
        let row = tx
            .query_opt(
                r#"
                UPDATE incentives.jobs
                SET state = 'aborted', error = $2, error_kind = 'abort',
                    completed_at = NOW(), updated_at = NOW()
                WHERE id = $1 AND state = 'waiting'
                RETURNING queue, parent_id, fail_parent_on_failure
                "#,
                &[&parent_id, &reason],
            )
            .await?;

        let Some(row) = row else {
            break;
        };
        aborted.push((parent_id, row.get("queue")));

        let propagate: bool = row.get("fail_parent_on_failure");
        parent = if propagate {
            row.get("parent_id")
        } else {
            None
        };
    }

    Ok(aborted)
}
