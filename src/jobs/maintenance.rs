//! Storage maintenance: partition retention and consolidation, plus
//! terminal-job cleanup. Triggered daily by the scheduler.

use chrono::{Duration, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::jobs::parse_payload;
use crate::queue::{Job, JobContext, JobError};

/// How long finished job rows are kept for triage.
const JOB_RETENTION_DAYS: i64 = 14;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenancePayload {
    /// Report what consolidation would do without touching storage.
    #[serde(default)]
    pub dry_run: bool,
}

impl crate::queue::ValidatedPayload for MaintenancePayload {}

pub async fn run(ctx: JobContext, job: Job) -> Result<Value, JobError> {
    let payload: MaintenancePayload = parse_payload(&job)?;
    let partitions = &ctx.settings.partitions;
    let now = Utc::now();

    let dropped = match partitions.retention_weeks {
        Some(weeks) if !payload.dry_run => {
            let cutoff = now - Duration::weeks(weeks);
            ctx.db.postgres.drop_old_partitions(cutoff).await?
        },
        _ => Vec::new(),
    };

    let consolidate_before = now - Duration::weeks(partitions.consolidate_after_weeks);
    let consolidated = ctx
        .db
        .postgres
        .consolidate_partitions(consolidate_before, payload.dry_run)
        .await?;

    let purged = if payload.dry_run {
        0
    } else {
        ctx.queues
            .store()
            .purge_terminal_jobs(now - Duration::days(JOB_RETENTION_DAYS))
            .await?
    };

    info!(
        "Maintenance{}: dropped {} partitions, consolidated {}, purged {} jobs",
        if payload.dry_run { " (dry run)" } else { "" },
        dropped.len(),
        consolidated.len(),
        purged
    );

    Ok(json!({
        "dryRun": payload.dry_run,
        "droppedPartitions": dropped,
        "consolidated": consolidated,
        "purgedJobs": purged,
    }))
}
