//! Pipeline job handlers.
//!
//! One file per queue. Handlers are plain async functions taking the
//! shared [`JobContext`] and the claimed job, returning a JSON output on
//! success or a classified [`JobError`]; the worker pool applies the
//! retry/backoff policy centrally.

mod activity_points;
mod leaderboard;
mod maintenance;
mod multiplier;
mod season_points;
mod snapshot;
mod snapshot_range;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use uuid::Uuid;

use crate::config::QueueSettings;
use crate::db::models::Week;
use crate::queue::{
    typed_validator, DagNode, EnqueueOpts, Job, JobContext, JobError, Queue, QueueRegistry,
    WorkerPool,
};

pub use activity_points::ActivityPointsPayload;
pub use leaderboard::LeaderboardPayload;
pub use maintenance::MaintenancePayload;
pub use multiplier::MultiplierPayload;
pub use season_points::SeasonPointsPayload;
pub use snapshot::SnapshotPayload;
pub use snapshot_range::SnapshotRangePayload;

pub const SNAPSHOT_QUEUE: &str = "snapshot";
pub const SNAPSHOT_RANGE_QUEUE: &str = "snapshot-date-range";
pub const ACTIVITY_POINTS_QUEUE: &str = "calculate-activity-points";
pub const MULTIPLIER_QUEUE: &str = "calculate-season-points-multiplier";
pub const SEASON_POINTS_QUEUE: &str = "calculate-season-points";
pub const LEADERBOARD_QUEUE: &str = "populate-leaderboard-cache";
pub const MAINTENANCE_QUEUE: &str = "maintenance";

/// Declare every pipeline queue with its payload schema and concurrency.
///
/// Snapshot ingestion, the season-points seal and the leaderboard rebuild
/// are serialized (concurrency 1); the per-week calculators may overlap
/// across weeks.
pub fn register_queues(registry: &mut QueueRegistry, queue: &QueueSettings) {
    let attempts = queue.max_attempts;
    let parallel = queue.default_concurrency;

    registry.register(Queue::new(
        SNAPSHOT_QUEUE,
        1,
        attempts,
        typed_validator::<SnapshotPayload>(),
    ));
    registry.register(Queue::new(
        SNAPSHOT_RANGE_QUEUE,
        1,
        attempts,
        typed_validator::<SnapshotRangePayload>(),
    ));
    registry.register(Queue::new(
        ACTIVITY_POINTS_QUEUE,
        parallel,
        attempts,
        typed_validator::<ActivityPointsPayload>(),
    ));
    registry.register(Queue::new(
        MULTIPLIER_QUEUE,
        parallel,
        attempts,
        typed_validator::<MultiplierPayload>(),
    ));
    registry.register(Queue::new(
        SEASON_POINTS_QUEUE,
        1,
        attempts,
        typed_validator::<SeasonPointsPayload>(),
    ));
    registry.register(Queue::new(
        LEADERBOARD_QUEUE,
        1,
        attempts,
        typed_validator::<LeaderboardPayload>(),
    ));
    registry.register(Queue::new(
        MAINTENANCE_QUEUE,
        1,
        attempts,
        typed_validator::<MaintenancePayload>(),
    ));
}

/// Bind every queue to its handler.
pub fn register_handlers(pool: &mut WorkerPool) {
    pool.register(SNAPSHOT_QUEUE, |ctx, job| snapshot::run(ctx, job).boxed());
    pool.register(SNAPSHOT_RANGE_QUEUE, |ctx, job| {
        snapshot_range::run(ctx, job).boxed()
    });
    pool.register(ACTIVITY_POINTS_QUEUE, |ctx, job| {
        activity_points::run(ctx, job).boxed()
    });
    pool.register(MULTIPLIER_QUEUE, |ctx, job| {
        multiplier::run(ctx, job).boxed()
    });
    pool.register(SEASON_POINTS_QUEUE, |ctx, job| {
        season_points::run(ctx, job).boxed()
    });
    pool.register(LEADERBOARD_QUEUE, |ctx, job| {
        leaderboard::run(ctx, job).boxed()
    });
    pool.register(MAINTENANCE_QUEUE, |ctx, job| {
        maintenance::run(ctx, job).boxed()
    });
}

/// The daily calculation chain: activity points, then the multiplier,
/// then season points. Each edge carries the fail-parent flag, so a
/// failed stage aborts everything downstream of it.
///
/// Payloads are empty; each stage resolves "the week containing now" when
/// it runs, not when the graph is enqueued.
pub fn calculation_dag(date_key: &str) -> DagNode {
    let activity = DagNode::new(ACTIVITY_POINTS_QUEUE, "calculate-activity-points", json!({}))
        .fail_parent(true);
    let multiplier = DagNode::new(
        MULTIPLIER_QUEUE,
        "calculate-season-points-multiplier",
        json!({}),
    )
    .fail_parent(true)
    .child(activity);

    DagNode::new(SEASON_POINTS_QUEUE, "calculate-season-points", json!({}))
        .with_opts(EnqueueOpts {
            job_key: Some(format!("calculations-{}", date_key)),
            ..Default::default()
        })
        .child(multiplier)
}

// ==================== HELPER FUNCTIONS ====================

/// Parse the claimed job's payload. Payloads were validated at enqueue
/// time, so a parse failure here is a domain error, never retried.
pub(crate) fn parse_payload<T: DeserializeOwned>(job: &Job) -> Result<T, JobError> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| JobError::domain(format!("malformed payload: {}", e)))
}

/// Resolve the target week: the given id, or the week containing now.
pub(crate) async fn resolve_week(
    ctx: &JobContext,
    week_id: Option<Uuid>,
) -> Result<Week, JobError> {
    let week = match week_id {
        Some(id) => ctx.db.postgres.get_week(id).await?,
        None => ctx.db.postgres.get_week_containing(Utc::now()).await?,
    };

    week.ok_or_else(|| match week_id {
        Some(id) => JobError::domain(format!("week {} not found", id)),
        None => JobError::domain("no week configured for the current date"),
    })
}

/// Hour-stamped dedupe key, so a trigger firing twice within the hour
/// collapses to one job.
pub(crate) fn hour_key(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}", prefix, at.format("%Y-%m-%dT%H"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_calculation_dag_shape() {
        let dag = calculation_dag("2025-01-06");

        assert_eq!(dag.queue, SEASON_POINTS_QUEUE);
        assert_eq!(dag.opts.job_key.as_deref(), Some("calculations-2025-01-06"));
        assert!(!dag.fail_parent_on_failure);

        assert_eq!(dag.children.len(), 1);
        let multiplier = &dag.children[0];
        assert_eq!(multiplier.queue, MULTIPLIER_QUEUE);
        assert!(multiplier.fail_parent_on_failure);

        assert_eq!(multiplier.children.len(), 1);
        let activity = &multiplier.children[0];
        assert_eq!(activity.queue, ACTIVITY_POINTS_QUEUE);
        assert!(activity.fail_parent_on_failure);
        assert!(activity.children.is_empty());
    }

    #[test]
    fn test_hour_key_truncates_to_hour() {
        let at = Utc.with_ymd_and_hms(2025, 1, 6, 14, 37, 59).unwrap();
        assert_eq!(hour_key("snapshot", at), "snapshot-2025-01-06T14");
    }
}
