use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::http::error::ApiResult;
use crate::http::AppState;
use crate::jobs::{
    LeaderboardPayload, ACTIVITY_POINTS_QUEUE, LEADERBOARD_QUEUE, MULTIPLIER_QUEUE,
    SEASON_POINTS_QUEUE, SNAPSHOT_QUEUE, SNAPSHOT_RANGE_QUEUE,
};
use crate::queue::{EnqueueOpts, JobHandle, JobState};

const ALL_STATES: [JobState; 6] = [
    JobState::Waiting,
    JobState::Active,
    JobState::Completed,
    JobState::Failed,
    JobState::Stalled,
    JobState::Aborted,
];

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/queues/snapshot/add", post(add_snapshot))
        .route("/queues/snapshot-date-range/add", post(add_snapshot_range))
        .route(
            "/queues/calculate-activity-points/add",
            post(add_activity_points),
        )
        .route(
            "/queues/calculate-season-points/add",
            post(add_season_points),
        )
        .route(
            "/queues/calculate-season-points-multiplier/add",
            post(add_multiplier),
        )
        .route(
            "/queues/populate-leaderboard-cache/add",
            post(add_leaderboard),
        )
        .route("/queues/{queue}/schedules", post(add_schedule))
}

async fn health(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    state.db.postgres.health_check().await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Prometheus text exposition. State gauges are refreshed from the jobs
/// table on every scrape; absent (queue, state) pairs read as zero.
async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    for queue in state.queues.queue_names() {
        for job_state in &ALL_STATES {
            state
                .metrics
                .jobs_in_state
                .with_label_values(&[queue, job_state.as_str()])
                .set(0);
        }
    }
    for (queue, job_state, count) in state.queues.store().counts_by_state().await? {
        state
            .metrics
            .jobs_in_state
            .with_label_values(&[queue.as_str(), job_state.as_str()])
            .set(count);
    }

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather(),
    ))
}

// ==================== ENQUEUE ENDPOINTS ====================

async fn enqueue(
    state: &AppState,
    queue: &'static str,
    payload: Value,
    opts: EnqueueOpts,
) -> ApiResult<(StatusCode, Json<JobHandle>)> {
    let handle = state.queues.enqueue(queue, queue, payload, opts).await?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

async fn add_snapshot(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<JobHandle>)> {
    enqueue(&state, SNAPSHOT_QUEUE, payload, EnqueueOpts::default()).await
}

async fn add_snapshot_range(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<JobHandle>)> {
    enqueue(&state, SNAPSHOT_RANGE_QUEUE, payload, EnqueueOpts::default()).await
}

async fn add_activity_points(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<JobHandle>)> {
    enqueue(&state, ACTIVITY_POINTS_QUEUE, payload, EnqueueOpts::default()).await
}

async fn add_season_points(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<JobHandle>)> {
    enqueue(&state, SEASON_POINTS_QUEUE, payload, EnqueueOpts::default()).await
}

async fn add_multiplier(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<JobHandle>)> {
    enqueue(&state, MULTIPLIER_QUEUE, payload, EnqueueOpts::default()).await
}

/// Leaderboard rebuilds are keyed by scope: a second request for a scope
/// that is already queued collapses onto the pending job.
async fn add_leaderboard(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<JobHandle>)> {
    let job_key = serde_json::from_value::<LeaderboardPayload>(payload.clone())
        .ok()
        .map(|p| leaderboard_job_key(&p));

    enqueue(
        &state,
        LEADERBOARD_QUEUE,
        payload,
        EnqueueOpts {
            job_key,
            ..Default::default()
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    job_name: String,
    cron_pattern: String,
    payload: Option<Value>,
}

/// Register or update a repeatable job. The cron scheduler picks the
/// schedule up on its next sync pass; re-posting the same name and
/// pattern is a no-op, a changed pattern replaces the entry.
async fn add_schedule(
    State(state): State<Arc<AppState>>,
    Path(queue): Path<String>,
    Json(request): Json<ScheduleRequest>,
) -> ApiResult<StatusCode> {
    state
        .queues
        .schedule(
            &queue,
            &request.job_name,
            &request.cron_pattern,
            request.payload.unwrap_or_else(|| json!({})),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

fn leaderboard_job_key(payload: &LeaderboardPayload) -> String {
    match (payload.season_id, payload.week_id) {
        (Some(season_id), _) => format!("leaderboard-season-{}", season_id),
        (_, Some(week_id)) => format!("leaderboard-week-{}", week_id),
        _ => "leaderboard-all".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn payload(value: Value) -> LeaderboardPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_leaderboard_key_per_scope() {
        let season_id = Uuid::new_v4();
        let week_id = Uuid::new_v4();

        assert_eq!(
            leaderboard_job_key(&payload(json!({ "seasonId": season_id }))),
            format!("leaderboard-season-{}", season_id)
        );
        assert_eq!(
            leaderboard_job_key(&payload(json!({ "weekId": week_id }))),
            format!("leaderboard-week-{}", week_id)
        );
        assert_eq!(leaderboard_job_key(&payload(json!({}))), "leaderboard-all");
    }

    #[test]
    fn test_schedule_request_payload_is_optional() {
        let request: ScheduleRequest = serde_json::from_value(json!({
            "jobName": "nightly-leaderboard",
            "cronPattern": "0 3 * * *",
        }))
        .unwrap();
        assert_eq!(request.job_name, "nightly-leaderboard");
        assert_eq!(request.cron_pattern, "0 3 * * *");
        assert!(request.payload.is_none());
    }
}
