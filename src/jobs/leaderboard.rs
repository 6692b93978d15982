//! Leaderboard cache populator.
//!
//! Rebuilds the ranked views for a season, a week (plus its per-category
//! boards) or everything. The queue runs with concurrency 1, so rebuilds
//! never overlap.

use std::collections::HashMap;

use log::info;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::postgres::{category_cache_key, rank_entries, season_cache_key, week_cache_key};
use crate::jobs::parse_payload;
use crate::queue::{Job, JobContext, JobError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPayload {
    #[serde(default)]
    pub season_id: Option<Uuid>,
    #[serde(default)]
    pub week_id: Option<Uuid>,
    /// Rebuild even when the scope is already populated.
    #[serde(default)]
    pub force: bool,
}

impl crate::queue::ValidatedPayload for LeaderboardPayload {
    fn validate(&self) -> Result<(), String> {
        if self.season_id.is_some() && self.week_id.is_some() {
            return Err("seasonId and weekId are mutually exclusive".to_string());
        }
        Ok(())
    }
}

pub async fn run(ctx: JobContext, job: Job) -> Result<Value, JobError> {
    let payload: LeaderboardPayload = parse_payload(&job)?;

    let rebuilt = match (payload.season_id, payload.week_id) {
        (Some(season_id), None) => rebuild_season(&ctx, season_id, payload.force).await?,
        (None, Some(week_id)) => rebuild_week(&ctx, week_id, payload.force).await?,
        (None, None) => rebuild_everything(&ctx, payload.force).await?,
        (Some(_), Some(_)) => unreachable!("rejected at enqueue"),
    };

    info!("Leaderboard populate rebuilt {} scopes", rebuilt);
    Ok(json!({ "rebuilt": rebuilt }))
}

async fn rebuild_season(ctx: &JobContext, season_id: Uuid, force: bool) -> Result<u64, JobError> {
    if ctx.db.postgres.get_season(season_id).await?.is_none() {
        return Err(JobError::domain(format!("season {} not found", season_id)));
    }

    let cache_key = season_cache_key(season_id);
    if !force && ctx.db.postgres.leaderboard_populated(&cache_key).await? {
        return Ok(0);
    }

    // Season totals are the per-week rows summed per user
    let mut totals: HashMap<Uuid, Decimal> = HashMap::new();
    for row in ctx.db.postgres.get_season_points(season_id).await? {
        *totals.entry(row.user_id).or_default() += row.points;
    }

    let rows = totals
        .into_iter()
        .map(|(user_id, points)| (user_id, points, None))
        .collect();
    let entries = rank_entries(&cache_key, rows);
    ctx.db.postgres.rebuild_leaderboard(&cache_key, &entries).await?;
    ctx.metrics.leaderboards_rebuilt.inc();

    Ok(1)
}

async fn rebuild_week(ctx: &JobContext, week_id: Uuid, force: bool) -> Result<u64, JobError> {
    if ctx.db.postgres.get_week(week_id).await?.is_none() {
        return Err(JobError::domain(format!("week {} not found", week_id)));
    }

    let mut rebuilt = 0;

    let cache_key = week_cache_key(week_id);
    if force || !ctx.db.postgres.leaderboard_populated(&cache_key).await? {
        let rows = ctx
            .db
            .postgres
            .get_week_points(week_id)
            .await?
            .into_iter()
            .map(|(user_id, points)| (user_id, points, None))
            .collect();
        let entries = rank_entries(&cache_key, rows);
        ctx.db.postgres.rebuild_leaderboard(&cache_key, &entries).await?;
        ctx.metrics.leaderboards_rebuilt.inc();
        rebuilt += 1;
    }

    for category in ctx.db.postgres.get_activity_categories().await? {
        let cache_key = category_cache_key(week_id, &category);
        if !force && ctx.db.postgres.leaderboard_populated(&cache_key).await? {
            continue;
        }

        let rows = ctx
            .db
            .postgres
            .get_category_breakdown(week_id, &category)
            .await?;
        let entries = rank_entries(&cache_key, rows);
        ctx.db.postgres.rebuild_leaderboard(&cache_key, &entries).await?;
        ctx.metrics.leaderboards_rebuilt.inc();
        rebuilt += 1;
    }

    Ok(rebuilt)
}

async fn rebuild_everything(ctx: &JobContext, force: bool) -> Result<u64, JobError> {
    let mut rebuilt = 0;
    for season in ctx.db.postgres.get_seasons().await? {
        rebuilt += rebuild_season(ctx, season.id, force).await?;
        for week in ctx.db.postgres.get_weeks_for_season(season.id).await? {
            rebuilt += rebuild_week(ctx, week.id, force).await?;
        }
    }
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ValidatedPayload;

    #[test]
    fn test_scopes_are_exclusive() {
        let payload: LeaderboardPayload = serde_json::from_value(json!({
            "seasonId": Uuid::new_v4(),
            "weekId": Uuid::new_v4(),
            "force": false,
        }))
        .unwrap();
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_empty_scope_means_everything() {
        let payload: LeaderboardPayload = serde_json::from_value(json!({})).unwrap();
        assert!(payload.validate().is_ok());
        assert!(payload.season_id.is_none());
        assert!(payload.week_id.is_none());
        assert!(!payload.force);
    }
}
