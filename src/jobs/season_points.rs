//! Season points stage: distributes each category's weekly pool, applies
//! the holding multiplier and seals the week.

use std::collections::HashMap;

use log::{info, warn};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::models::{SeasonStatus, UserSeasonPoints};
use crate::jobs::{parse_payload, resolve_week};
use crate::points::{BandedDistribution, PointsDistribution, MIN_MULTIPLIER};
use crate::queue::{Job, JobContext, JobError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeasonPointsPayload {
    #[serde(default)]
    pub week_id: Option<Uuid>,
    /// Recompute even when the week (or its season) is already sealed.
    #[serde(default)]
    pub force: bool,
    /// Flip `week.processed` after a successful run.
    #[serde(default)]
    pub mark_as_processed: bool,
}

impl crate::queue::ValidatedPayload for SeasonPointsPayload {}

pub async fn run(ctx: JobContext, job: Job) -> Result<Value, JobError> {
    let payload: SeasonPointsPayload = parse_payload(&job)?;
    let week = resolve_week(&ctx, payload.week_id).await?;

    // Sealed weeks and finished seasons are never silently recomputed
    if week.processed && !payload.force {
        info!("Week {} already processed, skipping", week.id);
        return Ok(json!({ "weekId": week.id, "skipped": "already processed" }));
    }
    let season = ctx
        .db
        .postgres
        .get_season(week.season_id)
        .await?
        .ok_or_else(|| JobError::domain(format!("season {} not found", week.season_id)))?;
    if season.status == SeasonStatus::Completed && !payload.force {
        info!("Season {} is completed, skipping week {}", season.id, week.id);
        return Ok(json!({ "weekId": week.id, "skipped": "season completed" }));
    }

    let pools = ctx.db.postgres.get_category_pools(week.id).await?;
    let distribution = BandedDistribution::from_settings(&ctx.settings.campaign);
    let multipliers: HashMap<Uuid, Decimal> = ctx
        .db
        .postgres
        .get_multipliers(week.id)
        .await?
        .into_iter()
        .map(|m| (m.user_id, m.multiplier))
        .collect();

    // Base points per user, summed across the week's category pools
    let mut base_points: HashMap<Uuid, f64> = HashMap::new();
    let mut categories = 0;
    for pool in &pools {
        let Some(points_pool) = pool.points_pool.filter(|p| *p > 0) else {
            continue;
        };

        let participants: Vec<(Uuid, f64)> = ctx
            .db
            .postgres
            .get_category_activity_points(week.id, &pool.activity_category_id)
            .await?
            .into_iter()
            .filter_map(|(user_id, points)| points.to_f64().map(|p| (user_id, p)))
            .collect();

        for (user_id, awarded) in distribution.distribute(participants, points_pool as f64) {
            *base_points.entry(user_id).or_default() += awarded;
        }
        categories += 1;
    }

    if categories == 0 {
        warn!("Week {} has no category pools configured", week.id);
    }

    let min_multiplier = Decimal::from_f64(MIN_MULTIPLIER).unwrap_or(Decimal::ONE);
    let rows: Vec<UserSeasonPoints> = base_points
        .into_iter()
        .map(|(user_id, base)| {
            let multiplier = multipliers.get(&user_id).copied().unwrap_or(min_multiplier);
            UserSeasonPoints {
                user_id,
                season_id: week.season_id,
                week_id: week.id,
                points: Decimal::from_f64(base).unwrap_or_default() * multiplier,
            }
        })
        .collect();

    ctx.db.postgres.set_user_season_points(&rows).await?;

    if payload.mark_as_processed {
        ctx.db.postgres.mark_week_processed(week.id).await?;
        info!("Week {} marked processed", week.id);
    }

    info!(
        "Season points for week {}: {} users across {} categories",
        week.id,
        rows.len(),
        categories
    );

    Ok(json!({
        "weekId": week.id,
        "users": rows.len(),
        "categories": categories,
        "processed": payload.mark_as_processed,
    }))
}
