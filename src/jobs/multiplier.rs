//! Multiplier stage: positions each qualifying user on the holding curve.
//!
//! The curve input is the user's place in the cumulative TWA-balance
//! distribution for the qualifying activity. The whole distribution is
//! always computed, even when writes are scoped to a subset of users;
//! a user's multiplier depends on everyone else's balances.

use log::info;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::models::UserWeeklyMultiplier;
use crate::jobs::{parse_payload, resolve_week};
use crate::points::{cumulative_positions, MultiplierCurve, SCurve};
use crate::queue::{Job, JobContext, JobError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiplierPayload {
    #[serde(default)]
    pub week_id: Option<Uuid>,
    /// Restrict writes to these users (incremental correction).
    #[serde(default)]
    pub user_ids: Option<Vec<Uuid>>,
}

impl crate::queue::ValidatedPayload for MultiplierPayload {
    fn validate(&self) -> Result<(), String> {
        if let Some(user_ids) = &self.user_ids {
            if user_ids.is_empty() {
                return Err("userIds must not be empty when given".to_string());
            }
        }
        Ok(())
    }
}

pub async fn run(ctx: JobContext, job: Job) -> Result<Value, JobError> {
    let payload: MultiplierPayload = parse_payload(&job)?;
    let week = resolve_week(&ctx, payload.week_id).await?;
    let campaign = &ctx.settings.campaign;

    let balances = ctx
        .db
        .postgres
        .get_user_activity_points(week.id, &campaign.qualifying_activity)
        .await?;

    let qualifying: Vec<(Uuid, f64)> = balances
        .iter()
        .filter_map(|(user_id, balance)| {
            let balance = balance.to_f64()?;
            (balance >= campaign.min_multiplier_balance).then_some((*user_id, balance))
        })
        .collect();

    let curve = SCurve::default();
    let mut rows: Vec<UserWeeklyMultiplier> = cumulative_positions(qualifying)
        .into_iter()
        .map(|position| {
            let multiplier = curve.multiplier(position.quantile());
            UserWeeklyMultiplier {
                user_id: position.user_id,
                week_id: week.id,
                multiplier: Decimal::from_f64(multiplier)
                    .unwrap_or_default()
                    .round_dp(2),
                cumulative_twa_balance: Decimal::from_f64(position.cumulative_balance),
                total_twa_balance: Decimal::from_f64(position.total_balance),
            }
        })
        .collect();

    if let Some(user_ids) = &payload.user_ids {
        rows.retain(|row| user_ids.contains(&row.user_id));
    }

    ctx.db.postgres.set_multipliers(&rows).await?;

    info!(
        "Computed multipliers for week {}: {} qualifying of {} users",
        week.id,
        rows.len(),
        balances.len()
    );

    Ok(json!({
        "weekId": week.id,
        "rows": rows.len(),
    }))
}
