//! Activity points stage: turns a week of balance snapshots into
//! per-account activity points.
//!
//! For holding activities the points are the account's time-weighted
//! average balance over the week, computed per tracked resource.

use log::info;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::db::models::{AccountActivityPoints, BalanceSnapshot, Week};
use crate::jobs::{parse_payload, resolve_week};
use crate::points::{calculate_time_weighted_average, BalanceChangeEvent};
use crate::queue::{Job, JobContext, JobError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPointsPayload {
    /// Target week; the week containing now when omitted.
    #[serde(default)]
    pub week_id: Option<Uuid>,
    /// Restrict the recompute to these accounts (incremental correction).
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
}

impl crate::queue::ValidatedPayload for ActivityPointsPayload {
    fn validate(&self) -> Result<(), String> {
        if let Some(addresses) = &self.addresses {
            if addresses.is_empty() {
                return Err("addresses must not be empty when given".to_string());
            }
        }
        Ok(())
    }
}

/// Activity id for holding a tracked resource.
fn holding_activity_id(resource: &str) -> String {
    format!("hold_{}", resource)
}

pub async fn run(ctx: JobContext, job: Job) -> Result<Value, JobError> {
    let payload: ActivityPointsPayload = parse_payload(&job)?;
    let week = resolve_week(&ctx, payload.week_id).await?;

    let snapshots = ctx
        .db
        .postgres
        .get_balance_events(week.start_date, week.end_date)
        .await?;

    let points = compute_holding_points(
        &week,
        &snapshots,
        &ctx.settings.snapshot.tracked_resources,
        payload.addresses.as_deref(),
    );

    ctx.db.postgres.set_activity_points(&points).await?;

    info!(
        "Computed {} activity point rows for week {} from {} snapshots",
        points.len(),
        week.id,
        snapshots.len()
    );

    Ok(json!({
        "weekId": week.id,
        "rows": points.len(),
    }))
}

/// Per-account TWA balance for each tracked resource, over the week's
/// snapshot sequence. Snapshots arrive ordered by account then time, so
/// one pass groups them.
fn compute_holding_points(
    week: &Week,
    snapshots: &[BalanceSnapshot],
    resources: &[String],
    scope: Option<&[String]>,
) -> Vec<AccountActivityPoints> {
    let mut points = Vec::new();

    let mut i = 0;
    while i < snapshots.len() {
        let address = &snapshots[i].account_address;
        let mut j = i;
        while j < snapshots.len() && snapshots[j].account_address == *address {
            j += 1;
        }
        let account_snapshots = &snapshots[i..j];
        i = j;

        if let Some(scope) = scope {
            if !scope.contains(address) {
                continue;
            }
        }

        for resource in resources {
            let events: Vec<BalanceChangeEvent> = account_snapshots
                .iter()
                .filter_map(|s| {
                    s.data.get(resource).and_then(|v| v.as_f64()).map(|balance| {
                        BalanceChangeEvent {
                            timestamp: s.timestamp,
                            balance,
                        }
                    })
                })
                .collect();
            if events.is_empty() {
                continue;
            }

            let twa = calculate_time_weighted_average(events, week.end_date);
            points.push(AccountActivityPoints {
                account_address: address.clone(),
                week_id: week.id,
                activity_id: holding_activity_id(resource),
                activity_points: Decimal::from_f64(twa).unwrap_or_default(),
            });
        }
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal::prelude::ToPrimitive;

    fn week() -> Week {
        Week {
            id: Uuid::new_v4(),
            season_id: Uuid::new_v4(),
            start_date: Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap(),
            end_date: Utc.with_ymd_and_hms(2025, 1, 12, 0, 0, 0).unwrap(),
            processed: false,
        }
    }

    fn snap(address: &str, at: DateTime<Utc>, xrd: f64) -> BalanceSnapshot {
        BalanceSnapshot::new(address.to_string(), at, json!({ "xrd": xrd }))
    }

    fn xrd() -> Vec<String> {
        vec!["xrd".to_string()]
    }

    #[test]
    fn test_constant_balance_scores_its_value() {
        let w = week();
        let snapshots = vec![
            snap("account_a", w.start_date, 5000.0),
            snap("account_a", w.start_date + chrono::Duration::days(3), 5000.0),
        ];

        let points = compute_holding_points(&w, &snapshots, &xrd(), None);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].activity_id, "hold_xrd");
        assert_eq!(points[0].activity_points, Decimal::from(5000));
    }

    #[test]
    fn test_groups_by_account() {
        let w = week();
        let snapshots = vec![
            snap("account_a", w.start_date, 1000.0),
            snap("account_a", w.start_date + chrono::Duration::days(1), 1000.0),
            snap("account_b", w.start_date, 2000.0),
        ];

        let points = compute_holding_points(&w, &snapshots, &xrd(), None);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].account_address, "account_a");
        assert_eq!(points[1].account_address, "account_b");
        assert_eq!(points[1].activity_points, Decimal::from(2000));
    }

    #[test]
    fn test_scope_filters_accounts() {
        let w = week();
        let snapshots = vec![
            snap("account_a", w.start_date, 1000.0),
            snap("account_b", w.start_date, 2000.0),
        ];
        let scope = vec!["account_b".to_string()];

        let points = compute_holding_points(&w, &snapshots, &xrd(), Some(&scope));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].account_address, "account_b");
    }

    #[test]
    fn test_missing_resource_yields_no_row() {
        let w = week();
        let snapshots = vec![BalanceSnapshot::new(
            "account_a".to_string(),
            w.start_date,
            json!({ "other_token": 9.0 }),
        )];

        let points = compute_holding_points(&w, &snapshots, &xrd(), None);
        assert!(points.is_empty());
    }

    #[test]
    fn test_balance_changes_are_time_weighted() {
        let w = week();
        // 36h at 5000, 60h at 10000, 48h at 2000 over the first 6 days
        let snapshots = vec![
            snap("account_a", Utc.with_ymd_and_hms(2025, 1, 5, 0, 0, 0).unwrap(), 5000.0),
            snap("account_a", Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap(), 10000.0),
            snap("account_a", Utc.with_ymd_and_hms(2025, 1, 9, 0, 0, 0).unwrap(), 2000.0),
        ];
        let mut w = w;
        w.end_date = Utc.with_ymd_and_hms(2025, 1, 11, 0, 0, 0).unwrap();

        let points = compute_holding_points(&w, &snapshots, &xrd(), None);
        let value = points[0].activity_points.to_f64().unwrap();
        assert!((value - 6083.33).abs() < 0.1);
    }
}
