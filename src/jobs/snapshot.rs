//! Snapshot producer: captures per-account balances into the partitioned
//! balance store.

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::models::{BalanceSnapshot, SnapshotStatus};
use crate::gateway::{BalanceSource, DummyBalanceSource};
use crate::jobs::{hour_key, parse_payload, ACTIVITY_POINTS_QUEUE};
use crate::queue::{EnqueueError, EnqueueOpts, Job, JobContext, JobError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    /// Subset of accounts to snapshot; all registered accounts when omitted.
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
    /// Ledger timestamp to capture; now when omitted (cron trigger).
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Serve synthetic balances instead of calling the gateway.
    #[serde(default)]
    pub add_dummy_data: bool,
}

impl crate::queue::ValidatedPayload for SnapshotPayload {
    fn validate(&self) -> Result<(), String> {
        if let Some(addresses) = &self.addresses {
            if addresses.is_empty() {
                return Err("addresses must not be empty when given".to_string());
            }
            if addresses.iter().any(|a| a.trim().is_empty()) {
                return Err("addresses must not contain blank entries".to_string());
            }
        }
        Ok(())
    }
}

pub async fn run(ctx: JobContext, job: Job) -> Result<Value, JobError> {
    let payload: SnapshotPayload = parse_payload(&job)?;
    let at = payload.timestamp.unwrap_or_else(Utc::now);

    let accounts = match &payload.addresses {
        Some(addresses) => ctx.db.postgres.get_accounts_by_addresses(addresses).await?,
        None => ctx.db.postgres.get_accounts().await?,
    };
    if accounts.is_empty() {
        return Ok(json!({ "accounts": 0, "timestamp": at }));
    }

    let run_id = ctx.db.postgres.create_snapshot_run(at).await?;

    let written = match capture(&ctx, &payload, &accounts, at).await {
        Ok(written) => {
            ctx.db
                .postgres
                .update_snapshot_run(run_id, SnapshotStatus::Completed)
                .await?;
            written
        },
        Err(err) => {
            // Best effort; the original error is the one worth surfacing
            let _ = ctx
                .db
                .postgres
                .update_snapshot_run(run_id, SnapshotStatus::Failed)
                .await;
            return Err(err);
        },
    };

    ctx.metrics.snapshots_taken.inc_by(written as u64);
    info!(
        "Snapshot at {} stored {} balances for {} accounts",
        at,
        written,
        accounts.len()
    );

    // Keep the in-progress week's activity points fresh without waiting
    // for the daily chain
    if let Some(week) = ctx.db.postgres.get_week_containing(at).await? {
        if !week.processed {
            chain_activity_points(&ctx, week.id, at).await?;
        }
    }

    Ok(json!({
        "accounts": accounts.len(),
        "balances": written,
        "timestamp": at,
    }))
}

async fn capture(
    ctx: &JobContext,
    payload: &SnapshotPayload,
    accounts: &[crate::db::models::Account],
    at: DateTime<Utc>,
) -> Result<usize, JobError> {
    let dummy = DummyBalanceSource;
    let source: &dyn BalanceSource = if payload.add_dummy_data {
        &dummy
    } else {
        ctx.balances.as_ref()
    };

    let resources = &ctx.settings.snapshot.tracked_resources;
    let hash_partitions = ctx.settings.partitions.hash_partitions;

    let mut written = 0;
    for chunk in accounts.chunks(ctx.settings.snapshot.batch_size) {
        let addresses: Vec<String> = chunk.iter().map(|a| a.address.clone()).collect();
        let balances = source.fetch_balances(&addresses, resources, at).await?;

        let rows: Vec<BalanceSnapshot> = balances
            .into_iter()
            .map(|b| BalanceSnapshot::new(b.account_address, at, b.balances))
            .collect();

        ctx.db
            .postgres
            .set_account_balances(&rows, hash_partitions)
            .await?;
        written += rows.len();
    }

    Ok(written)
}

async fn chain_activity_points(
    ctx: &JobContext,
    week_id: uuid::Uuid,
    at: DateTime<Utc>,
) -> Result<(), JobError> {
    let result = ctx
        .queues
        .enqueue(
            ACTIVITY_POINTS_QUEUE,
            "calculate-activity-points",
            json!({ "weekId": week_id }),
            EnqueueOpts {
                job_key: Some(hour_key(&format!("activity-points-{}", week_id), at)),
                ..Default::default()
            },
        )
        .await;

    match result {
        Ok(_) => Ok(()),
        Err(EnqueueError::Db(e)) => Err(JobError::Transient(e)),
        Err(e) => Err(JobError::domain(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ValidatedPayload;

    #[test]
    fn test_payload_defaults() {
        let payload: SnapshotPayload = serde_json::from_value(json!({})).unwrap();
        assert!(payload.addresses.is_none());
        assert!(payload.timestamp.is_none());
        assert!(!payload.add_dummy_data);
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn test_payload_rejects_empty_address_list() {
        let payload: SnapshotPayload = serde_json::from_value(json!({ "addresses": [] })).unwrap();
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_payload_rejects_blank_address() {
        let payload: SnapshotPayload =
            serde_json::from_value(json!({ "addresses": ["account_abc", " "] })).unwrap();
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_payload_accepts_full_request() {
        let payload: SnapshotPayload = serde_json::from_value(json!({
            "addresses": ["account_abc"],
            "timestamp": "2025-01-06T12:00:00Z",
            "addDummyData": true,
        }))
        .unwrap();
        assert!(payload.validate().is_ok());
        assert!(payload.add_dummy_data);
    }
}
