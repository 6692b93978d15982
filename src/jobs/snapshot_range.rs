//! Backfill: expands a date range into individual snapshot jobs.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Duration, Utc};
use log::info;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::jobs::{hour_key, SNAPSHOT_QUEUE};
use crate::queue::{EnqueueError, EnqueueOpts, Job, JobContext, JobError};

/// Upper bound on how many snapshots one backfill request may expand to.
const MAX_RANGE_SNAPSHOTS: i64 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRangePayload {
    #[serde(default)]
    pub addresses: Option<Vec<String>>,
    pub from_timestamp: DateTime<Utc>,
    pub to_timestamp: DateTime<Utc>,
    pub interval_in_hours: i64,
}

impl crate::queue::ValidatedPayload for SnapshotRangePayload {
    fn validate(&self) -> Result<(), String> {
        if self.from_timestamp >= self.to_timestamp {
            return Err("fromTimestamp must be before toTimestamp".to_string());
        }
        if self.interval_in_hours < 1 {
            return Err("intervalInHours must be at least 1".to_string());
        }

        let hours = (self.to_timestamp - self.from_timestamp).num_hours();
        if hours / self.interval_in_hours > MAX_RANGE_SNAPSHOTS {
            return Err(format!(
                "range expands to more than {} snapshots",
                MAX_RANGE_SNAPSHOTS
            ));
        }

        if let Some(addresses) = &self.addresses {
            if addresses.is_empty() {
                return Err("addresses must not be empty when given".to_string());
            }
        }
        Ok(())
    }
}

/// Dedupe key for one expanded snapshot: the hour plus a digest of the
/// account scope, order-insensitive. Overlapping backfills only collapse
/// when they target the same accounts.
fn backfill_key(addresses: Option<&[String]>, at: DateTime<Utc>) -> String {
    let scope = match addresses {
        None => "all".to_string(),
        Some(addresses) => {
            let mut sorted: Vec<&String> = addresses.iter().collect();
            sorted.sort();

            let mut hasher = FxHasher::default();
            for address in sorted {
                address.hash(&mut hasher);
            }
            format!("{:x}", hasher.finish())
        },
    };

    hour_key(&format!("backfill-{}", scope), at)
}

/// Walk the range in `interval_in_hours` steps, enqueueing one snapshot
/// job per step. Keyed per timestamp and account scope, so re-running a
/// backfill request skips the snapshots already queued.
pub async fn run(ctx: JobContext, job: Job) -> Result<Value, JobError> {
    let payload: SnapshotRangePayload = super::parse_payload(&job)?;
    let step = Duration::hours(payload.interval_in_hours);

    let mut enqueued = 0;
    let mut deduplicated = 0;
    let mut at = payload.from_timestamp;
    while at <= payload.to_timestamp {
        let snapshot = json!({
            "addresses": payload.addresses,
            "timestamp": at,
        });

        let handle = ctx
            .queues
            .enqueue(
                SNAPSHOT_QUEUE,
                "snapshot",
                snapshot,
                EnqueueOpts {
                    job_key: Some(backfill_key(payload.addresses.as_deref(), at)),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| match e {
                EnqueueError::Db(e) => JobError::Transient(e),
                other => JobError::domain(other.to_string()),
            })?;

        if handle.deduplicated {
            deduplicated += 1;
        } else {
            enqueued += 1;
        }
        at += step;
    }

    info!(
        "Backfill {} - {} expanded into {} snapshot jobs ({} already queued)",
        payload.from_timestamp, payload.to_timestamp, enqueued, deduplicated
    );

    Ok(json!({
        "enqueued": enqueued,
        "deduplicated": deduplicated,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ValidatedPayload;

    fn payload(from: &str, to: &str, hours: i64) -> SnapshotRangePayload {
        serde_json::from_value(json!({
            "fromTimestamp": from,
            "toTimestamp": to,
            "intervalInHours": hours,
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_range() {
        let p = payload("2025-01-01T00:00:00Z", "2025-01-02T00:00:00Z", 1);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_range() {
        let p = payload("2025-01-02T00:00:00Z", "2025-01-01T00:00:00Z", 1);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_interval() {
        let p = payload("2025-01-01T00:00:00Z", "2025-01-02T00:00:00Z", 0);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_expansion() {
        let p = payload("2020-01-01T00:00:00Z", "2025-01-01T00:00:00Z", 1);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_backfill_keys_differ_per_scope() {
        let at = "2025-01-06T12:00:00Z".parse().unwrap();
        let scope_a = vec!["account_a".to_string()];
        let scope_b = vec!["account_b".to_string()];

        let unscoped = backfill_key(None, at);
        assert!(unscoped.starts_with("backfill-all-"));
        assert_ne!(unscoped, backfill_key(Some(&scope_a), at));
        assert_ne!(backfill_key(Some(&scope_a), at), backfill_key(Some(&scope_b), at));
    }

    #[test]
    fn test_backfill_key_ignores_address_order() {
        let at = "2025-01-06T12:00:00Z".parse().unwrap();
        let forward = vec!["account_a".to_string(), "account_b".to_string()];
        let reversed = vec!["account_b".to_string(), "account_a".to_string()];

        assert_eq!(backfill_key(Some(&forward), at), backfill_key(Some(&reversed), at));
    }
}
