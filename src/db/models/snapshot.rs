use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};

/// One account's balances at a point in time.
///
/// `data` holds balances by token resource (`{"xrd": 1234.5, ...}`).
/// Immutable once written; keyed by `(account_address, timestamp)` inside a
/// partition selected by the owning week and the account-address hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub account_address: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl BalanceSnapshot {
    pub fn new(
        account_address: String,
        timestamp: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            account_address,
            timestamp,
            data,
        }
    }
}

/// Snapshot run status (PostgreSQL enum `snapshot_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[postgres(name = "snapshot_status")]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    #[postgres(name = "not_started")]
    NotStarted,
    #[postgres(name = "processing")]
    Processing,
    #[postgres(name = "completed")]
    Completed,
    #[postgres(name = "failed")]
    Failed,
}
