//! Weekly range partitions for the balance time series.
//!
//! `account_balances` is range-partitioned by timestamp into UTC weeks
//! (Sunday start). Each weekly partition is hash-partitioned by account
//! address while it is hot; once a week is safely in the past it can be
//! consolidated into a single plain table to cut per-partition overhead.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use log::info;
use serde::Serialize;

use crate::db::models::BalanceSnapshot;
use crate::db::postgres::ops::sanitize_string;
use crate::db::postgres::PostgresClient;

const PARTITION_PREFIX: &str = "account_balances_";

/// Start of the UTC week (Sunday 00:00) containing `at`.
pub fn week_start_utc(at: DateTime<Utc>) -> DateTime<Utc> {
    let date = at.date_naive();
    let days_back = date.weekday().num_days_from_sunday();
    let start = date - Duration::days(days_back as i64);
    start.and_time(NaiveTime::MIN).and_utc()
}

/// Weekly partition name for the week starting at `week_start`.
pub fn partition_name(week_start: DateTime<Utc>) -> String {
    format!("{}{}", PARTITION_PREFIX, week_start.format("%Y_%m_%d"))
}

/// Hash sub-partition name for remainder `k` of a weekly partition.
pub fn hash_partition_name(weekly: &str, k: u32) -> String {
    format!("{}_h{}", weekly, k)
}

/// Parse the week start date back out of a weekly partition name.
/// Returns `None` for names that are not weekly partitions (hash children,
/// unrelated tables).
pub fn partition_week_start(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(PARTITION_PREFIX)?;
    NaiveDate::parse_from_str(date, "%Y_%m_%d").ok()
}

/// Introspection row for one weekly partition.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionInfo {
    pub partition: String,
    pub week_start: Option<NaiveDate>,
    pub hash_partitions: i64,
    pub approx_rows: i64,
    pub total_bytes: i64,
}

impl PartitionInfo {
    /// A partition with no hash children has been consolidated into a
    /// single table.
    pub fn is_consolidated(&self) -> bool {
        self.hash_partitions == 0
    }
}

/// Summary of how far consolidation has progressed.
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationStatus {
    pub total_partitions: usize,
    pub consolidated: usize,
    pub pending: Vec<String>,
}

pub fn consolidation_status(partitions: &[PartitionInfo]) -> ConsolidationStatus {
    let pending: Vec<String> = partitions
        .iter()
        .filter(|p| !p.is_consolidated())
        .map(|p| p.partition.clone())
        .collect();

    ConsolidationStatus {
        total_partitions: partitions.len(),
        consolidated: partitions.len() - pending.len(),
        pending,
    }
}

/// Result of consolidating one weekly partition.
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationOutcome {
    pub partition: String,
    pub merged_hash_partitions: i64,
    pub rows_copied: u64,
    pub executed: bool,
}

/// Whether a weekly table can take hash children. Only a table that is
/// itself hash-partitioned (`relkind = 'p'`) can; a consolidated week is
/// a plain attached table (`relkind = 'r'`) and rows route into it
/// directly.
fn accepts_hash_children(relkind: Option<&str>) -> bool {
    relkind == Some("p")
}

fn range_bounds(week_start: DateTime<Utc>) -> (String, String) {
    let fmt = "%Y-%m-%d %H:%M:%S+00";
    let week_end = week_start + Duration::weeks(1);
    (
        week_start.format(fmt).to_string(),
        week_end.format(fmt).to_string(),
    )
}

impl PostgresClient {
    // ==================== PARTITION DDL ====================

    /// Create the weekly partition covering `at` (and its hash children)
    /// if it does not exist yet. Returns the weekly partition name.
    ///
    /// A week that was already consolidated into a plain table takes
    /// writes as-is; no hash children are created for it.
    pub async fn ensure_balance_partition(
        &self,
        at: DateTime<Utc>,
        hash_partitions: u32,
    ) -> anyhow::Result<String> {
        let week_start = week_start_utc(at);
        let name = partition_name(week_start);
        let (from, to) = range_bounds(week_start);

        let client = self.pool.get().await?;

        let create_weekly = format!(
            r#"
            CREATE TABLE IF NOT EXISTS incentives.{name}
            PARTITION OF incentives.account_balances
            FOR VALUES FROM ('{from}') TO ('{to}')
            PARTITION BY HASH (account_address)
            "#
        );
        client.execute(&create_weekly, &[]).await?;

        let relkind: Option<String> = client
            .query_opt(
                r#"
                SELECT c.relkind::TEXT AS relkind
                FROM pg_class c
                JOIN pg_namespace n ON n.oid = c.relnamespace
                WHERE n.nspname = 'incentives' AND c.relname = $1
                "#,
                &[&name],
            )
            .await?
            .map(|row| row.get("relkind"));

        if !accepts_hash_children(relkind.as_deref()) {
            return Ok(name);
        }

        for k in 0..hash_partitions {
            let child = hash_partition_name(&name, k);
            let create_child = format!(
                r#"
                CREATE TABLE IF NOT EXISTS incentives.{child}
                PARTITION OF incentives.{name}
                FOR VALUES WITH (MODULUS {hash_partitions}, REMAINDER {k})
                "#
            );
            client.execute(&create_child, &[]).await?;
        }

        Ok(name)
    }

    // ==================== BALANCE ROWS ====================

    /// Batch insert/update balance snapshots (true batch insert with multi-row VALUES).
    /// Creates any missing weekly partitions first; PostgreSQL routes the
    /// rows to the right partition.
    pub async fn set_account_balances(
        &self,
        balances: &[BalanceSnapshot],
        hash_partitions: u32,
    ) -> anyhow::Result<()> {
        if balances.is_empty() {
            return Ok(());
        }

        let weeks: BTreeSet<DateTime<Utc>> = balances
            .iter()
            .map(|b| week_start_utc(b.timestamp))
            .collect();
        for week_start in weeks {
            self.ensure_balance_partition(week_start, hash_partitions)
                .await?;
        }

        const COLS_PER_ROW: usize = 3;
        const BATCH_SIZE: usize = 1000;

        let client = self.pool.get().await?;

        for chunk in balances.chunks(BATCH_SIZE) {
            let values_clauses: Vec<String> = chunk
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    let start = i * COLS_PER_ROW + 1;
                    let placeholders: Vec<String> = (start..start + COLS_PER_ROW)
                        .map(|n| format!("${}", n))
                        .collect();
                    format!("({})", placeholders.join(", "))
                })
                .collect();

            let query = format!(
                r#"
                INSERT INTO incentives.account_balances (
                    account_address, timestamp, data
                ) VALUES {}
                ON CONFLICT (account_address, timestamp) DO UPDATE SET
                    data = EXCLUDED.data
                "#,
                values_clauses.join(", ")
            );

            let mut sanitized: Vec<String> = Vec::with_capacity(chunk.len());
            for entry in chunk {
                sanitized.push(sanitize_string(&entry.account_address));
            }

            let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
                Vec::with_capacity(chunk.len() * COLS_PER_ROW);

            for (i, entry) in chunk.iter().enumerate() {
                params.push(&sanitized[i]);
                params.push(&entry.timestamp);
                params.push(&entry.data);
            }

            client.execute(&query, &params).await.map_err(|e| {
                log::error!(
                    "Failed to batch insert {} balance snapshots: {:?}",
                    chunk.len(),
                    e
                );
                e
            })?;
        }

        Ok(())
    }

    /// All balance snapshots in `[from, to)`, ordered per account by time
    pub async fn get_balance_events(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<BalanceSnapshot>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT account_address, timestamp, data
            FROM incentives.account_balances
            WHERE timestamp >= $1 AND timestamp < $2
            ORDER BY account_address, timestamp
        "#;

        let rows = client.query(query, &[&from, &to]).await?;
        let events = rows
            .iter()
            .map(|row| BalanceSnapshot {
                account_address: row.get("account_address"),
                timestamp: row.get("timestamp"),
                data: row.get("data"),
            })
            .collect();

        Ok(events)
    }

    // ==================== INTROSPECTION ====================

    /// Per-partition statistics for every weekly partition, oldest first
    pub async fn get_partition_info(&self) -> anyhow::Result<Vec<PartitionInfo>> {
        let client = self.pool.get().await?;
        // Row estimates come from reltuples, -1 until the first analyze
        let query = r#"
            SELECT c.relname AS partition,
                   COUNT(gc.oid)::BIGINT AS hash_partitions,
                   (pg_total_relation_size(c.oid)
                        + COALESCE(SUM(pg_total_relation_size(gc.oid)), 0))::BIGINT AS total_bytes,
                   (GREATEST(c.reltuples, 0)
                        + COALESCE(SUM(GREATEST(gc.reltuples, 0)), 0))::BIGINT AS approx_rows
            FROM pg_inherits i
            JOIN pg_class c ON c.oid = i.inhrelid
            JOIN pg_class p ON p.oid = i.inhparent
            JOIN pg_namespace n ON n.oid = p.relnamespace
            LEFT JOIN pg_inherits gi ON gi.inhparent = c.oid
            LEFT JOIN pg_class gc ON gc.oid = gi.inhrelid
            WHERE n.nspname = 'incentives' AND p.relname = 'account_balances'
            GROUP BY c.relname, c.oid, c.reltuples
            ORDER BY c.relname
        "#;

        let rows = client.query(query, &[]).await?;
        let partitions = rows
            .iter()
            .map(|row| {
                let partition: String = row.get("partition");
                let week_start = partition_week_start(&partition);
                PartitionInfo {
                    partition,
                    week_start,
                    hash_partitions: row.get("hash_partitions"),
                    approx_rows: row.get("approx_rows"),
                    total_bytes: row.get("total_bytes"),
                }
            })
            .collect();

        Ok(partitions)
    }

    pub async fn get_consolidation_status(&self) -> anyhow::Result<ConsolidationStatus> {
        let partitions = self.get_partition_info().await?;
        Ok(consolidation_status(&partitions))
    }

    // ==================== MAINTENANCE ====================

    /// Drop weekly partitions that ended on or before `cutoff`.
    /// Returns the names of the dropped partitions.
    pub async fn drop_old_partitions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<Vec<String>> {
        let partitions = self.get_partition_info().await?;
        let client = self.pool.get().await?;

        let mut dropped = Vec::new();
        for info in partitions {
            let Some(week_start) = info.week_start else {
                continue;
            };
            let week_end = week_start.and_time(NaiveTime::MIN).and_utc() + Duration::weeks(1);
            if week_end > cutoff {
                continue;
            }

            let drop = format!("DROP TABLE incentives.{} CASCADE", info.partition);
            client.execute(&drop, &[]).await?;
            info!("Dropped expired balance partition {}", info.partition);
            dropped.push(info.partition);
        }

        Ok(dropped)
    }

    /// Merge the hash children of every weekly partition that ended before
    /// `before` into a single plain table per week. With `dry_run` the
    /// plan is returned without touching the database.
    pub async fn consolidate_partitions(
        &self,
        before: DateTime<Utc>,
        dry_run: bool,
    ) -> anyhow::Result<Vec<ConsolidationOutcome>> {
        let partitions = self.get_partition_info().await?;

        let mut outcomes = Vec::new();
        for info in partitions {
            if info.is_consolidated() {
                continue;
            }
            let Some(week_start) = info.week_start else {
                continue;
            };
            let week_start = week_start.and_time(NaiveTime::MIN).and_utc();
            if week_start + Duration::weeks(1) > before {
                continue;
            }

            if dry_run {
                outcomes.push(ConsolidationOutcome {
                    partition: info.partition,
                    merged_hash_partitions: info.hash_partitions,
                    rows_copied: 0,
                    executed: false,
                });
                continue;
            }

            let rows_copied = self
                .consolidate_one_partition(&info.partition, week_start)
                .await?;
            info!(
                "Consolidated balance partition {} ({} rows)",
                info.partition, rows_copied
            );
            outcomes.push(ConsolidationOutcome {
                partition: info.partition,
                merged_hash_partitions: info.hash_partitions,
                rows_copied,
                executed: true,
            });
        }

        Ok(outcomes)
    }

    /// Swap one hash-partitioned week for a plain table holding the same
    /// rows, inside a single transaction.
    async fn consolidate_one_partition(
        &self,
        name: &str,
        week_start: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let (from, to) = range_bounds(week_start);
        let old = format!("{}_old", name);

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        tx.execute(
            &format!(
                "ALTER TABLE incentives.account_balances DETACH PARTITION incentives.{name}"
            ),
            &[],
        )
        .await?;
        tx.execute(
            &format!("ALTER TABLE incentives.{name} RENAME TO {old}"),
            &[],
        )
        .await?;
        tx.execute(
            &format!(
                "CREATE TABLE incentives.{name} (LIKE incentives.account_balances INCLUDING ALL)"
            ),
            &[],
        )
        .await?;
        let rows_copied = tx
            .execute(
                &format!("INSERT INTO incentives.{name} SELECT * FROM incentives.{old}"),
                &[],
            )
            .await?;
        tx.execute(
            &format!(
                r#"
                ALTER TABLE incentives.account_balances
                ATTACH PARTITION incentives.{name}
                FOR VALUES FROM ('{from}') TO ('{to}')
                "#
            ),
            &[],
        )
        .await?;
        tx.execute(&format!("DROP TABLE incentives.{old} CASCADE"), &[])
            .await?;

        tx.commit().await?;
        Ok(rows_copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_week_start_backs_up_to_sunday() {
        // 2025-01-08 is a Wednesday; its week starts Sunday 2025-01-05
        let start = week_start_utc(at(2025, 1, 8, 15));
        assert_eq!(start, at(2025, 1, 5, 0));
    }

    #[test]
    fn test_week_start_on_sunday_is_midnight_same_day() {
        let start = week_start_utc(at(2025, 1, 5, 23));
        assert_eq!(start, at(2025, 1, 5, 0));
    }

    #[test]
    fn test_week_start_at_exact_boundary() {
        assert_eq!(week_start_utc(at(2025, 1, 5, 0)), at(2025, 1, 5, 0));
        // Saturday 23:00 still belongs to the prior Sunday's week
        let start = week_start_utc(at(2025, 1, 11, 23));
        assert_eq!(start, at(2025, 1, 5, 0));
    }

    #[test]
    fn test_partition_name_format() {
        assert_eq!(
            partition_name(at(2025, 1, 5, 0)),
            "account_balances_2025_01_05"
        );
        assert_eq!(
            hash_partition_name("account_balances_2025_01_05", 3),
            "account_balances_2025_01_05_h3"
        );
    }

    #[test]
    fn test_partition_week_start_roundtrip() {
        let name = partition_name(at(2025, 3, 2, 0));
        let parsed = partition_week_start(&name).unwrap();
        assert_eq!(parsed, NaiveDate::from_ymd_opt(2025, 3, 2).unwrap());
    }

    #[test]
    fn test_partition_week_start_rejects_foreign_names() {
        assert!(partition_week_start("jobs").is_none());
        assert!(partition_week_start("account_balances_2025_01_05_h0").is_none());
        assert!(partition_week_start("account_balances_garbage").is_none());
    }

    #[test]
    fn test_consolidation_status_counts() {
        let partitions = vec![
            PartitionInfo {
                partition: "account_balances_2025_01_05".into(),
                week_start: NaiveDate::from_ymd_opt(2025, 1, 5),
                hash_partitions: 0,
                approx_rows: 10,
                total_bytes: 8192,
            },
            PartitionInfo {
                partition: "account_balances_2025_01_12".into(),
                week_start: NaiveDate::from_ymd_opt(2025, 1, 12),
                hash_partitions: 4,
                approx_rows: 10,
                total_bytes: 8192,
            },
        ];

        let status = consolidation_status(&partitions);
        assert_eq!(status.total_partitions, 2);
        assert_eq!(status.consolidated, 1);
        assert_eq!(status.pending, vec!["account_balances_2025_01_12"]);
    }

    #[test]
    fn test_hash_children_only_under_partitioned_weeks() {
        // Freshly created weekly partition
        assert!(accepts_hash_children(Some("p")));
        // Week consolidated into a plain attached table
        assert!(!accepts_hash_children(Some("r")));
        assert!(!accepts_hash_children(None));
    }

    #[test]
    fn test_range_bounds_cover_one_week() {
        let (from, to) = range_bounds(at(2025, 1, 5, 0));
        assert_eq!(from, "2025-01-05 00:00:00+00");
        assert_eq!(to, "2025-01-12 00:00:00+00");
    }
}
