//! Leaderboard cache storage.
//!
//! Each leaderboard lives under a cache key and is rebuilt wholesale:
//! delete the key's entries, insert the new ranking, refresh the stats
//! row. The stats row doubles as the populated marker, so an empty but
//! populated leaderboard is distinguishable from one never built.

use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::models::{Leaderboard, LeaderboardEntry, LeaderboardStats, UserSeasonPoints};
use crate::db::postgres::PostgresClient;

#[derive(Debug, Error)]
pub enum LeaderboardError {
    #[error("leaderboard cache not populated for key {0}")]
    CacheNotPopulated(String),
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

// ==================== CACHE KEYS ====================

pub fn season_cache_key(season_id: Uuid) -> String {
    format!("season_{}", season_id)
}

pub fn week_cache_key(week_id: Uuid) -> String {
    format!("week_{}", week_id)
}

pub fn category_cache_key(week_id: Uuid, category: &str) -> String {
    format!("category_{}_{}", week_id, category)
}

/// Order rows by points descending and assign dense sequential ranks.
/// Ties break on user id so reruns produce identical rankings.
pub fn rank_entries(
    cache_key: &str,
    mut rows: Vec<(Uuid, Decimal, Option<Value>)>,
) -> Vec<LeaderboardEntry> {
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    rows.into_iter()
        .enumerate()
        .map(|(i, (user_id, points, breakdown))| LeaderboardEntry {
            cache_key: cache_key.to_string(),
            user_id,
            rank: i as i64 + 1,
            points,
            breakdown,
        })
        .collect()
}

impl PostgresClient {
    // ==================== POPULATION SOURCES ====================

    /// All weekly season-points rows for a season
    pub async fn get_season_points(
        &self,
        season_id: Uuid,
    ) -> anyhow::Result<Vec<UserSeasonPoints>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT user_id, season_id, week_id, points
            FROM incentives.user_season_points
            WHERE season_id = $1
        "#;

        let rows = client.query(query, &[&season_id]).await?;
        let points = rows
            .iter()
            .map(|row| UserSeasonPoints {
                user_id: row.get("user_id"),
                season_id: row.get("season_id"),
                week_id: row.get("week_id"),
                points: row.get("points"),
            })
            .collect();

        Ok(points)
    }

    /// Per-user season points earned in one week
    pub async fn get_week_points(&self, week_id: Uuid) -> anyhow::Result<Vec<(Uuid, Decimal)>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT user_id, points
            FROM incentives.user_season_points
            WHERE week_id = $1
        "#;

        let rows = client.query(query, &[&week_id]).await?;
        let points = rows
            .iter()
            .map(|row| (row.get("user_id"), row.get("points")))
            .collect();

        Ok(points)
    }

    /// Per-user points for one activity category in one week, with the
    /// per-activity split as a JSON breakdown
    pub async fn get_category_breakdown(
        &self,
        week_id: Uuid,
        category: &str,
    ) -> anyhow::Result<Vec<(Uuid, Decimal, Option<Value>)>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT user_id,
                   SUM(points) AS points,
                   jsonb_object_agg(activity_id, points) AS breakdown
            FROM (
                SELECT a.user_id, p.activity_id, SUM(p.activity_points) AS points
                FROM incentives.account_activity_points p
                JOIN incentives.accounts a ON a.address = p.account_address
                JOIN incentives.activities act ON act.id = p.activity_id
                WHERE p.week_id = $1 AND act.category = $2
                GROUP BY a.user_id, p.activity_id
            ) per_activity
            GROUP BY user_id
        "#;

        let rows = client.query(query, &[&week_id, &category]).await?;
        let points = rows
            .iter()
            .map(|row| (row.get("user_id"), row.get("points"), row.get("breakdown")))
            .collect();

        Ok(points)
    }

    /// Whether a cache key has ever been populated (its stats row exists)
    pub async fn leaderboard_populated(&self, cache_key: &str) -> anyhow::Result<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM incentives.leaderboard_stats WHERE cache_key = $1",
                &[&cache_key],
            )
            .await?;

        Ok(row.is_some())
    }

    // ==================== REBUILD ====================

    /// Replace a cache key's leaderboard with `entries` and refresh its
    /// stats row, atomically.
    pub async fn rebuild_leaderboard(
        &self,
        cache_key: &str,
        entries: &[LeaderboardEntry],
    ) -> anyhow::Result<()> {
        const COLS_PER_ROW: usize = 5;
        const BATCH_SIZE: usize = 1000;

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        tx.execute(
            "DELETE FROM incentives.leaderboard_entries WHERE cache_key = $1",
            &[&cache_key],
        )
        .await?;

        for chunk in entries.chunks(BATCH_SIZE) {
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
                INSERT INTO incentives.leaderboard_entries (
                    cache_key, user_id, rank, points, breakdown
                ) VALUES {}
                "#,
                values_clauses.join(", ")
            );

            let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
                Vec::with_capacity(chunk.len() * COLS_PER_ROW);

            for entry in chunk {
                params.push(&entry.cache_key);
                params.push(&entry.user_id);
                params.push(&entry.rank);
                params.push(&entry.points);
                params.push(&entry.breakdown);
            }

            tx.execute(&query, &params).await?;
        }

        // Aggregates over zero rows still emit one row, so the stats row is
        // written even for an empty leaderboard
        let stats_query = r#"
            INSERT INTO incentives.leaderboard_stats (
                cache_key, median_points, average_points, total_users, updated_at
            )
            SELECT $1,
                   (PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY points::DOUBLE PRECISION))::NUMERIC(18, 6),
                   AVG(points),
                   COUNT(*),
                   NOW()
            FROM incentives.leaderboard_entries
            WHERE cache_key = $1
            ON CONFLICT (cache_key) DO UPDATE SET
                median_points = EXCLUDED.median_points,
                average_points = EXCLUDED.average_points,
                total_users = EXCLUDED.total_users,
                updated_at = NOW()
        "#;
        tx.execute(stats_query, &[&cache_key]).await?;

        tx.commit().await?;
        Ok(())
    }

    // ==================== READ ====================

    /// Read a leaderboard. Missing stats row means the cache was never
    /// populated for this key, which is different from an empty ranking.
    pub async fn get_leaderboard(
        &self,
        cache_key: &str,
    ) -> Result<Leaderboard, LeaderboardError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| LeaderboardError::Db(e.into()))?;

        let stats_query = r#"
            SELECT cache_key, median_points, average_points, total_users, updated_at
            FROM incentives.leaderboard_stats
            WHERE cache_key = $1
        "#;
        let stats_row = client
            .query_opt(stats_query, &[&cache_key])
            .await
            .map_err(|e| LeaderboardError::Db(e.into()))?;

        let Some(stats_row) = stats_row else {
            return Err(LeaderboardError::CacheNotPopulated(cache_key.to_string()));
        };

        let stats = LeaderboardStats {
            cache_key: stats_row.get("cache_key"),
            median_points: stats_row.get("median_points"),
            average_points: stats_row.get("average_points"),
            total_users: stats_row.get("total_users"),
            updated_at: stats_row.get("updated_at"),
        };

        let entries_query = r#"
            SELECT cache_key, user_id, rank, points, breakdown
            FROM incentives.leaderboard_entries
            WHERE cache_key = $1
            ORDER BY rank
        "#;
        let rows = client
            .query(entries_query, &[&cache_key])
            .await
            .map_err(|e| LeaderboardError::Db(e.into()))?;

        let entries = rows
            .iter()
            .map(|row| LeaderboardEntry {
                cache_key: row.get("cache_key"),
                user_id: row.get("user_id"),
                rank: row.get("rank"),
                points: row.get("points"),
                breakdown: row.get("breakdown"),
            })
            .collect();

        Ok(Leaderboard {
            stats,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    fn dec(v: f64) -> Decimal {
        Decimal::from_f64(v).unwrap()
    }

    #[test]
    fn test_cache_key_formats() {
        let id = Uuid::nil();
        assert_eq!(
            season_cache_key(id),
            "season_00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            week_cache_key(id),
            "week_00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            category_cache_key(id, "holding"),
            "category_00000000-0000-0000-0000-000000000000_holding"
        );
    }

    #[test]
    fn test_rank_entries_orders_by_points_desc() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let entries = rank_entries(
            "week_x",
            vec![
                (a, dec(10.0), None),
                (b, dec(30.0), None),
                (c, dec(20.0), None),
            ],
        );

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].user_id, b);
        assert_eq!(entries[0].rank, 1);
        assert_eq!(entries[1].user_id, c);
        assert_eq!(entries[1].rank, 2);
        assert_eq!(entries[2].user_id, a);
        assert_eq!(entries[2].rank, 3);
        assert!(entries.iter().all(|e| e.cache_key == "week_x"));
    }

    #[test]
    fn test_rank_entries_ties_are_deterministic() {
        let mut ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();

        let shuffled = vec![
            (ids[2], dec(50.0), None),
            (ids[0], dec(50.0), None),
            (ids[1], dec(50.0), None),
        ];
        let entries = rank_entries("season_x", shuffled);

        // Equal points rank by user id, lowest first
        assert_eq!(entries[0].user_id, ids[0]);
        assert_eq!(entries[1].user_id, ids[1]);
        assert_eq!(entries[2].user_id, ids[2]);
        assert_eq!(
            entries.iter().map(|e| e.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_rank_entries_empty() {
        assert!(rank_entries("week_x", vec![]).is_empty());
    }
}
