use chrono::{DateTime, Utc};
use log::error;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::db::models::{
    Account, AccountActivityPoints, ActivityCategoryWeek, Season, SnapshotStatus,
    UserSeasonPoints, UserWeeklyMultiplier, Week,
};
use crate::db::postgres::PostgresClient;

/// Sanitize a string for PostgreSQL by removing null bytes (0x00)
/// which are invalid in UTF-8 text columns
pub(crate) fn sanitize_string(s: &str) -> String {
    s.replace('\0', "")
}

impl PostgresClient {
    // ==================== SEASONS & WEEKS ====================

    pub async fn get_seasons(&self) -> anyhow::Result<Vec<Season>> {
        let client = self.pool.get().await?;
        let query = "SELECT id, name, status FROM incentives.seasons ORDER BY name";

        let rows = client.query(query, &[]).await?;
        Ok(rows.iter().map(row_to_season).collect())
    }

    pub async fn get_season(&self, id: Uuid) -> anyhow::Result<Option<Season>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT id, name, status
            FROM incentives.seasons
            WHERE id = $1
        "#;

        let row = client.query_opt(query, &[&id]).await?;
        Ok(row.map(|row| row_to_season(&row)))
    }

    pub async fn get_week(&self, id: Uuid) -> anyhow::Result<Option<Week>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT id, season_id, start_date, end_date, processed
            FROM incentives.weeks
            WHERE id = $1
        "#;

        let row = client.query_opt(query, &[&id]).await?;
        Ok(row.map(|row| row_to_week(&row)))
    }

    /// All weeks of a season, oldest first
    pub async fn get_weeks_for_season(&self, season_id: Uuid) -> anyhow::Result<Vec<Week>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT id, season_id, start_date, end_date, processed
            FROM incentives.weeks
            WHERE season_id = $1
            ORDER BY start_date
        "#;

        let rows = client.query(query, &[&season_id]).await?;
        Ok(rows.iter().map(row_to_week).collect())
    }

    /// Get the week whose half-open [start_date, end_date) range contains `at`
    pub async fn get_week_containing(&self, at: DateTime<Utc>) -> anyhow::Result<Option<Week>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT id, season_id, start_date, end_date, processed
            FROM incentives.weeks
            WHERE start_date <= $1 AND end_date > $1
            ORDER BY start_date
            LIMIT 1
        "#;

        let row = client.query_opt(query, &[&at]).await?;
        Ok(row.map(|row| row_to_week(&row)))
    }

    /// Seal a week after its season points have been computed
    pub async fn mark_week_processed(&self, week_id: Uuid) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE incentives.weeks SET processed = TRUE WHERE id = $1",
                &[&week_id],
            )
            .await
            .map_err(|e| {
                error!("Failed to mark week {} processed: {:?}", week_id, e);
                e
            })?;

        Ok(())
    }

    // ==================== ACTIVITIES & POOLS ====================

    /// Distinct activity categories
    pub async fn get_activity_categories(&self) -> anyhow::Result<Vec<String>> {
        let client = self.pool.get().await?;
        let query = "SELECT DISTINCT category FROM incentives.activities ORDER BY category";

        let rows = client.query(query, &[]).await?;
        Ok(rows.iter().map(|row| row.get("category")).collect())
    }

    /// Get the per-category points pools configured for a week
    pub async fn get_category_pools(
        &self,
        week_id: Uuid,
    ) -> anyhow::Result<Vec<ActivityCategoryWeek>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT activity_category_id, week_id, points_pool
            FROM incentives.activity_category_weeks
            WHERE week_id = $1
        "#;

        let rows = client.query(query, &[&week_id]).await?;
        let pools = rows
            .iter()
            .map(|row| ActivityCategoryWeek {
                activity_category_id: row.get("activity_category_id"),
                week_id: row.get("week_id"),
                points_pool: row.get("points_pool"),
            })
            .collect();

        Ok(pools)
    }

    // ==================== ACCOUNTS ====================

    /// Get all registered campaign accounts
    pub async fn get_accounts(&self) -> anyhow::Result<Vec<Account>> {
        let client = self.pool.get().await?;
        let query = "SELECT address, user_id, label FROM incentives.accounts";

        let rows = client.query(query, &[]).await?;
        let accounts = rows.iter().map(|row| row_to_account(row)).collect();

        Ok(accounts)
    }

    /// Get accounts by address (batched)
    pub async fn get_accounts_by_addresses(
        &self,
        addresses: &[String],
    ) -> anyhow::Result<Vec<Account>> {
        if addresses.is_empty() {
            return Ok(vec![]);
        }

        let client = self.pool.get().await?;
        let query = r#"
            SELECT address, user_id, label
            FROM incentives.accounts
            WHERE address = ANY($1)
        "#;

        let rows = client.query(query, &[&addresses]).await?;
        let accounts = rows.iter().map(|row| row_to_account(row)).collect();

        Ok(accounts)
    }

    // ==================== SNAPSHOT RUNS ====================

    /// Record the start of a snapshot run, returning its id
    pub async fn create_snapshot_run(&self, timestamp: DateTime<Utc>) -> anyhow::Result<Uuid> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO incentives.snapshots (timestamp, status, updated_at)
            VALUES ($1, $2, NOW())
            RETURNING id
        "#;

        let row = client
            .query_one(query, &[&timestamp, &SnapshotStatus::Processing])
            .await
            .map_err(|e| {
                error!("Failed to create snapshot run at {}: {:?}", timestamp, e);
                e
            })?;

        Ok(row.get("id"))
    }

    pub async fn update_snapshot_run(
        &self,
        id: Uuid,
        status: SnapshotStatus,
    ) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE incentives.snapshots SET status = $2, updated_at = NOW() WHERE id = $1",
                &[&id, &status],
            )
            .await
            .map_err(|e| {
                error!("Failed to update snapshot run {}: {:?}", id, e);
                e
            })?;

        Ok(())
    }

    // ==================== ACTIVITY POINTS ====================

    /// Batch insert/update per-account activity points (true batch insert with multi-row VALUES)
    pub async fn set_activity_points(
        &self,
        points: &[AccountActivityPoints],
    ) -> anyhow::Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        const COLS_PER_ROW: usize = 4;
        const BATCH_SIZE: usize = 1000;

        let client = self.pool.get().await?;

        for chunk in points.chunks(BATCH_SIZE) {
            // Build VALUES placeholders: ($1,$2,$3,$4), ($5,$6,$7,$8), ...
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
                INSERT INTO incentives.account_activity_points (
                    account_address, week_id, activity_id, activity_points
                ) VALUES {}
                ON CONFLICT (account_address, week_id, activity_id) DO UPDATE SET
                    activity_points = EXCLUDED.activity_points
                "#,
                values_clauses.join(", ")
            );

            // Store sanitized addresses
            let mut sanitized: Vec<String> = Vec::with_capacity(chunk.len());
            for entry in chunk {
                sanitized.push(sanitize_string(&entry.account_address));
            }

            let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
                Vec::with_capacity(chunk.len() * COLS_PER_ROW);

            for (i, entry) in chunk.iter().enumerate() {
                params.push(&sanitized[i]);
                params.push(&entry.week_id);
                params.push(&entry.activity_id);
                params.push(&entry.activity_points);
            }

            client.execute(&query, &params).await.map_err(|e| {
                error!(
                    "Failed to batch insert {} activity points rows: {:?}",
                    chunk.len(),
                    e
                );
                e
            })?;
        }

        Ok(())
    }

    /// Per-user points for one activity in one week, summed over the user's
    /// accounts
    pub async fn get_user_activity_points(
        &self,
        week_id: Uuid,
        activity_id: &str,
    ) -> anyhow::Result<Vec<(Uuid, Decimal)>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT a.user_id, SUM(p.activity_points) AS points
            FROM incentives.account_activity_points p
            JOIN incentives.accounts a ON a.address = p.account_address
            WHERE p.week_id = $1 AND p.activity_id = $2
            GROUP BY a.user_id
        "#;

        let rows = client.query(query, &[&week_id, &activity_id]).await?;
        let points = rows
            .iter()
            .map(|row| (row.get("user_id"), row.get("points")))
            .collect();

        Ok(points)
    }

    /// Per-user points for one activity category in one week, summed over
    /// the category's activities and the user's accounts
    pub async fn get_category_activity_points(
        &self,
        week_id: Uuid,
        category: &str,
    ) -> anyhow::Result<Vec<(Uuid, Decimal)>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT a.user_id, SUM(p.activity_points) AS points
            FROM incentives.account_activity_points p
            JOIN incentives.accounts a ON a.address = p.account_address
            JOIN incentives.activities act ON act.id = p.activity_id
            WHERE p.week_id = $1 AND act.category = $2
            GROUP BY a.user_id
        "#;

        let rows = client.query(query, &[&week_id, &category]).await?;
        let points = rows
            .iter()
            .map(|row| (row.get("user_id"), row.get("points")))
            .collect();

        Ok(points)
    }

    // ==================== MULTIPLIERS ====================

    /// Batch insert/update weekly multipliers (true batch insert with multi-row VALUES)
    pub async fn set_multipliers(
        &self,
        multipliers: &[UserWeeklyMultiplier],
    ) -> anyhow::Result<()> {
        if multipliers.is_empty() {
            return Ok(());
        }

        const COLS_PER_ROW: usize = 5;
        const BATCH_SIZE: usize = 1000;

        let client = self.pool.get().await?;

        for chunk in multipliers.chunks(BATCH_SIZE) {
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
                INSERT INTO incentives.season_points_multiplier (
                    user_id, week_id, multiplier, cumulative_twa_balance, total_twa_balance
                ) VALUES {}
                ON CONFLICT (user_id, week_id) DO UPDATE SET
                    multiplier = EXCLUDED.multiplier,
                    cumulative_twa_balance = EXCLUDED.cumulative_twa_balance,
                    total_twa_balance = EXCLUDED.total_twa_balance
                "#,
                values_clauses.join(", ")
            );

            let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
                Vec::with_capacity(chunk.len() * COLS_PER_ROW);

            for entry in chunk {
                params.push(&entry.user_id);
                params.push(&entry.week_id);
                params.push(&entry.multiplier);
                params.push(&entry.cumulative_twa_balance);
                params.push(&entry.total_twa_balance);
            }

            client.execute(&query, &params).await.map_err(|e| {
                error!(
                    "Failed to batch insert {} multiplier rows: {:?}",
                    chunk.len(),
                    e
                );
                e
            })?;
        }

        Ok(())
    }

    pub async fn get_multipliers(&self, week_id: Uuid) -> anyhow::Result<Vec<UserWeeklyMultiplier>> {
        let client = self.pool.get().await?;
        let query = r#"
            SELECT user_id, week_id, multiplier, cumulative_twa_balance, total_twa_balance
            FROM incentives.season_points_multiplier
            WHERE week_id = $1
        "#;

        let rows = client.query(query, &[&week_id]).await?;
        let multipliers = rows.iter().map(|row| row_to_multiplier(row)).collect();

        Ok(multipliers)
    }

    // ==================== SEASON POINTS ====================

    /// Batch insert/update weekly season points (true batch insert with multi-row VALUES)
    pub async fn set_user_season_points(
        &self,
        points: &[UserSeasonPoints],
    ) -> anyhow::Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        const COLS_PER_ROW: usize = 4;
        const BATCH_SIZE: usize = 1000;

        let client = self.pool.get().await?;

        for chunk in points.chunks(BATCH_SIZE) {
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
                INSERT INTO incentives.user_season_points (
                    user_id, season_id, week_id, points
                ) VALUES {}
                ON CONFLICT (user_id, season_id, week_id) DO UPDATE SET
                    points = EXCLUDED.points
                "#,
                values_clauses.join(", ")
            );

            let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
                Vec::with_capacity(chunk.len() * COLS_PER_ROW);

            for entry in chunk {
                params.push(&entry.user_id);
                params.push(&entry.season_id);
                params.push(&entry.week_id);
                params.push(&entry.points);
            }

            client.execute(&query, &params).await.map_err(|e| {
                error!(
                    "Failed to batch insert {} season points rows: {:?}",
                    chunk.len(),
                    e
                );
                e
            })?;
        }

        Ok(())
    }

    // ==================== CRON CHECKPOINTS ====================

    /// Get the last run timestamp for a cron job
    pub async fn get_cron_checkpoint(
        &self,
        job_name: &str,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let client = self.pool.get().await?;
        let query = "SELECT last_run_at FROM incentives.cron_checkpoints WHERE job_name = $1";

        let row = client.query_opt(query, &[&job_name]).await?;
        Ok(row.and_then(|row| row.get("last_run_at")))
    }

    /// Record the last run timestamp for a cron job
    pub async fn set_cron_checkpoint(
        &self,
        job_name: &str,
        last_run_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let client = self.pool.get().await?;
        let query = r#"
            INSERT INTO incentives.cron_checkpoints (job_name, last_run_at, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (job_name) DO UPDATE SET
                last_run_at = EXCLUDED.last_run_at,
                updated_at = NOW()
        "#;

        client
            .execute(query, &[&job_name, &last_run_at])
            .await
            .map_err(|e| {
                error!("Failed to set cron checkpoint for {}: {:?}", job_name, e);
                e
            })?;

        Ok(())
    }
}

// ==================== HELPER FUNCTIONS ====================

fn row_to_season(row: &tokio_postgres::Row) -> Season {
    Season {
        id: row.get("id"),
        name: row.get("name"),
        status: row.get("status"),
    }
}

fn row_to_week(row: &tokio_postgres::Row) -> Week {
    Week {
        id: row.get("id"),
        season_id: row.get("season_id"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        processed: row.get("processed"),
    }
}

fn row_to_account(row: &tokio_postgres::Row) -> Account {
    Account {
        address: row.get("address"),
        user_id: row.get("user_id"),
        label: row.get("label"),
    }
}

fn row_to_multiplier(row: &tokio_postgres::Row) -> UserWeeklyMultiplier {
    UserWeeklyMultiplier {
        user_id: row.get("user_id"),
        week_id: row.get("week_id"),
        multiplier: row.get("multiplier"),
        cumulative_twa_balance: row.get("cumulative_twa_balance"),
        total_twa_balance: row.get("total_twa_balance"),
    }
}
