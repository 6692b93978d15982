use chrono::{DateTime, Utc};
use postgres_types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Season lifecycle status (PostgreSQL enum `season_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSql, FromSql)]
#[postgres(name = "season_status")]
#[serde(rename_all = "snake_case")]
pub enum SeasonStatus {
    #[postgres(name = "upcoming")]
    Upcoming,
    #[postgres(name = "active")]
    Active,
    #[postgres(name = "completed")]
    Completed,
}

/// Campaign season. Owned by external configuration; the pipeline only
/// reads the status for the season-points guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Season {
    pub id: Uuid,
    pub name: String,
    pub status: SeasonStatus,
}

/// Campaign week inside a season.
///
/// The pipeline reads the date range and flips `processed` once the week's
/// season points are sealed; `processed = true` blocks non-forced recomputes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Week {
    pub id: Uuid,
    pub season_id: Uuid,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub processed: bool,
}

impl Week {
    /// Whether `at` falls inside this week's half-open date range.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start_date <= at && at < self.end_date
    }
}

/// Points pool allocated to an activity category for one week.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityCategoryWeek {
    pub activity_category_id: String,
    pub week_id: Uuid,
    pub points_pool: Option<i64>,
}

/// Campaign account, mapped to the owning user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    pub user_id: Uuid,
    pub label: Option<String>,
}
