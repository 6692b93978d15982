use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ranked leaderboard row inside one cache scope.
///
/// `breakdown` carries the per-activity split for category scopes; null for
/// season/week scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub cache_key: String,
    pub user_id: Uuid,
    pub rank: i64,
    pub points: Decimal,
    pub breakdown: Option<serde_json::Value>,
}

/// Aggregate stats for one cache scope. The presence of this row is the
/// "cache populated" marker for the scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardStats {
    pub cache_key: String,
    pub median_points: Option<Decimal>,
    pub average_points: Option<Decimal>,
    pub total_users: i64,
    pub updated_at: DateTime<Utc>,
}

/// Read-side view of one populated scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaderboard {
    pub stats: LeaderboardStats,
    pub entries: Vec<LeaderboardEntry>,
}
