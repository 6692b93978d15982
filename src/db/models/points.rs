use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raw per-account activity points for one week (e.g. the TWA balance a
/// holding activity produced). Input to the season-points distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountActivityPoints {
    pub account_address: String,
    pub week_id: Uuid,
    pub activity_id: String,
    pub activity_points: Decimal,
}

/// Per-user holding multiplier for one week, with the cumulative/total TWA
/// balances that positioned the user on the curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserWeeklyMultiplier {
    pub user_id: Uuid,
    pub week_id: Uuid,
    pub multiplier: Decimal,
    pub cumulative_twa_balance: Option<Decimal>,
    pub total_twa_balance: Option<Decimal>,
}

/// One week's contribution to a user's season total. Season totals are the
/// sum of these rows over the season's weeks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeasonPoints {
    pub user_id: Uuid,
    pub season_id: Uuid,
    pub week_id: Uuid,
    pub points: Decimal,
}
