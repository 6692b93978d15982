mod leaderboard;
mod points;
mod snapshot;
mod week;

pub use leaderboard::{Leaderboard, LeaderboardEntry, LeaderboardStats};
pub use points::{AccountActivityPoints, UserSeasonPoints, UserWeeklyMultiplier};
pub use snapshot::{BalanceSnapshot, SnapshotStatus};
pub use week::{Account, ActivityCategoryWeek, Season, SeasonStatus, Week};
