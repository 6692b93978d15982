mod client;
mod leaderboard;
mod ops;
mod partitions;

pub use client::PostgresClient;
pub use leaderboard::{
    category_cache_key, rank_entries, season_cache_key, week_cache_key, LeaderboardError,
};
pub(crate) use ops::sanitize_string;
pub use partitions::{
    consolidation_status, hash_partition_name, partition_name, partition_week_start,
    week_start_utc, ConsolidationOutcome, ConsolidationStatus, PartitionInfo,
};
