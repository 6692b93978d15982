use config::{Config, ConfigError, File};
use serde::Deserialize;

use crate::cron::CronSettings;

/// PostgreSQL database connection configuration.
///
/// Single durable store for:
/// - Campaign configuration (seasons, weeks, activities, pools)
/// - Partitioned balance snapshots
/// - Computed points/multiplier artifacts and the leaderboard cache
/// - The durable job queue
#[derive(Debug, Deserialize, Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    16
}

/// Control-plane HTTP listener configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct HttpSettings {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    3000
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

/// Balance gateway configuration.
///
/// The gateway is the external collaborator that serves per-account token
/// balances at a ledger timestamp. An empty `url` switches the snapshot
/// producer to the deterministic dummy source.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewaySettings {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_gateway_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_gateway_timeout_secs() -> u64 {
    30
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

/// Durable queue engine configuration.
///
/// `lock_duration_secs` is the exclusive lease a worker holds on a claimed
/// job; `stalled_interval_secs` is the sweep cadence for expired leases.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,
    #[serde(default = "default_stalled_interval_secs")]
    pub stalled_interval_secs: u64,
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: i32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lock_duration_secs() -> u64 {
    300 // 5 minutes
}

fn default_stalled_interval_secs() -> u64 {
    180
}

fn default_max_stalled_count() -> i32 {
    2
}

fn default_max_attempts() -> i32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_concurrency() -> usize {
    2
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            lock_duration_secs: default_lock_duration_secs(),
            stalled_interval_secs: default_stalled_interval_secs(),
            max_stalled_count: default_max_stalled_count(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            default_concurrency: default_concurrency(),
        }
    }
}

/// Snapshot producer configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct SnapshotSettings {
    /// Accounts fetched/written per batch.
    #[serde(default = "default_snapshot_batch_size")]
    pub batch_size: usize,
    /// Token resources captured into each snapshot's data payload.
    #[serde(default = "default_tracked_resources")]
    pub tracked_resources: Vec<String>,
}

fn default_snapshot_batch_size() -> usize {
    30_000
}

fn default_tracked_resources() -> Vec<String> {
    vec!["xrd".to_string()]
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            batch_size: default_snapshot_batch_size(),
            tracked_resources: default_tracked_resources(),
        }
    }
}

/// Campaign scoring configuration.
///
/// Parameters of the banded pool distribution and the holding-multiplier
/// curve. Defaults match the campaign rules this service launched with.
#[derive(Debug, Deserialize, Clone)]
pub struct CampaignSettings {
    /// Activity whose TWA balance qualifies a user for the multiplier.
    #[serde(default = "default_qualifying_activity")]
    pub qualifying_activity: String,
    /// Minimum TWA balance for multiplier eligibility.
    #[serde(default = "default_min_multiplier_balance")]
    pub min_multiplier_balance: f64,
    /// Minimum raw activity points to participate in pool distribution.
    #[serde(default = "default_minimum_points")]
    pub minimum_points: f64,
    /// Fraction of the lowest-scoring participants trimmed before banding.
    #[serde(default = "default_lower_bounds_percentage")]
    pub lower_bounds_percentage: f64,
    #[serde(default = "default_number_of_bands")]
    pub number_of_bands: usize,
    #[serde(default = "default_pool_share_start")]
    pub pool_share_start: f64,
    #[serde(default = "default_pool_share_step")]
    pub pool_share_step: f64,
}

fn default_qualifying_activity() -> String {
    "hold_xrd".to_string()
}

fn default_min_multiplier_balance() -> f64 {
    10_000.0
}

fn default_minimum_points() -> f64 {
    10_080.0
}

fn default_lower_bounds_percentage() -> f64 {
    0.1
}

fn default_number_of_bands() -> usize {
    20
}

fn default_pool_share_start() -> f64 {
    0.98
}

fn default_pool_share_step() -> f64 {
    1.15
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            qualifying_activity: default_qualifying_activity(),
            min_multiplier_balance: default_min_multiplier_balance(),
            minimum_points: default_minimum_points(),
            lower_bounds_percentage: default_lower_bounds_percentage(),
            number_of_bands: default_number_of_bands(),
            pool_share_start: default_pool_share_start(),
            pool_share_step: default_pool_share_step(),
        }
    }
}

/// Balance store partition lifecycle configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct PartitionSettings {
    /// Hash sub-partitions per weekly partition.
    #[serde(default = "default_hash_partitions")]
    pub hash_partitions: u32,
    /// Weeks after which hash sub-partitions are merged into one partition.
    #[serde(default = "default_consolidate_after_weeks")]
    pub consolidate_after_weeks: i64,
    /// Weeks of history to keep; unset keeps everything.
    #[serde(default)]
    pub retention_weeks: Option<i64>,
}

fn default_hash_partitions() -> u32 {
    4
}

fn default_consolidate_after_weeks() -> i64 {
    13 // ~3 months
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            hash_partitions: default_hash_partitions(),
            consolidate_after_weeks: default_consolidate_after_weeks(),
            retention_weeks: None,
        }
    }
}

/// Root application configuration.
///
/// Loaded from `config.yaml` at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub postgres: PostgresSettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub snapshot: SnapshotSettings,
    #[serde(default)]
    pub campaign: CampaignSettings,
    #[serde(default)]
    pub partitions: PartitionSettings,
    #[serde(default)]
    pub cron: CronSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("config"))
            .build()?;

        let settings: Settings = s.try_deserialize()?;

        Ok(settings)
    }
}
