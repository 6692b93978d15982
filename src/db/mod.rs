use std::sync::Arc;

use log::info;

use crate::config::Settings;

pub mod models;
pub mod postgres;

pub use postgres::PostgresClient;

/// Database handle shared across the pipeline.
///
/// PostgreSQL holds everything: campaign configuration, the partitioned
/// balance time series, computed points, leaderboard caches and the
/// durable job queue.
#[derive(Clone)]
pub struct Database {
    pub postgres: Arc<PostgresClient>,
}

impl Database {
    pub async fn new(settings: Arc<Settings>) -> anyhow::Result<Self> {
        let postgres = PostgresClient::new(settings.postgres.clone()).await?;

        // Run migrations
        postgres.migrate().await?;

        info!("Database ready");

        Ok(Self {
            postgres: Arc::new(postgres),
        })
    }
}
