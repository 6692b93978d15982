pub mod config;
pub mod cron;
pub mod db;
pub mod gateway;
pub mod http;
pub mod jobs;
pub mod metrics;
pub mod points;
pub mod queue;

pub use config::Settings;
pub use cron::{CronScheduler, CronSettings};
pub use db::Database;
pub use metrics::Metrics;
