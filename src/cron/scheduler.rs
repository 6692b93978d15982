//! Cron scheduler for the pipeline's recurring triggers.
//!
//! Built-in triggers:
//! - Hourly snapshot of all account balances
//! - Daily calculation chain (activity points -> multiplier -> season points)
//! - Daily storage maintenance (partition retention/consolidation, job purge)
//!
//! On top of those, the scheduler materializes the durable `job_schedules`
//! table: repeatable jobs registered through the queue API are synced into
//! cron entries here, so re-registering an identical name and pattern is a
//! no-op and a changed pattern replaces the schedule instead of
//! duplicating it.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::json;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Settings;
use crate::db::Database;
use crate::jobs::{calculation_dag, hour_key, MAINTENANCE_QUEUE, SNAPSHOT_QUEUE};
use crate::queue::{EnqueueOpts, JobSchedule, QueueRegistry};

const SNAPSHOT_TRIGGER: &str = "snapshot_trigger";
const CALCULATIONS_TRIGGER: &str = "calculations_trigger";

/// Configuration for the built-in triggers. Patterns are 6-field cron
/// expressions (with seconds).
#[derive(Debug, Deserialize, Clone)]
pub struct CronSettings {
    /// Hourly balance snapshot trigger.
    #[serde(default = "default_snapshot_pattern")]
    pub snapshot_pattern: String,
    /// Daily calculation chain trigger.
    #[serde(default = "default_calculations_pattern")]
    pub calculations_pattern: String,
    /// Daily storage maintenance trigger.
    #[serde(default = "default_maintenance_pattern")]
    pub maintenance_pattern: String,
    /// How often the durable `job_schedules` table is synced into cron
    /// entries.
    #[serde(default = "default_schedule_sync_interval_secs")]
    pub schedule_sync_interval_secs: u64,
}

fn default_snapshot_pattern() -> String {
    "0 0 * * * *".to_string() // every hour on the hour
}

fn default_calculations_pattern() -> String {
    "0 30 2 * * *".to_string() // daily at 02:30 UTC
}

fn default_maintenance_pattern() -> String {
    "0 0 4 * * *".to_string() // daily at 04:00 UTC
}

fn default_schedule_sync_interval_secs() -> u64 {
    60
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            snapshot_pattern: default_snapshot_pattern(),
            calculations_pattern: default_calculations_pattern(),
            maintenance_pattern: default_maintenance_pattern(),
            schedule_sync_interval_secs: default_schedule_sync_interval_secs(),
        }
    }
}

/// One reconcile step for the durable schedules sync. `Install` and
/// `Replace` index into the fetched schedule rows.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ScheduleAction {
    Install(usize),
    Replace(usize),
    Remove(String, String),
}

/// Diff the `job_schedules` rows against the currently registered cron
/// entries, keyed by (queue, job_name). An unchanged pattern yields no
/// action, a changed one a replace, a missing row a remove.
fn plan_schedule_sync(
    schedules: &[JobSchedule],
    registered: &FxHashMap<(String, String), (String, Uuid)>,
) -> Vec<ScheduleAction> {
    let mut actions = Vec::new();

    for (idx, schedule) in schedules.iter().enumerate() {
        let key = (schedule.queue.clone(), schedule.job_name.clone());
        match registered.get(&key) {
            None => actions.push(ScheduleAction::Install(idx)),
            Some((pattern, _)) if *pattern != schedule.cron_pattern => {
                actions.push(ScheduleAction::Replace(idx));
            },
            Some(_) => {},
        }
    }

    for (queue, job_name) in registered.keys() {
        let live = schedules
            .iter()
            .any(|s| s.queue == *queue && s.job_name == *job_name);
        if !live {
            actions.push(ScheduleAction::Remove(queue.clone(), job_name.clone()));
        }
    }

    actions
}

/// Accept standard 5-field cron patterns from the schedules table by
/// prefixing the seconds field.
fn normalize_pattern(pattern: &str) -> String {
    if pattern.split_whitespace().count() == 5 {
        format!("0 {}", pattern)
    } else {
        pattern.to_string()
    }
}

pub struct CronScheduler {
    db: Database,
    queues: Arc<QueueRegistry>,
    settings: Arc<Settings>,
}

impl CronScheduler {
    pub fn new(db: Database, queues: Arc<QueueRegistry>, settings: Arc<Settings>) -> Self {
        Self {
            db,
            queues,
            settings,
        }
    }

    /// Starts the cron scheduler and runs until cancellation.
    pub async fn run(&self, cancellation_token: CancellationToken) -> Result<()> {
        let scheduler = JobScheduler::new().await?;

        self.register_snapshot_trigger(&scheduler).await?;
        self.register_calculations_trigger(&scheduler).await?;
        self.register_maintenance_trigger(&scheduler).await?;

        scheduler.start().await?;
        info!("Cron scheduler started with 3 built-in triggers");
        self.log_last_runs().await;

        // Sync loop for durable schedules; keyed by (queue, job_name) so a
        // changed pattern replaces the existing entry
        let sync_every =
            std::time::Duration::from_secs(self.settings.cron.schedule_sync_interval_secs.max(1));
        let mut registered: FxHashMap<(String, String), (String, Uuid)> = FxHashMap::default();

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(sync_every) => {},
            }

            if let Err(e) = self.sync_schedules(&scheduler, &mut registered).await {
                error!("Failed to sync job schedules: {:#}", e);
            }
        }

        info!("Cron scheduler shutting down...");
        let mut scheduler = scheduler;
        scheduler.shutdown().await?;
        Ok(())
    }

    /// Report when each built-in trigger last fired, from the durable
    /// checkpoints table. After a restart this makes a missed window
    /// visible in the logs.
    async fn log_last_runs(&self) {
        for job_name in [SNAPSHOT_TRIGGER, CALCULATIONS_TRIGGER] {
            match self.db.postgres.get_cron_checkpoint(job_name).await {
                Ok(Some(at)) => info!("Trigger {} last ran at {}", job_name, at),
                Ok(None) => info!("Trigger {} has never run", job_name),
                Err(e) => warn!("Failed to read checkpoint for {}: {:#}", job_name, e),
            }
        }
    }

    async fn register_snapshot_trigger(&self, scheduler: &JobScheduler) -> Result<()> {
        let queues = self.queues.clone();
        let db = self.db.clone();
        let pattern = self.settings.cron.snapshot_pattern.clone();

        let job = Job::new_async(pattern.as_str(), move |_uuid, _lock| {
            let queues = queues.clone();
            let db = db.clone();
            Box::pin(async move {
                let now = Utc::now();
                let result = queues
                    .enqueue(
                        SNAPSHOT_QUEUE,
                        "snapshot",
                        json!({}),
                        EnqueueOpts {
                            job_key: Some(hour_key("snapshot", now)),
                            ..Default::default()
                        },
                    )
                    .await;

                match result {
                    Ok(_) => {
                        if let Err(e) = db.postgres.set_cron_checkpoint(SNAPSHOT_TRIGGER, now).await
                        {
                            warn!("Failed to checkpoint {}: {:#}", SNAPSHOT_TRIGGER, e);
                        }
                    },
                    Err(e) => error!("Failed to enqueue hourly snapshot: {:#}", e),
                }
            })
        })?;

        scheduler.add(job).await?;
        info!(
            "Registered snapshot trigger ({})",
            self.settings.cron.snapshot_pattern
        );
        Ok(())
    }

    async fn register_calculations_trigger(&self, scheduler: &JobScheduler) -> Result<()> {
        let queues = self.queues.clone();
        let db = self.db.clone();
        let pattern = self.settings.cron.calculations_pattern.clone();

        let job = Job::new_async(pattern.as_str(), move |_uuid, _lock| {
            let queues = queues.clone();
            let db = db.clone();
            Box::pin(async move {
                let now = Utc::now();
                let dag = calculation_dag(&now.format("%Y-%m-%d").to_string());

                match queues.enqueue_dag(dag).await {
                    Ok(_) => {
                        if let Err(e) = db
                            .postgres
                            .set_cron_checkpoint(CALCULATIONS_TRIGGER, now)
                            .await
                        {
                            warn!("Failed to checkpoint {}: {:#}", CALCULATIONS_TRIGGER, e);
                        }
                    },
                    Err(e) => error!("Failed to enqueue calculation chain: {:#}", e),
                }
            })
        })?;

        scheduler.add(job).await?;
        info!(
            "Registered calculations trigger ({})",
            self.settings.cron.calculations_pattern
        );
        Ok(())
    }

    async fn register_maintenance_trigger(&self, scheduler: &JobScheduler) -> Result<()> {
        let queues = self.queues.clone();
        let pattern = self.settings.cron.maintenance_pattern.clone();

        let job = Job::new_async(pattern.as_str(), move |_uuid, _lock| {
            let queues = queues.clone();
            Box::pin(async move {
                let now = Utc::now();
                let result = queues
                    .enqueue(
                        MAINTENANCE_QUEUE,
                        "maintenance",
                        json!({}),
                        EnqueueOpts {
                            job_key: Some(format!("maintenance-{}", now.format("%Y-%m-%d"))),
                            ..Default::default()
                        },
                    )
                    .await;

                if let Err(e) = result {
                    error!("Failed to enqueue maintenance job: {:#}", e);
                }
            })
        })?;

        scheduler.add(job).await?;
        info!(
            "Registered maintenance trigger ({})",
            self.settings.cron.maintenance_pattern
        );
        Ok(())
    }

    /// Reconcile cron entries with the durable `job_schedules` table.
    async fn sync_schedules(
        &self,
        scheduler: &JobScheduler,
        registered: &mut FxHashMap<(String, String), (String, Uuid)>,
    ) -> Result<()> {
        let schedules = self.queues.store().list_schedules().await?;

        for action in plan_schedule_sync(&schedules, registered) {
            match action {
                ScheduleAction::Install(idx) | ScheduleAction::Replace(idx) => {
                    let schedule = &schedules[idx];
                    let key = (schedule.queue.clone(), schedule.job_name.clone());
                    if let Some((_, id)) = registered.remove(&key) {
                        scheduler.remove(&id).await?;
                        info!(
                            "Schedule {}/{} pattern changed to {}",
                            key.0, key.1, schedule.cron_pattern
                        );
                    }
                    match self.add_schedule_entry(scheduler, schedule).await {
                        Ok(id) => {
                            registered.insert(key, (schedule.cron_pattern.clone(), id));
                        },
                        Err(e) => {
                            warn!(
                                "Skipping schedule {}/{} with bad pattern {}: {:#}",
                                schedule.queue, schedule.job_name, schedule.cron_pattern, e
                            );
                        },
                    }
                },
                ScheduleAction::Remove(queue, job_name) => {
                    if let Some((_, id)) = registered.remove(&(queue.clone(), job_name.clone())) {
                        scheduler.remove(&id).await?;
                        info!("Removed schedule {}/{}", queue, job_name);
                    }
                },
            }
        }

        Ok(())
    }

    async fn add_schedule_entry(
        &self,
        scheduler: &JobScheduler,
        schedule: &JobSchedule,
    ) -> Result<Uuid> {
        let queues = self.queues.clone();
        let queue = schedule.queue.clone();
        let job_name = schedule.job_name.clone();
        let payload = schedule.payload.clone();
        let pattern = normalize_pattern(&schedule.cron_pattern);

        let job = Job::new_async(pattern.as_str(), move |_uuid, _lock| {
            let queues = queues.clone();
            let queue = queue.clone();
            let job_name = job_name.clone();
            let payload = payload.clone();
            Box::pin(async move {
                let result = queues
                    .enqueue(
                        &queue,
                        &job_name,
                        payload,
                        EnqueueOpts {
                            job_key: Some(hour_key(&job_name, Utc::now())),
                            ..Default::default()
                        },
                    )
                    .await;

                if let Err(e) = result {
                    error!("Failed to enqueue scheduled {}/{}: {:#}", queue, job_name, e);
                }
            })
        })?;

        let id = scheduler.add(job).await?;
        info!(
            "Registered schedule {}/{} ({})",
            schedule.queue, schedule.job_name, schedule.cron_pattern
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_adds_seconds_field() {
        assert_eq!(normalize_pattern("0 * * * *"), "0 0 * * * *");
    }

    #[test]
    fn test_normalize_keeps_six_field_patterns() {
        assert_eq!(normalize_pattern("0 30 2 * * *"), "0 30 2 * * *");
    }

    #[test]
    fn test_default_patterns_have_seconds() {
        let settings = CronSettings::default();
        assert_eq!(settings.snapshot_pattern.split_whitespace().count(), 6);
        assert_eq!(settings.calculations_pattern.split_whitespace().count(), 6);
        assert_eq!(settings.maintenance_pattern.split_whitespace().count(), 6);
    }

    fn schedule(queue: &str, job_name: &str, pattern: &str) -> JobSchedule {
        JobSchedule {
            queue: queue.to_string(),
            job_name: job_name.to_string(),
            cron_pattern: pattern.to_string(),
            payload: serde_json::json!({}),
        }
    }

    fn entry(pattern: &str) -> (String, Uuid) {
        (pattern.to_string(), Uuid::new_v4())
    }

    #[test]
    fn test_sync_plan_unchanged_schedule_is_noop() {
        let schedules = vec![schedule("snapshots", "refresh", "0 * * * *")];
        let mut registered = FxHashMap::default();
        registered.insert(
            ("snapshots".to_string(), "refresh".to_string()),
            entry("0 * * * *"),
        );

        assert!(plan_schedule_sync(&schedules, &registered).is_empty());
    }

    #[test]
    fn test_sync_plan_replaces_changed_pattern() {
        let schedules = vec![schedule("snapshots", "refresh", "30 * * * *")];
        let mut registered = FxHashMap::default();
        registered.insert(
            ("snapshots".to_string(), "refresh".to_string()),
            entry("0 * * * *"),
        );

        assert_eq!(
            plan_schedule_sync(&schedules, &registered),
            vec![ScheduleAction::Replace(0)]
        );
    }

    #[test]
    fn test_sync_plan_installs_new_row() {
        let schedules = vec![schedule("calculations", "recount", "0 3 * * *")];
        let registered = FxHashMap::default();

        assert_eq!(
            plan_schedule_sync(&schedules, &registered),
            vec![ScheduleAction::Install(0)]
        );
    }

    #[test]
    fn test_sync_plan_removes_deleted_row() {
        let schedules = Vec::new();
        let mut registered = FxHashMap::default();
        registered.insert(
            ("snapshots".to_string(), "refresh".to_string()),
            entry("0 * * * *"),
        );

        assert_eq!(
            plan_schedule_sync(&schedules, &registered),
            vec![ScheduleAction::Remove(
                "snapshots".to_string(),
                "refresh".to_string()
            )]
        );
    }
}
