use std::collections::HashMap;

use chrono::{Duration, Utc};
use log::info;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::db::postgres::sanitize_string;
use crate::metrics::Metrics;
use crate::queue::dag::DagNode;
use crate::queue::job::{EnqueueError, EnqueueOpts, JobHandle, JobSchedule};
use crate::queue::store::{JobStore, NewJob};

pub type PayloadValidator = Box<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Typed job payload with enqueue-time checks.
pub trait ValidatedPayload: DeserializeOwned {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Validator that parses the payload as `T` and runs its checks, so bad
/// requests are rejected at enqueue time instead of failing the job later.
pub fn typed_validator<T: ValidatedPayload + 'static>() -> PayloadValidator {
    Box::new(|value| {
        let payload: T = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        payload.validate()
    })
}

/// One named queue and its processing policy.
pub struct Queue {
    pub name: String,
    pub concurrency: usize,
    pub max_attempts: i32,
    validator: PayloadValidator,
}

impl Queue {
    pub fn new(
        name: impl Into<String>,
        concurrency: usize,
        max_attempts: i32,
        validator: PayloadValidator,
    ) -> Self {
        Self {
            name: name.into(),
            concurrency,
            max_attempts,
            validator,
        }
    }

    pub fn validate(&self, payload: &Value) -> Result<(), String> {
        (self.validator)(payload)
    }
}

/// The set of known queues; the only door into the jobs table.
///
/// Every enqueue path (HTTP, cron, job chaining) goes through here so
/// payload validation and queue policy apply uniformly.
pub struct QueueRegistry {
    store: JobStore,
    metrics: Metrics,
    queues: HashMap<String, Queue>,
}

impl QueueRegistry {
    pub fn new(store: JobStore, metrics: Metrics) -> Self {
        Self {
            store,
            metrics,
            queues: HashMap::new(),
        }
    }

    pub fn register(&mut self, queue: Queue) {
        self.queues.insert(queue.name.clone(), queue);
    }

    pub fn get(&self, name: &str) -> Option<&Queue> {
        self.queues.get(name)
    }

    pub fn queue_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.queues.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Validate and persist one job.
    pub async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        opts: EnqueueOpts,
    ) -> Result<JobHandle, EnqueueError> {
        let q = self
            .queues
            .get(queue)
            .ok_or_else(|| EnqueueError::UnknownQueue(queue.to_string()))?;
        q.validate(&payload).map_err(EnqueueError::InvalidPayload)?;

        let job = resolve_job(q, name, payload, &opts, None, 0, false);
        let (id, deduplicated) = self.store.insert_job(&job).await?;

        if deduplicated {
            info!(
                "Enqueue of {} on {} deduplicated against job {}",
                name, queue, id
            );
        } else {
            self.metrics.jobs_enqueued.with_label_values(&[queue]).inc();
            info!("Enqueued {} job {} on {}", name, id, queue);
        }

        Ok(JobHandle {
            id,
            queue: queue.to_string(),
            deduplicated,
        })
    }

    /// Validate and persist a job graph. Children become claimable first;
    /// the returned handle is the root's.
    pub async fn enqueue_dag(&self, root: DagNode) -> Result<JobHandle, EnqueueError> {
        for node in root.iter() {
            let q = self
                .queues
                .get(&node.queue)
                .ok_or_else(|| EnqueueError::UnknownQueue(node.queue.clone()))?;
            q.validate(&node.payload)
                .map_err(EnqueueError::InvalidPayload)?;
        }

        let mut rows = Vec::with_capacity(root.size());
        flatten(&root, None, &self.queues, &mut rows);

        let (id, deduplicated) = self.store.insert_dag(&rows).await?;

        if deduplicated {
            info!(
                "Graph enqueue of {} deduplicated against job {}",
                root.name, id
            );
        } else {
            for row in &rows {
                self.metrics
                    .jobs_enqueued
                    .with_label_values(&[row.queue.as_str()])
                    .inc();
            }
            info!(
                "Enqueued job graph of {} rooted at {} job {}",
                rows.len(),
                root.name,
                id
            );
        }

        Ok(JobHandle {
            id,
            queue: root.queue,
            deduplicated,
        })
    }

    /// Register a repeatable job, or update its pattern/payload if one
    /// with the same (queue, job_name) already exists.
    ///
    /// This is the write side of the durable `job_schedules` table; the
    /// cron scheduler's sync loop turns each row into a live cron entry
    /// that enqueues ordinary jobs on the pattern. Reached from
    /// `POST /queues/{queue}/schedules`.
    pub async fn schedule(
        &self,
        queue: &str,
        job_name: &str,
        cron_pattern: &str,
        payload: Value,
    ) -> Result<(), EnqueueError> {
        let q = self
            .queues
            .get(queue)
            .ok_or_else(|| EnqueueError::UnknownQueue(queue.to_string()))?;
        q.validate(&payload).map_err(EnqueueError::InvalidPayload)?;
        validate_cron_pattern(cron_pattern).map_err(EnqueueError::InvalidPayload)?;

        self.store
            .upsert_schedule(&JobSchedule {
                queue: queue.to_string(),
                job_name: sanitize_string(job_name),
                cron_pattern: cron_pattern.to_string(),
                payload,
            })
            .await?;

        info!(
            "Registered repeatable job {} on {} ({})",
            job_name, queue, cron_pattern
        );
        Ok(())
    }
}

// ==================== HELPER FUNCTIONS ====================

/// Cheap shape check so an unusable schedule is rejected at registration
/// instead of being skipped by every sync pass. Accepts standard 5-field
/// patterns and 6-field patterns with seconds.
fn validate_cron_pattern(pattern: &str) -> Result<(), String> {
    let fields = pattern.split_whitespace().count();
    if (5..=6).contains(&fields) {
        Ok(())
    } else {
        Err(format!(
            "cron pattern {:?} must have 5 or 6 fields, got {}",
            pattern, fields
        ))
    }
}

fn resolve_job(
    q: &Queue,
    name: &str,
    payload: Value,
    opts: &EnqueueOpts,
    parent_id: Option<Uuid>,
    pending_children: i32,
    fail_parent_on_failure: bool,
) -> NewJob {
    NewJob {
        id: Uuid::new_v4(),
        queue: q.name.clone(),
        name: sanitize_string(name),
        job_key: opts.job_key.as_deref().map(sanitize_string),
        payload,
        priority: opts.priority,
        max_attempts: opts.max_attempts.unwrap_or(q.max_attempts),
        run_at: Utc::now() + opts.delay.unwrap_or_else(Duration::zero),
        parent_id,
        pending_children,
        fail_parent_on_failure,
    }
}

fn flatten(
    node: &DagNode,
    parent_id: Option<Uuid>,
    queues: &HashMap<String, Queue>,
    out: &mut Vec<NewJob>,
) {
    let q = &queues[&node.queue];
    let row = resolve_job(
        q,
        &node.name,
        node.payload.clone(),
        &node.opts,
        parent_id,
        node.children.len() as i32,
        node.fail_parent_on_failure,
    );
    let id = row.id;
    out.push(row);

    for child in &node.children {
        flatten(child, Some(id), queues, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct EchoPayload {
        count: i32,
    }

    impl ValidatedPayload for EchoPayload {
        fn validate(&self) -> Result<(), String> {
            if self.count < 0 {
                return Err("count must not be negative".to_string());
            }
            Ok(())
        }
    }

    fn noop_queue(name: &str) -> Queue {
        Queue::new(name, 1, 3, Box::new(|_| Ok(())))
    }

    #[test]
    fn test_typed_validator_accepts_valid_payload() {
        let validator = typed_validator::<EchoPayload>();
        assert!(validator(&json!({ "count": 3 })).is_ok());
    }

    #[test]
    fn test_typed_validator_rejects_malformed_json() {
        let validator = typed_validator::<EchoPayload>();
        assert!(validator(&json!({ "count": "three" })).is_err());
        assert!(validator(&json!({})).is_err());
    }

    #[test]
    fn test_typed_validator_runs_domain_checks() {
        let validator = typed_validator::<EchoPayload>();
        let err = validator(&json!({ "count": -1 })).unwrap_err();
        assert!(err.contains("negative"));
    }

    #[test]
    fn test_flatten_links_children_to_parent() {
        let mut queues = HashMap::new();
        queues.insert("a".to_string(), noop_queue("a"));
        queues.insert("b".to_string(), noop_queue("b"));

        let dag = DagNode::new("a", "root", json!({}))
            .child(DagNode::new("b", "left", json!({})).fail_parent(true))
            .child(DagNode::new("b", "right", json!({})));

        let mut rows = Vec::new();
        flatten(&dag, None, &queues, &mut rows);

        assert_eq!(rows.len(), 3);
        let root = &rows[0];
        assert_eq!(root.pending_children, 2);
        assert_eq!(root.parent_id, None);
        assert!(rows[1..]
            .iter()
            .all(|r| r.parent_id == Some(root.id) && r.pending_children == 0));
        assert!(rows[1].fail_parent_on_failure);
        assert!(!rows[2].fail_parent_on_failure);
    }

    #[test]
    fn test_validate_cron_pattern_field_counts() {
        assert!(validate_cron_pattern("0 * * * *").is_ok());
        assert!(validate_cron_pattern("0 30 2 * * *").is_ok());
        assert!(validate_cron_pattern("hourly").is_err());
        assert!(validate_cron_pattern("0 30 2 * * * 2026").is_err());
    }

    #[test]
    fn test_resolve_job_applies_queue_defaults() {
        let q = noop_queue("a");
        let job = resolve_job(&q, "work", json!({}), &EnqueueOpts::default(), None, 0, false);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.priority, 0);
        assert!(job.job_key.is_none());

        let opts = EnqueueOpts {
            max_attempts: Some(7),
            priority: 5,
            job_key: Some("week-1".to_string()),
            delay: None,
        };
        let job = resolve_job(&q, "work", json!({}), &opts, None, 0, false);
        assert_eq!(job.max_attempts, 7);
        assert_eq!(job.priority, 5);
        assert_eq!(job.job_key.as_deref(), Some("week-1"));
    }
}
