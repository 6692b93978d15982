use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::db::Database;
use crate::gateway::BalanceSource;
use crate::metrics::Metrics;
use crate::queue::job::{backoff_delay, Job, JobError};
use crate::queue::registry::QueueRegistry;
use crate::queue::store::JobStore;

/// Everything a job handler gets to work with.
#[derive(Clone)]
pub struct JobContext {
    pub db: Database,
    pub balances: Arc<dyn BalanceSource>,
    pub settings: Arc<Settings>,
    pub queues: Arc<QueueRegistry>,
    pub metrics: Metrics,
}

pub type JobHandler = Arc<
    dyn Fn(JobContext, Job) -> BoxFuture<'static, Result<serde_json::Value, JobError>>
        + Send
        + Sync,
>;

/// Claim-and-process workers for every registered queue, plus the
/// stall sweeper.
///
/// Each queue gets as many polling workers as its configured
/// concurrency. A worker renews its job's lease at half the lock
/// duration and catches handler panics, so a crash inside a handler
/// fails the job instead of wedging it in the active state.
pub struct WorkerPool {
    ctx: JobContext,
    store: JobStore,
    handlers: HashMap<String, JobHandler>,
}

impl WorkerPool {
    pub fn new(ctx: JobContext, store: JobStore) -> Self {
        Self {
            ctx,
            store,
            handlers: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, queue: &str, handler: F)
    where
        F: Fn(JobContext, Job) -> BoxFuture<'static, Result<serde_json::Value, JobError>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(queue.to_string(), Arc::new(handler));
    }

    pub fn spawn(self, cancellation_token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let WorkerPool {
            ctx,
            store,
            handlers,
        } = self;

        let mut handles = Vec::new();
        for (queue, handler) in handlers {
            let concurrency = ctx
                .queues
                .get(&queue)
                .map(|q| q.concurrency)
                .unwrap_or(1);

            for i in 0..concurrency {
                handles.push(tokio::spawn(worker_loop(
                    ctx.clone(),
                    store.clone(),
                    queue.clone(),
                    handler.clone(),
                    format!("{}-{}", queue, i),
                    cancellation_token.child_token(),
                )));
            }
        }

        handles.push(tokio::spawn(sweeper_loop(
            ctx,
            store,
            cancellation_token.child_token(),
        )));

        handles
    }
}

async fn worker_loop(
    ctx: JobContext,
    store: JobStore,
    queue: String,
    handler: JobHandler,
    worker_id: String,
    cancellation_token: CancellationToken,
) {
    let poll = Duration::from_millis(ctx.settings.queue.poll_interval_ms);
    let lock_secs = ctx.settings.queue.lock_duration_secs as f64;

    info!("Worker {} started", worker_id);

    loop {
        if cancellation_token.is_cancelled() {
            info!("Worker {} received cancellation signal", worker_id);
            break;
        }

        match store.claim(&queue, &worker_id, lock_secs).await {
            Ok(Some(job)) => {
                process_job(&ctx, &store, &handler, job).await;
            },
            Ok(None) => {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {},
                    _ = tokio::time::sleep(poll) => {},
                }
            },
            Err(e) => {
                error!("Worker {} failed to claim from {}: {:#}", worker_id, queue, e);
                tokio::select! {
                    _ = cancellation_token.cancelled() => {},
                    _ = tokio::time::sleep(poll) => {},
                }
            },
        }
    }
}

async fn process_job(ctx: &JobContext, store: &JobStore, handler: &JobHandler, job: Job) {
    let started = Instant::now();
    let queue = job.queue.clone();
    let lock_secs = ctx.settings.queue.lock_duration_secs as f64;
    let renew_every = Duration::from_secs((ctx.settings.queue.lock_duration_secs / 2).max(1));

    info!(
        "[{}] Processing job {} ({}) attempt {}/{}",
        queue, job.id, job.name, job.attempts, job.max_attempts
    );

    let fut = AssertUnwindSafe((handler)(ctx.clone(), job.clone())).catch_unwind();
    tokio::pin!(fut);

    let mut renew =
        tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);

    let result = loop {
        tokio::select! {
            res = &mut fut => break res,
            _ = renew.tick() => {
                match store.extend_lease(job.id, lock_secs).await {
                    Ok(true) => {},
                    Ok(false) => warn!("[{}] Lost lease on job {}", queue, job.id),
                    Err(e) => warn!("[{}] Failed to extend lease on job {}: {:#}", queue, job.id, e),
                }
            },
        }
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(panic) => Err(JobError::Defect(panic_message(panic))),
    };

    match outcome {
        Ok(output) => {
            if let Err(e) = store.complete(job.id, &output).await {
                error!(
                    "[{}] Failed to record completion of job {}: {:#}",
                    queue, job.id, e
                );
                return;
            }
            ctx.metrics
                .jobs_completed
                .with_label_values(&[queue.as_str()])
                .inc();
            ctx.metrics
                .job_duration
                .with_label_values(&[queue.as_str()])
                .observe(started.elapsed().as_secs_f64());
            info!(
                "[{}] Job {} ({}) completed in {:?}",
                queue,
                job.id,
                job.name,
                started.elapsed()
            );
        },
        Err(err) => {
            let retry = err.retryable() && job.attempts < job.max_attempts;
            if retry {
                let run_at = Utc::now() + backoff_delay(ctx.settings.queue.backoff_base_ms, job.attempts);
                if let Err(e) = store.retry(job.id, run_at, &err.to_string(), err.kind()).await {
                    error!("[{}] Failed to requeue job {}: {:#}", queue, job.id, e);
                    return;
                }
                ctx.metrics
                    .jobs_retried
                    .with_label_values(&[queue.as_str()])
                    .inc();
                warn!(
                    "[{}] Job {} ({}) attempt {}/{} failed, retrying at {}: {:#}",
                    queue, job.id, job.name, job.attempts, job.max_attempts, run_at, err
                );
            } else {
                match store.fail(&job, &err.to_string(), err.kind()).await {
                    Ok(aborted) => {
                        ctx.metrics
                            .jobs_failed
                            .with_label_values(&[queue.as_str()])
                            .inc();
                        for (id, q) in &aborted {
                            ctx.metrics
                                .jobs_aborted
                                .with_label_values(&[q.as_str()])
                                .inc();
                            warn!("[{}] Aborted parent job {}", q, id);
                        }
                        error!(
                            "[{}] Job {} ({}) failed permanently after {} attempts: {:#}",
                            queue, job.id, job.name, job.attempts, err
                        );
                    },
                    Err(e) => {
                        error!(
                            "[{}] Failed to record failure of job {}: {:#}",
                            queue, job.id, e
                        );
                    },
                }
            }
        },
    }
}

async fn sweeper_loop(ctx: JobContext, store: JobStore, cancellation_token: CancellationToken) {
    let every = Duration::from_secs(ctx.settings.queue.stalled_interval_secs);
    let max_stalled = ctx.settings.queue.max_stalled_count;

    info!("Stall sweeper started ({:?} interval)", every);

    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                info!("Stall sweeper received cancellation signal");
                break;
            },
            _ = tokio::time::sleep(every) => {},
        }

        match store.sweep(max_stalled).await {
            Ok(outcome) => {
                for (id, queue) in &outcome.requeued {
                    ctx.metrics
                        .jobs_requeued
                        .with_label_values(&[queue.as_str()])
                        .inc();
                    warn!("[{}] Requeued job {} after expired lease", queue, id);
                }
                for (id, queue) in &outcome.stalled {
                    ctx.metrics
                        .jobs_stalled
                        .with_label_values(&[queue.as_str()])
                        .inc();
                    error!("[{}] Job {} stalled permanently", queue, id);
                }
                for (id, queue) in &outcome.aborted {
                    ctx.metrics
                        .jobs_aborted
                        .with_label_values(&[queue.as_str()])
                        .inc();
                    warn!("[{}] Aborted parent job {}", queue, id);
                }
            },
            Err(e) => error!("Stall sweep failed: {:#}", e),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_str() {
        let panic: Box<dyn std::any::Any + Send> = Box::new("week not found");
        assert_eq!(panic_message(panic), "week not found");
    }

    #[test]
    fn test_panic_message_string() {
        let panic: Box<dyn std::any::Any + Send> = Box::new(String::from("boom"));
        assert_eq!(panic_message(panic), "boom");
    }

    #[test]
    fn test_panic_message_opaque_payload() {
        let panic: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(panic), "handler panicked");
    }
}
