use std::sync::Arc;

use anyhow::Context;
use jemallocator::Jemalloc;
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use tally::gateway::{BalanceSource, DummyBalanceSource, GatewayClient};
use tally::http::{self, AppState};
use tally::jobs;
use tally::queue::{JobContext, JobStore, QueueRegistry, WorkerPool};
use tally::{CronScheduler, Database, Metrics, Settings};

#[tokio::main()]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap();

    // Load configuration
    let settings = Arc::new(
        Settings::new()
            .context("Failed to load config.yaml. Please ensure it exists and is valid")?,
    );

    let cancellation_token = CancellationToken::new();

    let db = Database::new(settings.clone())
        .await
        .context("Failed to initialize database connection")?;

    let metrics = Metrics::new();
    let store = JobStore::new(db.postgres.clone());

    let mut registry = QueueRegistry::new(store.clone(), metrics.clone());
    jobs::register_queues(&mut registry, &settings.queue);
    let queues = Arc::new(registry);

    // An empty gateway url switches the snapshot producer to the
    // deterministic dummy source; useful for local runs.
    let balances: Arc<dyn BalanceSource> = if settings.gateway.url.is_empty() {
        info!("No gateway url configured, using the dummy balance source");
        Arc::new(DummyBalanceSource)
    } else {
        Arc::new(
            GatewayClient::new(&settings.gateway).context("Failed to build gateway client")?,
        )
    };

    run_pipeline(
        settings,
        db,
        metrics,
        store,
        queues,
        balances,
        cancellation_token,
    )
    .await
}

async fn run_pipeline(
    settings: Arc<Settings>,
    db: Database,
    metrics: Metrics,
    store: JobStore,
    queues: Arc<QueueRegistry>,
    balances: Arc<dyn BalanceSource>,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    let ctx = JobContext {
        db: db.clone(),
        balances,
        settings: settings.clone(),
        queues: queues.clone(),
        metrics: metrics.clone(),
    };

    // Spawn the claim-and-process workers and the stall sweeper
    let mut pool = WorkerPool::new(ctx, store);
    jobs::register_handlers(&mut pool);
    let worker_handles = pool.spawn(&cancellation_token);

    info!("Worker pool started for {} queues", queues.queue_names().len());

    // Cron scheduler for the recurring triggers and durable schedules
    let cron_scheduler = CronScheduler::new(db.clone(), queues.clone(), settings.clone());

    let cron_token = cancellation_token.child_token();
    let cron_handle = tokio::spawn(async move {
        if let Err(e) = cron_scheduler.run(cron_token).await {
            error!("Cron scheduler failed: {:#}", e);
        }
    });

    info!("Cron scheduler started - recurring triggers will run on their patterns");

    // Control-plane HTTP API
    let state = AppState {
        db,
        queues,
        metrics,
    };
    let http_token = cancellation_token.child_token();
    let http_settings = settings.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http::serve(http_settings, state, http_token).await {
            error!("Control plane failed: {:#}", e);
        }
    });

    #[cfg(unix)]
    let mut sigterm_stream = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?
    };

    // Set up graceful shutdown signal handler
    info!("Pipeline running. Press Ctrl+C to stop.");

    #[cfg(unix)]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
            _ = sigterm_stream.recv() => {
                info!("Received SIGTERM, exiting gracefully...");
            },
        };
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C), exiting gracefully...");
            },
        };
    }

    // Cancel all running tasks
    info!("Finishing all tasks...");

    cancellation_token.cancel();

    // In-flight jobs finish their current attempt before the workers exit
    info!("Waiting for workers to drain...");
    for handle in worker_handles {
        let _ = handle.await;
    }

    info!("Waiting for cron scheduler to stop...");
    let _ = cron_handle.await;

    info!("Waiting for control plane to stop...");
    let _ = http_handle.await;

    info!("All tasks stopped");
    Ok(())
}
