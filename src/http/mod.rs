//! Control-plane HTTP surface.
//!
//! Minimal JSON API: liveness, Prometheus metrics and one enqueue
//! endpoint per pipeline queue. Enqueue bodies are validated against the
//! queue's payload schema before a job row is created; invalid payloads
//! are rejected with a 400 and nothing is enqueued.

mod error;
mod routes;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use log::info;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::db::Database;
use crate::metrics::Metrics;
use crate::queue::QueueRegistry;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub queues: Arc<QueueRegistry>,
    pub metrics: Metrics,
}

pub fn router(state: AppState) -> Router {
    routes::router().with_state(Arc::new(state))
}

/// Serve the control plane until the token is cancelled.
pub async fn serve(
    settings: Arc<Settings>,
    state: AppState,
    cancellation_token: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", settings.http.host, settings.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind control plane to {}", addr))?;

    info!("Control plane listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancellation_token.cancelled_owned())
        .await
        .context("Control plane server failed")?;

    info!("Control plane stopped");
    Ok(())
}
