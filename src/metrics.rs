use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Prometheus metrics for the pipeline, exposed on `GET /metrics`.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Queue metrics, labelled by queue name
    pub jobs_enqueued: IntCounterVec,
    pub jobs_completed: IntCounterVec,
    pub jobs_failed: IntCounterVec,
    pub jobs_retried: IntCounterVec,
    pub jobs_requeued: IntCounterVec,
    pub jobs_stalled: IntCounterVec,
    pub jobs_aborted: IntCounterVec,
    pub jobs_in_state: IntGaugeVec,
    pub job_duration: HistogramVec,

    // Pipeline metrics
    pub snapshots_taken: IntCounter,
    pub leaderboards_rebuilt: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let jobs_enqueued = IntCounterVec::new(
            Opts::new("tally_jobs_enqueued_total", "Total jobs enqueued"),
            &["queue"],
        )
        .unwrap();
        let jobs_completed = IntCounterVec::new(
            Opts::new("tally_jobs_completed_total", "Total jobs completed"),
            &["queue"],
        )
        .unwrap();
        let jobs_failed = IntCounterVec::new(
            Opts::new("tally_jobs_failed_total", "Total jobs failed permanently"),
            &["queue"],
        )
        .unwrap();
        let jobs_retried = IntCounterVec::new(
            Opts::new("tally_jobs_retried_total", "Total job retries scheduled"),
            &["queue"],
        )
        .unwrap();
        let jobs_requeued = IntCounterVec::new(
            Opts::new(
                "tally_jobs_requeued_total",
                "Total expired leases requeued for another attempt",
            ),
            &["queue"],
        )
        .unwrap();
        let jobs_stalled = IntCounterVec::new(
            Opts::new("tally_jobs_stalled_total", "Total jobs stalled permanently"),
            &["queue"],
        )
        .unwrap();
        let jobs_aborted = IntCounterVec::new(
            Opts::new(
                "tally_jobs_aborted_total",
                "Total jobs aborted by a failed child",
            ),
            &["queue"],
        )
        .unwrap();
        let jobs_in_state = IntGaugeVec::new(
            Opts::new("tally_jobs", "Jobs currently in each state"),
            &["queue", "state"],
        )
        .unwrap();
        let job_duration = HistogramVec::new(
            HistogramOpts::new("tally_job_duration_seconds", "Job processing duration")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
            &["queue"],
        )
        .unwrap();

        let snapshots_taken = IntCounter::new(
            "tally_balance_snapshots_total",
            "Total account balance snapshots stored",
        )
        .unwrap();
        let leaderboards_rebuilt = IntCounter::new(
            "tally_leaderboards_rebuilt_total",
            "Total leaderboard cache rebuilds",
        )
        .unwrap();

        registry.register(Box::new(jobs_enqueued.clone())).unwrap();
        registry.register(Box::new(jobs_completed.clone())).unwrap();
        registry.register(Box::new(jobs_failed.clone())).unwrap();
        registry.register(Box::new(jobs_retried.clone())).unwrap();
        registry.register(Box::new(jobs_requeued.clone())).unwrap();
        registry.register(Box::new(jobs_stalled.clone())).unwrap();
        registry.register(Box::new(jobs_aborted.clone())).unwrap();
        registry.register(Box::new(jobs_in_state.clone())).unwrap();
        registry.register(Box::new(job_duration.clone())).unwrap();
        registry
            .register(Box::new(snapshots_taken.clone()))
            .unwrap();
        registry
            .register(Box::new(leaderboards_rebuilt.clone()))
            .unwrap();

        Self {
            registry,
            jobs_enqueued,
            jobs_completed,
            jobs_failed,
            jobs_retried,
            jobs_requeued,
            jobs_stalled,
            jobs_aborted,
            jobs_in_state,
            job_duration,
            snapshots_taken,
            leaderboards_rebuilt,
        }
    }

    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_gather() {
        let m = Metrics::new();
        m.jobs_enqueued.with_label_values(&["snapshot"]).inc();
        m.jobs_completed.with_label_values(&["snapshot"]).inc();
        m.snapshots_taken.inc_by(3);

        let text = m.gather();
        assert!(text.contains("tally_jobs_enqueued_total"));
        assert!(text.contains("tally_jobs_completed_total"));
        assert!(text.contains("tally_balance_snapshots_total 3"));
    }

    #[test]
    fn test_queue_label_separates_series() {
        let m = Metrics::new();
        m.jobs_failed.with_label_values(&["snapshot"]).inc();
        m.jobs_failed
            .with_label_values(&["calculate-activity-points"])
            .inc_by(2);

        assert_eq!(m.jobs_failed.with_label_values(&["snapshot"]).get(), 1);
        assert_eq!(
            m.jobs_failed
                .with_label_values(&["calculate-activity-points"])
                .get(),
            2
        );
    }

    #[test]
    fn test_requeue_and_stall_are_separate_series() {
        let m = Metrics::new();
        m.jobs_requeued.with_label_values(&["snapshot"]).inc_by(3);
        m.jobs_stalled.with_label_values(&["snapshot"]).inc();

        assert_eq!(m.jobs_requeued.with_label_values(&["snapshot"]).get(), 3);
        assert_eq!(m.jobs_stalled.with_label_values(&["snapshot"]).get(), 1);

        let text = m.gather();
        assert!(text.contains("tally_jobs_requeued_total"));
        assert!(text.contains("tally_jobs_stalled_total"));
    }

    #[test]
    fn test_state_gauges() {
        let m = Metrics::new();
        m.jobs_in_state
            .with_label_values(&["snapshot", "waiting"])
            .set(4);
        m.jobs_in_state
            .with_label_values(&["snapshot", "active"])
            .set(1);

        let text = m.gather();
        assert!(text.contains("tally_jobs"));
        assert!(text.contains("state=\"waiting\""));
    }
}
