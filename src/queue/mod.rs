//! Durable job orchestration engine.
//!
//! Jobs live in PostgreSQL; workers claim them under an exclusive lease
//! with `FOR UPDATE SKIP LOCKED`, so coordination happens entirely through
//! the database. Parent/child graphs give ordering between dependent
//! stages, and a central sweeper requeues jobs whose lease expired.

mod dag;
mod job;
mod registry;
mod store;
mod worker;

pub use dag::DagNode;
pub use job::{
    backoff_delay, EnqueueError, EnqueueOpts, Job, JobError, JobHandle, JobSchedule, JobState,
};
pub use registry::{typed_validator, Queue, QueueRegistry, ValidatedPayload};
pub use store::{JobStore, SweepOutcome};
pub use worker::{JobContext, JobHandler, WorkerPool};
