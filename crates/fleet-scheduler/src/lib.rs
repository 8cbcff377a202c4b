//! fleet-scheduler: asynchronous execution of `Job` resources.
//!
//! The [`Scheduler`] watches the job registry and hands every `Waiting` job
//! to its per-key [`Worker`]. A worker runs the job through an [`Executor`]
//! with retries up to the job's failure threshold, bounded by its timeout,
//! and records the outcome as job status and conditions.
//!
//! At most one execution per job key runs at a time; changes that arrive
//! while a job is running are requeued and re-read after a short delay.

pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod log;
pub mod reconciler;
pub mod scheduler;
pub mod worker;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use executor::{CommandExecutor, Executor};
pub use job::{
    CONDITION_FAILED, CONDITION_SUCCEEDED, ExecutionDescriptor, JOB_GROUP, JOB_KIND, Job, JobSpec,
    JobSpecV1Alpha1, parse_duration, register_job_kinds,
};
pub use log::JobLog;
pub use reconciler::{JOB_LOG_FINALIZER, JobReconciler};
pub use scheduler::Scheduler;
pub use worker::Worker;
