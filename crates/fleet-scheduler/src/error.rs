//! Scheduler error types.

use fleet_registry::RegistryError;
use thiserror::Error;

/// Errors that stop the scheduler itself.
///
/// Job failures are never reported here; they end up in job status.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("job watch closed")]
    WatchClosed,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
