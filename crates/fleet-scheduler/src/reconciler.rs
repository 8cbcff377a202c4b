//! Job reconciler: cleans up a job's log file before the job is removed.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use fleet_operator::{Reconciler, Requeue};
use fleet_registry::Object;

use crate::job::JobSpec;
use crate::log::JobLog;

/// Finalizer owning a job's log file.
pub const JOB_LOG_FINALIZER: &str = "fleet.io/job-log";

pub struct JobReconciler {
    log_dir: PathBuf,
}

impl JobReconciler {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }
}

#[async_trait]
impl Reconciler<JobSpec> for JobReconciler {
    async fn handle(&self, obj: &Object<JobSpec>, _requeue: &Requeue<JobSpec>) -> anyhow::Result<()> {
        debug!(job = %obj.key(), phase = %obj.phase(), "job observed");
        Ok(())
    }

    async fn finalize(&self, obj: &Object<JobSpec>, finalizer: &str) -> anyhow::Result<()> {
        if finalizer != JOB_LOG_FINALIZER {
            return Ok(());
        }
        let path = JobLog::path_for(&self.log_dir, obj.namespace(), obj.name());
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!(job = %obj.key(), path = %path.display(), "job log removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
