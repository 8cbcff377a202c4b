//! Scheduler settings.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Directory holding one `<namespace>_<name>.log` file per job.
    pub log_dir: PathBuf,
    /// Delay before a job that arrived while its worker was busy is re-read.
    pub requeue_delay: Duration,
    /// Capacity of the requeue channel.
    pub requeue_capacity: usize,
    /// How often every stored job is re-dispatched, catching events a
    /// lagging watch skipped.
    pub resync_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./data/logs"),
            requeue_delay: Duration::from_millis(500),
            requeue_capacity: 256,
            resync_period: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    pub fn with_requeue_capacity(mut self, capacity: usize) -> Self {
        self.requeue_capacity = capacity.max(1);
        self
    }

    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period.max(Duration::from_millis(1));
        self
    }
}
