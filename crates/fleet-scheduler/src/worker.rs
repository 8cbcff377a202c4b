//! Worker: runs one job key, one execution at a time.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_registry::{Phase, Registry};

use crate::config::SchedulerConfig;
use crate::executor::Executor;
use crate::job::{CONDITION_FAILED, CONDITION_SUCCEEDED, Job, JobSpec};
use crate::log::JobLog;

/// Result of [`Worker::try_start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// The worker is now marked running; the caller must call `execute`.
    Started,
    /// An execution is in flight.
    Busy,
    /// The result for this exact spec is already recorded.
    AlreadyRan,
}

#[derive(Default)]
struct WorkerState {
    running: bool,
    last_hash: Option<String>,
}

/// How a run ended.
enum Outcome {
    Succeeded { attempt: u32 },
    Failed { attempts: u32, error: String },
    TimedOut(Duration),
    Cancelled,
}

/// Executes one job key.
pub struct Worker {
    registry: Arc<Registry<JobSpec>>,
    executor: Arc<dyn Executor>,
    config: SchedulerConfig,
    namespace: String,
    name: String,
    state: Mutex<WorkerState>,
}

impl Worker {
    pub fn new(
        registry: Arc<Registry<JobSpec>>,
        executor: Arc<dyn Executor>,
        config: SchedulerConfig,
        namespace: &str,
        name: &str,
    ) -> Self {
        Self {
            registry,
            executor,
            config,
            namespace: namespace.to_string(),
            name: name.to_string(),
            state: Mutex::new(WorkerState::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Hash of the spec whose result was most recently recorded.
    pub fn last_hash(&self) -> Option<String> {
        self.lock().last_hash.clone()
    }

    /// Claim the worker for a run of the spec with `hash`.
    pub fn try_start(&self, hash: &str) -> StartDecision {
        let mut state = self.lock();
        if state.running {
            return StartDecision::Busy;
        }
        if state.last_hash.as_deref() == Some(hash) {
            return StartDecision::AlreadyRan;
        }
        state.running = true;
        StartDecision::Started
    }

    /// Run `job` to completion, recording the outcome in its status.
    ///
    /// Must follow a [`StartDecision::Started`]. Nothing is written when the
    /// run is cancelled, and the final status is only written while the
    /// stored spec still matches the one that ran. A spec counts as ran only
    /// once its result is recorded, so a run that never got going is retried
    /// on the next dispatch.
    pub async fn execute(&self, job: Job, cancel: CancellationToken) {
        let _running = RunningGuard(self);
        let key = job.key();
        let hash = job.spec_hash();

        let started = self
            .registry
            .update_status_with(&self.namespace, &self.name, |current| {
                if current.spec_hash() != hash || current.phase() != Phase::Waiting {
                    return false;
                }
                current.status.phase = Phase::Running;
                true
            });
        match started {
            Ok(Some(_)) => info!(job = %key, "job running"),
            Ok(None) => {
                debug!(job = %key, "job changed before start, skipping");
                return;
            }
            Err(e) => {
                warn!(job = %key, error = %e, "failed to mark job running");
                return;
            }
        }

        let log = match JobLog::open(&self.config.log_dir, &self.namespace, &self.name).await {
            Ok(log) => log,
            Err(e) => {
                warn!(job = %key, error = %e, "job log unavailable, output discarded");
                JobLog::discard()
            }
        };

        let attempts = self.attempts(&job, &log, &cancel);
        let outcome = match job.spec.deadline() {
            Some(limit) => tokio::time::timeout(limit, attempts)
                .await
                .unwrap_or(Outcome::TimedOut(limit)),
            None => attempts.await,
        };
        if cancel.is_cancelled() || matches!(outcome, Outcome::Cancelled) {
            info!(job = %key, "job cancelled");
            return;
        }
        self.record(&key, &hash, &outcome);
    }

    async fn attempts(&self, job: &Job, log: &JobLog, cancel: &CancellationToken) -> Outcome {
        let key = job.key();
        let attempts = job.spec.attempts();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            match self.executor.execute(job, attempt, log, cancel).await {
                Ok(()) => return Outcome::Succeeded { attempt },
                Err(_) if cancel.is_cancelled() => return Outcome::Cancelled,
                Err(e) => {
                    last_error = format!("{e:#}");
                    warn!(job = %key, attempt, attempts, error = %last_error, "attempt failed");
                }
            }
        }
        Outcome::Failed {
            attempts,
            error: last_error,
        }
    }

    fn record(&self, key: &str, hash: &str, outcome: &Outcome) {
        let written = self
            .registry
            .update_status_with(&self.namespace, &self.name, |current| {
                // Waiting with the same hash: the spec was changed and reverted mid-run.
                if current.spec_hash() != hash
                    || !matches!(current.phase(), Phase::Running | Phase::Waiting)
                {
                    return false;
                }
                let status = &mut current.status;
                match outcome {
                    Outcome::Succeeded { attempt } => {
                        status.set_condition(
                            CONDITION_SUCCEEDED,
                            true,
                            "Completed",
                            &format!("succeeded on attempt {attempt}"),
                        );
                        status.set_condition(CONDITION_FAILED, false, "", "");
                        status.phase = Phase::Completed;
                    }
                    Outcome::Failed { attempts, error } => {
                        status.set_condition(
                            CONDITION_FAILED,
                            true,
                            "AttemptsExhausted",
                            &format!("failed after {attempts} attempt(s): {error}"),
                        );
                        status.set_condition(CONDITION_SUCCEEDED, false, "", "");
                        status.phase = Phase::Failed;
                    }
                    Outcome::TimedOut(limit) => {
                        status.set_condition(
                            CONDITION_FAILED,
                            true,
                            "DeadlineExceeded",
                            &format!("timed out after {}s", limit.as_secs()),
                        );
                        status.set_condition(CONDITION_SUCCEEDED, false, "", "");
                        status.phase = Phase::Failed;
                    }
                    Outcome::Cancelled => return false,
                }
                true
            });
        match written {
            Ok(Some(job)) => {
                self.lock().last_hash = Some(hash.to_string());
                info!(job = %key, phase = %job.phase(), "job finished");
            }
            Ok(None) => debug!(job = %key, "job changed while running, result dropped"),
            Err(e) => warn!(job = %key, error = %e, "failed to record job result"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the running flag when an execution ends, however it ends.
struct RunningGuard<'a>(&'a Worker);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().running = false;
    }
}
