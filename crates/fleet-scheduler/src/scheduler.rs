//! Scheduler: dispatches `Waiting` jobs to their workers.
//!
//! The scheduler is the control loop that:
//! - resets jobs left `Running` by a previous process back to `Waiting`
//! - consumes the job watch and starts executions for `Waiting` jobs
//! - requeues jobs that change while their worker is busy
//! - periodically re-dispatches every stored job
//! - cancels executions of jobs that are deleted

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_registry::{ObjectRef, Phase, Registry, WatchAction, WatchEvent};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};
use crate::executor::Executor;
use crate::job::{Job, JobSpec};
use crate::worker::{StartDecision, Worker};

/// Runs jobs from one job registry.
pub struct Scheduler {
    registry: Arc<Registry<JobSpec>>,
    executor: Arc<dyn Executor>,
    config: SchedulerConfig,
    /// Job key → worker.
    workers: Mutex<HashMap<String, Arc<Worker>>>,
    /// Job key → cancellation of its current execution.
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry<JobSpec>>,
        executor: Arc<dyn Executor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            config,
            workers: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry<JobSpec>> {
        &self.registry
    }

    /// Number of job keys with a tracked worker.
    pub fn tracked(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Run until `cancel` fires, then cancel every execution.
    pub async fn run(&self, cancel: CancellationToken) -> SchedulerResult<()> {
        let recovered = self.recover()?;
        if recovered > 0 {
            info!(recovered, "interrupted jobs reset to waiting");
        }

        let mut watch = self.registry.list_watch()?;
        let (tx, mut rx) = mpsc::channel::<ObjectRef>(self.config.requeue_capacity);
        let mut resync = tokio::time::interval(self.config.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The list-watch backlog already covers the first pass.
        resync.tick().await;
        info!(log_dir = %self.config.log_dir.display(), "scheduler started");

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                event = watch.next() => match event {
                    Some(event) => self.dispatch(event, &tx, &cancel),
                    None => break Err(SchedulerError::WatchClosed),
                },
                _ = resync.tick() => { self.resync(&tx, &cancel); }
                Some(requeued) = rx.recv() => {
                    match self.registry.get(&requeued.namespace, &requeued.name) {
                        Ok(Some(job)) => self.dispatch_set(job, &tx, &cancel),
                        Ok(None) => debug!(job = %requeued, "requeued job is gone"),
                        Err(e) => warn!(job = %requeued, error = %e, "requeued job unreadable"),
                    }
                }
            }
        };

        for token in lock(&self.cancels).drain().map(|(_, token)| token) {
            token.cancel();
        }
        info!("scheduler stopped");
        result
    }

    /// Reset every `Running` job to `Waiting`. Returns how many were reset.
    pub fn recover(&self) -> SchedulerResult<usize> {
        let mut recovered = 0;
        for job in self.registry.list(None)? {
            if job.phase() != Phase::Running {
                continue;
            }
            let reset = self
                .registry
                .update_status_with(job.namespace(), job.name(), |current| {
                    if current.phase() != Phase::Running {
                        return false;
                    }
                    current.status.phase = Phase::Waiting;
                    true
                })?;
            if reset.is_some() {
                debug!(job = %job.key(), "job reset to waiting");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Re-dispatch every stored job. Returns how many were `Waiting`.
    fn resync(&self, requeue: &mpsc::Sender<ObjectRef>, cancel: &CancellationToken) -> usize {
        let jobs = match self.registry.list(None) {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "job resync failed");
                return 0;
            }
        };
        let mut waiting = 0;
        for job in jobs {
            if job.phase() == Phase::Waiting {
                waiting += 1;
            }
            self.dispatch_set(job, requeue, cancel);
        }
        debug!(waiting, "job resync complete");
        waiting
    }

    fn dispatch(
        &self,
        event: WatchEvent<JobSpec>,
        requeue: &mpsc::Sender<ObjectRef>,
        cancel: &CancellationToken,
    ) {
        match (event.action, event.object) {
            (WatchAction::Set, Some(job)) => self.dispatch_set(job, requeue, cancel),
            (WatchAction::Set, None) => {}
            (WatchAction::Delete, _) => {
                let key = ObjectRef::new(&event.namespace, &event.name).to_string();
                self.forget(&key);
            }
        }
    }

    fn dispatch_set(&self, job: Job, requeue: &mpsc::Sender<ObjectRef>, cancel: &CancellationToken) {
        let key = job.key();
        match job.phase() {
            Phase::Waiting => {}
            Phase::Deleting => {
                self.cancel_execution(&key);
                return;
            }
            _ => return,
        }

        let worker = Arc::clone(lock(&self.workers).entry(key.clone()).or_insert_with(|| {
            Arc::new(Worker::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.executor),
                self.config.clone(),
                job.namespace(),
                job.name(),
            ))
        }));

        match worker.try_start(&job.spec_hash()) {
            StartDecision::Started => {
                let token = cancel.child_token();
                lock(&self.cancels).insert(key.clone(), token.clone());
                debug!(job = %key, resource_version = job.metadata.resource_version, "starting job");
                tokio::spawn(async move { worker.execute(job, token).await });
            }
            StartDecision::Busy => self.requeue(job.object_ref(), requeue),
            StartDecision::AlreadyRan => debug!(job = %key, "spec already ran, ignoring"),
        }
    }

    /// Re-read a job after the requeue delay. Waits for channel capacity
    /// rather than dropping the job.
    fn requeue(&self, job: ObjectRef, requeue: &mpsc::Sender<ObjectRef>) {
        let tx = requeue.clone();
        let delay = self.config.requeue_delay;
        debug!(%job, ?delay, "worker busy, requeueing");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tx.send(job).await {
                debug!(job = %e.0, "scheduler stopped, requeue discarded");
            }
        });
    }

    fn cancel_execution(&self, key: &str) {
        if let Some(token) = lock(&self.cancels).remove(key) {
            info!(job = %key, "cancelling execution");
            token.cancel();
        }
    }

    fn forget(&self, key: &str) {
        self.cancel_execution(key);
        if lock(&self.workers).remove(key).is_some() {
            debug!(job = %key, "job deleted, worker dropped");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
