//! Scheduler behaviour end to end, against an in-memory store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fleet_operator::{Operator, OperatorConfig};
use fleet_registry::{Catalog, DeleteOptions, Object, Phase, Registry, RegistryConfig};
use fleet_scheduler::{
    CONDITION_SUCCEEDED, CommandExecutor, Executor, JOB_LOG_FINALIZER, Job, JobLog,
    JobReconciler, JobSpec, JobSpecV1Alpha1, Scheduler, SchedulerConfig, SchedulerResult,
    register_job_kinds,
};
use fleet_state::StateStore;

// ── Fixtures ───────────────────────────────────────────────────────

/// Fails the first `fail_first` attempts of each run, optionally slowly.
#[derive(Default)]
struct ScriptedExecutor {
    fail_first: u32,
    delay: Duration,
    calls: AtomicU32,
    active: AtomicU32,
    max_active: AtomicU32,
    cancelled: AtomicU32,
    ran_args: Mutex<Vec<Vec<String>>>,
}

impl ScriptedExecutor {
    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(
        &self,
        job: &Job,
        attempt: u32,
        _log: &JobLog,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.ran_args
            .lock()
            .unwrap()
            .push(job.spec.executor.args.clone());

        let outcome = tokio::select! {
            _ = tokio::time::sleep(self.delay) => {
                if attempt <= self.fail_first {
                    Err(anyhow::anyhow!("attempt {attempt} failed"))
                } else {
                    Ok(())
                }
            }
            _ = cancel.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("cancelled"))
            }
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

struct Harness {
    store: StateStore,
    catalog: Arc<Catalog>,
    jobs: Arc<Registry<JobSpec>>,
    logs: tempfile::TempDir,
    cancel: CancellationToken,
}

impl Harness {
    fn new(registry_config: RegistryConfig) -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let mut catalog = Catalog::new();
        register_job_kinds(&mut catalog);
        let catalog = Arc::new(catalog);
        let jobs = Arc::new(Registry::new(
            store.clone(),
            Arc::clone(&catalog),
            registry_config,
        ));
        Self {
            store,
            catalog,
            jobs,
            logs: tempfile::tempdir().unwrap(),
            cancel: CancellationToken::new(),
        }
    }

    fn config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_log_dir(self.logs.path())
            .with_requeue_delay(Duration::from_millis(50))
    }

    fn start(&self, executor: Arc<dyn Executor>) -> JoinHandle<SchedulerResult<()>> {
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&self.jobs), executor, self.config()));
        let cancel = self.cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    }

    fn job(&self, name: &str) -> Job {
        self.jobs.get("ops", name).unwrap().unwrap()
    }

    async fn wait_for_phase(&self, name: &str, phase: Phase) -> Job {
        for _ in 0..500 {
            if let Some(job) = self.jobs.get("ops", name).unwrap()
                && job.phase() == phase
            {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {name} never reached {phase}");
    }

    async fn stop(self, running: JoinHandle<SchedulerResult<()>>) {
        self.cancel.cancel();
        running.await.unwrap().unwrap();
    }
}

fn scripted(fail_first: u32, delay_ms: u64) -> Arc<ScriptedExecutor> {
    Arc::new(ScriptedExecutor {
        fail_first,
        delay: Duration::from_millis(delay_ms),
        ..ScriptedExecutor::default()
    })
}

fn spec(args: &[&str], threshold: u32) -> JobSpec {
    JobSpec::command("backup", args).with_failure_threshold(threshold)
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn job_moves_waiting_running_completed() {
    let h = Harness::new(RegistryConfig::default());
    h.jobs.create(Job::new("ops", "nightly", spec(&[], 3))).unwrap();
    let mut watch = h.jobs.get_watch("ops", "nightly").unwrap();

    let executor = scripted(2, 10);
    let running = h.start(executor.clone());

    let mut phases: Vec<Phase> = Vec::new();
    while phases.last() != Some(&Phase::Completed) {
        let event = tokio::time::timeout(Duration::from_secs(5), watch.next())
            .await
            .unwrap()
            .unwrap();
        let phase = event.object.unwrap().phase();
        if phases.last() != Some(&phase) {
            phases.push(phase);
        }
    }

    assert_eq!(phases, vec![Phase::Waiting, Phase::Running, Phase::Completed]);
    assert_eq!(executor.calls(), 3);
    assert!(h.job("nightly").status.is_condition_true(CONDITION_SUCCEEDED));
    h.stop(running).await;
}

#[tokio::test]
async fn exhausted_attempts_fail_the_job() {
    let h = Harness::new(RegistryConfig::default());
    h.jobs.create(Job::new("ops", "flaky", spec(&[], 2))).unwrap();

    let executor = scripted(5, 1);
    let running = h.start(executor.clone());

    let job = h.wait_for_phase("flaky", Phase::Failed).await;
    assert_eq!(executor.calls(), 2);
    let failed = job.status.condition("Failed").unwrap();
    assert!(failed.message.contains("attempt 2 failed"));
    h.stop(running).await;
}

#[tokio::test]
async fn spec_changes_never_overlap_runs() {
    let h = Harness::new(RegistryConfig::default());
    h.jobs.create(Job::new("ops", "sync", spec(&["v1"], 1))).unwrap();

    let executor = scripted(0, 200);
    let running = h.start(executor.clone());
    h.wait_for_phase("sync", Phase::Running).await;

    for args in [["v2"], ["v3"]] {
        h.jobs
            .update(Job::new("ops", "sync", spec(&args, 1)), Default::default())
            .unwrap();
    }

    let done = h.wait_for_phase("sync", Phase::Completed).await;
    assert_eq!(done.spec.executor.args, vec!["v3"]);
    assert_eq!(executor.max_active.load(Ordering::SeqCst), 1);
    let ran = executor.ran_args.lock().unwrap().clone();
    assert_eq!(ran.first(), Some(&vec!["v1".to_string()]));
    assert_eq!(ran.last(), Some(&vec!["v3".to_string()]));
    h.stop(running).await;
}

#[tokio::test]
async fn spec_reverted_mid_run_still_completes() {
    let h = Harness::new(RegistryConfig::default());
    h.jobs.create(Job::new("ops", "flip", spec(&["a"], 1))).unwrap();

    let executor = scripted(0, 300);
    let running = h.start(executor.clone());
    h.wait_for_phase("flip", Phase::Running).await;

    for args in [["b"], ["a"]] {
        h.jobs
            .update(Job::new("ops", "flip", spec(&args, 1)), Default::default())
            .unwrap();
    }

    let done = h.wait_for_phase("flip", Phase::Completed).await;
    assert_eq!(done.spec.executor.args, vec!["a"]);
    assert!(done.status.is_condition_true(CONDITION_SUCCEEDED));
    assert_eq!(executor.max_active.load(Ordering::SeqCst), 1);
    h.stop(running).await;
}

#[tokio::test]
async fn unchanged_completed_job_is_not_rerun() {
    let h = Harness::new(RegistryConfig::default());
    h.jobs.create(Job::new("ops", "once", spec(&[], 1))).unwrap();

    let executor = scripted(0, 1);
    let running = h.start(executor.clone());
    h.wait_for_phase("once", Phase::Completed).await;

    // A note edit does not change the spec hash.
    let mut noted = spec(&[], 1);
    noted.note = "checked by ops".to_string();
    h.jobs.update(Job::new("ops", "once", noted), Default::default()).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(executor.calls(), 1);
    assert_eq!(h.job("once").phase(), Phase::Completed);
    h.stop(running).await;
}

#[tokio::test]
async fn delete_cancels_running_execution() {
    let h = Harness::new(RegistryConfig::default());
    h.jobs.create(Job::new("ops", "long", spec(&[], 1))).unwrap();

    let executor = scripted(0, 60_000);
    let running = h.start(executor.clone());
    h.wait_for_phase("long", Phase::Running).await;

    h.jobs.delete("ops", "long", DeleteOptions::new()).await.unwrap();

    for _ in 0..200 {
        if executor.cancelled.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(executor.cancelled.load(Ordering::SeqCst), 1);
    assert!(h.jobs.get("ops", "long").unwrap().is_none());
    h.stop(running).await;
}

#[tokio::test]
async fn interrupted_jobs_are_recovered() {
    let h = Harness::new(RegistryConfig::default());
    h.jobs.create(Job::new("ops", "orphan", spec(&[], 1))).unwrap();
    // Left over from a crashed process.
    h.jobs
        .update_status_phase("ops", "orphan", Phase::Running)
        .unwrap();

    let executor = scripted(0, 1);
    let running = h.start(executor.clone());

    h.wait_for_phase("orphan", Phase::Completed).await;
    assert_eq!(executor.calls(), 1);
    h.stop(running).await;
}

#[tokio::test]
async fn migrated_legacy_job_runs_as_command() {
    let h = Harness::new(RegistryConfig::default());
    let legacy: Registry<JobSpecV1Alpha1> = Registry::new(
        h.store.clone(),
        Arc::clone(&h.catalog),
        RegistryConfig::default(),
    );
    legacy
        .create(Object::new(
            "ops",
            "hello",
            JobSpecV1Alpha1 {
                command: "echo hello from legacy".to_string(),
                timeout: "30s".to_string(),
                retries: 0,
            },
        ))
        .unwrap();

    assert_eq!(h.jobs.migrate_objects().unwrap(), 1);
    let migrated = h.job("hello");
    assert_eq!(migrated.api_version, "batch.fleet.io/v1");
    assert_eq!(migrated.spec.executor.program, "echo");
    assert_eq!(migrated.spec.timeout_seconds, 30);

    let running = h.start(Arc::new(CommandExecutor));
    h.wait_for_phase("hello", Phase::Completed).await;

    let log = std::fs::read_to_string(JobLog::path_for(h.logs.path(), "ops", "hello")).unwrap();
    assert!(log.contains("[stdout] hello from legacy"));
    h.stop(running).await;
}

#[tokio::test]
async fn job_log_is_removed_by_finalizer() {
    let h = Harness::new(RegistryConfig::default().with_finalizers([JOB_LOG_FINALIZER]));
    h.jobs
        .create(Job::new("ops", "report", JobSpec::command("echo", &["done"])))
        .unwrap();

    let running = h.start(Arc::new(CommandExecutor));
    let operator = Operator::new(
        Arc::clone(&h.jobs),
        JobReconciler::new(h.logs.path()),
        OperatorConfig::default().with_lease_ttl(Duration::from_millis(300)),
    );
    let operating = tokio::spawn({
        let cancel = h.cancel.clone();
        async move { operator.run(cancel).await }
    });

    h.wait_for_phase("report", Phase::Completed).await;
    let log_path = JobLog::path_for(h.logs.path(), "ops", "report");
    assert!(log_path.exists());

    tokio::time::timeout(
        Duration::from_secs(5),
        h.jobs.delete("ops", "report", DeleteOptions::new().sync()),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(!log_path.exists());

    h.cancel.cancel();
    operating.await.unwrap().unwrap();
    running.await.unwrap().unwrap();
}
