//! Executors run one attempt of a job.

use std::process::Stdio;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::job::Job;
use crate::log::JobLog;

/// Runs a single attempt of a job.
///
/// Returning `Err` counts as a failed attempt. Implementations should stop
/// promptly once `cancel` fires.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(
        &self,
        job: &Job,
        attempt: u32,
        log: &JobLog,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Runs the job's [`ExecutionDescriptor`](crate::ExecutionDescriptor) as a
/// child process.
///
/// Output lines go to the job log and to `tracing` at debug level. A
/// non-zero exit is a failure; cancellation kills the child.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(
        &self,
        job: &Job,
        attempt: u32,
        log: &JobLog,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let descriptor = &job.spec.executor;
        if descriptor.program.is_empty() {
            bail!("job has no program");
        }

        let mut command = Command::new(&descriptor.program);
        command
            .args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &descriptor.working_dir {
            command.current_dir(dir);
        }

        let key = job.key();
        log.write_line(&format!("=== attempt {attempt}: {}", descriptor.program))
            .await;
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to start {}", descriptor.program))?;
        debug!(job = %key, attempt, pid = ?child.id(), "process started");

        let stdout = pump(child.stdout.take(), "stdout", log, &key);
        let stderr = pump(child.stderr.take(), "stderr", log, &key);
        let finished = async {
            let (status, (), ()) = tokio::join!(child.wait(), stdout, stderr);
            status
        };

        // Returning drops the child, which kills it.
        let status = tokio::select! {
            status = finished => status.context("failed to wait for process")?,
            _ = cancel.cancelled() => bail!("cancelled"),
        };
        log.write_line(&format!("=== exit: {status}")).await;
        if !status.success() {
            bail!("{} exited with {status}", descriptor.program);
        }
        Ok(())
    }
}

async fn pump<R>(reader: Option<R>, stream: &'static str, log: &JobLog, job: &str)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(%job, stream, "{line}");
        log.write_line(&format!("[{stream}] {line}")).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use std::time::Duration;

    fn job(program: &str, args: &[&str]) -> Job {
        Job::new("ops", "probe", JobSpec::command(program, args))
    }

    #[tokio::test]
    async fn successful_command_logs_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::open(dir.path(), "ops", "probe").await.unwrap();

        CommandExecutor
            .execute(&job("sh", &["-c", "echo hello; echo oops >&2"]), 1, &log, &CancellationToken::new())
            .await
            .unwrap();

        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        assert!(content.contains("[stdout] hello"));
        assert!(content.contains("[stderr] oops"));
        assert!(content.contains("=== attempt 1"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let err = CommandExecutor
            .execute(&job("sh", &["-c", "exit 3"]), 1, &JobLog::discard(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = CommandExecutor
            .execute(&job("/nonexistent/fleet-probe", &[]), 1, &JobLog::discard(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = CommandExecutor
            .execute(&job("sleep", &["30"]), 1, &JobLog::discard(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cancelled");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn env_and_working_dir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::open(dir.path(), "ops", "env").await.unwrap();
        let mut job = job("sh", &["-c", "echo $GREETING; pwd"]);
        job.spec.executor.env.insert("GREETING".into(), "hi-there".into());
        job.spec.executor.working_dir = Some(dir.path().display().to_string());

        CommandExecutor
            .execute(&job, 1, &log, &CancellationToken::new())
            .await
            .unwrap();

        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        assert!(content.contains("[stdout] hi-there"));
    }
}
