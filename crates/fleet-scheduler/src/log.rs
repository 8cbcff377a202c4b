//! Per-job output log.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Append-only log of one job's output, shared by all of a run's attempts.
///
/// Write failures are logged once per line and otherwise ignored so a full
/// disk never fails a job.
pub struct JobLog {
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
}

impl JobLog {
    /// `<log_dir>/<namespace>_<name>.log`.
    pub fn path_for(log_dir: &Path, namespace: &str, name: &str) -> PathBuf {
        log_dir.join(format!("{namespace}_{name}.log"))
    }

    /// Open (creating if needed) the log file of a job.
    pub async fn open(log_dir: &Path, namespace: &str, name: &str) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(log_dir).await?;
        let path = Self::path_for(log_dir, namespace, name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path: Some(path),
            file: Some(Mutex::new(file)),
        })
    }

    /// A log that drops everything.
    pub fn discard() -> Self {
        Self {
            path: None,
            file: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one line.
    pub async fn write_line(&self, line: &str) {
        let Some(file) = &self.file else {
            return;
        };
        let mut file = file.lock().await;
        let result = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(path = ?self.path, error = %e, "job log write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_are_appended_across_opens() {
        let dir = tempfile::tempdir().unwrap();

        let log = JobLog::open(dir.path(), "ops", "backup").await.unwrap();
        log.write_line("first").await;
        drop(log);
        let log = JobLog::open(dir.path(), "ops", "backup").await.unwrap();
        log.write_line("second").await;

        let path = JobLog::path_for(dir.path(), "ops", "backup");
        assert_eq!(log.path(), Some(path.as_path()));
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn discard_accepts_writes() {
        let log = JobLog::discard();
        log.write_line("nowhere").await;
        assert!(log.path().is_none());
    }
}
