//! fleet.toml configuration parser.
//!
//! Every field is optional; a missing file means all defaults.
//!
//! ```toml
//! [store]
//! data_dir = "/var/lib/fleet"
//! prefix = "/fleet"
//!
//! [operator]
//! reconcile_period_secs = 30
//! max_concurrent_handlers = 16
//! lease_ttl_secs = 15
//!
//! [scheduler]
//! log_dir = "/var/log/fleet/jobs"
//! requeue_delay_ms = 500
//! requeue_capacity = 256
//! resync_period_secs = 30
//!
//! [log]
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use fleet_operator::OperatorConfig;
use fleet_registry::RegistryConfig;
use fleet_scheduler::{JOB_LOG_FINALIZER, SchedulerConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub store: StoreConfig,
    pub operator: OperatorSection,
    pub scheduler: SchedulerSection,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Root of every key written by the registries.
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            prefix: "/fleet".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorSection {
    pub reconcile_period_secs: u64,
    pub max_concurrent_handlers: usize,
    pub requeue_capacity: usize,
    pub lease_ttl_secs: u64,
    /// Lease holder identity; random per process when unset.
    pub holder: Option<String>,
}

impl Default for OperatorSection {
    fn default() -> Self {
        Self {
            reconcile_period_secs: 30,
            max_concurrent_handlers: 16,
            requeue_capacity: 256,
            lease_ttl_secs: 15,
            holder: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Defaults to `<data_dir>/logs`.
    pub log_dir: Option<PathBuf>,
    pub requeue_delay_ms: u64,
    pub requeue_capacity: usize,
    pub resync_period_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            log_dir: None,
            requeue_delay_ms: 500,
            requeue_capacity: 256,
            resync_period_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub filter: Option<String>,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: FleetConfig =
            toml::from_str(&content).with_context(|| format!("invalid {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.store.data_dir.join("fleet.redb")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.scheduler
            .log_dir
            .clone()
            .unwrap_or_else(|| self.store.data_dir.join("logs"))
    }

    /// Registry settings for the job kind.
    pub fn job_registry(&self) -> RegistryConfig {
        RegistryConfig::default()
            .with_prefix(&self.store.prefix)
            .with_finalizers([JOB_LOG_FINALIZER])
    }

    pub fn operator(&self) -> OperatorConfig {
        let section = &self.operator;
        let mut config = OperatorConfig::default()
            .with_reconcile_period(Duration::from_secs(section.reconcile_period_secs.max(1)))
            .with_max_concurrent_handlers(section.max_concurrent_handlers)
            .with_requeue_capacity(section.requeue_capacity)
            .with_lease_ttl(Duration::from_secs(section.lease_ttl_secs.max(1)));
        if let Some(holder) = &section.holder {
            config = config.with_holder(holder.clone());
        }
        config
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_log_dir(self.log_dir())
            .with_requeue_delay(Duration::from_millis(self.scheduler.requeue_delay_ms))
            .with_requeue_capacity(self.scheduler.requeue_capacity)
            .with_resync_period(Duration::from_secs(self.scheduler.resync_period_secs.max(1)))
    }
}
