//! The `Job` kind and its schema versions.
//!
//! `v1` is the stored version. `v1alpha1` is the legacy single-command
//! shape, converted through the hub so old records keep decoding and can
//! be migrated in place.
//!
//! Hub representation (spec only):
//!
//! ```text
//! { program, args, env, workingDir, timeoutSeconds, attempts, note }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use fleet_registry::{Catalog, ConversionError, Gvk, Object, Spec, spec_conversion};

pub const JOB_GROUP: &str = "batch.fleet.io";
pub const JOB_KIND: &str = "Job";

/// Condition set when a run succeeds.
pub const CONDITION_SUCCEEDED: &str = "Succeeded";
/// Condition set when a run exhausts its attempts or deadline.
pub const CONDITION_FAILED: &str = "Failed";

pub type Job = Object<JobSpec>;

// ── v1 ─────────────────────────────────────────────────────────────

/// What to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDescriptor {
    pub program: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// A one-shot job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub executor: ExecutionDescriptor,
    /// Deadline for the whole run across attempts; 0 means none.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Attempts before the job is marked failed; 0 behaves as 1.
    #[serde(default)]
    pub failure_threshold: u32,
    /// Free-form operator note, not part of the spec hash.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
}

impl JobSpec {
    pub fn command(program: &str, args: &[&str]) -> Self {
        Self {
            executor: ExecutionDescriptor {
                program: program.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                ..ExecutionDescriptor::default()
            },
            ..Self::default()
        }
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Attempts allowed per run.
    pub fn attempts(&self) -> u32 {
        self.failure_threshold.max(1)
    }

    /// Deadline for one run, if any.
    pub fn deadline(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }
}

impl Spec for JobSpec {
    fn gvk() -> Gvk {
        Gvk::new(JOB_GROUP, "v1", JOB_KIND)
    }

    fn hash_view(&self) -> Value {
        let mut view = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(map) = view.as_object_mut() {
            map.remove("note");
        }
        view
    }
}

// ── v1alpha1 ───────────────────────────────────────────────────────

/// Legacy job shape: a whitespace-separated command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpecV1Alpha1 {
    pub command: String,
    /// Duration string such as `"30s"` or `"5m"`; empty means none.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    /// Extra attempts after the first.
    #[serde(default)]
    pub retries: u32,
}

impl Spec for JobSpecV1Alpha1 {
    fn gvk() -> Gvk {
        Gvk::new(JOB_GROUP, "v1alpha1", JOB_KIND)
    }
}

// ── Conversions ────────────────────────────────────────────────────

/// Register every `Job` version with the catalog.
pub fn register_job_kinds(catalog: &mut Catalog) {
    catalog.register_version(
        &JobSpec::gvk(),
        spec_conversion(v1_to_hub),
        spec_conversion(hub_to_v1),
    );
    catalog.register_version(
        &JobSpecV1Alpha1::gvk(),
        spec_conversion(v1alpha1_to_hub),
        spec_conversion(hub_to_v1alpha1),
    );
}

fn decode<T: serde::de::DeserializeOwned>(spec: Value) -> Result<T, ConversionError> {
    serde_json::from_value(spec).map_err(|e| ConversionError::malformed(e.to_string()))
}

fn v1_to_hub(spec: Value) -> Result<Value, ConversionError> {
    let spec: JobSpec = decode(spec)?;
    Ok(json!({
        "program": spec.executor.program,
        "args": spec.executor.args,
        "env": spec.executor.env,
        "workingDir": spec.executor.working_dir,
        "timeoutSeconds": spec.timeout_seconds,
        "attempts": spec.failure_threshold,
        "note": spec.note,
    }))
}

fn hub_to_v1(hub: Value) -> Result<Value, ConversionError> {
    let hub: Hub = decode(hub)?;
    let spec = JobSpec {
        executor: ExecutionDescriptor {
            program: hub.program,
            args: hub.args,
            env: hub.env,
            working_dir: hub.working_dir,
        },
        timeout_seconds: hub.timeout_seconds,
        failure_threshold: hub.attempts,
        note: hub.note,
    };
    serde_json::to_value(spec).map_err(|e| ConversionError::malformed(e.to_string()))
}

fn v1alpha1_to_hub(spec: Value) -> Result<Value, ConversionError> {
    let spec: JobSpecV1Alpha1 = decode(spec)?;
    let mut words = spec.command.split_whitespace().map(str::to_string);
    let program = words
        .next()
        .ok_or_else(|| ConversionError::malformed("empty command"))?;
    let timeout_seconds = if spec.timeout.trim().is_empty() {
        0
    } else {
        parse_duration(&spec.timeout)
            .ok_or_else(|| ConversionError::malformed(format!("bad timeout {:?}", spec.timeout)))?
            .as_secs()
    };
    Ok(json!({
        "program": program,
        "args": words.collect::<Vec<_>>(),
        "timeoutSeconds": timeout_seconds,
        "attempts": spec.retries.saturating_add(1),
    }))
}

fn hub_to_v1alpha1(hub: Value) -> Result<Value, ConversionError> {
    let hub: Hub = decode(hub)?;
    let command = std::iter::once(hub.program)
        .chain(hub.args)
        .collect::<Vec<_>>()
        .join(" ");
    let spec = JobSpecV1Alpha1 {
        command,
        timeout: if hub.timeout_seconds > 0 {
            format!("{}s", hub.timeout_seconds)
        } else {
            String::new()
        },
        retries: hub.attempts.saturating_sub(1),
    };
    serde_json::to_value(spec).map_err(|e| ConversionError::malformed(e.to_string()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hub {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    timeout_seconds: u64,
    #[serde(default)]
    attempts: u32,
    #[serde(default)]
    note: String,
}

/// Parse a duration string like "500ms", "30s", "5m", "1h".
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
