//! Object model shared by every resource kind.
//!
//! An [`Object`] is common [`Metadata`] and [`Status`] wrapped around a
//! kind-specific [`Spec`]. Each version of each kind is its own concrete
//! `Spec` type; the registry binds one of them to storage.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::gvk::Gvk;

// ── Spec ───────────────────────────────────────────────────────────

/// Kind-specific payload of a resource.
pub trait Spec:
    Serialize + DeserializeOwned + Clone + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    /// Whether objects of this kind live in a namespace.
    const NAMESPACED: bool = true;

    /// Schema identity of this spec type.
    fn gvk() -> Gvk;

    /// The JSON view that is fingerprinted by [`Object::spec_hash`].
    ///
    /// Override to strip fields whose changes should not count as a new
    /// version of the object (free-form notes and the like).
    fn hash_view(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ── Metadata ───────────────────────────────────────────────────────

/// Identity and bookkeeping common to all objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    /// Empty for cluster-scoped kinds.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Assigned once at creation.
    #[serde(default)]
    pub uid: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Incremented once per spec change.
    #[serde(default)]
    pub resource_version: u64,
    /// Unix timestamp (seconds).
    #[serde(default)]
    pub create_time: u64,
    /// Unix timestamp (seconds) of the last spec change.
    #[serde(default)]
    pub update_time: u64,
    /// Pending cleanup tasks, drained front to back before deletion.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

// ── Status ─────────────────────────────────────────────────────────

/// Coarse lifecycle state of an object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Waiting,
    Running,
    Installing,
    Installed,
    Upgrading,
    Completed,
    Failed,
    Deleting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A named sub-state of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Unix timestamp (seconds) of the last `status` flip.
    #[serde(default)]
    pub last_transition_time: u64,
}

/// Observed state of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Status {
    /// Set a condition, keyed by type.
    ///
    /// An existing entry is updated in place; its transition time only moves
    /// when `status` actually flips.
    pub fn set_condition(&mut self, type_: &str, status: bool, reason: &str, message: &str) {
        let now = epoch_secs();
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.status = status;
                    existing.last_transition_time = now;
                }
                existing.reason = reason.to_string();
                existing.message = message.to_string();
            }
            None => self.conditions.push(Condition {
                type_: type_.to_string(),
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
            }),
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.condition(type_).is_some_and(|c| c.status)
    }

    pub fn remove_condition(&mut self, type_: &str) {
        self.conditions.retain(|c| c.type_ != type_);
    }
}

// ── Object ─────────────────────────────────────────────────────────

/// A stored resource: type meta, metadata, spec and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object<S> {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: S,
    #[serde(default)]
    pub status: Status,
}

impl<S: Spec> Object<S> {
    /// A new, not yet stored object of `S`'s kind.
    pub fn new(namespace: &str, name: &str, spec: S) -> Self {
        let gvk = S::gvk();
        Self {
            api_version: gvk.api_version_string(),
            kind: gvk.kind,
            metadata: Metadata {
                name: name.to_string(),
                namespace: namespace.to_string(),
                ..Metadata::default()
            },
            spec,
            status: Status::default(),
        }
    }

    /// Schema identity as recorded in the object itself.
    pub fn gvk(&self) -> Gvk {
        Gvk::from_type_meta(&self.api_version, &self.kind)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects.
    pub fn key(&self) -> String {
        object_key(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn phase(&self) -> Phase {
        self.status.phase
    }

    /// Fingerprint of the meaningful spec fields.
    pub fn spec_hash(&self) -> String {
        spec_hash(&self.spec)
    }

    /// Serialize the spec alone.
    pub fn spec_encode(&self) -> serde_json::Result<Value> {
        serde_json::to_value(&self.spec)
    }

    /// Replace the spec from a serialized spec document.
    pub fn spec_decode(&mut self, value: Value) -> serde_json::Result<()> {
        self.spec = serde_json::from_value(value)?;
        Ok(())
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.metadata.namespace, &self.metadata.name)
    }
}

/// Hex SHA-256 over the canonical JSON of [`Spec::hash_view`].
///
/// `serde_json` maps are key-sorted, so equal views hash equally.
pub fn spec_hash<S: Spec>(spec: &S) -> String {
    let view = spec.hash_view();
    let bytes = serde_json::to_vec(&view).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

pub(crate) fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

// ── References ─────────────────────────────────────────────────────

/// Weak reference to another object, resolved through its registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&object_key(&self.namespace, &self.name))
    }
}

/// Current Unix epoch in seconds.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct HostSpec {
        address: String,
        gpus: u32,
        #[serde(default)]
        note: String,
    }

    impl Spec for HostSpec {
        const NAMESPACED: bool = false;

        fn gvk() -> Gvk {
            Gvk::new("core.fleet.io", "v1", "Host")
        }

        fn hash_view(&self) -> Value {
            let mut view = serde_json::to_value(self).unwrap_or(Value::Null);
            if let Some(map) = view.as_object_mut() {
                map.remove("note");
            }
            view
        }
    }

    fn host(address: &str, gpus: u32, note: &str) -> Object<HostSpec> {
        Object::new(
            "",
            "h1",
            HostSpec {
                address: address.to_string(),
                gpus,
                note: note.to_string(),
            },
        )
    }

    #[test]
    fn new_object_carries_type_meta() {
        let obj = host("10.0.0.1", 2, "");
        assert_eq!(obj.api_version, "core.fleet.io/v1");
        assert_eq!(obj.kind, "Host");
        assert_eq!(obj.gvk(), HostSpec::gvk());
        assert_eq!(obj.key(), "h1");
        assert_eq!(obj.phase(), Phase::Waiting);
    }

    #[test]
    fn spec_hash_ignores_stripped_fields() {
        let a = host("10.0.0.1", 2, "racked on monday");
        let b = host("10.0.0.1", 2, "moved to row 4");
        let c = host("10.0.0.1", 4, "racked on monday");

        assert_eq!(a.spec_hash(), b.spec_hash());
        assert_ne!(a.spec_hash(), c.spec_hash());
        assert_eq!(a.spec_hash().len(), 64);
    }

    #[test]
    fn spec_encode_decode_is_partial() {
        let mut obj = host("10.0.0.1", 2, "");
        obj.metadata.labels.insert("rack".into(), "r1".into());

        let encoded = obj.spec_encode().unwrap();
        assert_eq!(encoded["gpus"], 2);
        assert!(encoded.get("metadata").is_none());

        obj.spec_decode(serde_json::json!({"address": "10.0.0.9", "gpus": 8}))
            .unwrap();
        assert_eq!(obj.spec.gpus, 8);
        assert_eq!(obj.metadata.labels["rack"], "r1");
    }

    #[test]
    fn set_condition_updates_in_place() {
        let mut status = Status::default();
        status.set_condition("Ready", false, "Probing", "");
        status.set_condition("Ready", true, "Probed", "all good");
        status.set_condition("Synced", true, "", "");

        assert_eq!(status.conditions.len(), 2);
        let ready = status.condition("Ready").unwrap();
        assert!(ready.status);
        assert_eq!(ready.reason, "Probed");
        assert_eq!(ready.message, "all good");
        assert!(status.is_condition_true("Synced"));

        status.remove_condition("Synced");
        assert!(!status.is_condition_true("Synced"));
    }

    #[test]
    fn transition_time_only_moves_on_flip() {
        let mut status = Status::default();
        status.set_condition("Ready", true, "", "");
        status.conditions[0].last_transition_time = 1;

        status.set_condition("Ready", true, "Again", "");
        assert_eq!(status.conditions[0].last_transition_time, 1);

        status.set_condition("Ready", false, "", "");
        assert!(status.conditions[0].last_transition_time > 1);
    }

    #[test]
    fn object_json_shape() {
        let obj = host("10.0.0.1", 1, "");
        let json = serde_json::to_value(&obj).unwrap();

        assert_eq!(json["apiVersion"], "core.fleet.io/v1");
        assert_eq!(json["metadata"]["name"], "h1");
        assert!(json["metadata"].get("namespace").is_none());
        assert_eq!(json["status"]["phase"], "Waiting");
    }

    #[test]
    fn object_ref_display() {
        assert_eq!(ObjectRef::new("prod", "db").to_string(), "prod/db");
        assert_eq!(ObjectRef::new("", "h1").to_string(), "h1");
    }
}
