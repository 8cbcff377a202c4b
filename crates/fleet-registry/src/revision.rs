//! Revision history: immutable snapshots of objects for rollback.
//!
//! The registry asks the [`Revisioner`] to snapshot the *old* object
//! whenever a spec change replaces an object in one of the configured
//! phases. Snapshots are keyed by the replaced object's `resource_version`
//! and garbage-collected oldest first beyond the history limit.

use serde::{Deserialize, Serialize};
use tracing::debug;

use fleet_state::StateStore;

use crate::error::RegistryResult;
use crate::object::{Object, Spec, epoch_secs, object_key};

/// An immutable snapshot of an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    pub revision: u64,
    /// The full object, JSON-encoded in the schema it was stored with.
    pub data: String,
    /// Unix timestamp (seconds).
    pub create_time: u64,
}

/// Owns revision snapshots for one kind.
#[derive(Clone)]
pub struct Revisioner {
    store: StateStore,
    /// `{prefix}/revisions/{kind}s/`
    root: String,
    kind: String,
    history_limit: usize,
}

impl Revisioner {
    pub fn new(store: StateStore, registry_prefix: &str, kind: &str, history_limit: usize) -> Self {
        Self {
            store,
            root: format!(
                "{}/revisions/{}s/",
                registry_prefix.trim_end_matches('/'),
                kind.to_ascii_lowercase()
            ),
            kind: kind.to_string(),
            history_limit,
        }
    }

    fn object_prefix(&self, namespace: &str, name: &str) -> String {
        format!("{}{}/", self.root, object_key(namespace, name))
    }

    fn revision_key(&self, namespace: &str, name: &str, revision: u64) -> String {
        // Zero-padded so lexical key order is numeric order.
        format!("{}{revision:020}", self.object_prefix(namespace, name))
    }

    /// Snapshot `obj` under its current `resource_version`.
    pub fn record<S: Spec>(&self, obj: &Object<S>) -> RegistryResult<Revision> {
        let revision = Revision {
            kind: self.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone(),
            revision: obj.metadata.resource_version,
            data: serde_json::to_string(obj)?,
            create_time: epoch_secs(),
        };
        let key = self.revision_key(&revision.namespace, &revision.name, revision.revision);
        self.store.set(&key, &serde_json::to_vec(&revision)?)?;
        debug!(kind = %self.kind, object = %obj.key(), revision = revision.revision, "revision recorded");

        self.collect_garbage(&revision.namespace, &revision.name)?;
        Ok(revision)
    }

    /// All revisions of an object, oldest first.
    pub fn list(&self, namespace: &str, name: &str) -> RegistryResult<Vec<Revision>> {
        self.store
            .list(&self.object_prefix(namespace, name), false)?
            .values()
            .map(|bytes| Ok(serde_json::from_slice(bytes)?))
            .collect()
    }

    pub fn get(&self, namespace: &str, name: &str, revision: u64) -> RegistryResult<Option<Revision>> {
        match self.store.get(&self.revision_key(namespace, name, revision))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Drop every revision of an object. Returns number deleted.
    pub fn purge(&self, namespace: &str, name: &str) -> RegistryResult<u32> {
        Ok(self.store.delete_prefix(&self.object_prefix(namespace, name))?)
    }

    fn collect_garbage(&self, namespace: &str, name: &str) -> RegistryResult<()> {
        let keys: Vec<String> = self
            .store
            .list(&self.object_prefix(namespace, name), false)?
            .into_keys()
            .collect();
        let excess = keys.len().saturating_sub(self.history_limit);
        for key in &keys[..excess] {
            self.store.delete(key)?;
        }
        if excess > 0 {
            debug!(kind = %self.kind, %namespace, %name, excess, "old revisions collected");
        }
        Ok(())
    }
}
