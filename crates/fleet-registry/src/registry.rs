//! Registry: typed CRUD and watch storage for one kind.
//!
//! Objects are JSON-encoded into the key-value store under
//! `{prefix}/{kind}s/[{namespace}/]{name}`. Every write is a
//! compare-and-set against the bytes that were read, so concurrent writers
//! never silently clobber each other:
//!
//! - spec-merge updates and status updates re-read and retry;
//! - `all_fields` updates fail with `Conflict` when the caller's
//!   `resource_version` is stale.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fleet_state::{KvAction, StateStore};

use crate::catalog::{Catalog, ConversionError};
use crate::error::{RegistryError, RegistryResult};
use crate::gvk::Gvk;
use crate::hooks::{NoHooks, RegistryHooks};
use crate::object::{Object, Phase, Spec, Status, epoch_secs, object_key};
use crate::options::{DeleteOptions, UpdateOptions};
use crate::revision::{Revision, Revisioner};
use crate::validate::{validate_name, validate_namespace};
use crate::watch::{ObjectWatch, WatchEvent};

/// Annotation holding the spec an update replaced.
pub const LAST_APPLIED_ANNOTATION: &str = "fleet.io/last-applied-configuration";

/// Read-modify-write attempts before giving up with `Conflict`.
const WRITE_ATTEMPTS: u32 = 5;

/// Per-registry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Root of every key this registry writes.
    pub prefix: String,
    /// Finalizers every new object starts with.
    pub default_finalizers: Vec<String>,
    /// Phases in which a spec change snapshots the old object.
    pub revision_phases: Vec<Phase>,
    /// Revisions kept per object.
    pub history_limit: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            prefix: "/fleet".to_string(),
            default_finalizers: Vec::new(),
            revision_phases: vec![Phase::Installed],
            history_limit: 10,
        }
    }
}

impl RegistryConfig {
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_finalizers<I, F>(mut self, finalizers: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        self.default_finalizers = finalizers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_revision_phases(mut self, phases: &[Phase]) -> Self {
        self.revision_phases = phases.to_vec();
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

// ── Codec ──────────────────────────────────────────────────────────

/// Decoding, conversion and decoration shared by the registry and its watches.
pub(crate) struct ObjectCodec<S: Spec> {
    catalog: Arc<Catalog>,
    gvk: Gvk,
    hooks: Arc<dyn RegistryHooks<S>>,
    kind_prefix: String,
}

impl<S: Spec> Clone for ObjectCodec<S> {
    fn clone(&self) -> Self {
        Self {
            catalog: Arc::clone(&self.catalog),
            gvk: self.gvk.clone(),
            hooks: Arc::clone(&self.hooks),
            kind_prefix: self.kind_prefix.clone(),
        }
    }
}

impl<S: Spec> ObjectCodec<S> {
    /// Decode a stored document, converting it to this registry's version.
    pub(crate) fn decode(&self, bytes: &[u8]) -> RegistryResult<Object<S>> {
        let value: Value = serde_json::from_slice(bytes)?;
        let stored = stored_gvk(&value)?;
        let value = if stored == self.gvk {
            value
        } else {
            debug!(from = %stored, to = %self.gvk, "converting stored object");
            self.catalog.convert(value, &stored, &self.gvk)?
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Apply the decorate hook to an object leaving the registry.
    pub(crate) fn present(&self, mut obj: Object<S>) -> Object<S> {
        self.hooks.decorate(&mut obj);
        obj
    }

    /// Recover `(namespace, name)` from a storage key.
    pub(crate) fn split_key(&self, key: &str) -> Option<(String, String)> {
        let rest = key.strip_prefix(&self.kind_prefix)?;
        match (S::NAMESPACED, rest.split_once('/')) {
            (true, Some((namespace, name))) if !name.contains('/') => {
                Some((namespace.to_string(), name.to_string()))
            }
            (false, None) => Some((String::new(), rest.to_string())),
            _ => None,
        }
    }
}

fn stored_gvk(value: &Value) -> Result<Gvk, ConversionError> {
    let api_version = value
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| ConversionError::malformed("missing apiVersion"))?;
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| ConversionError::malformed("missing kind"))?;
    Ok(Gvk::from_type_meta(api_version, kind))
}

// ── Registry ───────────────────────────────────────────────────────

/// Typed storage for one (group, version, kind).
pub struct Registry<S: Spec> {
    store: StateStore,
    config: RegistryConfig,
    codec: ObjectCodec<S>,
    revisioner: Revisioner,
    lock_key: String,
}

impl<S: Spec> Registry<S> {
    /// Create a registry for `S` with no hooks.
    pub fn new(store: StateStore, catalog: Arc<Catalog>, config: RegistryConfig) -> Self {
        let gvk = S::gvk();
        let prefix = config.prefix.trim_end_matches('/').to_string();
        if !catalog.is_registered(&gvk) {
            debug!(%gvk, "kind not in catalog, stored objects must match its version");
        }
        let revisioner = Revisioner::new(store.clone(), &prefix, &gvk.kind, config.history_limit);
        let codec = ObjectCodec {
            catalog,
            kind_prefix: format!("{prefix}/{}s/", gvk.resource()),
            gvk: gvk.clone(),
            hooks: Arc::new(NoHooks),
        };
        Self {
            lock_key: format!("{prefix}/locks/{}", gvk.resource()),
            store,
            config,
            codec,
            revisioner,
        }
    }

    /// Install kind-specific hooks.
    pub fn with_hooks(mut self, hooks: impl RegistryHooks<S> + 'static) -> Self {
        self.codec.hooks = Arc::new(hooks);
        self
    }

    pub fn gvk(&self) -> &Gvk {
        &self.codec.gvk
    }

    pub fn kind(&self) -> &str {
        &self.codec.gvk.kind
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn revisioner(&self) -> &Revisioner {
        &self.revisioner
    }

    /// Storage key of one object.
    pub fn key(&self, namespace: &str, name: &str) -> String {
        format!("{}{}", self.codec.kind_prefix, object_key(namespace, name))
    }

    /// Prefix shared by every object of this kind.
    pub fn kind_prefix(&self) -> &str {
        &self.codec.kind_prefix
    }

    /// Lease key for the single active operator of this kind.
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    // ── Create ─────────────────────────────────────────────────────

    /// Store a new object.
    ///
    /// Assigns uid, timestamps, default finalizers and a fresh status, then
    /// runs validate → mutate → pre_create before writing.
    pub fn create(&self, mut obj: Object<S>) -> RegistryResult<Object<S>> {
        self.validate_identity(&obj)?;
        let key = self.key(&obj.metadata.namespace, &obj.metadata.name);
        if self.store.get(&key)?.is_some() {
            return Err(self.exists(&obj.key()));
        }

        let now = epoch_secs();
        let requested = std::mem::take(&mut obj.metadata.finalizers);
        obj.metadata.uid = Uuid::new_v4().to_string();
        obj.metadata.resource_version = 0;
        obj.metadata.create_time = now;
        obj.metadata.update_time = now;
        obj.metadata.finalizers = self.config.default_finalizers.clone();
        for finalizer in requested {
            if !obj.metadata.finalizers.contains(&finalizer) {
                obj.metadata.finalizers.push(finalizer);
            }
        }
        obj.status = Status::default();

        let hooks = &self.codec.hooks;
        hooks.validate(&obj)?;
        hooks.mutate(&mut obj)?;
        hooks.pre_create(&mut obj)?;

        let value = serde_json::to_vec(&obj)?;
        if !self.store.compare_and_set(&key, None, &value)? {
            return Err(self.exists(&obj.key()));
        }
        hooks.post_create(&obj);
        info!(kind = %self.kind(), object = %obj.key(), uid = %obj.metadata.uid, "object created");
        Ok(self.codec.present(obj))
    }

    // ── Update ─────────────────────────────────────────────────────

    /// Update an existing object.
    ///
    /// By default only the spec is merged onto the stored object. A spec
    /// change bumps `resource_version`, records the previous spec in
    /// [`LAST_APPLIED_ANNOTATION`], resets the phase to `Waiting` and
    /// snapshots the old object when its phase is a revision phase.
    pub fn update(&self, obj: Object<S>, opts: UpdateOptions) -> RegistryResult<Object<S>> {
        self.validate_identity(&obj)?;
        let key = self.key(&obj.metadata.namespace, &obj.metadata.name);
        let incoming_hash = obj.spec_hash();

        for attempt in 1..=WRITE_ATTEMPTS {
            let Some((raw, stored)) = self.read(&key)? else {
                return Err(self.not_found(&obj.key()));
            };
            if opts.all_fields && obj.metadata.resource_version != stored.metadata.resource_version {
                return Err(self.conflict(&obj.key()));
            }

            let spec_changed = stored.spec_hash() != incoming_hash;
            if !spec_changed && opts.when_spec_changed {
                return Ok(self.codec.present(stored));
            }

            let mut next = if opts.all_fields {
                obj.clone()
            } else {
                let mut merged = stored.clone();
                merged.spec = obj.spec.clone();
                merged
            };
            // Identity always comes from storage.
            next.api_version = self.codec.gvk.api_version_string();
            next.kind = self.codec.gvk.kind.clone();
            next.metadata.uid = stored.metadata.uid.clone();
            next.metadata.create_time = stored.metadata.create_time;
            next.metadata.resource_version = stored.metadata.resource_version;

            if spec_changed {
                next.metadata.resource_version += 1;
                next.metadata.update_time = epoch_secs();
                next.metadata.annotations.insert(
                    LAST_APPLIED_ANNOTATION.to_string(),
                    serde_json::to_string(&stored.spec)?,
                );
                // A pending deletion outranks the new spec.
                if !opts.all_fields && next.status.phase != Phase::Deleting {
                    next.status.phase = Phase::Waiting;
                }
            }

            let hooks = &self.codec.hooks;
            hooks.validate(&next)?;
            hooks.mutate(&mut next)?;
            hooks.pre_update(&stored, &mut next)?;

            let value = serde_json::to_vec(&next)?;
            if value == raw {
                return Ok(self.codec.present(next));
            }
            if self.store.compare_and_set(&key, Some(&raw), &value)? {
                if spec_changed && self.config.revision_phases.contains(&stored.status.phase) {
                    if let Err(e) = self.revisioner.record(&stored) {
                        warn!(kind = %self.kind(), object = %obj.key(), error = %e, "failed to record revision");
                    }
                }
                debug!(
                    kind = %self.kind(),
                    object = %obj.key(),
                    resource_version = next.metadata.resource_version,
                    spec_changed,
                    "object updated"
                );
                return Ok(self.codec.present(next));
            }
            if opts.all_fields {
                return Err(self.conflict(&obj.key()));
            }
            debug!(kind = %self.kind(), object = %obj.key(), attempt, "update raced, retrying");
        }
        Err(self.conflict(&obj.key()))
    }

    /// Replace only the status of an object.
    pub fn update_status(&self, obj: &Object<S>) -> RegistryResult<Object<S>> {
        let status = obj.status.clone();
        self.update_status_with(&obj.metadata.namespace, &obj.metadata.name, |current| {
            current.status = status.clone();
            true
        })?
        .ok_or_else(|| self.not_found(&obj.key()))
    }

    /// Set only the phase of an object.
    pub fn update_status_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: Phase,
    ) -> RegistryResult<Object<S>> {
        self.update_status_with(namespace, name, |current| {
            current.status.phase = phase;
            true
        })?
        .ok_or_else(|| self.not_found(&object_key(namespace, name)))
    }

    /// Read-modify-write the status of an object.
    ///
    /// `f` sees the current stored object and edits its status; returning
    /// `false` skips the write and yields `Ok(None)`. Anything `f` changes
    /// outside the status is discarded. Retried on concurrent modification.
    pub fn update_status_with(
        &self,
        namespace: &str,
        name: &str,
        mut f: impl FnMut(&mut Object<S>) -> bool,
    ) -> RegistryResult<Option<Object<S>>> {
        let key = self.key(namespace, name);
        let object = object_key(namespace, name);
        for attempt in 1..=WRITE_ATTEMPTS {
            let Some((raw, stored)) = self.read(&key)? else {
                return Err(self.not_found(&object));
            };
            let mut edited = stored.clone();
            if !f(&mut edited) {
                return Ok(None);
            }
            let mut next = stored;
            next.status = edited.status;

            let value = serde_json::to_vec(&next)?;
            if value == raw || self.store.compare_and_set(&key, Some(&raw), &value)? {
                debug!(kind = %self.kind(), %object, phase = %next.status.phase, "status updated");
                return Ok(Some(self.codec.present(next)));
            }
            debug!(kind = %self.kind(), %object, attempt, "status update raced, retrying");
        }
        Err(self.conflict(&object))
    }

    /// Drop one finalizer from an object.
    ///
    /// Returns `None` when the finalizer was already gone. Everything else
    /// on the stored object is preserved.
    pub fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> RegistryResult<Option<Object<S>>> {
        let key = self.key(namespace, name);
        let object = object_key(namespace, name);
        for attempt in 1..=WRITE_ATTEMPTS {
            let Some((raw, mut next)) = self.read(&key)? else {
                return Err(self.not_found(&object));
            };
            let before = next.metadata.finalizers.len();
            next.metadata.finalizers.retain(|f| f != finalizer);
            if next.metadata.finalizers.len() == before {
                return Ok(None);
            }
            if self
                .store
                .compare_and_set(&key, Some(&raw), &serde_json::to_vec(&next)?)?
            {
                debug!(kind = %self.kind(), %object, %finalizer, "finalizer removed");
                return Ok(Some(self.codec.present(next)));
            }
            debug!(kind = %self.kind(), %object, attempt, "finalizer removal raced, retrying");
        }
        Err(self.conflict(&object))
    }

    // ── Delete ─────────────────────────────────────────────────────

    /// Delete an object.
    ///
    /// With pending finalizers the object only moves to `Deleting`; the
    /// operator drains the finalizers and removes it. With
    /// [`DeleteOptions::sync`] this waits until the record is gone.
    /// Deleting a missing object is a no-op.
    pub async fn delete(
        &self,
        namespace: &str,
        name: &str,
        opts: DeleteOptions,
    ) -> RegistryResult<()> {
        let key = self.key(namespace, name);
        let object = object_key(namespace, name);
        // Subscribe before touching the record so the removal can't be missed.
        let mut watcher = opts.sync.then(|| self.store.watch(&key, false));

        let mut settled = false;
        for attempt in 1..=WRITE_ATTEMPTS {
            let Some((raw, stored)) = self.read(&key)? else {
                return Ok(());
            };
            if stored.metadata.finalizers.is_empty() {
                if self.remove_unchanged(namespace, name, &raw)? {
                    settled = true;
                    break;
                }
                debug!(kind = %self.kind(), %object, attempt, "delete raced, retrying");
                continue;
            }
            if stored.status.phase == Phase::Deleting {
                settled = true;
                break;
            }
            let mut next = stored;
            next.status.phase = Phase::Deleting;
            if self
                .store
                .compare_and_set(&key, Some(&raw), &serde_json::to_vec(&next)?)?
            {
                info!(
                    kind = %self.kind(),
                    %object,
                    finalizers = ?next.metadata.finalizers,
                    "object marked for deletion"
                );
                settled = true;
                break;
            }
            debug!(kind = %self.kind(), %object, attempt, "delete raced, retrying");
        }
        if !settled {
            return Err(self.conflict(&object));
        }

        if let Some(watcher) = watcher.as_mut() {
            while let Some(event) = watcher.next().await {
                if event.action == KvAction::Delete {
                    debug!(kind = %self.kind(), %object, "deletion observed");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Remove an object once it has no finalizers left.
    ///
    /// Returns `false` when the object is missing or still carries
    /// finalizers. A finalizer added concurrently keeps the object.
    pub fn remove_finalized(&self, namespace: &str, name: &str) -> RegistryResult<bool> {
        let key = self.key(namespace, name);
        let object = object_key(namespace, name);
        for attempt in 1..=WRITE_ATTEMPTS {
            let Some((raw, stored)) = self.read(&key)? else {
                return Ok(false);
            };
            if !stored.metadata.finalizers.is_empty() {
                return Ok(false);
            }
            if self.remove_unchanged(namespace, name, &raw)? {
                return Ok(true);
            }
            debug!(kind = %self.kind(), %object, attempt, "removal raced, retrying");
        }
        Err(self.conflict(&object))
    }

    /// Delete the record only if it still holds `raw`, then purge revisions.
    fn remove_unchanged(&self, namespace: &str, name: &str, raw: &[u8]) -> RegistryResult<bool> {
        if !self
            .store
            .compare_and_delete(&self.key(namespace, name), raw)?
        {
            return Ok(false);
        }
        let purged = self.revisioner.purge(namespace, name)?;
        info!(kind = %self.kind(), object = %object_key(namespace, name), purged, "object removed");
        Ok(true)
    }

    /// Physically remove an object and its revisions, ignoring finalizers.
    ///
    /// Returns whether the object existed.
    pub fn remove(&self, namespace: &str, name: &str) -> RegistryResult<bool> {
        let existed = self.store.delete(&self.key(namespace, name))?.is_some();
        let purged = self.revisioner.purge(namespace, name)?;
        if existed {
            info!(kind = %self.kind(), object = %object_key(namespace, name), purged, "object removed");
        }
        Ok(existed)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Fetch one object; `None` when it does not exist.
    pub fn get(&self, namespace: &str, name: &str) -> RegistryResult<Option<Object<S>>> {
        Ok(self
            .read(&self.key(namespace, name))?
            .map(|(_, obj)| self.codec.present(obj)))
    }

    /// List objects, optionally restricted to one namespace.
    ///
    /// A cluster-scoped kind has no objects in any named namespace. Records
    /// that fail to decode are logged and skipped.
    pub fn list(&self, namespace: Option<&str>) -> RegistryResult<Vec<Object<S>>> {
        let (prefix, recursive) = match namespace {
            Some(ns) if S::NAMESPACED => (format!("{}{ns}/", self.codec.kind_prefix), false),
            Some(ns) if !ns.is_empty() => return Ok(Vec::new()),
            _ => (self.codec.kind_prefix.clone(), true),
        };
        let mut results = Vec::new();
        for (key, bytes) in self.store.list(&prefix, recursive)? {
            match self.codec.decode(&bytes) {
                Ok(obj) => results.push(self.codec.present(obj)),
                Err(e) => warn!(%key, error = %e, "skipping undecodable object"),
            }
        }
        Ok(results)
    }

    // ── Watches ────────────────────────────────────────────────────

    /// Live changes to every object of this kind.
    pub fn watch(&self) -> ObjectWatch<S> {
        let watcher = self.store.watch(&self.codec.kind_prefix, true);
        ObjectWatch::new(watcher, self.codec.clone(), Vec::new())
    }

    /// Every current object as a `Set` event, then live changes.
    pub fn list_watch(&self) -> RegistryResult<ObjectWatch<S>> {
        let watcher = self.store.watch(&self.codec.kind_prefix, true);
        let backlog = self.list(None)?.into_iter().map(WatchEvent::set).collect();
        Ok(ObjectWatch::new(watcher, self.codec.clone(), backlog))
    }

    /// The current object (if any) as a `Set` event, then its live changes.
    pub fn get_watch(&self, namespace: &str, name: &str) -> RegistryResult<ObjectWatch<S>> {
        let watcher = self.store.watch(&self.key(namespace, name), false);
        let backlog = self.get(namespace, name)?.into_iter().map(WatchEvent::set).collect();
        Ok(ObjectWatch::new(watcher, self.codec.clone(), backlog))
    }

    // ── Schema migration ───────────────────────────────────────────

    /// Re-encode every stored object into this registry's version.
    ///
    /// Also appends missing default finalizers and re-runs the mutate hook.
    /// Returns the number of objects rewritten.
    pub fn migrate_objects(&self) -> RegistryResult<usize> {
        let mut migrated = 0;
        for (key, raw) in self.store.list(&self.codec.kind_prefix, true)? {
            let mut obj = match self.codec.decode(&raw) {
                Ok(obj) => obj,
                Err(e) => {
                    warn!(%key, error = %e, "cannot migrate undecodable object");
                    continue;
                }
            };
            for finalizer in &self.config.default_finalizers {
                if !obj.metadata.finalizers.contains(finalizer) {
                    obj.metadata.finalizers.push(finalizer.clone());
                }
            }
            self.codec.hooks.mutate(&mut obj)?;

            let value = serde_json::to_vec(&obj)?;
            if value == raw {
                continue;
            }
            if self.store.compare_and_set(&key, Some(&raw), &value)? {
                migrated += 1;
            } else {
                warn!(%key, "object changed during migration, skipped");
            }
        }
        info!(kind = %self.kind(), version = %self.codec.gvk.api_version, migrated, "objects migrated");
        Ok(migrated)
    }

    // ── Revisions ──────────────────────────────────────────────────

    pub fn list_revisions(&self, namespace: &str, name: &str) -> RegistryResult<Vec<Revision>> {
        self.revisioner.list(namespace, name)
    }

    pub fn get_revision(
        &self,
        namespace: &str,
        name: &str,
        revision: u64,
    ) -> RegistryResult<Option<Revision>> {
        self.revisioner.get(namespace, name, revision)
    }

    /// Restore the spec recorded in a revision.
    pub fn rollback(&self, namespace: &str, name: &str, revision: u64) -> RegistryResult<Object<S>> {
        let snapshot = self
            .revisioner
            .get(namespace, name, revision)?
            .ok_or_else(|| RegistryError::RevisionNotFound {
                kind: self.kind().to_string(),
                key: object_key(namespace, name),
                revision,
            })?;
        let restored = self.codec.decode(snapshot.data.as_bytes())?;
        info!(kind = %self.kind(), object = %object_key(namespace, name), revision, "rolling back");
        self.update(Object::new(namespace, name, restored.spec), UpdateOptions::new())
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn read(&self, key: &str) -> RegistryResult<Option<(Vec<u8>, Object<S>)>> {
        match self.store.get(key)? {
            Some(raw) => {
                let obj = self.codec.decode(&raw)?;
                Ok(Some((raw, obj)))
            }
            None => Ok(None),
        }
    }

    fn validate_identity(&self, obj: &Object<S>) -> RegistryResult<()> {
        validate_name(&obj.metadata.name)?;
        validate_namespace(&obj.metadata.namespace, S::NAMESPACED)?;
        let found = obj.gvk();
        if found != self.codec.gvk {
            return Err(RegistryError::GvkMismatch {
                expected: self.codec.gvk.clone(),
                found,
            });
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> RegistryError {
        RegistryError::ResourceExists {
            kind: self.kind().to_string(),
            key: key.to_string(),
        }
    }

    fn not_found(&self, key: &str) -> RegistryError {
        RegistryError::NotFound {
            kind: self.kind().to_string(),
            key: key.to_string(),
        }
    }

    fn conflict(&self, key: &str) -> RegistryError {
        RegistryError::Conflict {
            kind: self.kind().to_string(),
            key: key.to_string(),
        }
    }
}
