//! StateStore: redb-backed key-value persistence for Fleet.
//!
//! Provides byte-level get/set/delete, conditional puts, prefix listing,
//! range scans and watches. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::watch::{KvAction, KvEvent, Watcher};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;

/// Buffered events per watcher before it starts lagging.
const WATCH_CAPACITY: usize = 1024;

/// Attempts made for a transaction that fails to begin or commit.
const TRANSIENT_ATTEMPTS: u32 = 3;

type KvTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// Thread-safe key-value store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<KvEvent>,
    /// Serializes commit + publish so watchers see commit order.
    writer: Arc<Mutex<()>>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(KV).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get the value stored under `key`.
    pub fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        self.read_value(KV, key)
    }

    /// List every key under `prefix`.
    ///
    /// When `recursive` is false only direct children are returned, i.e. keys
    /// with no further `/` after the prefix.
    pub fn list(&self, prefix: &str, recursive: bool) -> StateResult<BTreeMap<String, Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut results = BTreeMap::new();
        for entry in table.range::<&str>(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            if !recursive && rest.contains('/') {
                continue;
            }
            results.insert(key.to_string(), value.value().to_vec());
        }
        Ok(results)
    }

    /// Scan the half-open key range `[begin, end)`.
    pub fn range(&self, begin: &str, end: &str) -> StateResult<BTreeMap<String, Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut results = BTreeMap::new();
        for entry in table.range::<&str>(begin..end).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            results.insert(key.value().to_string(), value.value().to_vec());
        }
        Ok(results)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Insert or overwrite `key`.
    pub fn set(&self, key: &str, value: &[u8]) -> StateResult<()> {
        self.write(KV, |table| {
            let prev = table
                .insert(key, value)
                .map_err(map_err!(Write))?
                .map(|guard| guard.value().to_vec());
            Ok(((), vec![set_event(key, value, prev)]))
        })?;
        debug!(%key, "key stored");
        Ok(())
    }

    /// Delete `key`, returning the value it held.
    pub fn delete(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        let prev = self.write(KV, |table| {
            let prev = table
                .remove(key)
                .map_err(map_err!(Write))?
                .map(|guard| guard.value().to_vec());
            let events = match &prev {
                Some(prev) => vec![delete_event(key, prev.clone())],
                None => Vec::new(),
            };
            Ok((prev, events))
        })?;
        debug!(%key, existed = prev.is_some(), "key deleted");
        Ok(prev)
    }

    /// Write `value` only if the current value equals `expected`.
    ///
    /// `expected = None` means the key must be absent. Returns whether the
    /// write happened.
    pub fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> StateResult<bool> {
        self.write(KV, |table| {
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            if current.as_deref() != expected {
                return Ok((false, Vec::new()));
            }
            table.insert(key, value).map_err(map_err!(Write))?;
            Ok((true, vec![set_event(key, value, current)]))
        })
    }

    /// Delete `key` only if its current value equals `expected`.
    ///
    /// Returns whether the key was deleted.
    pub fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StateResult<bool> {
        self.write(KV, |table| {
            let current = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            if current.as_deref() != Some(expected) {
                return Ok((false, Vec::new()));
            }
            table.remove(key).map_err(map_err!(Write))?;
            Ok((true, vec![delete_event(key, expected.to_vec())]))
        })
    }

    /// Delete every key under `prefix`. Returns number deleted.
    pub fn delete_prefix(&self, prefix: &str) -> StateResult<u32> {
        let keys: Vec<String> = self.list(prefix, true)?.into_keys().collect();
        if keys.is_empty() {
            return Ok(0);
        }
        self.write(KV, |table| {
            let mut events = Vec::with_capacity(keys.len());
            for key in &keys {
                if let Some(prev) = table.remove(key.as_str()).map_err(map_err!(Write))? {
                    events.push(delete_event(key, prev.value().to_vec()));
                }
            }
            Ok((events.len() as u32, events))
        })
    }

    // ── Watch ──────────────────────────────────────────────────────

    /// Watch `key`, or every key starting with it when `with_prefix` is set.
    pub fn watch(&self, key: &str, with_prefix: bool) -> Watcher {
        Watcher::new(self.events.subscribe(), key, with_prefix)
    }

    // ── Internal helpers ───────────────────────────────────────────

    pub(crate) fn read_value(
        &self,
        def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        Ok(table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }

    /// Run `op` inside a write transaction, then publish the events it
    /// produced. Transaction failures are retried a fixed number of times.
    pub(crate) fn write<T>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        op: impl Fn(&mut KvTable<'_>) -> StateResult<(T, Vec<KvEvent>)>,
    ) -> StateResult<T> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut attempt = 1;
        let (out, events) = loop {
            match self.try_write(def, &op) {
                Err(StateError::Transaction(e)) if attempt < TRANSIENT_ATTEMPTS => {
                    warn!(attempt, error = %e, "transaction failed, retrying");
                    attempt += 1;
                }
                other => break other?,
            }
        };
        for event in events {
            // No receivers is fine; nobody is watching.
            let _ = self.events.send(event);
        }
        Ok(out)
    }

    fn try_write<T>(
        &self,
        def: TableDefinition<&str, &[u8]>,
        op: &impl Fn(&mut KvTable<'_>) -> StateResult<(T, Vec<KvEvent>)>,
    ) -> StateResult<(T, Vec<KvEvent>)> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result = {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            op(&mut table)?
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }
}

fn set_event(key: &str, value: &[u8], prev: Option<Vec<u8>>) -> KvEvent {
    KvEvent {
        action: KvAction::Set,
        key: key.to_string(),
        value: Some(value.to_vec()),
        prev_value: prev,
    }
}

fn delete_event(key: &str, prev: Vec<u8>) -> KvEvent {
    KvEvent {
        action: KvAction::Delete,
        key: key.to_string(),
        value: None,
        prev_value: Some(prev),
    }
}
