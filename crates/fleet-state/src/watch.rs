//! Change notification for the kv table.
//!
//! Every committed `set`/`delete` is published on a broadcast channel.
//! A [`Watcher`] filters that stream down to one key or one key prefix.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// Kind of change observed on a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvAction {
    Set,
    Delete,
}

/// A committed change to a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub action: KvAction,
    pub key: String,
    /// New value (`None` for deletes).
    pub value: Option<Vec<u8>>,
    /// Value before this change, if the key existed.
    pub prev_value: Option<Vec<u8>>,
}

/// Receives the changes for one key (or every key under a prefix).
///
/// Only changes committed after the watcher was created are delivered.
pub struct Watcher {
    rx: broadcast::Receiver<KvEvent>,
    key: String,
    with_prefix: bool,
}

impl Watcher {
    pub(crate) fn new(rx: broadcast::Receiver<KvEvent>, key: &str, with_prefix: bool) -> Self {
        Self {
            rx,
            key: key.to_string(),
            with_prefix,
        }
    }

    /// Wait for the next matching event.
    ///
    /// Returns `None` once the store has been dropped.
    pub async fn next(&mut self) -> Option<KvEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event.key) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(key = %self.key, skipped, "watcher lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, key: &str) -> bool {
        if self.with_prefix {
            key.starts_with(&self.key)
        } else {
            key == self.key
        }
    }
}
