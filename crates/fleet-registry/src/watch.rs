//! Typed watches over one kind.
//!
//! An [`ObjectWatch`] wraps a raw key watcher, decoding (and converting)
//! every change into a [`WatchEvent`]. List-style watches start with a
//! backlog of synthetic `Set` events for the objects that already exist.

use std::collections::VecDeque;

use tracing::warn;

use fleet_state::{KvAction, Watcher};

use crate::object::{Object, Spec};
use crate::registry::ObjectCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Set,
    Delete,
}

/// A change to one object.
#[derive(Debug, Clone)]
pub struct WatchEvent<S> {
    pub action: WatchAction,
    pub namespace: String,
    pub name: String,
    /// The new object for `Set`, the last stored object for `Delete`.
    pub object: Option<Object<S>>,
}

impl<S> WatchEvent<S> {
    pub(crate) fn set(object: Object<S>) -> Self {
        Self {
            action: WatchAction::Set,
            namespace: object.metadata.namespace.clone(),
            name: object.metadata.name.clone(),
            object: Some(object),
        }
    }
}

/// Stream of decoded changes for one kind.
pub struct ObjectWatch<S: Spec> {
    watcher: Watcher,
    backlog: VecDeque<WatchEvent<S>>,
    codec: ObjectCodec<S>,
}

impl<S: Spec> ObjectWatch<S> {
    pub(crate) fn new(watcher: Watcher, codec: ObjectCodec<S>, backlog: Vec<WatchEvent<S>>) -> Self {
        Self {
            watcher,
            backlog: backlog.into(),
            codec,
        }
    }

    /// Wait for the next change.
    ///
    /// Values that fail to decode are logged and skipped. Returns `None` once
    /// the underlying store is gone.
    pub async fn next(&mut self) -> Option<WatchEvent<S>> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        loop {
            let event = self.watcher.next().await?;
            let Some((namespace, name)) = self.codec.split_key(&event.key) else {
                continue;
            };
            match event.action {
                KvAction::Set => {
                    let Some(bytes) = event.value else {
                        continue;
                    };
                    match self.codec.decode(&bytes) {
                        Ok(object) => return Some(WatchEvent::set(self.codec.present(object))),
                        Err(e) => {
                            warn!(key = %event.key, error = %e, "skipping undecodable watch value");
                        }
                    }
                }
                KvAction::Delete => {
                    let object = event.prev_value.and_then(|bytes| match self.codec.decode(&bytes) {
                        Ok(object) => Some(self.codec.present(object)),
                        Err(e) => {
                            warn!(key = %event.key, error = %e, "deleted value undecodable");
                            None
                        }
                    });
                    return Some(WatchEvent {
                        action: WatchAction::Delete,
                        namespace,
                        name,
                        object,
                    });
                }
            }
        }
    }
}
