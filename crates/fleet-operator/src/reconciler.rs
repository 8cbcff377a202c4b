//! The per-kind behaviour an [`Operator`](crate::Operator) drives.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use fleet_registry::{Object, Spec};

/// Kind-specific control logic.
///
/// Errors are logged by the operator and never retried automatically; use
/// [`Requeue`] from `handle` to try again.
#[async_trait]
pub trait Reconciler<S: Spec>: Send + Sync + 'static {
    /// Periodic drift correction for a live object.
    async fn reconcile(&self, _obj: &Object<S>) -> anyhow::Result<()> {
        Ok(())
    }

    /// React to a change (or a requeue) of a live object.
    async fn handle(&self, obj: &Object<S>, requeue: &Requeue<S>) -> anyhow::Result<()>;

    /// Run one finalizer of an object being deleted.
    ///
    /// The finalizer is removed only when this returns `Ok`.
    async fn finalize(&self, _obj: &Object<S>, _finalizer: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Sends objects back to the handler pool.
pub struct Requeue<S> {
    tx: mpsc::Sender<Object<S>>,
}

impl<S> Clone for Requeue<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: Spec> Requeue<S> {
    pub(crate) fn new(tx: mpsc::Sender<Object<S>>) -> Self {
        Self { tx }
    }

    /// Queue an object for another `handle` pass.
    ///
    /// Never blocks: when the queue is full the object is dropped with a
    /// warning and picked up again by the next reconcile pass.
    pub fn requeue(&self, obj: Object<S>) {
        let key = obj.key();
        match self.tx.try_send(obj) {
            Ok(()) => debug!(object = %key, "object requeued"),
            Err(TrySendError::Full(_)) => warn!(object = %key, "requeue channel full, dropping"),
            Err(TrySendError::Closed(_)) => debug!(object = %key, "operator stopped, requeue ignored"),
        }
    }

    /// Queue an object after `delay`.
    pub fn requeue_after(&self, obj: Object<S>, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.requeue(obj);
        });
    }
}
