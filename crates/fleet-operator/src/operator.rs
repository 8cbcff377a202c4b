//! Operator: leader-elected control loops for one kind.

use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleet_registry::{Object, Phase, Registry, Spec, WatchAction};
use fleet_state::{LeaderLock, Lease};

use crate::config::OperatorConfig;
use crate::error::{OperatorError, OperatorResult};
use crate::reconciler::{Reconciler, Requeue};

/// Drives a [`Reconciler`] over every object of one kind.
pub struct Operator<S: Spec> {
    registry: Arc<Registry<S>>,
    reconciler: Arc<dyn Reconciler<S>>,
    lock: Arc<dyn LeaderLock>,
    config: OperatorConfig,
    /// Keys with a finalizer drain in progress.
    deletings: Arc<Mutex<HashSet<String>>>,
}

impl<S: Spec> Clone for Operator<S> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            reconciler: Arc::clone(&self.reconciler),
            lock: Arc::clone(&self.lock),
            config: self.config.clone(),
            deletings: Arc::clone(&self.deletings),
        }
    }
}

impl<S: Spec> Operator<S> {
    /// Create an operator leasing through the registry's own store.
    pub fn new(
        registry: Arc<Registry<S>>,
        reconciler: impl Reconciler<S>,
        config: OperatorConfig,
    ) -> Self {
        let lock: Arc<dyn LeaderLock> = Arc::new(registry.store().clone());
        Self {
            registry,
            reconciler: Arc::new(reconciler),
            lock,
            config,
            deletings: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Use a different lock backend for leader election.
    pub fn with_lock(mut self, lock: Arc<dyn LeaderLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn registry(&self) -> &Arc<Registry<S>> {
        &self.registry
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Run until `cancel` fires or leadership is lost.
    ///
    /// Blocks until the kind's lease is acquired. Returns
    /// [`OperatorError::Cancelled`] if cancelled while waiting and
    /// [`OperatorError::LeaseLost`] if the lease could not be renewed.
    pub async fn run(&self, cancel: CancellationToken) -> OperatorResult<()> {
        let kind = self.registry.kind().to_string();
        let lease = Lease::acquire(
            Arc::clone(&self.lock),
            self.registry.lock_key(),
            &self.config.holder,
            self.config.lease_ttl,
            &cancel,
        )
        .await?
        .ok_or(OperatorError::Cancelled)?;
        info!(%kind, holder = %self.config.holder, "operator leading");

        let stop = cancel.child_token();
        let lost = lease.lost();
        let watchdog = {
            let stop = stop.clone();
            let lost = lost.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = lost.cancelled() => stop.cancel(),
                    _ = stop.cancelled() => {}
                }
            })
        };

        let result = tokio::try_join!(self.reconcile_loop(&stop), self.handle_loop(&stop));
        stop.cancel();
        if let Err(e) = watchdog.await {
            warn!(%kind, error = %e, "lease watchdog failed");
        }

        let lease_key = lease.key().to_string();
        if let Err(e) = lease.release().await {
            warn!(%kind, error = %e, "failed to release lease");
        }
        result?;

        if lost.is_cancelled() {
            error!(%kind, "lease lost, operator stopped");
            return Err(OperatorError::LeaseLost { key: lease_key });
        }
        info!(%kind, "operator stopped");
        Ok(())
    }

    // ── Reconcile loop ─────────────────────────────────────────────

    async fn reconcile_loop(&self, stop: &CancellationToken) -> OperatorResult<()> {
        let kind = self.registry.kind();
        let mut ticker = tokio::time::interval(self.config.reconcile_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let objects = match self.registry.list(None) {
                Ok(objects) => objects,
                Err(e) => {
                    warn!(%kind, error = %e, "reconcile list failed");
                    continue;
                }
            };
            debug!(%kind, count = objects.len(), "reconcile pass");

            for obj in objects {
                if stop.is_cancelled() {
                    return Ok(());
                }
                let key = obj.key();
                if obj.phase() == Phase::Deleting {
                    guarded(&key, "drain", self.drain(obj.namespace(), obj.name())).await;
                } else {
                    guarded(&key, "reconcile", self.reconciler.reconcile(&obj)).await;
                }
            }
        }
    }

    // ── Handle loop ────────────────────────────────────────────────

    async fn handle_loop(&self, stop: &CancellationToken) -> OperatorResult<()> {
        let kind = self.registry.kind();
        let mut watch = self.registry.list_watch()?;
        let (tx, mut rx) = mpsc::channel(self.config.requeue_capacity);
        let requeue = Requeue::new(tx);
        let max = self.config.max_concurrent_handlers.max(1);
        let permits = Arc::new(Semaphore::new(max));

        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                event = watch.next() => match event {
                    Some(event) if event.action == WatchAction::Set => event.object,
                    Some(_) => None,
                    None => {
                        warn!(%kind, "watch closed");
                        break;
                    }
                },
                Some(queued) = rx.recv() => self.refresh(&queued),
            };
            let Some(obj) = next else {
                continue;
            };

            // Wait for a free slot: a saturated pool slows consumption.
            let permit = tokio::select! {
                _ = stop.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let this = self.clone();
            let requeue = requeue.clone();
            tokio::spawn(async move {
                this.dispatch(obj, &requeue).await;
                drop(permit);
            });
        }

        // Let in-flight handlers finish before giving up the lease.
        let all = u32::try_from(max).unwrap_or(u32::MAX);
        let _drained = permits.acquire_many(all).await;
        Ok(())
    }

    /// The latest stored version of a requeued object.
    fn refresh(&self, queued: &Object<S>) -> Option<Object<S>> {
        match self.registry.get(queued.namespace(), queued.name()) {
            Ok(latest) => latest,
            Err(e) => {
                warn!(object = %queued.key(), error = %e, "requeued object unreadable");
                None
            }
        }
    }

    async fn dispatch(&self, obj: Object<S>, requeue: &Requeue<S>) {
        let key = obj.key();
        if obj.phase() == Phase::Deleting {
            guarded(&key, "drain", self.drain(obj.namespace(), obj.name())).await;
        } else {
            guarded(&key, "handle", self.reconciler.handle(&obj, requeue)).await;
        }
    }

    // ── Finalizer drain ────────────────────────────────────────────

    /// Run pending finalizers in order, then remove the object.
    ///
    /// Stops at the first failing finalizer, leaving it (and those after it)
    /// in place for a later attempt. Concurrent drains of one key are skipped.
    pub async fn drain(&self, namespace: &str, name: &str) -> OperatorResult<()> {
        let key = self.registry.key(namespace, name);
        let Some(_guard) = DrainGuard::claim(&self.deletings, &key) else {
            debug!(%key, "drain already in progress");
            return Ok(());
        };

        loop {
            let Some(obj) = self.registry.get(namespace, name)? else {
                return Ok(());
            };
            if obj.phase() != Phase::Deleting {
                return Ok(());
            }
            let Some(finalizer) = obj.metadata.finalizers.first().cloned() else {
                if self.registry.remove_finalized(namespace, name)? {
                    info!(object = %obj.key(), "finalizers drained, object removed");
                    return Ok(());
                }
                // A finalizer was added after the read.
                continue;
            };

            debug!(object = %obj.key(), %finalizer, "running finalizer");
            self.reconciler
                .finalize(&obj, &finalizer)
                .await
                .map_err(|source| OperatorError::Finalize {
                    key: obj.key(),
                    finalizer: finalizer.clone(),
                    source,
                })?;
            self.registry.remove_finalizer(namespace, name, &finalizer)?;
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Membership in the drain set, released on drop.
struct DrainGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl DrainGuard {
    fn claim(set: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
        inserted.then(|| Self {
            set: Arc::clone(set),
            key: key.to_string(),
        })
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Run one unit of per-object work, logging errors and containing panics.
async fn guarded<F, E>(key: &str, stage: &str, work: F)
where
    F: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(object = %key, %stage, error = %e, "operator task failed"),
        Err(panic) => error!(
            object = %key,
            %stage,
            panic = %panic_message(panic.as_ref()),
            "operator task panicked"
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
