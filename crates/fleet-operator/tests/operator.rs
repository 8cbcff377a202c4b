//! End-to-end operator behaviour against an in-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use fleet_operator::{Operator, OperatorConfig, OperatorError, Reconciler, Requeue};
use fleet_registry::{
    Catalog, DeleteOptions, Gvk, Object, Phase, Registry, RegistryConfig, Spec,
};
use fleet_state::StateStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct WidgetSpec {
    size: u32,
}

impl Spec for WidgetSpec {
    fn gvk() -> Gvk {
        Gvk::new("test.fleet.io", "v1", "Widget")
    }
}

/// Records every call and fails or panics on demand.
#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
    handled: Arc<Mutex<HashMap<String, usize>>>,
    /// Finalizer that fails exactly once.
    flaky_finalizer: Option<String>,
    flaked: Arc<AtomicBool>,
    requeue_once: bool,
}

impl Recorder {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn handled(&self, name: &str) -> usize {
        self.handled.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Reconciler<WidgetSpec> for Recorder {
    async fn reconcile(&self, obj: &Object<WidgetSpec>) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("reconcile:{}", obj.name()));
        Ok(())
    }

    async fn handle(
        &self,
        obj: &Object<WidgetSpec>,
        requeue: &Requeue<WidgetSpec>,
    ) -> anyhow::Result<()> {
        if obj.name() == "boom" {
            panic!("handler exploded");
        }
        let count = {
            let mut handled = self.handled.lock().unwrap();
            let count = handled.entry(obj.name().to_string()).or_default();
            *count += 1;
            *count
        };
        if self.requeue_once && count == 1 {
            requeue.requeue(obj.clone());
        }
        Ok(())
    }

    async fn finalize(&self, obj: &Object<WidgetSpec>, finalizer: &str) -> anyhow::Result<()> {
        if self.flaky_finalizer.as_deref() == Some(finalizer)
            && !self.flaked.swap(true, Ordering::SeqCst)
        {
            anyhow::bail!("{finalizer} not ready");
        }
        self.calls
            .lock()
            .unwrap()
            .push(format!("finalize:{}:{finalizer}", obj.name()));
        Ok(())
    }
}

fn registry(store: StateStore, finalizers: &[&str]) -> Arc<Registry<WidgetSpec>> {
    Arc::new(Registry::new(
        store,
        Arc::new(Catalog::new()),
        RegistryConfig::default().with_finalizers(finalizers.iter().copied()),
    ))
}

fn fast_config() -> OperatorConfig {
    OperatorConfig::default()
        .with_reconcile_period(Duration::from_millis(100))
        .with_lease_ttl(Duration::from_millis(300))
}

fn widget(name: &str) -> Object<WidgetSpec> {
    Object::new("default", name, WidgetSpec { size: 1 })
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn handles_existing_and_new_objects() {
    let store = StateStore::open_in_memory().unwrap();
    let registry = registry(store, &[]);
    registry.create(widget("a")).unwrap();

    let recorder = Recorder::default();
    let operator = Operator::new(Arc::clone(&registry), recorder.clone(), fast_config());
    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let cancel = cancel.clone();
        async move { operator.run(cancel).await }
    });

    eventually("backlog handled", || recorder.handled("a") == 1).await;
    registry.create(widget("b")).unwrap();
    eventually("new object handled", || recorder.handled("b") == 1).await;
    eventually("periodic reconcile", || {
        recorder.calls().iter().any(|c| c == "reconcile:b")
    })
    .await;

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn finalizers_drain_in_order_then_remove() {
    let store = StateStore::open_in_memory().unwrap();
    let registry = registry(store, &["release-ips", "cleanup-inventory"]);
    registry.create(widget("a")).unwrap();

    let recorder = Recorder::default();
    let operator = Operator::new(Arc::clone(&registry), recorder.clone(), fast_config());
    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let cancel = cancel.clone();
        async move { operator.run(cancel).await }
    });

    tokio::time::timeout(
        Duration::from_secs(5),
        registry.delete("default", "a", DeleteOptions::new().sync()),
    )
    .await
    .unwrap()
    .unwrap();

    let finalized: Vec<String> = recorder
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("finalize:"))
        .collect();
    assert_eq!(
        finalized,
        vec!["finalize:a:release-ips", "finalize:a:cleanup-inventory"]
    );
    assert!(registry.get("default", "a").unwrap().is_none());

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_finalizer_keeps_object_until_retry() {
    let store = StateStore::open_in_memory().unwrap();
    let registry = registry(store, &["release-ips", "cleanup-inventory"]);
    registry.create(widget("a")).unwrap();
    registry
        .delete("default", "a", DeleteOptions::new())
        .await
        .unwrap();

    let recorder = Recorder {
        flaky_finalizer: Some("cleanup-inventory".to_string()),
        ..Recorder::default()
    };
    // Drive the drain by hand: no loops, so nothing retries behind our back.
    let operator = Operator::new(Arc::clone(&registry), recorder.clone(), fast_config());

    let err = operator.drain("default", "a").await.unwrap_err();
    assert!(matches!(err, OperatorError::Finalize { ref finalizer, .. } if finalizer == "cleanup-inventory"));
    let stuck = registry.get("default", "a").unwrap().unwrap();
    assert_eq!(stuck.status.phase, Phase::Deleting);
    assert_eq!(stuck.metadata.finalizers, vec!["cleanup-inventory"]);

    operator.drain("default", "a").await.unwrap();
    assert!(registry.get("default", "a").unwrap().is_none());
}

#[tokio::test]
async fn panicking_handler_does_not_stop_the_pool() {
    let store = StateStore::open_in_memory().unwrap();
    let registry = registry(store, &[]);

    let recorder = Recorder::default();
    let operator = Operator::new(
        Arc::clone(&registry),
        recorder.clone(),
        fast_config().with_max_concurrent_handlers(1),
    );
    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let cancel = cancel.clone();
        async move { operator.run(cancel).await }
    });

    registry.create(widget("boom")).unwrap();
    registry.create(widget("calm")).unwrap();
    eventually("calm handled after panic", || recorder.handled("calm") == 1).await;

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn requeued_objects_are_handled_again() {
    let store = StateStore::open_in_memory().unwrap();
    let registry = registry(store, &[]);
    registry.create(widget("a")).unwrap();

    let recorder = Recorder {
        requeue_once: true,
        ..Recorder::default()
    };
    let operator = Operator::new(Arc::clone(&registry), recorder.clone(), fast_config());
    let cancel = CancellationToken::new();
    let running = tokio::spawn({
        let cancel = cancel.clone();
        async move { operator.run(cancel).await }
    });

    eventually("requeue handled", || recorder.handled("a") == 2).await;

    cancel.cancel();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn only_the_lease_holder_handles() {
    let store = StateStore::open_in_memory().unwrap();
    let registry = registry(store, &[]);
    registry.create(widget("a")).unwrap();

    let leader = Recorder::default();
    let standby = Recorder::default();
    let first = Operator::new(
        Arc::clone(&registry),
        leader.clone(),
        fast_config().with_holder("first"),
    );
    let second = Operator::new(
        Arc::clone(&registry),
        standby.clone(),
        fast_config().with_holder("second"),
    );

    let cancel_first = CancellationToken::new();
    let running_first = tokio::spawn({
        let cancel = cancel_first.clone();
        async move { first.run(cancel).await }
    });
    eventually("leader handled", || leader.handled("a") == 1).await;

    let cancel_second = CancellationToken::new();
    let running_second = tokio::spawn({
        let cancel = cancel_second.clone();
        async move { second.run(cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(standby.handled("a"), 0);

    // Stepping down hands the lease over.
    cancel_first.cancel();
    running_first.await.unwrap().unwrap();
    eventually("standby took over", || standby.handled("a") == 1).await;

    cancel_second.cancel();
    running_second.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancelled_before_leading() {
    let store = StateStore::open_in_memory().unwrap();
    let registry = registry(store, &[]);

    // Someone else holds the lease for the whole test.
    let holder = Operator::new(Arc::clone(&registry), Recorder::default(), fast_config());
    let cancel_holder = CancellationToken::new();
    let running_holder = tokio::spawn({
        let cancel = cancel_holder.clone();
        async move { holder.run(cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let waiter = Operator::new(Arc::clone(&registry), Recorder::default(), fast_config());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = waiter.run(cancel).await.unwrap_err();
    assert!(matches!(err, OperatorError::Cancelled));

    cancel_holder.cancel();
    running_holder.await.unwrap().unwrap();
}
