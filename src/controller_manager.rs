//! Runs the machineset reconciler against an object store.
//!
//! Three informers fold watch events into the [`Cache`] and translate them into machineset keys
//! on the [`WorkQueue`]. A pool of workers drains the queue, one reconcile per key at a time.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::cache::{Cache, Snapshot};
use crate::controller::mapper::{map_machine, map_node};
use crate::controller::{MachineSetReconciler, Outcome};
use crate::error::Error;
use crate::events::EventRecorder;
use crate::queue::WorkQueue;
use crate::resources::{Machine, MachineSet, Node, ObjectKey};
use crate::store::{ObjectStore, StoreError, WatchEvent};

#[derive(Clone, Debug)]
pub struct ControllerManagerConfig {
    /// Only watch this namespace, all namespaces when unset.
    pub namespace: Option<String>,
    pub workers: usize,
    pub max_concurrent_ops: usize,
    /// Re-enqueue every machineset this often, zero disables.
    pub resync_period: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ControllerManagerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            workers: 2,
            max_concurrent_ops: 10,
            resync_period: Duration::from_secs(600),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
        }
    }
}

#[derive(Clone)]
pub struct ControllerManager {
    store: Arc<dyn ObjectStore>,
    reconciler: MachineSetReconciler,
    cache: Arc<Cache>,
    queue: Arc<WorkQueue>,
    config: ControllerManagerConfig,
}

impl std::fmt::Debug for ControllerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerManager")
            .field("config", &self.config)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl ControllerManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        recorder: Arc<dyn EventRecorder>,
        config: ControllerManagerConfig,
    ) -> Self {
        let cache = Arc::new(Cache::new());
        let reconciler = MachineSetReconciler::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            recorder,
            config.max_concurrent_ops,
        );
        let queue = Arc::new(WorkQueue::new(config.backoff_base, config.backoff_max));
        Self {
            store,
            reconciler,
            cache,
            queue,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Snapshots of the informer cache, used to report readiness.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.cache.subscribe()
    }

    /// Start informers, and workers once the cache has synced, returning once `shutdown`
    /// resolves and the workers stopped.
    ///
    /// Pending keys are dropped on shutdown. In-flight reconciles are cancelled at their next
    /// suspension point.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        let (stop_tx, stop_rx) = watch::channel(false);
        let namespace = self.config.namespace.as_deref();

        let mut informers: Vec<JoinHandle<()>> = vec![
            self.spawn_informer(
                "machinesets",
                self.store.watch_machinesets(namespace),
                Self::on_machineset,
            ),
            self.spawn_informer(
                "machines",
                self.store.watch_machines(namespace),
                Self::on_machine,
            ),
            self.spawn_informer("nodes", self.store.watch_nodes(), Self::on_node),
        ];
        if !self.config.resync_period.is_zero() {
            informers.push(tokio::spawn(self.clone().resync()));
        }

        let synced = tokio::select! {
            _ = self.wait_for_sync() => true,
            _ = &mut shutdown => false,
        };
        let worker_count = if synced { self.config.workers.max(1) } else { 0 };
        let workers = (0..worker_count)
            .map(|id| {
                let manager = self.clone();
                let stop = stop_rx.clone();
                tokio::spawn(
                    manager
                        .worker(stop)
                        .instrument(tracing::info_span!("worker", id)),
                )
            })
            .collect::<Vec<_>>();
        if synced {
            info!(workers = workers.len(), namespace = ?self.config.namespace, "Started controller manager");
            shutdown.await;
        }
        info!("Shutting down controller manager");
        // Receivers may all be gone if every worker already exited.
        let _ = stop_tx.send(true);
        self.queue.shutdown();
        for worker in futures::future::join_all(workers).await {
            if let Err(e) = worker {
                error!(error = %e, "Worker task failed");
            }
        }
        for informer in informers {
            informer.abort();
        }
        info!("Controller manager stopped");
    }

    async fn wait_for_sync(&self) {
        let mut snapshots = self.cache.subscribe();
        while !snapshots.borrow_and_update().is_synced() {
            if snapshots.changed().await.is_err() {
                return;
            }
        }
        debug!("Caches synced");
    }

    fn spawn_informer<T, S, F>(&self, kind: &'static str, stream: S, handle: F) -> JoinHandle<()>
    where
        T: Send + 'static,
        S: Stream<Item = Result<WatchEvent<T>, StoreError>> + Send + Unpin + 'static,
        F: Fn(&Self, WatchEvent<T>) + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(
            async move {
                let mut stream = stream;
                while let Some(event) = stream.next().await {
                    match event {
                        Ok(event) => handle(&manager, event),
                        Err(e) => warn!(error = %e, "Watch failed"),
                    }
                }
                warn!("Watch stream ended");
            }
            .instrument(tracing::info_span!("informer", kind)),
        )
    }

    fn enqueue(&self, keys: impl IntoIterator<Item = ObjectKey>) {
        for key in keys {
            debug!(%key, "Enqueueing machineset");
            self.queue.add(key);
        }
    }

    fn on_machineset(&self, event: WatchEvent<MachineSet>) {
        let keys = match &event {
            WatchEvent::Added(ms) | WatchEvent::Modified(ms) | WatchEvent::Deleted(ms) => {
                vec![ObjectKey::of(ms)]
            }
            WatchEvent::Restarted(all) => all.iter().map(ObjectKey::of).collect(),
        };
        self.cache.apply_machineset(event);
        self.enqueue(keys);
    }

    fn on_machine(&self, event: WatchEvent<Machine>) {
        // Map against the cache before the event lands so relabelling sees the old labels.
        let snapshot = self.cache.snapshot();
        let keys = match &event {
            WatchEvent::Added(m) | WatchEvent::Modified(m) | WatchEvent::Deleted(m) => {
                map_machine(&snapshot, m)
            }
            WatchEvent::Restarted(all) => all.iter().flat_map(|m| map_machine(&snapshot, m)).collect(),
        };
        self.cache.apply_machine(event);
        self.enqueue(keys);
    }

    fn on_node(&self, event: WatchEvent<Node>) {
        let snapshot = self.cache.snapshot();
        let keys = match &event {
            WatchEvent::Added(n) | WatchEvent::Modified(n) | WatchEvent::Deleted(n) => {
                map_node(&snapshot, n)
            }
            WatchEvent::Restarted(all) => all.iter().flat_map(|n| map_node(&snapshot, n)).collect(),
        };
        self.cache.apply_node(event);
        self.enqueue(keys);
    }

    async fn resync(self) {
        let mut interval = tokio::time::interval(self.config.resync_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately and the informers already enqueue everything.
        interval.tick().await;
        loop {
            interval.tick().await;
            let snapshot = self.cache.snapshot();
            debug!(machinesets = snapshot.machinesets.len(), "Resyncing");
            self.enqueue(snapshot.machinesets.keys().cloned());
        }
    }

    async fn worker(self, mut stop: watch::Receiver<bool>) {
        loop {
            let key = tokio::select! {
                key = self.queue.get() => key,
                _ = stop.changed() => None,
            };
            let Some(key) = key else {
                debug!("Worker stopping");
                return;
            };
            tokio::select! {
                result = self.reconcile(&key) => self.handle_result(&key, result),
                _ = stop.changed() => {
                    debug!(%key, "Reconcile cancelled");
                    self.queue.done(&key);
                    return;
                }
            }
            self.queue.done(&key);
        }
    }

    /// Reconcile a key, turning a panic into a retryable error.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, Error> {
        AssertUnwindSafe(self.reconciler.reconcile(key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::Panicked(panic_message(panic.as_ref()))))
    }

    fn handle_result(&self, key: &ObjectKey, result: Result<Outcome, Error>) {
        match result {
            Ok(outcome) => {
                debug!(%key, ?outcome, "Reconciled");
                self.queue.forget(key);
            }
            Err(e) if e.is_conflict() => {
                debug!(%key, error = %e, "Conflict, requeueing");
                self.queue.add(key.clone());
            }
            Err(e) if e.is_retryable() => {
                warn!(%key, error = %e, requeues = self.queue.num_requeues(key), "Reconcile failed, requeueing with backoff");
                self.queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                error!(%key, error = %e, "Reconcile failed, not retrying until the machineset changes");
                self.queue.forget(key);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
