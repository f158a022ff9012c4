//! Generic multi-worker reconciliation operator
//!
//! Runs an informer that keeps an in-memory cache coherent with an
//! [`ObjectStore`](crate::store::ObjectStore), feeds a deduplicating work
//! queue, and drains it with a pool of workers dispatching to a [`Handler`].
//! The queue serializes work per key: the handler never runs twice
//! concurrently for the same object, and always sees the latest cached
//! version.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{panic_message, OperatorError, Result};
use crate::queue::WorkQueue;
use crate::store::{ObjectKey, ObjectStore, StoreObject, WatchEvent};

/// Resync interval used when none is configured
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// How long `stop` waits for workers to drain before aborting them
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before retrying a failed list or watch call
const RELIST_DELAY: Duration = Duration::from_secs(1);

/// Receives reconciliation dispatches from the worker pool.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Called with the latest cached version of an added or updated object.
    async fn create_or_update(&self, object: Arc<dyn StoreObject>) -> Result<()>;

    /// Called for keys whose object is gone from the cache. Must be
    /// idempotent.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Operator lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Watch-driven reconciler running `num_workers` workers over a keyed
/// work queue.
pub struct MultiWorkerOperator<K> {
    store: Arc<dyn ObjectStore<K>>,
    handler: Arc<dyn Handler>,
    namespace: String,
    num_workers: usize,
    resync_interval: Duration,
    queue: Arc<WorkQueue>,
    cache: Arc<RwLock<HashMap<ObjectKey, Arc<K>>>>,
    state: Mutex<OperatorState>,
    synced: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<K> MultiWorkerOperator<K>
where
    K: StoreObject,
{
    pub fn new(
        store: Arc<dyn ObjectStore<K>>,
        handler: Arc<dyn Handler>,
        namespace: impl Into<String>,
        num_workers: usize,
        resync_interval: Option<Duration>,
    ) -> Arc<Self> {
        let (synced, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            store,
            handler,
            namespace: namespace.into(),
            num_workers: num_workers.max(1),
            resync_interval: resync_interval.unwrap_or(DEFAULT_RESYNC_INTERVAL),
            queue: Arc::new(WorkQueue::new()),
            cache: Arc::new(RwLock::new(HashMap::new())),
            state: Mutex::new(OperatorState::Stopped),
            synced,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> OperatorState {
        *self.state.lock().unwrap()
    }

    /// Start the informer and the worker pool. Blocks until the cache has
    /// completed its initial sync, then returns with workers running.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != OperatorState::Stopped {
                return Err(OperatorError::Configuration(format!(
                    "operator cannot start from state {:?}",
                    *state
                )));
            }
            *state = OperatorState::Starting;
        }

        info!(
            namespace = %self.namespace,
            workers = self.num_workers,
            resync_secs = self.resync_interval.as_secs(),
            "Starting operator",
        );

        let informer = {
            let operator = Arc::clone(&self);
            tokio::spawn(async move { operator.run_informer().await })
        };
        self.tasks.lock().unwrap().push(informer);

        let mut synced = self.synced.subscribe();
        synced.wait_for(|s| *s).await.map_err(|_| {
            OperatorError::Configuration("informer terminated before initial sync".to_string())
        })?;

        for worker_id in 0..self.num_workers {
            let operator = Arc::clone(&self);
            let handle = tokio::spawn(async move { operator.run_worker(worker_id).await });
            self.tasks.lock().unwrap().push(handle);
        }

        *self.state.lock().unwrap() = OperatorState::Running;
        info!("Operator running");
        Ok(())
    }

    /// Stop the operator: shut the queue down, wait for workers to drain
    /// their in-flight item, abort stragglers.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                OperatorState::Running | OperatorState::Starting => {}
                _ => return,
            }
            *state = OperatorState::Stopping;
        }

        info!("Stopping operator");
        let _ = self.shutdown.send(true);
        self.queue.shut_down();

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                warn!("Task did not drain within the deadline; aborting");
                task.abort();
            }
        }

        *self.state.lock().unwrap() = OperatorState::Stopped;
        info!("Operator stopped");
    }

    /// Informer loop: list into the cache, then follow the watch stream.
    /// A broken stream re-watches from the last bookmark; a stream error or
    /// failed watch re-lists from scratch. Resync ticks re-enqueue every
    /// cached key.
    async fn run_informer(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut resync = tokio::time::interval_at(
            Instant::now() + self.resync_interval,
            self.resync_interval,
        );

        'relist: loop {
            if *shutdown.borrow() {
                return;
            }

            let list = match self.store.list(&self.namespace).await {
                Ok(list) => list,
                Err(err) => {
                    warn!(error = %err, "List failed; retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(RELIST_DELAY) => continue 'relist,
                        _ = shutdown.changed() => return,
                    }
                }
            };

            let mut resource_version = list.resource_version;
            {
                let mut cache = self.cache.write().unwrap();
                cache.clear();
                for object in list.items {
                    cache.insert(object.object_key(), Arc::new(object));
                }
            }
            debug!(objects = self.cache.read().unwrap().len(), "Cache synced");
            let _ = self.synced.send(true);
            self.enqueue_all();

            'watch: loop {
                let mut events = match self.store.watch(&self.namespace, &resource_version).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(error = %err, "Watch failed; re-listing");
                        tokio::select! {
                            _ = tokio::time::sleep(RELIST_DELAY) => continue 'relist,
                            _ = shutdown.changed() => return,
                        }
                    }
                };

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = resync.tick() => {
                            debug!("Resync tick; re-enqueueing all cached keys");
                            self.enqueue_all();
                        }
                        event = events.next() => match event {
                            Some(WatchEvent::Added(object))
                            | Some(WatchEvent::Modified(object)) => {
                                let key = object.object_key();
                                self.cache.write().unwrap().insert(key.clone(), Arc::new(object));
                                self.queue.add(key);
                            }
                            Some(WatchEvent::Deleted(object)) => {
                                let key = object.object_key();
                                self.cache.write().unwrap().remove(&key);
                                self.queue.add(key);
                            }
                            Some(WatchEvent::Bookmark(version)) => {
                                resource_version = version;
                            }
                            Some(WatchEvent::Error(err)) => {
                                warn!(error = %err, "Watch stream error; re-listing");
                                continue 'relist;
                            }
                            None => {
                                debug!("Watch stream ended; re-watching");
                                continue 'watch;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Worker loop: pop keys, dispatch against the latest cached object,
    /// requeue failures with backoff.
    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker = worker_id, "Worker started");

        while let Some(key) = self.queue.next().await {
            let cached = { self.cache.read().unwrap().get(&key).cloned() };

            match self.dispatch(&key, cached).await {
                Ok(()) => self.queue.forget(&key),
                Err(err) => {
                    let delay = self.queue.failure_backoff(&key);
                    warn!(
                        key = %key,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Handler failed; requeueing with backoff",
                    );

                    let queue = Arc::clone(&self.queue);
                    let key = key.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        queue.add(key);
                    });
                }
            }

            self.queue.done(&key);
        }

        debug!(worker = worker_id, "Worker stopped");
    }

    /// Dispatch one key. A cache miss means the object was deleted. The
    /// invocation is wrapped in a panic boundary so a non-conforming handler
    /// cannot take the worker down.
    async fn dispatch(&self, key: &ObjectKey, cached: Option<Arc<K>>) -> Result<()> {
        let invocation = async {
            match cached {
                Some(object) => {
                    let object: Arc<dyn StoreObject> = object;
                    self.handler.create_or_update(object).await
                }
                None => self.handler.delete(&key.namespace, &key.name).await,
            }
        };

        match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(OperatorError::Panic(panic_message(payload.as_ref()))),
        }
    }

    fn enqueue_all(&self) {
        let keys: Vec<ObjectKey> = self.cache.read().unwrap().keys().cloned().collect();
        for key in keys {
            self.queue.add(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Function, FunctionSpec};
    use crate::store::{EventStream, ObjectList};
    use kube::api::ObjectMeta;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn test_function(name: &str) -> Function {
        Function {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: FunctionSpec {
                image: "example/fn:latest".to_string(),
                ..serde_json::from_str("{}").unwrap()
            },
            status: None,
        }
    }

    fn event_stream(
        rx: mpsc::UnboundedReceiver<WatchEvent<Function>>,
    ) -> EventStream<Function> {
        Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    struct MockStore {
        objects: Mutex<Vec<Function>>,
        streams: Mutex<VecDeque<EventStream<Function>>>,
    }

    impl MockStore {
        fn new(objects: Vec<Function>) -> Self {
            Self {
                objects: Mutex::new(objects),
                streams: Mutex::new(VecDeque::new()),
            }
        }

        fn with_stream(self, stream: EventStream<Function>) -> Self {
            self.streams.lock().unwrap().push_back(stream);
            self
        }
    }

    #[async_trait]
    impl ObjectStore<Function> for MockStore {
        async fn list(&self, _namespace: &str) -> Result<ObjectList<Function>> {
            Ok(ObjectList {
                items: self.objects.lock().unwrap().clone(),
                resource_version: "1".to_string(),
            })
        }

        async fn watch(
            &self,
            _namespace: &str,
            _resource_version: &str,
        ) -> Result<EventStream<Function>> {
            Ok(self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Box::pin(futures::stream::pending())))
        }

        async fn update(&self, object: &Function) -> Result<Function> {
            Ok(object.clone())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        applied: Mutex<Vec<ObjectKey>>,
        deleted: Mutex<Vec<ObjectKey>>,
        failures_remaining: AtomicUsize,
        in_flight: AtomicUsize,
        overlapped: AtomicBool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn create_or_update(&self, object: Arc<dyn StoreObject>) -> Result<()> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.applied.lock().unwrap().push(object.object_key());

            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(OperatorError::KubeApi("transient".to_string()));
            }
            Ok(())
        }

        async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
            self.deleted
                .lock()
                .unwrap()
                .push(ObjectKey::new(namespace, name));
            Ok(())
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_syncs_and_dispatches_initial_objects() {
        let store = Arc::new(MockStore::new(vec![
            test_function("fn1"),
            test_function("fn2"),
        ]));
        let handler = Arc::new(RecordingHandler::default());
        let operator =
            MultiWorkerOperator::new(store, handler.clone(), "default", 2, None);

        operator.clone().start().await.unwrap();
        assert_eq!(operator.state(), OperatorState::Running);

        wait_until(|| handler.applied.lock().unwrap().len() >= 2).await;
        let applied = handler.applied.lock().unwrap().clone();
        assert!(applied.contains(&ObjectKey::new("default", "fn1")));
        assert!(applied.contains(&ObjectKey::new("default", "fn2")));

        operator.stop().await;
        assert_eq!(operator.state(), OperatorState::Stopped);
    }

    #[tokio::test]
    async fn test_watch_events_dispatch_updates_and_deletes() {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::new(MockStore::new(vec![]).with_stream(event_stream(rx)));
        let handler = Arc::new(RecordingHandler::default());
        let operator =
            MultiWorkerOperator::new(store, handler.clone(), "default", 1, None);

        operator.clone().start().await.unwrap();

        tx.send(WatchEvent::Added(test_function("fn1"))).unwrap();
        wait_until(|| handler.applied.lock().unwrap().len() >= 1).await;

        tx.send(WatchEvent::Deleted(test_function("fn1"))).unwrap();
        wait_until(|| handler.deleted.lock().unwrap().len() >= 1).await;

        assert_eq!(
            handler.deleted.lock().unwrap()[0],
            ObjectKey::new("default", "fn1")
        );

        operator.stop().await;
    }

    #[tokio::test]
    async fn test_handler_errors_requeue_with_backoff() {
        let store = Arc::new(MockStore::new(vec![test_function("fn1")]));
        let handler = Arc::new(RecordingHandler {
            failures_remaining: AtomicUsize::new(2),
            ..Default::default()
        });
        let operator =
            MultiWorkerOperator::new(store, handler.clone(), "default", 1, None);

        operator.clone().start().await.unwrap();

        // two failed rounds plus the succeeding one
        wait_until(|| handler.applied.lock().unwrap().len() >= 3).await;

        operator.stop().await;
    }

    #[tokio::test]
    async fn test_resync_re_enqueues_cached_keys() {
        let store = Arc::new(MockStore::new(vec![test_function("fn1")]));
        let handler = Arc::new(RecordingHandler::default());
        let operator = MultiWorkerOperator::new(
            store,
            handler.clone(),
            "default",
            1,
            Some(Duration::from_millis(50)),
        );

        operator.clone().start().await.unwrap();
        wait_until(|| handler.applied.lock().unwrap().len() >= 3).await;

        operator.stop().await;
    }

    #[tokio::test]
    async fn test_same_key_never_processed_concurrently() {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Arc::new(
            MockStore::new(vec![test_function("fn1")]).with_stream(event_stream(rx)),
        );
        let handler = Arc::new(RecordingHandler {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        });
        let operator =
            MultiWorkerOperator::new(store, handler.clone(), "default", 4, None);

        operator.clone().start().await.unwrap();

        for _ in 0..10 {
            tx.send(WatchEvent::Modified(test_function("fn1"))).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        wait_until(|| handler.applied.lock().unwrap().len() >= 3).await;
        assert!(!handler.overlapped.load(Ordering::SeqCst));

        operator.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let store = Arc::new(MockStore::new(vec![]));
        let handler = Arc::new(RecordingHandler::default());
        let operator = MultiWorkerOperator::new(store, handler, "default", 1, None);

        operator.clone().start().await.unwrap();
        assert!(operator.clone().start().await.is_err());

        operator.stop().await;
    }

    #[tokio::test]
    async fn test_worker_count_clamped_to_one() {
        let store = Arc::new(MockStore::new(vec![test_function("fn1")]));
        let handler = Arc::new(RecordingHandler::default());
        let operator =
            MultiWorkerOperator::new(store, handler.clone(), "default", 0, None);

        operator.clone().start().await.unwrap();
        wait_until(|| handler.applied.lock().unwrap().len() >= 1).await;
        operator.stop().await;
    }
}
