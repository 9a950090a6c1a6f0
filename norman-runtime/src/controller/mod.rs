//! The generic controller: a watch-fed cache plus ordered, named handlers run per key
use crate::{
    reflector::{self, reflector, store::Writer, ObjectRef, Store},
    utils::{exponential, StreamBackoff},
    watcher::{self, watcher},
    WorkQueue,
};
use futures::{future::Future, pin_mut, FutureExt, StreamExt};
use norman_client::{core::Resource, Api, BoxError};
use parking_lot::{Mutex, RwLock};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

mod handler;
mod lister;

pub use handler::{
    object_in_cluster, CallbackError, FeatureGate, HandlerFn, HandlerResult, CLUSTER_NAME_LABEL,
    PROJECT_ID_ANNOTATION,
};
use handler::Handler;
pub use lister::Lister;

/// Failures surfaced by a [`GenericController`] and its [`Lister`]
#[derive(Debug, Error)]
pub enum Error {
    /// A handler with this name is already registered on the controller
    #[error("handler {0:?} is already registered")]
    DuplicateHandler(String),
    /// The cancellation token fired before the cache was seeded
    #[error("controller {0:?} was cancelled before its cache synced")]
    SyncCancelled(String),
    /// The cache holds no object under this key
    #[error("{0} not found")]
    NotFound(String),
    /// A handler failed, the remaining handlers were skipped
    #[error("handler {handler:?} failed: {source}")]
    HandlerFailed {
        /// The name of the failing handler
        handler: String,
        /// What it failed with
        #[source]
        source: BoxError,
    },
}

/// Tuning for a [`GenericController`]
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// First delay before a failed key is retried
    pub retry_base: Duration,
    /// Ceiling for the retry delay of a key
    pub retry_cap: Duration,
    /// First pause after a watch error
    pub watch_backoff_base: Duration,
    /// Ceiling for the pause after watch errors
    pub watch_backoff_cap: Duration,
    /// Which objects the controller follows
    pub watcher: watcher::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_millis(5),
            retry_cap: Duration::from_secs(1000),
            watch_backoff_base: Duration::from_millis(800),
            watch_backoff_cap: Duration::from_secs(30),
            watcher: watcher::Config::default(),
        }
    }
}

impl Config {
    /// Set the per-key retry backoff
    #[must_use]
    pub fn retry_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.retry_base = base;
        self.retry_cap = cap;
        self
    }

    /// Set the backoff applied after watch errors
    #[must_use]
    pub fn watch_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.watch_backoff_base = base;
        self.watch_backoff_cap = cap;
        self
    }

    /// Restrict the watched objects
    #[must_use]
    pub fn watcher(mut self, watcher: watcher::Config) -> Self {
        self.watcher = watcher;
        self
    }
}

struct Inner<K> {
    name: String,
    api: Api<K>,
    store: Store<K>,
    /// Taken by the watch task when it starts
    writer: Mutex<Option<Writer<K>>>,
    handlers: RwLock<Vec<Arc<Handler<K>>>>,
    queue: WorkQueue<ObjectRef>,
    config: Config,
    workers_started: AtomicBool,
    shutdown: CancellationToken,
}

/// Mirrors one kind into an indexed cache and reconciles every changed key through its handlers
///
/// Handlers run in registration order. The first failing handler aborts the rest and the key is
/// retried after a per-key exponential backoff that resets once a reconciliation succeeds.
/// Reconciliations of one key never overlap; distinct keys are processed concurrently by the
/// workers spawned in [`start`](Self::start).
pub struct GenericController<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for GenericController<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> std::fmt::Debug for GenericController<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericController")
            .field("name", &self.inner.name)
            .field("handlers", &self.inner.handlers.read().len())
            .finish()
    }
}

fn boxed<K, F, Fut>(handler: F) -> HandlerFn<K>
where
    K: 'static,
    F: Fn(String, Option<Arc<K>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<K>> + Send + 'static,
{
    Arc::new(move |key, obj| handler(key, obj).boxed())
}

impl<K> GenericController<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// A controller called `name` over the objects reachable through `api`
    pub fn new(name: &str, api: Api<K>, config: Config) -> Self {
        let (store, writer) = reflector::store();
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                api,
                store,
                writer: Mutex::new(Some(writer)),
                handlers: RwLock::default(),
                queue: WorkQueue::new(config.retry_base, config.retry_cap),
                config,
                workers_started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The controller name, used in logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The client the controller lists and watches through
    pub fn api(&self) -> &Api<K> {
        &self.inner.api
    }

    /// The indexed cache
    pub fn store(&self) -> &Store<K> {
        &self.inner.store
    }

    /// A read-only view of the cache
    pub fn lister(&self) -> Lister<K> {
        Lister::new(self.inner.store.clone())
    }

    /// Run `handler` for every changed key
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateHandler`] if `name` is taken on this controller.
    pub fn add_handler<F, Fut>(&self, name: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(String, Option<Arc<K>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<K>> + Send + 'static,
    {
        self.register(name, None, None, boxed(handler))
    }

    /// Like [`add_handler`](Self::add_handler), skipped whenever `enabled` returns false
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateHandler`] if `name` is taken on this controller.
    pub fn add_feature_handler<G, F, Fut>(&self, enabled: G, name: &str, handler: F) -> Result<(), Error>
    where
        G: Fn() -> bool + Send + Sync + 'static,
        F: Fn(String, Option<Arc<K>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<K>> + Send + 'static,
    {
        self.register(name, Some(Arc::new(enabled)), None, boxed(handler))
    }

    /// Like [`add_handler`](Self::add_handler), only dispatched for objects of `cluster`
    ///
    /// See [`object_in_cluster`]. Deletions always reach the handler.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateHandler`] if `name` is taken on this controller.
    pub fn add_cluster_scoped_handler<F, Fut>(
        &self,
        name: &str,
        cluster: &str,
        handler: F,
    ) -> Result<(), Error>
    where
        F: Fn(String, Option<Arc<K>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<K>> + Send + 'static,
    {
        self.register(name, None, Some(cluster.to_string()), boxed(handler))
    }

    /// Both a feature gate and a cluster filter, the gate is checked first
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateHandler`] if `name` is taken on this controller.
    pub fn add_cluster_scoped_feature_handler<G, F, Fut>(
        &self,
        enabled: G,
        name: &str,
        cluster: &str,
        handler: F,
    ) -> Result<(), Error>
    where
        G: Fn() -> bool + Send + Sync + 'static,
        F: Fn(String, Option<Arc<K>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<K>> + Send + 'static,
    {
        self.register(name, Some(Arc::new(enabled)), Some(cluster.to_string()), boxed(handler))
    }

    fn register(
        &self,
        name: &str,
        gate: Option<FeatureGate>,
        cluster: Option<String>,
        callback: HandlerFn<K>,
    ) -> Result<(), Error> {
        let mut handlers = self.inner.handlers.write();
        if handlers.iter().any(|h| h.name == name) {
            return Err(Error::DuplicateHandler(name.to_string()));
        }
        tracing::debug!(controller = %self.inner.name, handler = name, "registered handler");
        handlers.push(Arc::new(Handler {
            name: name.to_string(),
            gate,
            cluster,
            callback,
        }));
        Ok(())
    }

    /// Force a reconciliation of `namespace/name`
    pub fn enqueue(&self, namespace: &str, name: &str) {
        self.inner.queue.add(ObjectRef::new(name).within(namespace));
    }

    /// Start the watch task, once, and wait until the cache is seeded by the first full list
    ///
    /// The watch task runs until `token` is cancelled or [`shutdown`](Self::shutdown) is called.
    ///
    /// # Errors
    ///
    /// [`Error::SyncCancelled`] if the token fires first.
    pub async fn sync(&self, token: &CancellationToken) -> Result<(), Error> {
        let writer = self.inner.writer.lock().take();
        if let Some(writer) = writer {
            tracing::info!(controller = %self.inner.name, "starting watch");
            tokio::spawn(watch_loop(self.inner.clone(), writer, token.clone()));
        }
        tokio::select! {
            _ = token.cancelled() => Err(Error::SyncCancelled(self.inner.name.clone())),
            ready = self.inner.store.wait_until_ready() => {
                ready.map_err(|_| Error::SyncCancelled(self.inner.name.clone()))
            }
        }
    }

    /// [`sync`](Self::sync), then spawn `threadiness` workers, once
    ///
    /// # Errors
    ///
    /// [`Error::SyncCancelled`] if the token fires before the cache is seeded.
    pub async fn start(&self, token: &CancellationToken, threadiness: usize) -> Result<(), Error> {
        self.sync(token).await?;
        if self.inner.workers_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(controller = %self.inner.name, threadiness, "starting workers");
        for _ in 0..threadiness.max(1) {
            tokio::spawn(run_worker(self.inner.clone()));
        }
        Ok(())
    }

    /// Stop the watch task and the workers; in-flight reconciliations run to completion
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.queue.shut_down();
    }
}

async fn watch_loop<K>(inner: Arc<Inner<K>>, writer: Writer<K>, token: CancellationToken)
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let config = &inner.config;
    let events = StreamBackoff::new(
        watcher(inner.api.clone(), config.watcher.clone()),
        exponential(config.watch_backoff_base, config.watch_backoff_cap),
    );
    let touched = reflector(writer, events);
    pin_mut!(touched);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = inner.shutdown.cancelled() => break,
            next = touched.next() => match next {
                Some(Ok(keys)) => keys.into_iter().for_each(|key| inner.queue.add(key)),
                Some(Err(err)) => tracing::warn!(controller = %inner.name, "watch failed, retrying: {err}"),
                None => break,
            },
        }
    }
    tracing::debug!(controller = %inner.name, "watch stopped");
    inner.queue.shut_down();
}

async fn run_worker<K>(inner: Arc<Inner<K>>)
where
    K: Resource + Clone + Send + Sync + 'static,
{
    while let Some(key) = inner.queue.get().await {
        let span = tracing::info_span!("reconciling", controller = %inner.name, object.ref = %key);
        match reconcile(&inner, &key).instrument(span).await {
            Ok(()) => inner.queue.forget(&key),
            Err(err) => {
                let delay = inner.queue.add_rate_limited(key.clone());
                tracing::warn!(
                    controller = %inner.name,
                    object.ref = %key,
                    ?delay,
                    "reconcile failed: {err}"
                );
            }
        }
        inner.queue.done(&key);
    }
}

/// Run every accepted handler for `key` in order, stopping at the first failure
///
/// Each handler sees the object produced by the handler before it, starting from the cached state.
async fn reconcile<K>(inner: &Inner<K>, key: &ObjectRef) -> Result<(), Error>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let mut obj = inner.store.get(key);
    let handlers = inner.handlers.read().clone();
    for handler in handlers {
        if !handler.accepts(obj.as_deref()) {
            tracing::trace!(handler = %handler.name, "skipped");
            continue;
        }
        match (handler.callback)(key.to_string(), obj.clone()).await {
            Ok(Some(updated)) => obj = Some(Arc::new(updated)),
            Ok(None) => {}
            Err(err) => {
                let (_, source) = err.into_parts();
                return Err(Error::HandlerFailed {
                    handler: handler.name.clone(),
                    source,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{CallbackError, Config, Error, GenericController};
    use crate::reflector::test_utils::{widget, Widget};
    use norman_client::{core::params::DeleteParams, Api, MemoryStore, ObjectClient};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering::SeqCst},
            Arc,
        },
        time::Duration,
    };
    use tokio::{sync::mpsc, time::timeout};
    use tokio_util::sync::CancellationToken;

    const WAIT: Duration = Duration::from_secs(5);

    async fn setup(names: &[&str]) -> (Arc<MemoryStore<Widget>>, GenericController<Widget>) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let store = Arc::new(MemoryStore::new());
        for key in names {
            let (ns, name) = key.split_once('/').unwrap();
            store.create(&widget(ns, name)).await.unwrap();
        }
        let controller = GenericController::new("widgets", Api::all(store.clone()), Config::default());
        (store, controller)
    }

    fn recording(
        controller: &GenericController<Widget>,
        name: &'static str,
    ) -> mpsc::UnboundedReceiver<(&'static str, String, bool)> {
        let (tx, rx) = mpsc::unbounded_channel();
        controller
            .add_handler(name, move |key, obj| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((name, key, obj.is_some()));
                    Ok(None)
                }
            })
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn listed_objects_are_reconciled() {
        let (_store, controller) = setup(&["ns/a"]).await;
        let mut calls = recording(&controller, "h1");
        let token = CancellationToken::new();
        controller.start(&token, 2).await.unwrap();
        assert_eq!(controller.store().len(), 1);
        assert_eq!(timeout(WAIT, calls.recv()).await.unwrap(), Some(("h1", "ns/a".into(), true)));
        token.cancel();
    }

    #[tokio::test]
    async fn handler_names_are_unique() {
        let (_store, controller) = setup(&[]).await;
        let _calls = recording(&controller, "h1");
        let err = controller
            .add_handler("h1", |_, _| async { Ok(None) })
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateHandler(name) if name == "h1"));
    }

    #[tokio::test]
    async fn sync_reports_cancellation() {
        let (_store, controller) = setup(&[]).await;
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(controller.sync(&token).await, Err(Error::SyncCancelled(_))));
    }

    #[tokio::test]
    async fn failing_handler_blocks_the_rest_until_it_succeeds() {
        let (_store, controller) = setup(&["ns/b"]).await;
        let attempts = Arc::new(AtomicUsize::new(0));
        controller
            .add_handler("h1", {
                let attempts = attempts.clone();
                move |_, _| {
                    let attempt = attempts.fetch_add(1, SeqCst);
                    async move {
                        if attempt < 2 {
                            return Err(CallbackError::new("not yet"));
                        }
                        Ok(None)
                    }
                }
            })
            .unwrap();
        let mut calls = recording(&controller, "h2");
        let token = CancellationToken::new();
        controller.start(&token, 1).await.unwrap();

        assert_eq!(timeout(WAIT, calls.recv()).await.unwrap(), Some(("h2", "ns/b".into(), true)));
        assert_eq!(attempts.load(SeqCst), 3);
        token.cancel();
    }

    #[tokio::test]
    async fn deletions_and_enqueues_are_dispatched() {
        let (store, controller) = setup(&["ns/a"]).await;
        let mut calls = recording(&controller, "h1");
        let token = CancellationToken::new();
        controller.start(&token, 1).await.unwrap();
        assert_eq!(timeout(WAIT, calls.recv()).await.unwrap(), Some(("h1", "ns/a".into(), true)));

        controller.enqueue("ns", "a");
        assert_eq!(timeout(WAIT, calls.recv()).await.unwrap(), Some(("h1", "ns/a".into(), true)));

        store.delete(Some("ns"), "a", &DeleteParams::default()).await.unwrap();
        assert_eq!(timeout(WAIT, calls.recv()).await.unwrap(), Some(("h1", "ns/a".into(), false)));
        assert!(controller.lister().get("ns", "a").is_err());
        token.cancel();
    }

    #[tokio::test]
    async fn cluster_scoped_handlers_only_see_their_cluster() {
        let (_store, controller) = setup(&["c1/a", "c2/a"]).await;
        let (tx, mut scoped) = mpsc::unbounded_channel();
        controller
            .add_cluster_scoped_handler("scoped", "c1", move |key, _| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(key);
                    Ok(None)
                }
            })
            .unwrap();
        let mut tail = recording(&controller, "tail");
        let token = CancellationToken::new();
        controller.start(&token, 1).await.unwrap();

        for _ in 0..2 {
            timeout(WAIT, tail.recv()).await.unwrap();
        }
        assert_eq!(scoped.try_recv().ok(), Some("c1/a".to_string()));
        assert!(scoped.try_recv().is_err());
        token.cancel();
    }

    #[tokio::test]
    async fn disabled_feature_handlers_are_skipped() {
        let (_store, controller) = setup(&["ns/a"]).await;
        let gated = Arc::new(AtomicUsize::new(0));
        controller
            .add_feature_handler(|| false, "gated", {
                let gated = gated.clone();
                move |_, _| {
                    gated.fetch_add(1, SeqCst);
                    async { Ok(None) }
                }
            })
            .unwrap();
        let mut tail = recording(&controller, "tail");
        let token = CancellationToken::new();
        controller.start(&token, 1).await.unwrap();
        timeout(WAIT, tail.recv()).await.unwrap();
        assert_eq!(gated.load(SeqCst), 0);
        token.cancel();
    }

    #[tokio::test]
    async fn cancelling_the_token_stops_the_workers() {
        let (_store, controller) = setup(&["ns/a"]).await;
        let mut calls = recording(&controller, "h1");
        let token = CancellationToken::new();
        controller.start(&token, 2).await.unwrap();
        timeout(WAIT, calls.recv()).await.unwrap();

        token.cancel();
        timeout(WAIT, async {
            while !controller.inner.queue.is_shutting_down() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        controller.enqueue("ns", "a");
        assert!(controller.inner.queue.is_empty());
        assert!(timeout(Duration::from_millis(100), calls.recv()).await.is_err());
    }

    #[tokio::test]
    async fn deleted_keys_stop_retrying() {
        let (store, controller) = setup(&["ns/a"]).await;
        let attempts = Arc::new(AtomicUsize::new(0));
        controller
            .add_handler("present-only", {
                let attempts = attempts.clone();
                move |_, obj| {
                    attempts.fetch_add(1, SeqCst);
                    async move {
                        match obj {
                            Some(_) => Err(CallbackError::new("still there")),
                            None => Ok(None),
                        }
                    }
                }
            })
            .unwrap();
        let token = CancellationToken::new();
        controller.start(&token, 1).await.unwrap();

        let queue = controller.inner.queue.clone();
        timeout(WAIT, async {
            while attempts.load(SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(queue.retrying(), 1);

        store.delete(Some("ns"), "a", &DeleteParams::default()).await.unwrap();
        timeout(WAIT, async {
            while queue.retrying() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        token.cancel();
    }
}
