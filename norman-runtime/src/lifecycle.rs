//! Create/update/remove callbacks wrapped in the finalizer protocol
//!
//! A [`LifecycleAdapter`] turns an [`ObjectLifecycle`] into a single controller handler:
//!
//! 1. An object the adapter has not seen yet gets [`ObjectLifecycle::create`], the adapter's
//!    finalizer and a create marker annotation, all persisted in one update.
//! 2. Later reconciliations of a live object run [`ObjectLifecycle::updated`].
//! 3. Once the object is being deleted, [`ObjectLifecycle::remove`] runs and the finalizer is
//!    removed in the same update, which lets the store purge the object. A failing `remove`
//!    keeps the finalizer so the removal is retried. The object is read back from the store
//!    first, so a cached copy that still lists a removed finalizer never triggers `remove` twice.
//!
//! Every callback result is written back only when it differs from the observed object. When a
//! callback fails but hands back an object, that object is persisted before the error propagates.
use crate::controller::{CallbackError, HandlerResult};
use async_trait::async_trait;
use norman_client::{
    core::{Resource, ResourceExt},
    Api,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Finalizer prefix of namespaced lifecycles
pub const FINALIZER_PREFIX: &str = "controller.cattle.io/";
/// Finalizer prefix of cluster-scoped lifecycles
pub const CLUSTER_SCOPED_FINALIZER_PREFIX: &str = "clusterscoped.controller.cattle.io/";
/// Prefix of the annotation recording that `create` ran
pub const CREATE_ANNOTATION_PREFIX: &str = "lifecycle.cattle.io/create.";
/// Prefix of the annotation recording that a cluster-scoped `create` ran
pub const CLUSTER_SCOPED_CREATE_ANNOTATION_PREFIX: &str = "clusterscoped.lifecycle.cattle.io/create.";

/// Failures of the adapter itself, as opposed to its callbacks
#[derive(Debug, Error)]
pub enum Error {
    /// Writing the callback result back failed
    #[error("lifecycle {lifecycle:?} failed to persist {object}: {source}")]
    PersistFailed {
        /// The adapter name
        lifecycle: String,
        /// The object key
        object: String,
        /// The store failure
        #[source]
        source: norman_client::Error,
    },
    /// Reading the live object before `remove` failed
    #[error("lifecycle {lifecycle:?} failed to read {object}: {source}")]
    ReadFailed {
        /// The adapter name
        lifecycle: String,
        /// The object key
        object: String,
        /// The store failure
        #[source]
        source: norman_client::Error,
    },
}

/// Business logic attached to the lifecycle of one kind
///
/// Each callback receives the current object and may return a modified copy to persist, or
/// `None` when there is nothing to write.
#[async_trait]
pub trait ObjectLifecycle<K>: Send + Sync {
    /// Runs once per object, before any `updated`
    async fn create(&self, obj: K) -> HandlerResult<K>;

    /// Runs on every reconciliation of a live object after `create`
    async fn updated(&self, obj: K) -> HandlerResult<K>;

    /// Runs once the object is being deleted, until it succeeds
    async fn remove(&self, obj: K) -> HandlerResult<K>;

    /// Whether `create` does anything; when false no create marker is written
    fn has_create(&self) -> bool {
        true
    }

    /// Whether `remove` does anything; when false no finalizer is added
    fn has_finalize(&self) -> bool {
        true
    }
}

struct FinalizerState {
    has_finalizer: bool,
    is_deleting: bool,
}

impl FinalizerState {
    fn for_object<K: Resource>(obj: &K, finalizer_name: &str) -> Self {
        Self {
            has_finalizer: obj.finalizers().iter().any(|fin| fin == finalizer_name),
            is_deleting: obj.meta().deletion_timestamp.is_some(),
        }
    }
}

/// Drives an [`ObjectLifecycle`] from controller reconciliations
pub struct LifecycleAdapter<K> {
    name: String,
    finalizer: String,
    create_annotation: String,
    api: Api<K>,
    lifecycle: Arc<dyn ObjectLifecycle<K>>,
}

impl<K> std::fmt::Debug for LifecycleAdapter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleAdapter")
            .field("name", &self.name)
            .field("finalizer", &self.finalizer)
            .finish()
    }
}

impl<K> LifecycleAdapter<K>
where
    K: Resource + Clone + Serialize + Send + Sync + 'static,
{
    /// Wrap `lifecycle`, persisting through `api`
    pub fn new(
        name: &str,
        cluster_scoped: bool,
        api: Api<K>,
        lifecycle: Arc<dyn ObjectLifecycle<K>>,
    ) -> Self {
        let (finalizer, annotation) = if cluster_scoped {
            (CLUSTER_SCOPED_FINALIZER_PREFIX, CLUSTER_SCOPED_CREATE_ANNOTATION_PREFIX)
        } else {
            (FINALIZER_PREFIX, CREATE_ANNOTATION_PREFIX)
        };
        Self {
            name: name.to_string(),
            finalizer: format!("{finalizer}{name}"),
            create_annotation: format!("{annotation}{name}"),
            api,
            lifecycle,
        }
    }

    /// The adapter name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The finalizer this adapter adds and removes
    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    /// The annotation marking that `create` ran
    pub fn create_annotation(&self) -> &str {
        &self.create_annotation
    }

    /// Reconcile `key`, whose cached state is `obj` (`None` once it is gone)
    ///
    /// Returns the persisted object, if anything was written or produced.
    pub async fn sync(&self, key: &str, obj: Option<Arc<K>>) -> HandlerResult<K> {
        let Some(observed) = obj else {
            return Ok(None);
        };
        let state = FinalizerState::for_object(&*observed, &self.finalizer);
        match state {
            FinalizerState {
                is_deleting: true,
                has_finalizer: true,
            } => self.finalize(key, &observed).await,
            FinalizerState {
                is_deleting: true,
                has_finalizer: false,
            } => Ok(None),
            FinalizerState {
                is_deleting: false, ..
            } if self.lifecycle.has_create() && !self.is_created(&observed) => {
                self.create(key, &observed).await
            }
            FinalizerState {
                is_deleting: false,
                has_finalizer,
            } => {
                let mut obj = (*observed).clone();
                if !has_finalizer && self.lifecycle.has_finalize() {
                    obj.finalizers_mut().push(self.finalizer.clone());
                }
                let result = self.lifecycle.updated(obj.clone()).await;
                self.record(key, &observed, result.map(|updated| Some(updated.unwrap_or(obj))))
                    .await
            }
        }
    }

    fn is_created(&self, obj: &K) -> bool {
        obj.annotations()
            .get(&self.create_annotation)
            .is_some_and(|v| v == "true")
    }

    async fn create(&self, key: &str, observed: &K) -> HandlerResult<K> {
        let mut prepared = observed.clone();
        if self.lifecycle.has_finalize() && !prepared.finalizers().contains(&self.finalizer) {
            prepared.finalizers_mut().push(self.finalizer.clone());
        }
        tracing::debug!(lifecycle = %self.name, object = key, "running create");
        match self.lifecycle.create(prepared.clone()).await {
            Ok(created) => {
                let mut created = created.unwrap_or(prepared);
                created
                    .annotations_mut()
                    .insert(self.create_annotation.clone(), "true".into());
                self.record(key, observed, Ok(Some(created))).await
            }
            // keep the finalizer even when create fails, but leave the create marker off for the retry
            Err(err) => {
                let (object, source) = err.into_parts();
                let mut object = object.unwrap_or(prepared);
                if self.lifecycle.has_finalize() && !object.finalizers().contains(&self.finalizer) {
                    object.finalizers_mut().push(self.finalizer.clone());
                }
                self.record(key, observed, Err(CallbackError::new(source).with_object(object)))
                    .await
            }
        }
    }

    async fn finalize(&self, key: &str, observed: &K) -> HandlerResult<K> {
        // the cache may lag behind our own finalizer removal, so only the live object decides
        let Some(live) = self.live(key, observed).await? else {
            tracing::trace!(lifecycle = %self.name, object = key, "already purged");
            return Ok(None);
        };
        if !FinalizerState::for_object(&live, &self.finalizer).has_finalizer {
            tracing::trace!(lifecycle = %self.name, object = key, "already finalized");
            return Ok(None);
        }
        tracing::debug!(lifecycle = %self.name, object = key, "running remove");
        match self.lifecycle.remove(live.clone()).await {
            Ok(removed) => {
                let mut removed = removed.unwrap_or_else(|| live.clone());
                removed.finalizers_mut().retain(|fin| fin != &self.finalizer);
                self.record(key, &live, Ok(Some(removed))).await
            }
            Err(err) => self.record(key, &live, Err(err)).await,
        }
    }

    async fn live(&self, key: &str, observed: &K) -> Result<Option<K>, Error> {
        let namespace = observed.namespace().unwrap_or_default();
        match self.api.get_namespaced(&namespace, &observed.name_any()).await {
            Ok(live) => Ok(Some(live)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(source) => Err(Error::ReadFailed {
                lifecycle: self.name.clone(),
                object: key.to_string(),
                source,
            }),
        }
    }

    /// Persist whatever a callback produced, then pass its outcome on
    async fn record(&self, key: &str, observed: &K, result: HandlerResult<K>) -> HandlerResult<K> {
        match result {
            Ok(Some(obj)) => Ok(Some(self.persist(key, observed, obj).await?)),
            Ok(None) => Ok(None),
            Err(err) => {
                let (object, source) = err.into_parts();
                if let Some(obj) = object {
                    if let Err(persist_err) = self.persist(key, observed, obj).await {
                        tracing::warn!(lifecycle = %self.name, object = key, "persist failed: {persist_err}");
                    }
                }
                Err(CallbackError::new(source))
            }
        }
    }

    async fn persist(&self, key: &str, observed: &K, obj: K) -> Result<K, Error> {
        if same_object(observed, &obj) {
            return Ok(obj);
        }
        self.api.update(&obj).await.map_err(|source| Error::PersistFailed {
            lifecycle: self.name.clone(),
            object: key.to_string(),
            source,
        })
    }
}

fn same_object<K: Serialize>(a: &K, b: &K) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{LifecycleAdapter, ObjectLifecycle};
    use crate::{
        controller::{CallbackError, HandlerResult},
        reflector::test_utils::{widget, Widget},
    };
    use async_trait::async_trait;
    use norman_client::{core::params::DeleteParams, core::ResourceExt, Api, MemoryStore, ObjectClient};
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc,
    };

    struct Recorder {
        creates: AtomicUsize,
        updates: AtomicUsize,
        removes: AtomicUsize,
        fail_create: AtomicBool,
        fail_remove: AtomicBool,
        finalize: bool,
    }

    impl Recorder {
        fn new(finalize: bool) -> Arc<Self> {
            Arc::new(Self {
                creates: AtomicUsize::new(0),
                updates: AtomicUsize::new(0),
                removes: AtomicUsize::new(0),
                fail_create: AtomicBool::new(false),
                fail_remove: AtomicBool::new(false),
                finalize,
            })
        }

        fn counts(&self) -> (usize, usize, usize) {
            (
                self.creates.load(SeqCst),
                self.updates.load(SeqCst),
                self.removes.load(SeqCst),
            )
        }
    }

    #[async_trait]
    impl ObjectLifecycle<Widget> for Recorder {
        async fn create(&self, mut obj: Widget) -> HandlerResult<Widget> {
            self.creates.fetch_add(1, SeqCst);
            obj.size = 1;
            if self.fail_create.load(SeqCst) {
                return Err(CallbackError::new("create failed").with_object(obj));
            }
            Ok(Some(obj))
        }

        async fn updated(&self, _obj: Widget) -> HandlerResult<Widget> {
            self.updates.fetch_add(1, SeqCst);
            Ok(None)
        }

        async fn remove(&self, _obj: Widget) -> HandlerResult<Widget> {
            self.removes.fetch_add(1, SeqCst);
            if self.fail_remove.load(SeqCst) {
                return Err(CallbackError::new("remove failed"));
            }
            Ok(None)
        }

        fn has_finalize(&self) -> bool {
            self.finalize
        }
    }

    struct Fixture {
        store: Arc<MemoryStore<Widget>>,
        recorder: Arc<Recorder>,
        adapter: LifecycleAdapter<Widget>,
    }

    impl Fixture {
        async fn new(finalize: bool) -> Self {
            let store = Arc::new(MemoryStore::new());
            store.create(&widget("ns", "a")).await.unwrap();
            let recorder = Recorder::new(finalize);
            let adapter = LifecycleAdapter::new("widgets", false, Api::all(store.clone()), recorder.clone());
            Self {
                store,
                recorder,
                adapter,
            }
        }

        async fn current(&self) -> Option<Arc<Widget>> {
            self.store.get(Some("ns"), "a").await.ok().map(Arc::new)
        }

        async fn sync(&self) -> HandlerResult<Widget> {
            self.adapter.sync("ns/a", self.current().await).await
        }

        async fn delete(&self) {
            self.store
                .delete(Some("ns"), "a", &DeleteParams::default())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn create_runs_once_then_updated_every_time() {
        let f = Fixture::new(true).await;
        f.sync().await.unwrap();
        let stored = f.current().await.unwrap();
        assert_eq!(stored.size, 1);
        assert_eq!(stored.finalizers(), ["controller.cattle.io/widgets"]);
        assert_eq!(
            stored.annotations().get("lifecycle.cattle.io/create.widgets").map(String::as_str),
            Some("true")
        );

        f.sync().await.unwrap();
        f.sync().await.unwrap();
        assert_eq!(f.recorder.counts(), (1, 2, 0));
    }

    #[tokio::test]
    async fn unchanged_results_are_not_written() {
        let f = Fixture::new(true).await;
        f.sync().await.unwrap();
        let revision = f.store.revision();
        f.sync().await.unwrap();
        assert_eq!(f.store.revision(), revision);
    }

    #[tokio::test]
    async fn remove_clears_the_finalizer_and_lets_the_object_go() {
        let f = Fixture::new(true).await;
        f.sync().await.unwrap();
        f.delete().await;
        assert!(f.current().await.unwrap().is_deleting());

        f.sync().await.unwrap();
        assert!(f.current().await.is_none());
        assert_eq!(f.adapter.sync("ns/a", None).await.unwrap(), None);
        assert_eq!(f.recorder.counts(), (1, 0, 1));
    }

    #[tokio::test]
    async fn failed_remove_keeps_the_finalizer_for_a_retry() {
        let f = Fixture::new(true).await;
        f.sync().await.unwrap();
        f.delete().await;
        f.recorder.fail_remove.store(true, SeqCst);

        assert!(f.sync().await.is_err());
        let current = f.current().await.unwrap();
        let finalizers = current.finalizers();
        assert!(finalizers.contains(&"controller.cattle.io/widgets".to_string()));

        f.recorder.fail_remove.store(false, SeqCst);
        f.sync().await.unwrap();
        assert!(f.current().await.is_none());
        assert_eq!(f.recorder.counts(), (1, 0, 2));
    }

    #[tokio::test]
    async fn failed_create_persists_its_object_then_retries() {
        let f = Fixture::new(true).await;
        f.recorder.fail_create.store(true, SeqCst);
        let err = f.sync().await.unwrap_err();
        assert_eq!(err.to_string(), "create failed");

        let stored = f.current().await.unwrap();
        assert_eq!(stored.size, 1);
        assert_eq!(stored.finalizers(), ["controller.cattle.io/widgets"]);
        assert!(stored.annotations().is_empty());

        f.recorder.fail_create.store(false, SeqCst);
        f.sync().await.unwrap();
        assert_eq!(f.recorder.counts(), (2, 0, 0));
    }

    #[tokio::test]
    async fn without_finalize_deletion_is_immediate() {
        let f = Fixture::new(false).await;
        f.sync().await.unwrap();
        assert!(f.current().await.unwrap().finalizers().is_empty());
        f.delete().await;
        assert!(f.current().await.is_none());
        assert_eq!(f.recorder.counts(), (1, 0, 0));
    }

    #[tokio::test]
    async fn stale_copies_do_not_finalize_twice() {
        let f = Fixture::new(true).await;
        let second_recorder = Recorder::new(true);
        let api = Api::all(f.store.clone());
        let second = LifecycleAdapter::new("others", false, api, second_recorder.clone());
        f.sync().await.unwrap();
        second.sync("ns/a", f.current().await).await.unwrap();
        f.delete().await;

        // both finalizers are still listed on this copy
        let stale = f.current().await.unwrap();
        assert_eq!(stale.finalizers().len(), 2);
        let handed_on = f.adapter.sync("ns/a", Some(stale.clone())).await.unwrap();
        second.sync("ns/a", handed_on.map(Arc::new)).await.unwrap();
        assert!(f.current().await.is_none());

        assert_eq!(second.sync("ns/a", Some(stale.clone())).await.unwrap(), None);
        assert_eq!(f.adapter.sync("ns/a", Some(stale)).await.unwrap(), None);
        assert_eq!(f.recorder.counts(), (1, 0, 1));
        assert_eq!(second_recorder.counts(), (1, 0, 1));
    }

    #[tokio::test]
    async fn remove_skips_a_finalizer_already_cleared_in_the_store() {
        let f = Fixture::new(true).await;
        f.sync().await.unwrap();
        let mut held = (*f.current().await.unwrap()).clone();
        held.finalizers_mut().push("test.cattle.io/hold".into());
        f.store.update(&held).await.unwrap();
        f.delete().await;
        let stale = f.current().await.unwrap();

        f.sync().await.unwrap();
        assert_eq!(f.current().await.unwrap().finalizers(), ["test.cattle.io/hold"]);
        assert_eq!(f.adapter.sync("ns/a", Some(stale)).await.unwrap(), None);
        assert_eq!(f.recorder.counts(), (1, 0, 1));
    }

    #[tokio::test]
    async fn cluster_scoped_markers_are_distinct() {
        let store = Arc::new(MemoryStore::<Widget>::new());
        let adapter = LifecycleAdapter::new("widgets_c1", true, Api::all(store), Recorder::new(true));
        assert_eq!(adapter.finalizer(), "clusterscoped.controller.cattle.io/widgets_c1");
        assert_eq!(
            adapter.create_annotation(),
            "clusterscoped.lifecycle.cattle.io/create.widgets_c1"
        );
    }
}
