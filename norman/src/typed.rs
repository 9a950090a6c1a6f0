//! The per-kind facade over the registry, the object client and the runtime
//!
//! [`Interface`] is the full surface for one kind in one namespace: CRUD against the object client
//! plus handler and lifecycle registration on the shared controller. [`TypedClient`] narrows it to the
//! common case of reacting to creates, changes and removals, and [`ClientCache`] reads the cache.
use crate::registry::Registry;
use async_trait::async_trait;
use futures::{
    future::{BoxFuture, Future},
    stream::BoxStream,
    FutureExt,
};
use norman_client::{
    core::{
        labels::Selector,
        params::{DeleteParams, ListParams, Patch, WatchParams},
        ObjectList, Resource, WatchEvent,
    },
    Api, ObjectClient, Result,
};
use norman_runtime::{
    controller::{self, GenericController, HandlerResult},
    reflector::store,
    LifecycleAdapter, ObjectLifecycle,
};
use serde::Serialize;
use std::{fmt, sync::Arc};

/// A handler as stored on the controller
type SyncFn<K> = Arc<dyn Fn(String, Option<Arc<K>>) -> BoxFuture<'static, HandlerResult<K>> + Send + Sync>;

/// A single lifecycle callback, see [`TypedClient::on_change`]
type ChangeFn<K> = Arc<dyn Fn(K) -> BoxFuture<'static, HandlerResult<K>> + Send + Sync>;

fn lifecycle_handler<K>(adapter: LifecycleAdapter<K>) -> SyncFn<K>
where
    K: Resource + Clone + Serialize + Send + Sync + 'static,
{
    let adapter = Arc::new(adapter);
    Arc::new(move |key, obj| {
        let adapter = adapter.clone();
        async move { adapter.sync(&key, obj).await }.boxed()
    })
}

/// Everything the facade offers for one kind in one namespace
///
/// The controller behind [`controller`](Self::controller) is created on first use and shared, through the
/// [`Registry`], with every other `Interface` for the same kind and namespace.
pub struct Interface<K> {
    registry: Arc<Registry>,
    client: Arc<dyn ObjectClient<K>>,
    api: Api<K>,
    namespace: String,
}

impl<K> Clone for Interface<K> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            client: self.client.clone(),
            api: self.api.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

impl<K> fmt::Debug for Interface<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl<K> Interface<K>
where
    K: Resource + Clone + Serialize + Send + Sync + 'static,
{
    /// The facade for `K` in `namespace` (empty for every namespace)
    pub fn new(registry: Arc<Registry>, client: Arc<dyn ObjectClient<K>>, namespace: &str) -> Self {
        let api = Api::namespaced(client.clone(), namespace);
        Self {
            registry,
            client,
            api,
            namespace: namespace.to_string(),
        }
    }

    /// The namespace this facade is bound to, empty for every namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The object client behind this facade
    pub fn object_client(&self) -> &Arc<dyn ObjectClient<K>> {
        &self.client
    }

    /// The namespaced [`Api`] this facade writes through
    pub fn api(&self) -> &Api<K> {
        &self.api
    }

    /// See [`Api::create`]
    pub async fn create(&self, obj: &K) -> Result<K> {
        self.api.create(obj).await
    }

    /// See [`Api::get`]
    pub async fn get(&self, name: &str) -> Result<K> {
        self.api.get(name).await
    }

    /// See [`Api::get_namespaced`]
    pub async fn get_namespaced(&self, namespace: &str, name: &str) -> Result<K> {
        self.api.get_namespaced(namespace, name).await
    }

    /// See [`Api::update`]
    pub async fn update(&self, obj: &K) -> Result<K> {
        self.api.update(obj).await
    }

    /// See [`Api::delete`]
    pub async fn delete(&self, name: &str, dp: &DeleteParams) -> Result<()> {
        self.api.delete(name, dp).await
    }

    /// See [`Api::delete_namespaced`]
    pub async fn delete_namespaced(&self, namespace: &str, name: &str, dp: &DeleteParams) -> Result<()> {
        self.api.delete_namespaced(namespace, name, dp).await
    }

    /// See [`Api::delete_collection`]
    pub async fn delete_collection(&self, dp: &DeleteParams, lp: &ListParams) -> Result<()> {
        self.api.delete_collection(dp, lp).await
    }

    /// See [`Api::list`]
    pub async fn list(&self, lp: &ListParams) -> Result<ObjectList<K>> {
        self.api.list(lp).await
    }

    /// See [`Api::watch`]
    pub async fn watch(
        &self,
        wp: &WatchParams,
        version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        self.api.watch(wp, version).await
    }

    /// See [`Api::patch_object`]
    pub async fn patch(&self, obj: &K, patch: &Patch) -> Result<K> {
        self.api.patch_object(obj, patch).await
    }

    /// The shared controller for this kind and namespace
    pub fn controller(&self) -> GenericController<K> {
        self.registry.controller(&self.client, &self.namespace)
    }

    /// See [`GenericController::add_handler`]
    ///
    /// # Errors
    ///
    /// [`controller::Error::DuplicateHandler`] if `name` is taken.
    pub fn add_handler<F, Fut>(&self, name: &str, handler: F) -> Result<(), controller::Error>
    where
        F: Fn(String, Option<Arc<K>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<K>> + Send + 'static,
    {
        self.controller().add_handler(name, handler)
    }

    /// See [`GenericController::add_feature_handler`]
    ///
    /// # Errors
    ///
    /// [`controller::Error::DuplicateHandler`] if `name` is taken.
    pub fn add_feature_handler<G, F, Fut>(
        &self,
        enabled: G,
        name: &str,
        handler: F,
    ) -> Result<(), controller::Error>
    where
        G: Fn() -> bool + Send + Sync + 'static,
        F: Fn(String, Option<Arc<K>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<K>> + Send + 'static,
    {
        self.controller().add_feature_handler(enabled, name, handler)
    }

    /// See [`GenericController::add_cluster_scoped_handler`]
    ///
    /// # Errors
    ///
    /// [`controller::Error::DuplicateHandler`] if `name` is taken.
    pub fn add_cluster_scoped_handler<F, Fut>(
        &self,
        name: &str,
        cluster: &str,
        handler: F,
    ) -> Result<(), controller::Error>
    where
        F: Fn(String, Option<Arc<K>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<K>> + Send + 'static,
    {
        self.controller().add_cluster_scoped_handler(name, cluster, handler)
    }

    /// See [`GenericController::add_cluster_scoped_feature_handler`]
    ///
    /// # Errors
    ///
    /// [`controller::Error::DuplicateHandler`] if `name` is taken.
    pub fn add_cluster_scoped_feature_handler<G, F, Fut>(
        &self,
        enabled: G,
        name: &str,
        cluster: &str,
        handler: F,
    ) -> Result<(), controller::Error>
    where
        G: Fn() -> bool + Send + Sync + 'static,
        F: Fn(String, Option<Arc<K>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<K>> + Send + 'static,
    {
        self.controller()
            .add_cluster_scoped_feature_handler(enabled, name, cluster, handler)
    }

    fn adapter(&self, name: &str, cluster_scoped: bool, lifecycle: Arc<dyn ObjectLifecycle<K>>) -> SyncFn<K> {
        lifecycle_handler(LifecycleAdapter::new(
            name,
            cluster_scoped,
            self.api.clone(),
            lifecycle,
        ))
    }

    /// Register `lifecycle` as a handler called `name`, see [`LifecycleAdapter`]
    ///
    /// # Errors
    ///
    /// [`controller::Error::DuplicateHandler`] if `name` is taken.
    pub fn add_lifecycle(
        &self,
        name: &str,
        lifecycle: Arc<dyn ObjectLifecycle<K>>,
    ) -> Result<(), controller::Error> {
        let sync = self.adapter(name, false, lifecycle);
        self.controller().add_handler(name, move |key, obj| sync(key, obj))
    }

    /// Like [`add_lifecycle`](Self::add_lifecycle), skipped whenever `enabled` returns false
    ///
    /// # Errors
    ///
    /// [`controller::Error::DuplicateHandler`] if `name` is taken.
    pub fn add_feature_lifecycle<G>(
        &self,
        enabled: G,
        name: &str,
        lifecycle: Arc<dyn ObjectLifecycle<K>>,
    ) -> Result<(), controller::Error>
    where
        G: Fn() -> bool + Send + Sync + 'static,
    {
        let sync = self.adapter(name, false, lifecycle);
        self.controller()
            .add_feature_handler(enabled, name, move |key, obj| sync(key, obj))
    }

    /// Register `lifecycle` for the objects of `cluster` only
    ///
    /// The adapter is named `<name>_<cluster>` and uses the cluster-scoped markers, so the same
    /// lifecycle can be registered once per cluster without the finalizers colliding.
    ///
    /// # Errors
    ///
    /// [`controller::Error::DuplicateHandler`] if `name` is taken.
    pub fn add_cluster_scoped_lifecycle(
        &self,
        name: &str,
        cluster: &str,
        lifecycle: Arc<dyn ObjectLifecycle<K>>,
    ) -> Result<(), controller::Error> {
        let sync = self.adapter(&format!("{name}_{cluster}"), true, lifecycle);
        self.controller()
            .add_cluster_scoped_handler(name, cluster, move |key, obj| sync(key, obj))
    }

    /// Both a feature gate and a cluster filter, see
    /// [`add_cluster_scoped_lifecycle`](Self::add_cluster_scoped_lifecycle)
    ///
    /// # Errors
    ///
    /// [`controller::Error::DuplicateHandler`] if `name` is taken.
    pub fn add_cluster_scoped_feature_lifecycle<G>(
        &self,
        enabled: G,
        name: &str,
        cluster: &str,
        lifecycle: Arc<dyn ObjectLifecycle<K>>,
    ) -> Result<(), controller::Error>
    where
        G: Fn() -> bool + Send + Sync + 'static,
    {
        let sync = self.adapter(&format!("{name}_{cluster}"), true, lifecycle);
        self.controller()
            .add_cluster_scoped_feature_handler(enabled, name, cluster, move |key, obj| sync(key, obj))
    }
}

/// An [`ObjectLifecycle`] made of at most one callback per operation
///
/// Missing operations hand the object back unchanged. `has_create` and `has_finalize` report
/// whether the create and remove callbacks exist.
struct LifecycleDelegate<K> {
    create: Option<ChangeFn<K>>,
    update: Option<ChangeFn<K>>,
    remove: Option<ChangeFn<K>>,
}

impl<K> Default for LifecycleDelegate<K> {
    fn default() -> Self {
        Self {
            create: None,
            update: None,
            remove: None,
        }
    }
}

async fn delegate<K>(callback: Option<&ChangeFn<K>>, obj: K) -> HandlerResult<K> {
    match callback {
        Some(callback) => callback(obj).await,
        None => Ok(Some(obj)),
    }
}

#[async_trait]
impl<K> ObjectLifecycle<K> for LifecycleDelegate<K>
where
    K: Send + Sync + 'static,
{
    async fn create(&self, obj: K) -> HandlerResult<K> {
        delegate(self.create.as_ref(), obj).await
    }

    async fn updated(&self, obj: K) -> HandlerResult<K> {
        delegate(self.update.as_ref(), obj).await
    }

    async fn remove(&self, obj: K) -> HandlerResult<K> {
        delegate(self.remove.as_ref(), obj).await
    }

    fn has_create(&self) -> bool {
        self.create.is_some()
    }

    fn has_finalize(&self) -> bool {
        self.remove.is_some()
    }
}

fn change_fn<K, F, Fut>(callback: F) -> ChangeFn<K>
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<K>> + Send + 'static,
{
    Arc::new(move |obj| callback(obj).boxed())
}

/// Reacts to creates, changes and removals of one kind
///
/// Each registration becomes its own lifecycle on the shared controller:
///
/// - [`on_create`](Self::on_create) is named `<name>-create` and runs once per object,
/// - [`on_change`](Self::on_change) is named `<name>-change` and runs on every reconciliation,
/// - [`on_remove`](Self::on_remove) is named `<name>` and holds a finalizer until it succeeds.
pub struct TypedClient<K> {
    iface: Interface<K>,
}

impl<K> Clone for TypedClient<K> {
    fn clone(&self) -> Self {
        Self {
            iface: self.iface.clone(),
        }
    }
}

impl<K> fmt::Debug for TypedClient<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedClient").field("iface", &self.iface).finish()
    }
}

impl<K> TypedClient<K>
where
    K: Resource + Clone + Serialize + Send + Sync + 'static,
{
    /// Narrow `iface`
    pub fn new(iface: Interface<K>) -> Self {
        Self { iface }
    }

    /// The full facade
    pub fn interface(&self) -> &Interface<K> {
        &self.iface
    }

    /// The shared controller
    pub fn generic(&self) -> GenericController<K> {
        self.iface.controller()
    }

    /// The object client behind this facade
    pub fn object_client(&self) -> &Arc<dyn ObjectClient<K>> {
        self.iface.object_client()
    }

    /// Force a reconciliation of `namespace/name`
    pub fn enqueue(&self, namespace: &str, name: &str) {
        self.generic().enqueue(namespace, name);
    }

    /// Create an object
    pub async fn create(&self, obj: &K) -> Result<K> {
        self.iface.create(obj).await
    }

    /// Get `name` from `namespace`
    pub async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        self.iface.get_namespaced(namespace, name).await
    }

    /// Replace an object with a new version
    pub async fn update(&self, obj: &K) -> Result<K> {
        self.iface.update(obj).await
    }

    /// Delete `name` from `namespace`
    pub async fn delete(&self, namespace: &str, name: &str, dp: &DeleteParams) -> Result<()> {
        self.iface.delete_namespaced(namespace, name, dp).await
    }

    /// List objects in the bound namespace
    pub async fn list(&self, lp: &ListParams) -> Result<ObjectList<K>> {
        self.iface.list(lp).await
    }

    /// Watch objects in the bound namespace, starting after `version`
    pub async fn watch(
        &self,
        wp: &WatchParams,
        version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        self.iface.watch(wp, version).await
    }

    /// A read view of the shared controller's cache
    pub fn cache(&self) -> ClientCache<K> {
        ClientCache {
            controller: self.generic(),
        }
    }

    fn register(&self, name: &str, delegate: LifecycleDelegate<K>) -> Result<(), controller::Error> {
        self.iface.add_lifecycle(name, Arc::new(delegate))
    }

    /// Run `callback` once for every object, as the lifecycle `<name>-create`
    ///
    /// # Errors
    ///
    /// [`controller::Error::DuplicateHandler`] if `name` was already used for `on_create`.
    pub fn on_create<F, Fut>(&self, name: &str, callback: F) -> Result<(), controller::Error>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<K>> + Send + 'static,
    {
        self.register(&format!("{name}-create"), LifecycleDelegate {
            create: Some(change_fn(callback)),
            ..LifecycleDelegate::default()
        })
    }

    /// Run `callback` on every reconciliation of a live object, as the lifecycle `<name>-change`
    ///
    /// # Errors
    ///
    /// [`controller::Error::DuplicateHandler`] if `name` was already used for `on_change`.
    pub fn on_change<F, Fut>(&self, name: &str, callback: F) -> Result<(), controller::Error>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<K>> + Send + 'static,
    {
        self.register(&format!("{name}-change"), LifecycleDelegate {
            update: Some(change_fn(callback)),
            ..LifecycleDelegate::default()
        })
    }

    /// Run `callback` when an object is deleted, holding it back until `callback` succeeds
    ///
    /// # Errors
    ///
    /// [`controller::Error::DuplicateHandler`] if `name` was already used for `on_remove`.
    pub fn on_remove<F, Fut>(&self, name: &str, callback: F) -> Result<(), controller::Error>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<K>> + Send + 'static,
    {
        self.register(name, LifecycleDelegate {
            remove: Some(change_fn(callback)),
            ..LifecycleDelegate::default()
        })
    }
}

/// Read and index access to a controller's cache
pub struct ClientCache<K> {
    controller: GenericController<K>,
}

impl<K> Clone for ClientCache<K> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
        }
    }
}

impl<K> fmt::Debug for ClientCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCache")
            .field("controller", &self.controller)
            .finish()
    }
}

impl<K> ClientCache<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// The cached `namespace/name`
    ///
    /// # Errors
    ///
    /// [`controller::Error::NotFound`] when it is not cached.
    pub fn get(&self, namespace: &str, name: &str) -> Result<Arc<K>, controller::Error> {
        self.controller.lister().get(namespace, name)
    }

    /// Cached objects in `namespace` (every namespace when empty) matching `selector`
    pub fn list(&self, namespace: &str, selector: &Selector) -> Vec<Arc<K>> {
        self.controller.lister().list(namespace, selector)
    }

    /// Maintain a secondary index called `name`, filing each object under the values of `indexer`
    ///
    /// # Errors
    ///
    /// [`store::Error::IndexExists`] if `name` is taken.
    pub fn index<F>(&self, name: &str, indexer: F) -> Result<(), store::Error>
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        self.controller.store().add_index(name, indexer)
    }

    /// Cached objects filed under `key` in the index `name`
    ///
    /// # Errors
    ///
    /// [`store::Error::IndexNotFound`] if no such index exists.
    pub fn get_indexed(&self, name: &str, key: &str) -> Result<Vec<Arc<K>>, store::Error> {
        self.controller.store().by_index(name, key)
    }
}
