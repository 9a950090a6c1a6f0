//! The object store seam and the namespace-scoped [`Api`] handle
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::{fmt, sync::Arc};

use crate::{Error, Result};
use norman_core::{
    params::{DeleteParams, ListParams, Patch, WatchParams},
    ErrorResponse, ObjectList, Resource, ResourceExt, WatchEvent,
};

/// A remote (or in-process) store for objects of kind `K`
///
/// Namespaces are passed explicitly; `None` means all namespaces for reads, and the cluster scope for
/// kinds that are not namespaced. Writes take the namespace from the object itself.
#[async_trait]
pub trait ObjectClient<K>: Send + Sync {
    /// Create a new object, failing with `AlreadyExists` if the name is taken
    async fn create(&self, obj: &K) -> Result<K>;

    /// Get a named object
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K>;

    /// Replace an object, failing with `Conflict` if its resource version is stale
    async fn update(&self, obj: &K) -> Result<K>;

    /// Delete a named object
    ///
    /// Objects with finalizers are only marked for deletion, and are purged once the last
    /// finalizer is removed.
    async fn delete(&self, namespace: Option<&str>, name: &str, dp: &DeleteParams) -> Result<()>;

    /// Delete every object matched by `lp`
    async fn delete_collection(
        &self,
        namespace: Option<&str>,
        dp: &DeleteParams,
        lp: &ListParams,
    ) -> Result<()>;

    /// List objects, along with the resource version the list was taken at
    async fn list(&self, namespace: Option<&str>, lp: &ListParams) -> Result<ObjectList<K>>;

    /// Watch objects for changes that happened after `version`
    ///
    /// The returned stream may end at any time. A `410 Gone` is delivered as a
    /// [`WatchEvent::Error`] when `version` is older than what the store retains.
    async fn watch(
        &self,
        namespace: Option<&str>,
        wp: &WatchParams,
        version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<K>>>>;

    /// Patch a named object
    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &Patch) -> Result<K>;
}

/// A typed handle to objects of kind `K`, scoped to a namespace or to all of them
///
/// Cloning is cheap, the underlying [`ObjectClient`] is shared.
pub struct Api<K> {
    client: Arc<dyn ObjectClient<K>>,
    namespace: Option<String>,
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

impl<K> fmt::Debug for Api<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api").field("namespace", &self.namespace).finish()
    }
}

/// Treats the empty namespace as "no namespace", like the generated clients did
fn scope(namespace: &str) -> Option<&str> {
    (!namespace.is_empty()).then_some(namespace)
}

impl<K> Api<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Cluster level resources, or resources viewed across all namespaces
    pub fn all(client: Arc<dyn ObjectClient<K>>) -> Self {
        Self {
            client,
            namespace: None,
        }
    }

    /// Namespaced resource within a given namespace
    ///
    /// An empty namespace is the same as [`Api::all`].
    pub fn namespaced(client: Arc<dyn ObjectClient<K>>, ns: &str) -> Self {
        Self {
            client,
            namespace: scope(ns).map(String::from),
        }
    }

    /// The namespace this handle is bound to, if any
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The underlying object client
    pub fn client(&self) -> &Arc<dyn ObjectClient<K>> {
        &self.client
    }

    /// Create an object
    ///
    /// Namespaced kinds created through a namespaced handle inherit its namespace when they have none.
    pub async fn create(&self, obj: &K) -> Result<K> {
        match (&self.namespace, K::NAMESPACED, obj.meta().namespace.is_none()) {
            (Some(ns), true, true) => {
                let mut obj = obj.clone();
                obj.meta_mut().namespace = Some(ns.clone());
                self.client.create(&obj).await
            }
            _ => self.client.create(obj).await,
        }
    }

    /// Get a named object from the bound namespace
    pub async fn get(&self, name: &str) -> Result<K> {
        self.client.get(self.namespace.as_deref(), name).await
    }

    /// Get a named object from an explicit namespace
    pub async fn get_namespaced(&self, namespace: &str, name: &str) -> Result<K> {
        self.client.get(scope(namespace), name).await
    }

    /// [Get](`Api::get`) a named object if it exists, returns [`None`] if it doesn't exist
    pub async fn get_opt(&self, name: &str) -> Result<Option<K>> {
        match self.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Replace an object with a new version
    pub async fn update(&self, obj: &K) -> Result<K> {
        self.client.update(obj).await
    }

    /// Delete a named object from the bound namespace
    pub async fn delete(&self, name: &str, dp: &DeleteParams) -> Result<()> {
        self.client.delete(self.namespace.as_deref(), name, dp).await
    }

    /// Delete a named object from an explicit namespace
    pub async fn delete_namespaced(&self, namespace: &str, name: &str, dp: &DeleteParams) -> Result<()> {
        self.client.delete(scope(namespace), name, dp).await
    }

    /// Delete every object in the bound namespace matched by `lp`
    pub async fn delete_collection(&self, dp: &DeleteParams, lp: &ListParams) -> Result<()> {
        self.client
            .delete_collection(self.namespace.as_deref(), dp, lp)
            .await
    }

    /// List objects in the bound namespace
    pub async fn list(&self, lp: &ListParams) -> Result<ObjectList<K>> {
        self.client.list(self.namespace.as_deref(), lp).await
    }

    /// Watch objects in the bound namespace, starting after `version`
    pub async fn watch(
        &self,
        wp: &WatchParams,
        version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        self.client.watch(self.namespace.as_deref(), wp, version).await
    }

    /// Patch a named object in the bound namespace
    pub async fn patch(&self, name: &str, patch: &Patch) -> Result<K> {
        self.client.patch(self.namespace.as_deref(), name, patch).await
    }

    /// Patch the object `obj` refers to, using its own namespace
    pub async fn patch_object(&self, obj: &K, patch: &Patch) -> Result<K> {
        self.client
            .patch(obj.namespace().as_deref().and_then(scope), &obj.name_any(), patch)
            .await
    }
}
