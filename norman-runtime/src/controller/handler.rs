//! Named reconciliation callbacks and the guards that filter them
use futures::future::BoxFuture;
use norman_client::{core::ResourceExt, BoxError};
use std::{fmt, sync::Arc};

/// Label naming the cluster an object belongs to
pub const CLUSTER_NAME_LABEL: &str = "cattle.io/cluster-name";
/// Annotation holding the `<cluster>:<project>` an object belongs to
pub const PROJECT_ID_ANNOTATION: &str = "field.cattle.io/projectId";

/// The outcome of a handler: the object it produced, if any
pub type HandlerResult<K> = Result<Option<K>, CallbackError<K>>;

/// A type-erased handler, called with the object key and the cached object (`None` once deleted)
pub type HandlerFn<K> =
    Arc<dyn Fn(String, Option<Arc<K>>) -> BoxFuture<'static, HandlerResult<K>> + Send + Sync>;

/// A predicate re-evaluated before every dispatch
pub type FeatureGate = Arc<dyn Fn() -> bool + Send + Sync>;

/// A failed callback, optionally carrying an object that should be persisted before the error propagates
///
/// Any [`std::error::Error`] converts into it, so callbacks can use `?` freely.
pub struct CallbackError<K> {
    object: Option<K>,
    source: BoxError,
}

impl<K> CallbackError<K> {
    /// A failure without an object to persist
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            object: None,
            source: source.into(),
        }
    }

    /// Attach the object to persist before the error is propagated
    #[must_use]
    pub fn with_object(mut self, object: K) -> Self {
        self.object = Some(object);
        self
    }

    /// The object to persist, if any
    pub fn object(&self) -> Option<&K> {
        self.object.as_ref()
    }

    /// The object to persist and the underlying failure
    pub fn into_parts(self) -> (Option<K>, BoxError) {
        (self.object, self.source)
    }
}

impl<K, E> From<E> for CallbackError<K>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::new(err)
    }
}

impl<K> fmt::Debug for CallbackError<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackError")
            .field("source", &self.source)
            .field("has_object", &self.object.is_some())
            .finish()
    }
}

impl<K> fmt::Display for CallbackError<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source, f)
    }
}

/// Whether `obj` belongs to `cluster`
///
/// The first of these that is present decides: the cluster name label, the cluster half of the
/// project id annotation, then the namespace.
pub fn object_in_cluster<K: ResourceExt>(obj: &K, cluster: &str) -> bool {
    if let Some(name) = obj.labels().get(CLUSTER_NAME_LABEL) {
        return name == cluster;
    }
    if let Some((owner, _)) = obj
        .annotations()
        .get(PROJECT_ID_ANNOTATION)
        .and_then(|id| id.split_once(':'))
    {
        return owner == cluster;
    }
    obj.meta().namespace.as_deref() == Some(cluster)
}

pub(crate) struct Handler<K> {
    pub(crate) name: String,
    pub(crate) gate: Option<FeatureGate>,
    pub(crate) cluster: Option<String>,
    pub(crate) callback: HandlerFn<K>,
}

impl<K: ResourceExt> Handler<K> {
    /// Feature gate first, then cluster scope; deletions are never filtered by cluster
    pub(crate) fn accepts(&self, obj: Option<&K>) -> bool {
        if self.gate.as_ref().is_some_and(|enabled| !enabled()) {
            return false;
        }
        match (&self.cluster, obj) {
            (Some(cluster), Some(obj)) => object_in_cluster(obj, cluster),
            _ => true,
        }
    }
}
