use norman_client::core::{Resource, ResourceExt};
use std::fmt::{self, Display};

/// A namespaced (if relevant) reference to an object
///
/// Its [`Display`] form is the cache key: `namespace/name`, or the bare name for cluster-scoped objects.
///
/// ```
/// use norman_runtime::reflector::ObjectRef;
/// assert_eq!(ObjectRef::new("a").within("ns").to_string(), "ns/a");
/// assert_eq!(ObjectRef::parse("ns/a"), ObjectRef::new("a").within("ns"));
/// assert_eq!(ObjectRef::parse("a"), ObjectRef::new("a"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub struct ObjectRef {
    /// The namespace of the object
    ///
    /// May only be `None` if the kind is cluster-scoped (not located in a namespace).
    pub namespace: Option<String>,
    /// The name of the object
    pub name: String,
}

impl ObjectRef {
    /// A reference to a cluster-scoped object
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Place the reference in `namespace`, an empty namespace means cluster scope
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = (!namespace.is_empty()).then(|| namespace.to_string());
        self
    }

    /// Creates `ObjectRef` from the resource
    #[must_use]
    pub fn from_obj<K: Resource>(obj: &K) -> Self {
        Self::new(&obj.name_any()).within(obj.meta().namespace.as_deref().unwrap_or_default())
    }

    /// Parse a cache key back into a reference
    #[must_use]
    pub fn parse(key: &str) -> Self {
        match key.split_once('/') {
            Some((namespace, name)) => Self::new(name).within(namespace),
            None => Self::new(key),
        }
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}
