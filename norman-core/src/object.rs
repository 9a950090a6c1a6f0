//! Generic list wrapper
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use serde::{Deserialize, Serialize};

/// A generic list of objects, as returned from a list call
///
/// The `metadata.resource_version` is the point in the kind's history the list was taken at,
/// and is where a subsequent watch resumes from.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ObjectList<T> {
    /// ListMeta - only really used for its `resourceVersion`
    pub metadata: ListMeta,

    /// The items we are actually interested in.
    #[serde(bound(deserialize = "Vec<T>: Deserialize<'de>"))]
    pub items: Vec<T>,
}

impl<T> ObjectList<T> {
    /// `iter` returns an Iterator over the elements of this ObjectList
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// The resource version the list was taken at
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }
}

impl<T> IntoIterator for ObjectList<T> {
    type IntoIter = ::std::vec::IntoIter<Self::Item>;
    type Item = T;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a ObjectList<T> {
    type IntoIter = ::std::slice::Iter<'a, T>;
    type Item = &'a T;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
