pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};

use crate::gvk::{GroupVersionKind, GroupVersionResource};
use std::{borrow::Cow, collections::BTreeMap};

/// An accessor trait for a norman-managed resource kind.
///
/// Kinds know their type information at compile time, so it is exposed as associated constants
/// rather than through a dynamic type parameter.
///
/// These types, using [`ObjectMeta`], SHOULD all have required properties:
/// - `.metadata`
/// - `.metadata.name`
///
/// And these optional properties:
/// - `.metadata.namespace` (absent for cluster-scoped kinds)
/// - `.metadata.resource_version`
pub trait Resource {
    /// Kind of this object, e.g. `Example`
    const KIND: &'static str;
    /// API group of this object, e.g. `management.cattle.io`
    const GROUP: &'static str;
    /// Version of this object, e.g. `v3`
    const VERSION: &'static str;
    /// Plural name of the kind, known as the resource in apimachinery
    const PLURAL: &'static str;
    /// Whether objects of this kind live in a namespace
    const NAMESPACED: bool;

    /// Returns apiVersion of this object
    fn api_version() -> Cow<'static, str> {
        if Self::GROUP.is_empty() {
            return Self::VERSION.into();
        }
        format!("{}/{}", Self::GROUP, Self::VERSION).into()
    }

    /// Returns the group, version and kind triple of this object
    fn gvk() -> GroupVersionKind {
        GroupVersionKind::gvk(Self::GROUP, Self::VERSION, Self::KIND)
    }

    /// Returns the group, version and plural resource triple of this object
    fn gvr() -> GroupVersionResource {
        GroupVersionResource::gvr(Self::GROUP, Self::VERSION, Self::PLURAL)
    }

    /// Metadata that all persisted resources must have
    fn meta(&self) -> &ObjectMeta;
    /// Metadata that all persisted resources must have
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// Helper methods for resources.
pub trait ResourceExt: Resource {
    /// Returns the most useful name identifier available
    ///
    /// This tries `name`, then `generateName`, and falls back on an empty string when neither is set.
    fn name_any(&self) -> String;
    /// The namespace the resource is in
    fn namespace(&self) -> Option<String>;
    /// The resource version
    fn resource_version(&self) -> Option<String>;
    /// Unique ID (if you delete resource and then create a new
    /// resource with the same name, it will have different ID)
    fn uid(&self) -> Option<String>;
    /// Returns the creation timestamp
    fn creation_timestamp(&self) -> Option<Time>;
    /// Returns the deletion timestamp, set once a delete is pending on finalizers
    fn deletion_timestamp(&self) -> Option<Time>;
    /// Whether a delete has been requested for this object
    fn is_deleting(&self) -> bool;
    /// Returns resource labels
    fn labels(&self) -> &BTreeMap<String, String>;
    /// Provides mutable access to the labels
    fn labels_mut(&mut self) -> &mut BTreeMap<String, String>;
    /// Returns resource annotations
    fn annotations(&self) -> &BTreeMap<String, String>;
    /// Provider mutable access to the annotations
    fn annotations_mut(&mut self) -> &mut BTreeMap<String, String>;
    /// Returns resource owner references
    fn owner_references(&self) -> &[OwnerReference];
    /// Returns resource finalizers
    fn finalizers(&self) -> &[String];
    /// Provides mutable access to the finalizers
    fn finalizers_mut(&mut self) -> &mut Vec<String>;
}

static EMPTY_MAP: BTreeMap<String, String> = BTreeMap::new();

impl<K: Resource> ResourceExt for K {
    fn name_any(&self) -> String {
        let meta = self.meta();
        meta.name
            .clone()
            .or_else(|| meta.generate_name.clone())
            .unwrap_or_default()
    }

    fn namespace(&self) -> Option<String> {
        self.meta().namespace.clone()
    }

    fn resource_version(&self) -> Option<String> {
        self.meta().resource_version.clone()
    }

    fn uid(&self) -> Option<String> {
        self.meta().uid.clone()
    }

    fn creation_timestamp(&self) -> Option<Time> {
        self.meta().creation_timestamp.clone()
    }

    fn deletion_timestamp(&self) -> Option<Time> {
        self.meta().deletion_timestamp.clone()
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn labels(&self) -> &BTreeMap<String, String> {
        self.meta().labels.as_ref().unwrap_or(&EMPTY_MAP)
    }

    fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.meta_mut().labels.get_or_insert_with(BTreeMap::new)
    }

    fn annotations(&self) -> &BTreeMap<String, String> {
        self.meta().annotations.as_ref().unwrap_or(&EMPTY_MAP)
    }

    fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.meta_mut().annotations.get_or_insert_with(BTreeMap::new)
    }

    fn owner_references(&self) -> &[OwnerReference] {
        self.meta().owner_references.as_deref().unwrap_or_default()
    }

    fn finalizers(&self) -> &[String] {
        self.meta().finalizers.as_deref().unwrap_or_default()
    }

    fn finalizers_mut(&mut self) -> &mut Vec<String> {
        self.meta_mut().finalizers.get_or_insert_with(Vec::new)
    }
}
