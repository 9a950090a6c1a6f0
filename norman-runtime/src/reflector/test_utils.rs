use crate::{
    reflector::{store::Writer, Store},
    watcher,
};
use norman_client::core::{ObjectMeta, Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A namespaced kind for exercising the runtime
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub size: u32,
}

impl Resource for Widget {
    const GROUP: &'static str = "test.cattle.io";
    const KIND: &'static str = "Widget";
    const NAMESPACED: bool = true;
    const PLURAL: &'static str = "widgets";
    const VERSION: &'static str = "v1";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

pub fn widget(namespace: &str, name: &str) -> Widget {
    Widget {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: (!namespace.is_empty()).then(|| namespace.into()),
            ..ObjectMeta::default()
        },
        size: 0,
    }
}

pub trait ToStore<K> {
    fn to_store(self) -> Store<K>;
}

impl<K: Resource + Clone + Send + Sync + 'static> ToStore<K> for Vec<K> {
    fn to_store(self) -> Store<K> {
        check_for_duplicates(&self);

        let mut store_writer = Writer::default();
        store_writer.apply_watcher_event(&watcher::Event::Restarted(self));
        store_writer.as_reader()
    }
}

/// Keys must be unique, or duplicates silently collapse into one entry
fn check_for_duplicates<K: Resource>(to_store: &[K]) {
    let mut seen = HashSet::new();
    let duplicates = to_store
        .iter()
        .map(|item| (item.name_any(), item.meta().namespace.clone()))
        .filter(|key| !seen.insert(key.clone()))
        .collect::<Vec<_>>();

    assert!(
        duplicates.is_empty(),
        "Attempted .to_store() on a vec with with duplicate resources: {duplicates:?}"
    );
}
