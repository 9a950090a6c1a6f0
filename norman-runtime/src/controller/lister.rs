use super::Error;
use crate::reflector::{ObjectRef, Store};
use norman_client::core::{labels::Selector, Resource};
use std::sync::Arc;

/// A read-only typed view of a controller's cache
#[derive(Debug)]
pub struct Lister<K> {
    store: Store<K>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<K: Resource + 'static> Lister<K> {
    pub(crate) fn new(store: Store<K>) -> Self {
        Self { store }
    }

    /// The cached object called `name` in `namespace` (empty for cluster-scoped kinds)
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when the cache holds no such object.
    pub fn get(&self, namespace: &str, name: &str) -> Result<Arc<K>, Error> {
        let key = ObjectRef::new(name).within(namespace);
        self.store.get(&key).ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// Cached objects in `namespace` (every namespace when empty) matching `selector`, ordered by key
    pub fn list(&self, namespace: &str, selector: &Selector) -> Vec<Arc<K>> {
        self.store.list(Some(namespace), selector)
    }
}

#[cfg(test)]
mod tests {
    use super::Lister;
    use crate::{
        controller::Error,
        reflector::test_utils::{widget, ToStore},
    };
    use norman_client::core::labels::Selector;

    #[test]
    fn get_builds_namespaced_and_bare_keys() {
        let lister = Lister::new(vec![widget("ns", "a"), widget("", "b")].to_store());
        assert!(lister.get("ns", "a").is_ok());
        assert!(lister.get("", "b").is_ok());
        assert!(matches!(lister.get("other", "a"), Err(Error::NotFound(key)) if key == "other/a"));
        assert_eq!(lister.list("", &Selector::everything()).len(), 2);
        assert_eq!(lister.list("ns", &Selector::everything()).len(), 1);
    }
}
