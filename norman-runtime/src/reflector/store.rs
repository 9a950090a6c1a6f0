//! The indexed object cache behind a reflector: a [`Writer`] that applies watch events and the
//! cloneable [`Store`] readers with their secondary indices
use super::ObjectRef;
use crate::watcher;
use ahash::{AHashMap, AHashSet};
use educe::Educe;
use norman_client::core::{labels::Selector, Resource, ResourceExt};
use parking_lot::RwLock;
use std::{collections::BTreeSet, fmt, sync::Arc};
use thiserror::Error;
use tokio::sync::watch;

/// Derives the values an object is filed under in a secondary index
pub type IndexFn<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// Failures of the secondary index API
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// An index with this name is already registered
    #[error("index {0:?} already exists")]
    IndexExists(String),
    /// No index with this name is registered
    #[error("index {0:?} does not exist")]
    IndexNotFound(String),
}

/// The [`Writer`] was dropped before the store was seeded by a full list
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("writer was dropped before store became ready")]
pub struct WriterDropped;

struct Cache<K> {
    objects: AHashMap<ObjectRef, Arc<K>>,
    indexers: AHashMap<String, IndexFn<K>>,
    /// index name -> indexed value -> keys of the objects filed under it
    indices: AHashMap<String, AHashMap<String, BTreeSet<ObjectRef>>>,
}

impl<K> Default for Cache<K> {
    fn default() -> Self {
        Self {
            objects: AHashMap::new(),
            indexers: AHashMap::new(),
            indices: AHashMap::new(),
        }
    }
}

impl<K> Cache<K> {
    fn index_obj(&mut self, key: &ObjectRef, obj: &K) {
        for (name, index_fn) in &self.indexers {
            let index = self.indices.entry(name.clone()).or_default();
            for value in index_fn(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
    }

    fn unindex_obj(&mut self, key: &ObjectRef, obj: &K) {
        for (name, index_fn) in &self.indexers {
            let Some(index) = self.indices.get_mut(name) else {
                continue;
            };
            for value in index_fn(obj) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }

    fn insert(&mut self, key: ObjectRef, obj: Arc<K>) {
        if let Some(old) = self.objects.remove(&key) {
            self.unindex_obj(&key, &old);
        }
        self.index_obj(&key, &obj);
        self.objects.insert(key, obj);
    }

    fn remove(&mut self, key: &ObjectRef) -> Option<Arc<K>> {
        let old = self.objects.remove(key)?;
        self.unindex_obj(key, &old);
        Some(old)
    }
}

/// A writable Store handle
///
/// This is exclusive since it's not safe to share a single `Store` between multiple reflectors.
/// In particular, `Restarted` events will clobber the state of other connected reflectors.
pub struct Writer<K> {
    cache: Arc<RwLock<Cache<K>>>,
    /// Flipped to true by the first `Restarted`
    ready: watch::Sender<bool>,
}

impl<K> Default for Writer<K> {
    fn default() -> Self {
        Self {
            cache: Arc::default(),
            ready: watch::channel(false).0,
        }
    }
}

impl<K> fmt::Debug for Writer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("objects", &self.cache.read().objects.len())
            .field("ready", &*self.ready.borrow())
            .finish()
    }
}

impl<K: Resource + Clone> Writer<K> {
    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader` multiple times,
    /// or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store<K> {
        Store {
            cache: self.cache.clone(),
            ready: self.ready.subscribe(),
        }
    }

    /// Applies a single watcher event to the store, returning the keys it touched
    ///
    /// A `Restarted` event touches every listed key as well as every previously cached key that
    /// is missing from the listing, since the deletion of those was missed. The first `Restarted`
    /// marks the store as ready.
    pub fn apply_watcher_event(&mut self, event: &watcher::Event<K>) -> Vec<ObjectRef> {
        let touched = {
            let mut cache = self.cache.write();
            match event {
                watcher::Event::Applied(obj) => {
                    let key = ObjectRef::from_obj(obj);
                    cache.insert(key.clone(), Arc::new(obj.clone()));
                    vec![key]
                }
                watcher::Event::Deleted(obj) => {
                    let key = ObjectRef::from_obj(obj);
                    cache.remove(&key);
                    vec![key]
                }
                watcher::Event::Restarted(new_objs) => {
                    let new_keys = new_objs.iter().map(ObjectRef::from_obj).collect::<AHashSet<_>>();
                    let mut touched = cache
                        .objects
                        .keys()
                        .filter(|key| !new_keys.contains(*key))
                        .cloned()
                        .collect::<Vec<_>>();
                    for key in &touched {
                        cache.remove(key);
                    }
                    for obj in new_objs {
                        let key = ObjectRef::from_obj(obj);
                        cache.insert(key.clone(), Arc::new(obj.clone()));
                        touched.push(key);
                    }
                    touched
                }
            }
        };
        if matches!(event, watcher::Event::Restarted(_)) {
            self.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
        }
        touched
    }
}

/// A readable cache of objects of kind `K`
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` instead.
#[derive(Educe)]
#[educe(Clone)]
pub struct Store<K> {
    cache: Arc<RwLock<Cache<K>>>,
    ready: watch::Receiver<bool>,
}

impl<K> fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("objects", &self.cache.read().objects.len())
            .finish()
    }
}

impl<K: Resource + 'static> Store<K> {
    /// Wait for the store to be seeded by its first full list
    ///
    /// # Errors
    ///
    /// Fails if the [`Writer`] was dropped before that happened.
    pub async fn wait_until_ready(&self) -> Result<(), WriterDropped> {
        let mut ready = self.ready.clone();
        ready.wait_for(|ready| *ready).await.map(|_| ()).map_err(|_| WriterDropped)
    }

    /// Retrieve the entry referred to by `key`, if it is in the cache.
    ///
    /// `key.namespace` is ignored for cluster-scoped resources.
    ///
    /// Note that this is a cache and may be stale. Deleted objects may still exist in the cache
    /// despite having been deleted in the store, and new objects may not yet exist in the cache.
    #[must_use]
    pub fn get(&self, key: &ObjectRef) -> Option<Arc<K>> {
        let cache = self.cache.read();
        cache
            .objects
            .get(key)
            // Try to erase the namespace and try again, in case the object is cluster-scoped
            .or_else(|| {
                key.namespace.as_ref()?;
                cache.objects.get(&ObjectRef::new(&key.name))
            })
            .cloned()
    }

    /// Retrieve an entry by its `namespace/name` key
    #[must_use]
    pub fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        self.get(&ObjectRef::parse(key))
    }

    /// Objects in `namespace` (all namespaces when `None` or empty) whose labels satisfy `selector`
    ///
    /// Results are ordered by key.
    #[must_use]
    pub fn list(&self, namespace: Option<&str>, selector: &Selector) -> Vec<Arc<K>> {
        let namespace = namespace.filter(|ns| !ns.is_empty());
        let cache = self.cache.read();
        let mut found = cache
            .objects
            .iter()
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace.as_deref() == Some(ns)))
            .filter(|(_, obj)| selector.matches(obj.labels()))
            .collect::<Vec<_>>();
        found.sort_by(|(a, _), (b, _)| a.cmp(b));
        found.into_iter().map(|(_, obj)| obj.clone()).collect()
    }

    /// Return a full snapshot of the current values
    #[must_use]
    pub fn state(&self) -> Vec<Arc<K>> {
        self.list(None, &Selector::everything())
    }

    /// Register a secondary index, filing every cached object under it immediately
    ///
    /// # Errors
    ///
    /// Fails with [`Error::IndexExists`] if `name` is taken.
    pub fn add_index<F>(&self, name: &str, index_fn: F) -> Result<(), Error>
    where
        F: Fn(&K) -> Vec<String> + Send + Sync + 'static,
    {
        let mut cache = self.cache.write();
        if cache.indexers.contains_key(name) {
            return Err(Error::IndexExists(name.to_string()));
        }
        let mut index = AHashMap::<String, BTreeSet<ObjectRef>>::new();
        for (key, obj) in &cache.objects {
            for value in index_fn(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
        cache.indices.insert(name.to_string(), index);
        cache.indexers.insert(name.to_string(), Arc::new(index_fn));
        Ok(())
    }

    /// Cached objects filed under `value` in the index `name`, ordered by key
    ///
    /// # Errors
    ///
    /// Fails with [`Error::IndexNotFound`] if no such index was registered.
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<Arc<K>>, Error> {
        let cache = self.cache.read();
        let index = cache
            .indices
            .get(name)
            .filter(|_| cache.indexers.contains_key(name))
            .ok_or_else(|| Error::IndexNotFound(name.to_string()))?;
        Ok(index
            .get(value)
            .into_iter()
            .flatten()
            .filter_map(|key| cache.objects.get(key).cloned())
            .collect())
    }

    /// The number of cached objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.read().objects.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Create a (Reader, Writer) pair for a [`Store`]
#[must_use]
pub fn store<K: Resource + Clone>() -> (Store<K>, Writer<K>) {
    let w = Writer::default();
    let r = w.as_reader();
    (r, w)
}
