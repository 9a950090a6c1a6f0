//! An in-process object store with apiserver semantics
//!
//! Useful for tests and for embedding controllers without a remote store. Every write bumps a single
//! monotonically increasing revision that doubles as the resource version. The most recent changes are
//! retained so that watches can resume; older versions are answered with `410 Gone`.
use async_trait::async_trait;
use chrono::Utc;
use futures::{channel::mpsc, future, stream, stream::BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ListMeta, Time};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::{api::ObjectClient, Error, Result};
use norman_core::{
    labels::Selector,
    params::{DeleteParams, ListParams, Patch, WatchParams},
    ErrorResponse, ObjectList, Resource, ResourceExt, WatchEvent,
};

const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// `(namespace, name)`, with the empty namespace for cluster-scoped kinds
type Key = (String, String);

fn object_key<K: Resource>(obj: &K) -> Key {
    let meta = obj.meta();
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn lookup_key<K: Resource>(namespace: Option<&str>, name: &str) -> Key {
    let namespace = if K::NAMESPACED { namespace.unwrap_or_default() } else { "" };
    (namespace.to_string(), name.to_string())
}

fn group_resource<K: Resource>() -> String {
    K::gvr().group_resource()
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Name,
    Namespace,
}

/// The field selectors understood by the store: `metadata.name` and `metadata.namespace`
#[derive(Debug, Default)]
struct FieldSelector(Vec<(Field, bool, String)>);

impl FieldSelector {
    fn parse(raw: Option<&str>) -> Result<Self> {
        let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
            return Ok(Self::default());
        };
        raw.split(',')
            .map(|req| {
                let (field, equal, value) = if let Some((f, v)) = req.split_once("!=") {
                    (f, false, v)
                } else if let Some((f, v)) = req.split_once("==").or_else(|| req.split_once('=')) {
                    (f, true, v)
                } else {
                    return Err(ErrorResponse::invalid(format!("invalid field selector {raw:?}")).into());
                };
                let field = match field.trim() {
                    "metadata.name" => Field::Name,
                    "metadata.namespace" => Field::Namespace,
                    other => {
                        let message = format!("field label not supported: {other}");
                        return Err(ErrorResponse::invalid(message).into());
                    }
                };
                Ok((field, equal, value.trim().to_string()))
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    fn matches<K: Resource>(&self, obj: &K) -> bool {
        let meta = obj.meta();
        self.0.iter().all(|(field, equal, value)| {
            let actual = match field {
                Field::Name => meta.name.as_deref(),
                Field::Namespace => meta.namespace.as_deref(),
            }
            .unwrap_or_default();
            (actual == value) == *equal
        })
    }
}

struct Filter {
    namespace: Option<String>,
    labels: Selector,
    fields: FieldSelector,
}

impl Filter {
    fn new<K: Resource>(
        namespace: Option<&str>,
        label_selector: Option<&str>,
        field_selector: Option<&str>,
    ) -> Result<Self> {
        let labels = label_selector
            .unwrap_or_default()
            .parse::<Selector>()
            .map_err(|err| ErrorResponse::invalid(err.to_string()))?;
        Ok(Self {
            namespace: namespace
                .filter(|ns| K::NAMESPACED && !ns.is_empty())
                .map(String::from),
            labels,
            fields: FieldSelector::parse(field_selector)?,
        })
    }

    fn matches<K: Resource>(&self, obj: &K) -> bool {
        if let Some(ns) = &self.namespace {
            if obj.meta().namespace.as_ref() != Some(ns) {
                return false;
            }
        }
        self.labels.matches(obj.labels()) && self.fields.matches(obj)
    }
}

/// One recorded write, and the state it replaced
struct Change<K> {
    revision: u64,
    previous: Option<K>,
    event: WatchEvent<K>,
}

impl<K: Resource + Clone> Change<K> {
    /// Translate the change as seen through `filter`
    ///
    /// An object that starts or stops matching a watcher's selectors is reported as added or deleted.
    fn view(&self, filter: &Filter) -> Option<WatchEvent<K>> {
        match &self.event {
            WatchEvent::Added(obj) => filter.matches(obj).then(|| WatchEvent::Added(obj.clone())),
            WatchEvent::Deleted(obj) => filter.matches(obj).then(|| WatchEvent::Deleted(obj.clone())),
            WatchEvent::Modified(obj) => {
                let was = self.previous.as_ref().is_some_and(|prev| filter.matches(prev));
                match (was, filter.matches(obj)) {
                    (true, true) => Some(WatchEvent::Modified(obj.clone())),
                    (false, true) => Some(WatchEvent::Added(obj.clone())),
                    (true, false) => Some(WatchEvent::Deleted(obj.clone())),
                    (false, false) => None,
                }
            }
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => None,
        }
    }
}

struct Watcher<K> {
    filter: Filter,
    tx: mpsc::UnboundedSender<Result<WatchEvent<K>>>,
}

struct State<K> {
    revision: u64,
    objects: BTreeMap<Key, K>,
    history: VecDeque<Change<K>>,
    /// Changes at or below this revision are no longer retained
    compacted: u64,
    watchers: Vec<Watcher<K>>,
}

impl<K: Resource + Clone> State<K> {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn record(&mut self, history_limit: usize, previous: Option<K>, event: WatchEvent<K>) {
        let change = Change {
            revision: self.revision,
            previous,
            event,
        };
        self.watchers.retain(|watcher| match change.view(&watcher.filter) {
            Some(ev) => watcher.tx.unbounded_send(Ok(ev)).is_ok(),
            None => !watcher.tx.is_closed(),
        });
        self.history.push_back(change);
        while self.history.len() > history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.revision;
            }
        }
    }
}

/// An in-process [`ObjectClient`] for objects of kind `K`
pub struct MemoryStore<K> {
    state: Mutex<State<K>>,
    history_limit: usize,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl<K> MemoryStore<K> {
    /// An empty store retaining the last 1000 changes for watch resumption
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store retaining the last `history_limit` changes for watch resumption
    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(State {
                revision: 0,
                objects: BTreeMap::new(),
                history: VecDeque::new(),
                compacted: 0,
                watchers: Vec::new(),
            }),
            history_limit,
        }
    }

    /// The revision of the latest write
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// The number of stored objects, including those pending deletion
    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Whether the store holds no objects
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every open watch stream, as a store restart or an idle timeout would
    pub fn sever_watches(&self) {
        let mut state = self.state.lock();
        tracing::debug!(watchers = state.watchers.len(), "severing watch streams");
        state.watchers.clear();
    }

    /// Forget all recorded changes, so resuming from any earlier version yields `410 Gone`
    pub fn compact(&self) {
        let mut state = self.state.lock();
        state.compacted = state.revision;
        state.history.clear();
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn replace_locked(&self, state: &mut State<K>, mut obj: K) -> Result<K> {
        let key = lookup_key::<K>(obj.meta().namespace.as_deref(), &obj.name_any());
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(ErrorResponse::not_found(&group_resource::<K>(), &key.1).into());
        };
        if let Some(rv) = obj.meta().resource_version.as_deref() {
            if current.meta().resource_version.as_deref() != Some(rv) {
                return Err(ErrorResponse::conflict(&group_resource::<K>(), &key.1).into());
            }
        }
        {
            // server-owned fields cannot be written by clients
            let (meta, cur) = (obj.meta_mut(), current.meta());
            meta.namespace = cur.namespace.clone();
            meta.uid = cur.uid.clone();
            meta.creation_timestamp = cur.creation_timestamp.clone();
            meta.deletion_timestamp = cur.deletion_timestamp.clone();
            meta.generation = cur.generation;
            meta.resource_version = cur.resource_version.clone();
            if meta.finalizers.as_ref().is_some_and(Vec::is_empty) {
                meta.finalizers = None;
            }
        }
        if serde_json::to_value(&obj).map_err(Error::SerdeError)?
            == serde_json::to_value(&current).map_err(Error::SerdeError)?
        {
            return Ok(current);
        }
        let rv = state.next_revision();
        obj.meta_mut().resource_version = Some(rv.to_string());
        if obj.is_deleting() && obj.finalizers().is_empty() {
            tracing::trace!(name = %key.1, "last finalizer removed, purging");
            state.objects.remove(&key);
            state.record(self.history_limit, Some(current), WatchEvent::Deleted(obj.clone()));
        } else {
            state.objects.insert(key, obj.clone());
            state.record(self.history_limit, Some(current), WatchEvent::Modified(obj.clone()));
        }
        Ok(obj)
    }

    fn delete_locked(&self, state: &mut State<K>, key: Key, dp: &DeleteParams) -> Result<()> {
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(ErrorResponse::not_found(&group_resource::<K>(), &key.1).into());
        };
        if let Some(pre) = &dp.preconditions {
            let stale_uid = pre.uid.is_some() && pre.uid != current.meta().uid;
            let stale_rv =
                pre.resource_version.is_some() && pre.resource_version != current.meta().resource_version;
            if stale_uid || stale_rv {
                return Err(ErrorResponse::conflict(&group_resource::<K>(), &key.1).into());
            }
        }
        if !current.finalizers().is_empty() {
            if current.is_deleting() {
                return Ok(());
            }
            let mut obj = current.clone();
            let rv = state.next_revision();
            obj.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
            obj.meta_mut().resource_version = Some(rv.to_string());
            state.objects.insert(key, obj.clone());
            state.record(self.history_limit, Some(current), WatchEvent::Modified(obj));
        } else {
            let mut obj = current.clone();
            let rv = state.next_revision();
            obj.meta_mut().resource_version = Some(rv.to_string());
            state.objects.remove(&key);
            state.record(self.history_limit, Some(current), WatchEvent::Deleted(obj));
        }
        Ok(())
    }
}

#[async_trait]
impl<K> ObjectClient<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn create(&self, obj: &K) -> Result<K> {
        let gr = group_resource::<K>();
        let mut obj = obj.clone();
        let mut state = self.state.lock();
        if !K::NAMESPACED {
            obj.meta_mut().namespace = None;
        } else if obj.meta().namespace.as_deref().map_or(true, str::is_empty) {
            return Err(ErrorResponse::invalid(format!("{gr}: namespace is required")).into());
        }
        if obj.meta().name.as_deref().map_or(true, str::is_empty) {
            match obj.meta().generate_name.clone().filter(|prefix| !prefix.is_empty()) {
                Some(prefix) => obj.meta_mut().name = Some(format!("{prefix}{:05x}", state.revision + 1)),
                None => {
                    let message = format!("{gr}: name or generateName is required");
                    return Err(ErrorResponse::invalid(message).into());
                }
            }
        }
        let key = object_key(&obj);
        if state.objects.contains_key(&key) {
            return Err(ErrorResponse::already_exists(&gr, &key.1).into());
        }
        let rv = state.next_revision();
        let meta = obj.meta_mut();
        meta.uid = Some(format!("{rv:08x}-0000-4000-8000-{:012x}", state.objects.len()));
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;
        meta.generation = Some(1);
        meta.resource_version = Some(rv.to_string());
        state.objects.insert(key, obj.clone());
        state.record(self.history_limit, None, WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        let state = self.state.lock();
        state
            .objects
            .get(&lookup_key::<K>(namespace, name))
            .cloned()
            .ok_or_else(|| ErrorResponse::not_found(&group_resource::<K>(), name).into())
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let mut state = self.state.lock();
        self.replace_locked(&mut state, obj.clone())
    }

    async fn delete(&self, namespace: Option<&str>, name: &str, dp: &DeleteParams) -> Result<()> {
        let mut state = self.state.lock();
        self.delete_locked(&mut state, lookup_key::<K>(namespace, name), dp)
    }

    async fn delete_collection(
        &self,
        namespace: Option<&str>,
        dp: &DeleteParams,
        lp: &ListParams,
    ) -> Result<()> {
        let filter = Filter::new::<K>(namespace, lp.label_selector.as_deref(), lp.field_selector.as_deref())?;
        let mut state = self.state.lock();
        let keys = state
            .objects
            .iter()
            .filter(|(_, obj)| filter.matches(*obj))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in keys {
            self.delete_locked(&mut state, key, dp)?;
        }
        Ok(())
    }

    async fn list(&self, namespace: Option<&str>, lp: &ListParams) -> Result<ObjectList<K>> {
        let filter = Filter::new::<K>(namespace, lp.label_selector.as_deref(), lp.field_selector.as_deref())?;
        let state = self.state.lock();
        let items = state
            .objects
            .values()
            .filter(|obj| filter.matches(*obj))
            .cloned()
            .collect();
        Ok(ObjectList {
            metadata: ListMeta {
                resource_version: Some(state.revision.to_string()),
                ..ListMeta::default()
            },
            items,
        })
    }

    async fn watch(
        &self,
        namespace: Option<&str>,
        wp: &WatchParams,
        version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        let filter = Filter::new::<K>(namespace, wp.label_selector.as_deref(), wp.field_selector.as_deref())?;
        // only the empty version means "from now"; "0" is the version of an empty listing
        let since = match version {
            "" => None,
            v => Some(
                v.parse::<u64>()
                    .map_err(|_| ErrorResponse::invalid(format!("invalid resource version {v:?}")))?,
            ),
        };
        let mut state = self.state.lock();
        let since = since.unwrap_or(state.revision);
        if since < state.compacted {
            let gone = WatchEvent::Error(ErrorResponse::gone(version));
            return Ok(stream::once(future::ready(Ok(gone))).boxed());
        }
        let (tx, rx) = mpsc::unbounded();
        for change in state.history.iter().filter(|change| change.revision > since) {
            if let Some(ev) = change.view(&filter) {
                // rx is alive, it is only handed out below
                let _ = tx.unbounded_send(Ok(ev));
            }
        }
        state.watchers.push(Watcher { filter, tx });
        Ok(rx.boxed())
    }

    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &Patch) -> Result<K> {
        let mut state = self.state.lock();
        let key = lookup_key::<K>(namespace, name);
        let Some(current) = state.objects.get(&key).cloned() else {
            return Err(ErrorResponse::not_found(&group_resource::<K>(), name).into());
        };
        let mut doc = serde_json::to_value(&current).map_err(Error::SerdeError)?;
        match patch {
            Patch::Merge(p) => json_patch::merge(&mut doc, p),
            Patch::Json(p) => json_patch::patch(&mut doc, &p.0).map_err(Error::PatchError)?,
        }
        let mut obj: K = serde_json::from_value(doc).map_err(Error::SerdeError)?;
        obj.meta_mut().name = current.meta().name.clone();
        obj.meta_mut().namespace = current.meta().namespace.clone();
        self.replace_locked(&mut state, obj)
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::api::{Api, ObjectClient};
    use futures::{StreamExt, TryStreamExt};
    use norman_core::{
        params::{DeleteParams, ListParams, Patch, WatchParams},
        ObjectMeta, Resource, ResourceExt, WatchEvent,
    };
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Widget {
        metadata: ObjectMeta,
        #[serde(default)]
        size: u32,
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

    fn widget(ns: &str, name: &str) -> Widget {
        Widget {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(ns.into()),
                ..ObjectMeta::default()
            },
            size: 1,
        }
    }

    fn api(store: &Arc<MemoryStore<Widget>>) -> Api<Widget> {
        Api::all(store.clone())
    }

    #[tokio::test]
    async fn create_assigns_server_fields_and_rejects_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let created = api(&store).create(&widget("ns", "a")).await.unwrap();
        assert!(created.uid().is_some());
        assert!(created.creation_timestamp().is_some());
        assert_eq!(created.resource_version().as_deref(), Some("1"));

        let err = api(&store).create(&widget("ns", "a")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn stale_update_conflicts_and_noop_update_keeps_version() {
        let store = Arc::new(MemoryStore::new());
        let first = store.create(&widget("ns", "a")).await.unwrap();
        let mut changed = first.clone();
        changed.size = 2;
        let second = store.update(&changed).await.unwrap();
        assert_eq!(second.resource_version().as_deref(), Some("2"));

        let err = store.update(&changed).await.unwrap_err();
        assert!(err.is_conflict());

        let same = store.update(&second).await.unwrap();
        assert_eq!(same.resource_version(), second.resource_version());
        assert_eq!(store.revision(), 2);
    }

    #[tokio::test]
    async fn finalizers_gate_deletion() {
        let store = Arc::new(MemoryStore::new());
        let mut w = widget("ns", "a");
        w.finalizers_mut().push("test.cattle.io/hold".into());
        store.create(&w).await.unwrap();

        store.delete(Some("ns"), "a", &DeleteParams::default()).await.unwrap();
        let pending = store.get(Some("ns"), "a").await.unwrap();
        assert!(pending.is_deleting());

        let mut released = pending.clone();
        released.finalizers_mut().clear();
        store.update(&released).await.unwrap();
        assert!(store.get(Some("ns"), "a").await.unwrap_err().is_not_found());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_labels() {
        let store = Arc::new(MemoryStore::new());
        let mut labelled = widget("ns", "a");
        labelled.labels_mut().insert("app".into(), "x".into());
        store.create(&labelled).await.unwrap();
        store.create(&widget("ns", "b")).await.unwrap();
        store.create(&widget("other", "c")).await.unwrap();

        let all = store.list(None, &ListParams::default()).await.unwrap();
        assert_eq!(all.items.len(), 3);
        assert_eq!(all.resource_version(), Some("3"));
        let ns = store.list(Some("ns"), &ListParams::default()).await.unwrap();
        assert_eq!(ns.items.len(), 2);
        let app = store.list(None, &ListParams::default().labels("app=x")).await.unwrap();
        assert_eq!(app.items.len(), 1);
        let named = store
            .list(None, &ListParams::default().fields("metadata.name!=a"))
            .await
            .unwrap();
        assert_eq!(named.items.len(), 2);
    }

    #[tokio::test]
    async fn watch_resumes_from_history() {
        let store = Arc::new(MemoryStore::new());
        store.create(&widget("ns", "a")).await.unwrap();
        let version = store.revision().to_string();
        store.create(&widget("ns", "b")).await.unwrap();
        store.delete(Some("ns"), "a", &DeleteParams::default()).await.unwrap();

        let stream = store.watch(None, &WatchParams::default(), &version).await.unwrap();
        store.sever_watches();
        let events = stream.try_collect::<Vec<_>>().await.unwrap();
        assert!(matches!(
            &events[..],
            [WatchEvent::Added(b), WatchEvent::Deleted(a)] if b.name_any() == "b" && a.name_any() == "a"
        ));
    }

    #[tokio::test]
    async fn watch_from_an_empty_listing_sees_later_writes() {
        let store = Arc::new(MemoryStore::new());
        let listed = store.list(None, &ListParams::default()).await.unwrap();
        assert_eq!(listed.resource_version(), Some("0"));
        store.create(&widget("ns", "a")).await.unwrap();

        let mut stream = store.watch(None, &WatchParams::default(), "0").await.unwrap();
        match stream.next().await {
            Some(Ok(WatchEvent::Added(a))) => assert_eq!(a.name_any(), "a"),
            other => panic!("expected the create, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn watch_from_compacted_version_is_gone() {
        let store = Arc::new(MemoryStore::new());
        store.create(&widget("ns", "a")).await.unwrap();
        store.create(&widget("ns", "b")).await.unwrap();
        store.compact();

        let mut stream = store.watch(None, &WatchParams::default(), "1").await.unwrap();
        match stream.next().await {
            Some(Ok(WatchEvent::Error(err))) => assert!(err.is_gone()),
            other => panic!("expected 410, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn label_transitions_are_reported_as_add_and_delete() {
        let store = Arc::new(MemoryStore::new());
        let created = store.create(&widget("ns", "a")).await.unwrap();
        let mut stream = store
            .watch(None, &WatchParams::default().labels("app=x"), "")
            .await
            .unwrap();

        let mut labelled = created.clone();
        labelled.labels_mut().insert("app".into(), "x".into());
        let labelled = store.update(&labelled).await.unwrap();
        let mut unlabelled = labelled.clone();
        unlabelled.labels_mut().clear();
        store.update(&unlabelled).await.unwrap();

        assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Added(_)))));
        assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Deleted(_)))));
    }

    #[tokio::test]
    async fn merge_patch_updates_fields() {
        let store = Arc::new(MemoryStore::new());
        store.create(&widget("ns", "a")).await.unwrap();
        let patch = Patch::Merge(serde_json::json!({ "size": 7, "metadata": { "name": "renamed" } }));
        let patched = store.patch(Some("ns"), "a", &patch).await.unwrap();
        assert_eq!(patched.size, 7);
        assert_eq!(patched.name_any(), "a");
    }
}
