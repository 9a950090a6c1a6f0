//! Caches objects in memory

mod object_ref;
pub mod store;
#[cfg(test)]
pub(crate) mod test_utils;

pub use self::object_ref::ObjectRef;
use crate::watcher;
use async_stream::stream;
use futures::{Stream, StreamExt};
use norman_client::core::Resource;
pub use store::{store, Store};

/// Cache objects from a [`watcher()`](crate::watcher()) stream into a local [`Store`]
///
/// Observes the raw `Stream` of [`watcher::Event`] objects and modifies the cache. Each applied
/// event is passed on as the keys it touched, ready to be enqueued for reconciliation. Errors
/// are passed through unmodified.
///
/// The cache contains the last-seen state of objects, which may lag slightly behind the store.
pub fn reflector<K, W>(
    mut writer: store::Writer<K>,
    stream: W,
) -> impl Stream<Item = watcher::Result<Vec<ObjectRef>>>
where
    K: Resource + Clone,
    W: Stream<Item = watcher::Result<watcher::Event<K>>>,
{
    let mut stream = Box::pin(stream);
    stream! {
        while let Some(event) = stream.next().await {
            match event {
                Ok(ev) => yield Ok(writer.apply_watcher_event(&ev)),
                Err(err) => yield Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{reflector, store, ObjectRef};
    use crate::{
        reflector::test_utils::{widget, Widget},
        watcher,
    };
    use futures::{stream, StreamExt, TryStreamExt};

    #[tokio::test]
    async fn reflector_applied_should_add_object() {
        let (store, writer) = store::<Widget>();
        let w = widget("ns", "a");
        let touched = reflector(writer, stream::iter(vec![Ok(watcher::Event::Applied(w.clone()))]))
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(touched, [vec![ObjectRef::new("a").within("ns")]]);
        assert_eq!(store.get(&ObjectRef::from_obj(&w)).as_deref(), Some(&w));
    }

    #[tokio::test]
    async fn reflector_applied_should_update_object() {
        let (store, writer) = store::<Widget>();
        let w = widget("ns", "a");
        let mut updated = w.clone();
        updated.size = 9;
        reflector(
            writer,
            stream::iter(vec![
                Ok(watcher::Event::Applied(w.clone())),
                Ok(watcher::Event::Applied(updated.clone())),
            ]),
        )
        .map(|_| ())
        .collect::<()>()
        .await;
        assert_eq!(store.get(&ObjectRef::from_obj(&w)).as_deref(), Some(&updated));
    }

    #[tokio::test]
    async fn reflector_deleted_should_remove_object() {
        let (store, writer) = store::<Widget>();
        let w = widget("ns", "a");
        reflector(
            writer,
            stream::iter(vec![
                Ok(watcher::Event::Applied(w.clone())),
                Ok(watcher::Event::Deleted(w.clone())),
            ]),
        )
        .map(|_| ())
        .collect::<()>()
        .await;
        assert_eq!(store.get(&ObjectRef::from_obj(&w)), None);
    }

    #[tokio::test]
    async fn reflector_passes_errors_through() {
        let (store, writer) = store::<Widget>();
        let events = reflector(
            writer,
            stream::iter(vec![
                Err(watcher::Error::WatchError(norman_client::core::ErrorResponse::gone("1"))),
                Ok(watcher::Event::Restarted(vec![widget("ns", "b")])),
            ]),
        )
        .collect::<Vec<_>>()
        .await;
        assert!(events[0].is_err());
        assert_eq!(store.len(), 1);
    }
}
