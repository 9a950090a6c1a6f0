//! Watches a kind for changes, with error recovery

use futures::{stream::BoxStream, Stream, StreamExt};
use norman_client::{
    core::{
        params::{ListParams, WatchParams},
        ErrorResponse, Resource, ResourceExt, WatchEvent,
    },
    Api,
};
use thiserror::Error;

/// Failures observed by the [`watcher`]; all of them are recovered from on the next poll
#[derive(Debug, Error)]
pub enum Error {
    /// The full list that seeds (or re-seeds) the watcher failed
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] norman_client::Error),
    /// The watch call itself was rejected
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] norman_client::Error),
    /// The store sent an error event down an open watch
    #[error("error returned by store during watch: {0}")]
    WatchError(#[source] ErrorResponse),
    /// The watch stream broke
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] norman_client::Error),
}

/// Result alias for the [`watcher`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Watch events returned from the [`watcher`]
#[derive(Debug, Clone, PartialEq)]
pub enum Event<K> {
    /// An object was added or modified
    Applied(K),
    /// An object was deleted
    ///
    /// NOTE: This should not be used for managing persistent state elsewhere, since
    /// events may be lost if the watcher is unavailable. Use finalizers instead.
    Deleted(K),
    /// The watch stream was restarted, so `Deleted` events may have been missed
    ///
    /// Should be used as a signal to replace the store contents atomically.
    ///
    /// Any objects that were previously [`Applied`](Event::Applied) but are not listed in this event
    /// should be assumed to have been [`Deleted`](Event::Deleted).
    Restarted(Vec<K>),
}

/// Which objects a [`watcher`] follows
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    /// A selector to restrict the watched objects by their labels
    pub label_selector: Option<String>,
    /// A selector to restrict the watched objects by their fields
    pub field_selector: Option<String>,
    /// Seconds after which the store may close an idle watch; the watcher then resumes it
    pub timeout: Option<u32>,
}

impl Config {
    /// Restrict the watched objects by their labels
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }

    /// Restrict the watched objects by their fields
    #[must_use]
    pub fn fields(mut self, field_selector: &str) -> Self {
        self.field_selector = Some(field_selector.to_string());
        self
    }

    /// Ask the store to close watches after `timeout_secs`
    #[must_use]
    pub fn timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout = Some(timeout_secs);
        self
    }

    fn to_list_params(&self) -> ListParams {
        ListParams {
            label_selector: self.label_selector.clone(),
            field_selector: self.field_selector.clone(),
            ..ListParams::default()
        }
    }

    fn to_watch_params(&self) -> WatchParams {
        WatchParams {
            label_selector: self.label_selector.clone(),
            field_selector: self.field_selector.clone(),
            timeout: self.timeout,
            ..WatchParams::default()
        }
    }
}

/// The internal finite state machine driving the [`watcher`]
enum State<K> {
    /// The next poll will start the initial LIST to get all existing objects
    Empty,
    /// The initial LIST was successful, so we should move on to starting the actual watch.
    InitListed { resource_version: String },
    /// The watch is in progress, from this point we just return events from the store.
    ///
    /// If the connection is disrupted then we propagate the error but try to restart the watch stream by
    /// returning to the `InitListed` state.
    /// If we fall out of the watch window then we propagate the error and fall back doing a re-list
    /// with `Empty`.
    Watching {
        resource_version: String,
        stream: BoxStream<'static, norman_client::Result<WatchEvent<K>>>,
    },
}

/// Progresses the watcher a single step, returning (event, state)
///
/// This function should be trampolined: if event == `None`
/// then the function should be called again until it returns a Some.
async fn step_trampolined<K>(
    api: &Api<K>,
    config: &Config,
    state: State<K>,
) -> (Option<Result<Event<K>>>, State<K>)
where
    K: Resource + Clone + Send + Sync + 'static,
{
    match state {
        State::Empty => match api.list(&config.to_list_params()).await {
            Ok(list) => {
                let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
                tracing::debug!(kind = K::KIND, %resource_version, objects = list.items.len(), "listed");
                (Some(Ok(Event::Restarted(list.items))), State::InitListed {
                    resource_version,
                })
            }
            Err(err) => {
                tracing::warn!(kind = K::KIND, "initial list error: {err:?}");
                (Some(Err(Error::InitialListFailed(err))), State::Empty)
            }
        },
        State::InitListed { resource_version } => {
            match api.watch(&config.to_watch_params(), &resource_version).await {
                Ok(stream) => (None, State::Watching {
                    resource_version,
                    stream,
                }),
                Err(err) => {
                    let new_state = if err.is_gone() {
                        tracing::warn!(kind = K::KIND, %resource_version, "listed version expired");
                        State::Empty
                    } else {
                        tracing::warn!(kind = K::KIND, "watch initialization error: {err:?}");
                        State::InitListed { resource_version }
                    };
                    (Some(Err(Error::WatchStartFailed(err))), new_state)
                }
            }
        }
        State::Watching {
            resource_version,
            mut stream,
        } => match stream.next().await {
            Some(Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj))) => {
                let resource_version = obj.resource_version().unwrap_or(resource_version);
                (Some(Ok(Event::Applied(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Deleted(obj))) => {
                let resource_version = obj.resource_version().unwrap_or(resource_version);
                (Some(Ok(Event::Deleted(obj))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            Some(Ok(WatchEvent::Bookmark(bm))) => (None, State::Watching {
                resource_version: bm.resource_version,
                stream,
            }),
            Some(Ok(WatchEvent::Error(err))) => {
                // 410 Gone means we have desynced and need to start over and re-list
                let new_state = if err.code == 410 {
                    tracing::warn!(kind = K::KIND, %resource_version, "watch window expired, re-listing");
                    State::Empty
                } else {
                    tracing::warn!(kind = K::KIND, "watch error event: {err:?}");
                    State::Watching {
                        resource_version,
                        stream,
                    }
                };
                (Some(Err(Error::WatchError(err))), new_state)
            }
            Some(Err(err)) => {
                tracing::warn!(kind = K::KIND, "watcher error: {err:?}");
                (Some(Err(Error::WatchFailed(err))), State::Watching {
                    resource_version,
                    stream,
                })
            }
            None => {
                tracing::debug!(kind = K::KIND, %resource_version, "watch stream ended, resuming");
                (None, State::InitListed { resource_version })
            }
        },
    }
}

/// Trampoline helper for `step_trampolined`
async fn step<K>(api: &Api<K>, config: &Config, mut state: State<K>) -> (Result<Event<K>>, State<K>)
where
    K: Resource + Clone + Send + Sync + 'static,
{
    loop {
        match step_trampolined(api, config, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches a kind for changes continuously
///
/// Compared to [`Api::watch`], this automatically tries to recover the stream upon errors.
///
/// Errors from the underlying watch are propagated, after which the stream will go into recovery mode
/// on the next poll.
/// Apply your own backoff by not polling the stream for a duration after errors, for instance with
/// [`StreamBackoff`](crate::utils::StreamBackoff).
///
/// This is intended to provide a safe and atomic input interface for a state store like a
/// [`reflector`](crate::reflector()).
///
/// # Recovery
///
/// If the watch stream ends then we restart the watch using the last resource version that we
/// have seen on the stream, so the stream is simply resumed from where it left off.
/// If the store answers that this version is no longer retained (`410 Gone`) then we start over
/// with a new list, emitting an [`Event::Restarted`].
pub fn watcher<K>(api: Api<K>, config: Config) -> impl Stream<Item = Result<Event<K>>> + Send
where
    K: Resource + Clone + Send + Sync + 'static,
{
    futures::stream::unfold((api, config, State::Empty), |(api, config, state)| async {
        let (event, state) = step(&api, &config, state).await;
        Some((event, (api, config, state)))
    })
}
