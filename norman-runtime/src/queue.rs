//! A deduplicating work queue with per-key serialization and rate-limited retries
//!
//! Keys move through `Pending -> Processing -> {Done, Pending}`:
//!
//! - adding a key that is already pending is a no-op, so repeated changes coalesce into one item,
//! - a key handed out by [`WorkQueue::get`] is not handed out again until [`WorkQueue::done`] is called,
//!   keys added in the meantime are parked and requeued by `done`,
//! - [`WorkQueue::add_rate_limited`] requeues after a per-key exponential backoff that
//!   [`WorkQueue::forget`] resets.
use crate::utils::{exponential, ResettableBackoff, ResettableBackoffWrapper};
use ahash::{AHashMap, AHashSet};
use backon::ExponentialBuilder;
use parking_lot::Mutex;
use std::{collections::VecDeque, fmt, hash::Hash, sync::Arc, time::Duration};
use tokio::sync::Notify;

struct State<T> {
    queue: VecDeque<T>,
    /// Keys waiting to be processed, whether queued or parked behind an in-flight run
    dirty: AHashSet<T>,
    processing: AHashSet<T>,
    backoffs: AHashMap<T, ResettableBackoffWrapper<ExponentialBuilder>>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    retry_base: Duration,
    retry_cap: Duration,
}

/// A cloneable handle to a shared work queue
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// An empty queue whose retry delays double from `retry_base` up to `retry_cap`
    pub fn new(retry_base: Duration, retry_cap: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: AHashSet::new(),
                    processing: AHashSet::new(),
                    backoffs: AHashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                retry_base,
                retry_cap,
            }),
        }
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: T) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || !state.dirty.insert(item.clone()) {
            return;
        }
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add `item` once `delay` has passed
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Add `item` after its next backoff delay, returning that delay
    ///
    /// Nothing is tracked or scheduled once the queue is shutting down.
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return Duration::ZERO;
            }
            let (base, cap) = (self.inner.retry_base, self.inner.retry_cap);
            state
                .backoffs
                .entry(item.clone())
                .or_insert_with(|| exponential(base, cap))
                .next()
                .unwrap_or(cap)
        };
        self.add_after(item, delay);
        delay
    }

    /// Reset the retry backoff of `item`
    pub fn forget(&self, item: &T) {
        if let Some(mut backoff) = self.inner.state.lock().backoffs.remove(item) {
            backoff.reset();
        }
    }

    /// Wait for the next item, or `None` once the queue is shut down
    ///
    /// The item is not handed out again until it is marked [`done`](Self::done).
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Finish processing `item`, requeueing it if it was added in the meantime
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out items and wake every waiting consumer
    ///
    /// Pending items and retry backoffs are dropped.
    pub fn shut_down(&self) {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        tracing::debug!(dropped = state.queue.len(), "work queue shutting down");
        state.queue.clear();
        state.dirty.clear();
        state.backoffs.clear();
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Whether [`shut_down`](Self::shut_down) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// The number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no item is waiting to be handed out
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of items with a retry backoff in progress
    pub fn retrying(&self) -> usize {
        self.inner.state.lock().backoffs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::WorkQueue;
    use futures::{pin_mut, poll};
    use std::{task::Poll, time::Duration};

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(Duration::from_millis(5), Duration::from_millis(40))
    }

    #[tokio::test]
    async fn repeated_adds_coalesce() {
        let q = queue();
        q.add("a");
        q.add("b");
        q.add("a");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn in_flight_key_is_parked_until_done() {
        let q = queue();
        q.add("a");
        assert_eq!(q.get().await, Some("a"));
        q.add("a");
        q.add("a");
        assert!(q.is_empty());

        let next = q.get();
        pin_mut!(next);
        assert_eq!(poll!(next.as_mut()), Poll::Pending);
        q.done(&"a");
        assert_eq!(poll!(next), Poll::Ready(Some("a")));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_retries_back_off_until_forgotten() {
        tokio::time::pause();
        let q = queue();
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(5));
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(10));
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(20));
        assert_eq!(q.add_rate_limited("b"), Duration::from_millis(5));
        q.forget(&"a");
        assert_eq!(q.add_rate_limited("a"), Duration::from_millis(5));

        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_millis(6)).await;
        let mut ready = [q.get().await, q.get().await];
        ready.sort_unstable();
        assert_eq!(ready, [Some("a"), Some("b")]);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_consumers() {
        let q = queue();
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });
        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        q.add("a");
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_drops_pending_items_and_backoffs() {
        tokio::time::pause();
        let q = queue();
        q.add("a");
        q.add_rate_limited("b");
        q.add_rate_limited("b");
        assert_eq!(q.retrying(), 1);

        q.shut_down();
        assert!(q.is_empty());
        assert_eq!(q.retrying(), 0);
        assert_eq!(q.add_rate_limited("c"), Duration::ZERO);
        assert_eq!(q.retrying(), 0);
    }

    #[tokio::test]
    async fn workers_share_items() {
        let q = queue();
        let workers = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move {
                    let item = q.get().await;
                    if let Some(item) = item {
                        q.done(&item);
                    }
                    item
                })
            })
            .collect::<Vec<_>>();
        for item in ["a", "b", "c"] {
            q.add(item);
        }
        let mut seen = Vec::new();
        for worker in workers {
            seen.extend(worker.await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, ["a", "b", "c"]);
    }
}
