use std::{
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use futures::{Stream, TryStream};
use pin_project::pin_project;
use tokio::time::{sleep, Sleep};

use super::ResettableBackoff;

/// Pauses a fallible stream after every error for the next delay of a [`ResettableBackoff`]
///
/// The error itself is passed through before the pause starts. Any [`Ok`] item resets the backoff,
/// and a backoff that runs out of delays ends the stream.
#[pin_project]
pub struct StreamBackoff<S, B> {
    #[pin]
    stream: S,
    backoff: B,
    #[pin]
    pause: Option<Sleep>,
    exhausted: bool,
}

impl<S: TryStream, B: ResettableBackoff> StreamBackoff<S, B> {
    /// Pace the errors of `stream` with `backoff`
    pub fn new(stream: S, backoff: B) -> Self {
        Self {
            stream,
            backoff,
            pause: None,
            exhausted: false,
        }
    }
}

impl<S: TryStream, B: ResettableBackoff> Stream for StreamBackoff<S, B> {
    type Item = Result<S::Ok, S::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.exhausted {
            return Poll::Ready(None);
        }
        if let Some(pause) = this.pause.as_mut().as_pin_mut() {
            ready!(pause.poll(cx));
            tracing::trace!("pause elapsed, polling again");
            this.pause.set(None);
        }

        let item = ready!(this.stream.try_poll_next(cx));
        match &item {
            Some(Err(_)) => match this.backoff.next() {
                Some(delay) => {
                    tracing::debug!(?delay, "stream failed, pausing");
                    this.pause.set(Some(sleep(delay)));
                }
                None => {
                    tracing::debug!("backoff exhausted, closing stream");
                    *this.exhausted = true;
                }
            },
            Some(Ok(_)) => this.backoff.reset(),
            None => {}
        }
        Poll::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use std::{task::Poll, time::Duration};

    use super::StreamBackoff;
    use crate::utils::{exponential, ResettableBackoffWrapper};
    use backon::ConstantBuilder;
    use futures::{channel::mpsc, pin_mut, poll, stream, StreamExt};

    /// Timer deadlines are rounded up to the next millisecond, so step just past them
    const SLACK: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn errors_pause_the_stream() {
        tokio::time::pause();
        let delay = Duration::from_millis(800);
        let items = StreamBackoff::new(
            stream::iter([Ok("listed"), Err("gone"), Ok("relisted")]),
            ResettableBackoffWrapper::new(ConstantBuilder::default().with_delay(delay).without_max_times()),
        );
        pin_mut!(items);
        assert_eq!(poll!(items.next()), Poll::Ready(Some(Ok("listed"))));
        assert_eq!(poll!(items.next()), Poll::Ready(Some(Err("gone"))));
        assert_eq!(poll!(items.next()), Poll::Pending);
        tokio::time::advance(delay - SLACK).await;
        assert_eq!(poll!(items.next()), Poll::Pending);
        tokio::time::advance(SLACK * 2).await;
        assert_eq!(poll!(items.next()), Poll::Ready(Some(Ok("relisted"))));
        assert_eq!(poll!(items.next()), Poll::Ready(None));
    }

    #[tokio::test]
    async fn consecutive_errors_double_the_pause_until_a_success() {
        tokio::time::pause();
        let second = Duration::from_secs(1);
        let (tx, rx) = mpsc::unbounded::<Result<u8, u8>>();
        let items = StreamBackoff::new(rx, exponential(second, Duration::from_secs(30)));
        pin_mut!(items);

        tx.unbounded_send(Err(1)).unwrap();
        tx.unbounded_send(Err(2)).unwrap();
        tx.unbounded_send(Ok(3)).unwrap();
        tx.unbounded_send(Err(4)).unwrap();
        assert_eq!(poll!(items.next()), Poll::Ready(Some(Err(1))));
        tokio::time::advance(second + SLACK).await;
        assert_eq!(poll!(items.next()), Poll::Ready(Some(Err(2))));
        tokio::time::advance(second).await;
        assert_eq!(poll!(items.next()), Poll::Pending);
        tokio::time::advance(second + SLACK).await;
        assert_eq!(poll!(items.next()), Poll::Ready(Some(Ok(3))));
        // the success reset the backoff
        assert_eq!(poll!(items.next()), Poll::Ready(Some(Err(4))));
        tokio::time::advance(second + SLACK).await;
        drop(tx);
        assert_eq!(poll!(items.next()), Poll::Ready(None));
    }

    #[tokio::test]
    async fn exhausted_backoff_ends_the_stream() {
        let never = ResettableBackoffWrapper::new(ConstantBuilder::default().with_max_times(0));
        let items = StreamBackoff::new(stream::iter([Ok(0), Err(1), Ok(2)]), never)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(items, [Ok(0), Err(1)]);
    }
}
