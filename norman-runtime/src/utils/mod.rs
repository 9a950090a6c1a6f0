//! Backoff helpers shared by the watcher and the controller

mod backoff_resettable;
mod stream_backoff;

pub use backoff_resettable::{ResettableBackoff, ResettableBackoffWrapper};
pub use stream_backoff::StreamBackoff;

use backon::ExponentialBuilder;
use std::time::Duration;

/// An unbounded exponential backoff doubling from `base` up to `cap`
pub(crate) fn exponential(base: Duration, cap: Duration) -> ResettableBackoffWrapper<ExponentialBuilder> {
    ResettableBackoffWrapper::new(
        ExponentialBuilder::default()
            .with_min_delay(base)
            .with_max_delay(cap)
            .with_factor(2.0)
            .without_max_times(),
    )
}
