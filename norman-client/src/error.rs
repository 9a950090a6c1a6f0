//! Error handling in [`norman_client`][crate]
use thiserror::Error;

pub use norman_core::ErrorResponse;

/// A type-erased error, as produced by transports and user callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Possible errors when working with an object store
#[derive(Error, Debug)]
pub enum Error {
    /// ApiError for when things fail
    ///
    /// This can be parsed into as an error handling fallback.
    /// It's also used in `WatchEvent` from watch calls.
    ///
    /// It's quite common to get a `410 Gone` when the `resourceVersion` is too old.
    #[error("ApiError: {0} ({0:?})")]
    Api(#[source] ErrorResponse),

    /// The store could not be reached, or failed while serving the request
    #[error("ServiceError: {0}")]
    Service(#[source] BoxError),

    /// Common error case when converting objects to or from their serialized form
    #[error("Error deserializing response: {0}")]
    SerdeError(#[source] serde_json::Error),

    /// A JSON patch could not be applied to the stored object
    #[error("Error applying patch: {0}")]
    PatchError(#[source] json_patch::PatchError),
}

impl Error {
    /// The object (or index) is absent; returned to the caller, not retried
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api(resp) if resp.is_not_found())
    }

    /// The write was made against a stale resource version; re-fetch and retry, or propagate
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Api(resp) if resp.is_conflict())
    }

    /// The requested resource version is no longer retained; re-list
    pub fn is_gone(&self) -> bool {
        matches!(self, Error::Api(resp) if resp.is_gone())
    }

    /// Network or server side failures that are worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Service(_) => true,
            Error::Api(resp) => resp.code == 429 || resp.code >= 500 || resp.is_gone(),
            Error::SerdeError(_) | Error::PatchError(_) => false,
        }
    }
}

impl From<ErrorResponse> for Error {
    fn from(resp: ErrorResponse) -> Self {
        Error::Api(resp)
    }
}
