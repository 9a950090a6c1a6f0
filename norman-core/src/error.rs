use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error response from the object store.
///
/// The `code` follows HTTP status semantics, so a `404` is a missing object, a `409` a
/// write against a stale resource version (or a name clash on create), and a `410` a watch
/// that asked for a resource version the store no longer remembers.
#[derive(Error, Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
#[error("{message}: {reason}")]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

/// Well-known values of [`ErrorResponse::reason`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The object or index does not exist
    NotFound,
    /// An object with the same name already exists
    AlreadyExists,
    /// The write was made against a stale resource version
    Conflict,
    /// The requested resource version is no longer retained
    Expired,
    /// The request was malformed
    Invalid,
}

impl Reason {
    /// The reason string as sent by the store
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::NotFound => "NotFound",
            Reason::AlreadyExists => "AlreadyExists",
            Reason::Conflict => "Conflict",
            Reason::Expired => "Expired",
            Reason::Invalid => "Invalid",
        }
    }

    fn code(&self) -> u16 {
        match self {
            Reason::NotFound => 404,
            Reason::AlreadyExists | Reason::Conflict => 409,
            Reason::Expired => 410,
            Reason::Invalid => 422,
        }
    }
}

impl ErrorResponse {
    /// Build a failure response for a well-known reason
    pub fn new(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            status: "Failure".into(),
            message: message.into(),
            reason: reason.as_str().into(),
            code: reason.code(),
        }
    }

    /// `group_resource` (e.g. `examples.management.cattle.io`) has no object called `name`
    pub fn not_found(group_resource: &str, name: &str) -> Self {
        Self::new(Reason::NotFound, format!("{group_resource} \"{name}\" not found"))
    }

    /// `name` is already taken within `group_resource`
    pub fn already_exists(group_resource: &str, name: &str) -> Self {
        Self::new(
            Reason::AlreadyExists,
            format!("{group_resource} \"{name}\" already exists"),
        )
    }

    /// A write against `name` was based on a stale resource version
    pub fn conflict(group_resource: &str, name: &str) -> Self {
        Self::new(
            Reason::Conflict,
            format!(
                "Operation cannot be fulfilled on {group_resource} \"{name}\": the object has been modified; \
                 please apply your changes to the latest version and try again"
            ),
        )
    }

    /// The resource version `rv` has been compacted away
    pub fn gone(rv: &str) -> Self {
        Self::new(Reason::Expired, format!("too old resource version: {rv}"))
    }

    /// The request was rejected before reaching the store
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(Reason::Invalid, message)
    }

    /// Whether this is a `404 NotFound`
    pub fn is_not_found(&self) -> bool {
        self.code == 404
    }

    /// Whether this is a `409` (stale write or name clash)
    pub fn is_conflict(&self) -> bool {
        self.code == 409
    }

    /// Whether this is a `410 Gone`, the signal to re-list
    pub fn is_gone(&self) -> bool {
        self.code == 410
    }
}
