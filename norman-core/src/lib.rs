//! Types and traits shared by every norman crate
//!
//! This crate has no client and no runtime. It describes what a resource looks like,
//! how it is selected, and what the object store says back.
//! The same information is re-exported from `norman` under `norman::core`.
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod gvk;
pub use gvk::{GroupVersion, GroupVersionKind, GroupVersionResource};

pub mod labels;
pub use labels::Selector;

pub mod object;
pub use object::ObjectList;

pub mod params;

mod resource;
pub use resource::{ObjectMeta, Resource, ResourceExt};

pub mod watch;
pub use watch::WatchEvent;

mod error;
pub use error::{ErrorResponse, Reason};

/// Convient alias for `Result<T, ErrorResponse>`
pub type Result<T, E = ErrorResponse> = std::result::Result<T, E>;
