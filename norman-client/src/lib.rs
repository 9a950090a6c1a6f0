//! Object store client for norman controllers
//!
//! The runtime never talks to a wire protocol directly. It consumes an [`ObjectClient`]: anything that can
//! create, get, update, delete, list, watch and patch objects of one kind. [`Api`] scopes such a client
//! to a namespace (or to all of them) and is the handle passed around to controllers and handlers.
//!
//! [`MemoryStore`] is an in-process implementation with the semantics controllers rely on: resource versions,
//! optimistic concurrency, finalizer-gated deletion and resumable watches.

pub mod api;
pub use api::{Api, ObjectClient};

pub mod error;
pub use error::{BoxError, Error};

pub mod memory;
pub use memory::MemoryStore;

/// Re-exports from `norman-core`
pub use norman_core as core;

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
