//! Runtime components for norman controllers
//!
//! This crate holds the core building blocks for keeping a local cache of a kind in sync with an
//! object store and reconciling its objects through ordered, named handlers:
//!
//! - [`watcher`] turns list and watch calls into a recovering stream of cache events,
//! - [`reflector`] applies those events to an indexed [`Store`],
//! - [`WorkQueue`] coalesces keys and serializes work per key,
//! - [`GenericController`] ties them together and dispatches registered handlers,
//! - [`lifecycle`] wraps create/update/remove callbacks in the finalizer protocol.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod controller;
pub mod lifecycle;
pub mod queue;
pub mod reflector;
pub mod utils;
pub mod watcher;

pub use controller::{GenericController, Lister};
pub use lifecycle::{LifecycleAdapter, ObjectLifecycle};
pub use queue::WorkQueue;
pub use reflector::{reflector, Store};
pub use watcher::watcher;
