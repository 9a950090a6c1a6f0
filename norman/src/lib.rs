//! Norman is an umbrella crate for building typed watch-cache controllers over Rancher-style
//! custom resources.
//!
//! # Overview
//!
//! A kind is mirrored into a local indexed cache through a recovering watch, and every changed object is
//! reconciled through an ordered list of named handlers. Lifecycle handlers add the finalizer protocol on
//! top, so removal work runs once per participant and only after the handlers before it succeeded.
//!
//! The main modules are:
//!
//! - [`api`] with the object store seam [`ObjectClient`] and the namespace scoped [`Api`]
//! - [`runtime`] with the [`GenericController`](runtime::GenericController), the
//!   [`watcher`](runtime::watcher()), the [`reflector`](runtime::reflector()) and the
//!   [`LifecycleAdapter`](runtime::LifecycleAdapter)
//! - [`registry`] with the [`Registry`] sharing one controller per kind and namespace
//! - [`typed`] with the per-kind facade: [`Interface`], [`TypedClient`] and [`ClientCache`]
//! - [`apis`] with the `management.cattle.io/v3` kinds
//! - [`core`] with the resource model shared by all of the above
//!
//! # Reacting to changes
//!
//! ```no_run
//! use norman::{apis::management::v3::{Client, Example, Test}, MemoryStore, Registry};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(Registry::default());
//!     let client = Client::new(
//!         registry.clone(),
//!         Arc::new(MemoryStore::<Example>::new()),
//!         Arc::new(MemoryStore::<Test>::new()),
//!     );
//!
//!     let examples = client.examples("");
//!     examples.on_change("print", |example: Example| async move {
//!         let name = example.metadata.name.as_deref().unwrap_or_default();
//!         println!("{name} is now called {}", example.spec.display_name);
//!         Ok(None)
//!     })?;
//!
//!     let token = CancellationToken::new();
//!     registry.start(&token, 2).await?;
//!     token.cancelled().await;
//!     Ok(())
//! }
//! ```
#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub use norman_client::{api, error, memory};
#[doc(inline)]
pub use api::{Api, ObjectClient};
#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use memory::MemoryStore;

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Re-exports from [`norman-runtime`](norman_runtime)
#[doc(inline)]
pub use norman_runtime as runtime;

pub use crate::core::{Resource, ResourceExt};
/// Re-exports from [`norman_core`](norman_core)
#[doc(inline)]
pub use norman_core as core;

pub mod apis;

pub mod registry;
pub use registry::Registry;

pub mod typed;
pub use typed::{ClientCache, Interface, TypedClient};
