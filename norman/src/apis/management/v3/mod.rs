//! `management.cattle.io/v3`
mod example;
pub use example::{Example, ExampleSpec};

mod test;
pub use test::{Test, TestSpec};

use crate::{registry::Registry, typed::Interface, ObjectClient, TypedClient};
use std::{fmt, sync::Arc};

/// The group name of every kind in this module
pub const GROUP_NAME: &str = "management.cattle.io";
/// The version of every kind in this module
pub const VERSION: &str = "v3";

/// Typed facades for every kind in `management.cattle.io/v3`
///
/// All facades share the controllers of `registry`.
#[derive(Clone)]
pub struct Client {
    registry: Arc<Registry>,
    examples: Arc<dyn ObjectClient<Example>>,
    tests: Arc<dyn ObjectClient<Test>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("registry", &self.registry).finish()
    }
}

impl Client {
    /// Facades over one object client per kind
    pub fn new(
        registry: Arc<Registry>,
        examples: Arc<dyn ObjectClient<Example>>,
        tests: Arc<dyn ObjectClient<Test>>,
    ) -> Self {
        Self {
            registry,
            examples,
            tests,
        }
    }

    /// The registry driving this group's controllers
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// [`Example`]s in `namespace`
    pub fn examples(&self, namespace: &str) -> TypedClient<Example> {
        TypedClient::new(Interface::new(self.registry.clone(), self.examples.clone(), namespace))
    }

    /// [`Test`]s in `namespace`
    pub fn tests(&self, namespace: &str) -> TypedClient<Test> {
        TypedClient::new(Interface::new(self.registry.clone(), self.tests.clone(), namespace))
    }
}
