//! Shared controllers, one per kind and namespace
//!
//! Every typed facade built over the same [`Registry`] reuses the controller it created first for that
//! kind and namespace, so all handlers registered for a kind share one watch, one cache and one queue.
use ahash::AHashMap;
use async_trait::async_trait;
use futures::future;
use norman_client::{core::Resource, Api, ObjectClient};
use norman_runtime::controller::{self, GenericController};
use parking_lot::Mutex;
use std::{
    any::{Any, TypeId},
    fmt,
    sync::Arc,
};
use tokio_util::sync::CancellationToken;

/// Something [`Registry::sync`] and [`Registry::start`] can drive
#[async_trait]
trait Starter: Send + Sync {
    async fn sync(&self, token: &CancellationToken) -> Result<(), controller::Error>;

    async fn start(&self, token: &CancellationToken, threadiness: usize) -> Result<(), controller::Error>;
}

#[async_trait]
impl<K> Starter for GenericController<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn sync(&self, token: &CancellationToken) -> Result<(), controller::Error> {
        GenericController::sync(self, token).await
    }

    async fn start(&self, token: &CancellationToken, threadiness: usize) -> Result<(), controller::Error> {
        GenericController::start(self, token, threadiness).await
    }
}

type ControllerKey = (TypeId, String);

/// Owns the controllers created through the typed facade
///
/// Controllers are created lazily on first use and keyed by kind and namespace (empty for every
/// namespace). Creation is serialized by a lock, so concurrent facades never build duplicates.
#[derive(Default)]
pub struct Registry {
    config: controller::Config,
    controllers: Mutex<AHashMap<ControllerKey, Box<dyn Any + Send + Sync>>>,
    starters: Mutex<Vec<Arc<dyn Starter>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("controllers", &self.controllers.lock().len())
            .finish()
    }
}

impl Registry {
    /// A registry whose controllers all use `config`
    pub fn new(config: controller::Config) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// The controller for `K` in `namespace`, created over `client` if it does not exist yet
    pub fn controller<K>(&self, client: &Arc<dyn ObjectClient<K>>, namespace: &str) -> GenericController<K>
    where
        K: Resource + Clone + Send + Sync + 'static,
    {
        let key = (TypeId::of::<K>(), namespace.to_string());
        let mut controllers = self.controllers.lock();
        if let Some(existing) = controllers
            .get(&key)
            .and_then(|c| c.downcast_ref::<GenericController<K>>())
        {
            return existing.clone();
        }

        let api = if namespace.is_empty() {
            Api::all(client.clone())
        } else {
            Api::namespaced(client.clone(), namespace)
        };
        let controller = GenericController::new(&format!("{}Controller", K::KIND), api, self.config.clone());
        tracing::debug!(controller = controller.name(), namespace, "created controller");
        controllers.insert(key, Box::new(controller.clone()));
        self.starters.lock().push(Arc::new(controller.clone()));
        controller
    }

    /// Number of controllers created so far
    pub fn len(&self) -> usize {
        self.controllers.lock().len()
    }

    /// Whether no controller has been created yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn starters(&self) -> Vec<Arc<dyn Starter>> {
        self.starters.lock().clone()
    }

    /// Wait until the cache of every controller is seeded
    ///
    /// # Errors
    ///
    /// [`controller::Error::SyncCancelled`] if `token` fires first.
    pub async fn sync(&self, token: &CancellationToken) -> Result<(), controller::Error> {
        let starters = self.starters();
        future::try_join_all(starters.iter().map(|s| s.sync(token))).await?;
        Ok(())
    }

    /// [`sync`](Self::sync) every controller, then start `threadiness` workers on each
    ///
    /// Controllers created after this call are not started; call it again to start them.
    ///
    /// # Errors
    ///
    /// [`controller::Error::SyncCancelled`] if `token` fires before the caches are seeded.
    pub async fn start(
        &self,
        token: &CancellationToken,
        threadiness: usize,
    ) -> Result<(), controller::Error> {
        self.sync(token).await?;
        for starter in self.starters() {
            starter.start(token, threadiness).await?;
        }
        Ok(())
    }
}
