use std::{any::Any, sync::Arc};

use futures::future::{BoxFuture, FutureExt};

use crate::{
    broadcast::InvalidationSink, core::Generation, ComputationKey, ComputationRegistry, Result,
    Subscription,
};

pub type RemoteValue = Arc<dyn Any + Send + Sync>;

/// A result published by an endpoint, with the generation it was committed under.
///
/// Failures of the computation itself travel in `result`; a failed transport is
/// reported by [`RemoteEndpoint::fetch`] returning `Err` instead.
#[derive(Clone)]
pub struct RemoteSnapshot {
    pub result: Result<RemoteValue>,
    pub generation: Generation,
}

impl std::fmt::Debug for RemoteSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSnapshot")
            .field("ok", &self.result.is_ok())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Source of computed results for a [`ReplicaClient`](super::ReplicaClient).
pub trait RemoteEndpoint: Send + Sync + 'static {
    /// Fetches the current result of `key`.
    fn fetch(&self, key: &ComputationKey) -> BoxFuture<'static, Result<RemoteSnapshot>>;

    /// Pushes invalidation notices for `key` to `sink` until the subscription is dropped.
    fn subscribe(
        &self,
        key: &ComputationKey,
        sink: Arc<dyn InvalidationSink>,
    ) -> Result<Subscription>;
}

/// Publishes the registered operations of a registry in the same process.
#[derive(Clone)]
pub struct LocalEndpoint {
    registry: ComputationRegistry,
}

impl LocalEndpoint {
    pub fn new(registry: ComputationRegistry) -> Self {
        Self { registry }
    }
    pub fn registry(&self) -> &ComputationRegistry {
        &self.registry
    }
}

impl RemoteEndpoint for LocalEndpoint {
    fn fetch(&self, key: &ComputationKey) -> BoxFuture<'static, Result<RemoteSnapshot>> {
        let registry = self.registry.clone();
        let key = key.clone();
        async move {
            let (_hold, snapshot) = registry.call_erased(key, None, None).await?;
            Ok(RemoteSnapshot {
                result: snapshot.result,
                generation: snapshot.generation,
            })
        }
        .boxed()
    }

    fn subscribe(
        &self,
        key: &ComputationKey,
        sink: Arc<dyn InvalidationSink>,
    ) -> Result<Subscription> {
        Ok(self.registry.subscribe(key, sink))
    }
}
