//! Client-side mirrors of published computations.
//!
//! A mirror caches the last fetched result of one key and is invalidated by push
//! notices from its endpoint. It never refetches on a notice; the next read does.

use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, Weak},
};

use derive_ex::Ex;
use futures::future::FutureExt;
use parking_lot::Mutex;
use slabmap::SlabMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    broadcast::{InvalidationNotice, InvalidationSink},
    core::{
        flight::{with_cancel, AbandonGuard, FlightFuture, FlightSlot},
        Generation, Validity,
    },
    ComputationKey, Error, Result, Subscription,
};

mod endpoint;

pub use endpoint::{LocalEndpoint, RemoteEndpoint, RemoteSnapshot, RemoteValue};

#[cfg(test)]
mod tests;

type FetchOutput = Result<RemoteSnapshot>;

/// Keeps one [`ReplicaMirror`] per key for an endpoint.
#[derive(Clone)]
pub struct ReplicaClient(Arc<ClientInner>);

struct ClientInner {
    endpoint: Arc<dyn RemoteEndpoint>,
    mirrors: Mutex<HashMap<ComputationKey, Weak<MirrorNode>>>,
}

impl ReplicaClient {
    pub fn new(endpoint: impl RemoteEndpoint) -> Self {
        Self::from_arc(Arc::new(endpoint))
    }
    pub fn from_arc(endpoint: Arc<dyn RemoteEndpoint>) -> Self {
        Self(Arc::new(ClientInner {
            endpoint,
            mirrors: Mutex::new(HashMap::new()),
        }))
    }

    /// Returns the mirror of `key`, creating and subscribing it if no one holds it.
    ///
    /// The mirror is dropped together with its last handle.
    pub fn mirror<T: Send + Sync + 'static>(
        &self,
        key: ComputationKey,
    ) -> Result<ReplicaMirror<T>> {
        if let Some(node) = self.0.mirrors.lock().get(&key).and_then(Weak::upgrade) {
            return Ok(ReplicaMirror::new(node));
        }
        let node = Arc::new(MirrorNode {
            key: key.clone(),
            client: Arc::downgrade(&self.0),
            endpoint: self.0.endpoint.clone(),
            state: Mutex::new(MirrorState::default()),
            listeners: Mutex::new(SlabMap::new()),
            subscription: Mutex::new(Subscription::empty()),
        });
        // Subscribe before the first fetch so that no invalidation can slip in between.
        let sink = Arc::new(MirrorSink(Arc::downgrade(&node)));
        *node.subscription.lock() = self.0.endpoint.subscribe(&key, sink)?;

        let mut mirrors = self.0.mirrors.lock();
        let existing = mirrors.get(&key).and_then(Weak::upgrade);
        let node = match existing {
            Some(existing) => {
                drop(mirrors);
                existing
            }
            None => {
                mirrors.insert(key.clone(), Arc::downgrade(&node));
                drop(mirrors);
                debug!(key = %key, "mirror created");
                node
            }
        };
        Ok(ReplicaMirror::new(node))
    }

    /// Reads `key` through its mirror.
    pub async fn read<T: Send + Sync + 'static>(&self, key: ComputationKey) -> Result<Arc<T>> {
        self.mirror::<T>(key)?.read().await
    }

    pub fn mirror_count(&self) -> usize {
        self.0
            .mirrors
            .lock()
            .values()
            .filter(|m| m.strong_count() > 0)
            .count()
    }
}

impl std::fmt::Debug for ReplicaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaClient")
            .field("mirrors", &self.mirror_count())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct MirrorState {
    cached: Option<RemoteSnapshot>,
    validity: Validity,
    invalidated_through: Option<Generation>,
    flight: Option<FlightSlot<FetchOutput>>,
    next_flight: u64,
}

struct MirrorNode {
    key: ComputationKey,
    client: Weak<ClientInner>,
    endpoint: Arc<dyn RemoteEndpoint>,
    state: Mutex<MirrorState>,
    listeners: Mutex<SlabMap<Arc<dyn InvalidationSink>>>,
    subscription: Mutex<Subscription>,
}

struct MirrorSink(Weak<MirrorNode>);

impl InvalidationSink for MirrorSink {
    fn notify(&self, notice: &InvalidationNotice) {
        if let Some(node) = self.0.upgrade() {
            node.on_notice(notice);
        }
    }
}

impl MirrorNode {
    fn on_notice(&self, notice: &InvalidationNotice) {
        {
            let mut state = self.state.lock();
            state.invalidated_through = state.invalidated_through.max(Some(notice.generation));
            let cached = state.cached.as_ref().map(|c| c.generation);
            if cached.is_some_and(|g| g > notice.generation) {
                trace!(key = %self.key, generation = %notice.generation, "ignore old notice");
                return;
            }
            if state.validity.is_valid() {
                state.validity = Validity::Invalidated;
            }
        }
        trace!(key = %self.key, generation = %notice.generation, "mirror invalidated");
        self.forward(notice);
    }

    fn forward(&self, notice: &InvalidationNotice) {
        let listeners: Vec<_> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener.notify(notice);
        }
    }

    fn invalidate(&self) -> bool {
        let generation = {
            let mut state = self.state.lock();
            if !state.validity.is_valid() {
                return false;
            }
            state.validity = Validity::Invalidated;
            state.cached.as_ref().map(|c| c.generation)
        };
        if let Some(generation) = generation {
            self.forward(&InvalidationNotice::new(self.key.clone(), generation));
        }
        true
    }

    async fn read(self: &Arc<Self>, cancel: Option<&CancellationToken>) -> Result<RemoteSnapshot> {
        let flight = {
            let mut state = self.state.lock();
            if state.validity.is_valid() {
                if let Some(cached) = &state.cached {
                    return Ok(cached.clone());
                }
            }
            match state.flight.as_ref().and_then(FlightSlot::join) {
                Some(flight) => flight,
                None => self.start_fetch(&mut state),
            }
        };
        with_cancel(flight, cancel).await
    }

    fn start_fetch(self: &Arc<Self>, state: &mut MirrorState) -> FlightFuture<FetchOutput> {
        state.next_flight += 1;
        let id = state.next_flight;
        let node = self.clone();
        let future = async move {
            let guard = AbandonGuard::new({
                let node = node.clone();
                move || node.abandon(id)
            });
            debug!(key = %node.key, "fetch");
            let result = node.endpoint.fetch(&node.key).await;
            guard.disarm();
            node.commit(id, result)
        }
        .boxed();
        let (slot, shared) = FlightSlot::start(id, future);
        state.flight = Some(slot);
        state.validity = Validity::Invalidating;
        shared
    }

    fn commit(&self, id: u64, fetched: Result<RemoteSnapshot>) -> FetchOutput {
        let mut state = self.state.lock();
        let is_current = state.flight.as_ref().is_some_and(|f| f.id() == id);
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                if is_current {
                    state.flight = None;
                    state.validity = Validity::Invalidated;
                }
                drop(state);
                warn!(key = %self.key, error = %e, "fetch failed");
                return Err(match e {
                    Error::RemoteUnavailable { .. } | Error::Cancelled => e,
                    e => Error::remote_unavailable(self.key.clone(), e),
                });
            }
        };
        if !is_current {
            return Ok(fetched);
        }
        state.flight = None;
        let mut previous = None;
        if state
            .cached
            .as_ref()
            .map_or(true, |c| c.generation < fetched.generation)
        {
            previous = state.cached.replace(fetched.clone());
        }
        let current = state.cached.clone().unwrap_or(fetched);
        state.validity = if state
            .invalidated_through
            .is_some_and(|g| g >= current.generation)
        {
            Validity::Invalidated
        } else {
            Validity::Valid
        };
        trace!(
            key = %self.key,
            generation = %current.generation,
            validity = %state.validity,
            "fetched"
        );
        drop(state);
        drop(previous);
        Ok(current)
    }

    fn abandon(&self, id: u64) {
        let mut state = self.state.lock();
        if state.flight.as_ref().is_some_and(|f| f.id() == id) {
            state.flight = None;
            state.validity = Validity::Invalidated;
        }
    }
}

impl Drop for MirrorNode {
    fn drop(&mut self) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let mut mirrors = client.mirrors.lock();
        let is_self = mirrors
            .get(&self.key)
            .is_some_and(|m| std::ptr::eq(m.as_ptr(), self));
        if is_self {
            mirrors.remove(&self.key);
            trace!(key = %self.key, "mirror dropped");
        }
    }
}

/// Local copy of a published computation.
#[derive(Ex)]
#[derive_ex(Clone(bound()))]
pub struct ReplicaMirror<T> {
    node: Arc<MirrorNode>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ReplicaMirror<T> {
    fn new(node: Arc<MirrorNode>) -> Self {
        Self {
            node,
            _phantom: PhantomData,
        }
    }

    /// Returns the cached value if valid, otherwise fetches it.
    ///
    /// Concurrent reads share one fetch. A failed fetch returns
    /// [`Error::RemoteUnavailable`] and leaves the mirror invalidated.
    pub async fn read(&self) -> Result<Arc<T>> {
        self.downcast(self.node.read(None).await?)
    }

    pub async fn read_with_cancel(&self, cancel: &CancellationToken) -> Result<Arc<T>> {
        self.downcast(self.node.read(Some(cancel)).await?)
    }

    fn downcast(&self, snapshot: RemoteSnapshot) -> Result<Arc<T>> {
        snapshot.result?.downcast::<T>().map_err(|_| Error::TypeMismatch {
            key: self.node.key.clone(),
        })
    }
}

impl<T> ReplicaMirror<T> {
    pub fn key(&self) -> &ComputationKey {
        &self.node.key
    }
    pub fn validity(&self) -> Validity {
        self.node.state.lock().validity
    }
    pub fn is_valid(&self) -> bool {
        self.validity().is_valid()
    }

    /// Generation of the cached result, if any was fetched.
    pub fn generation(&self) -> Option<Generation> {
        self.node.state.lock().cached.as_ref().map(|c| c.generation)
    }

    /// Forces the next read to refetch. The source is not affected.
    pub fn invalidate(&self) -> bool {
        self.node.invalidate()
    }

    /// Forwards invalidations of this mirror to `sink`.
    pub fn subscribe(&self, sink: Arc<dyn InvalidationSink>) -> Subscription {
        let slot = self.node.listeners.lock().insert(sink);
        Subscription::from_weak_fn(Arc::downgrade(&self.node), move |node| {
            node.listeners.lock().remove(slot);
        })
    }
}

impl<T> std::fmt::Debug for ReplicaMirror<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaMirror")
            .field("key", &self.node.key)
            .field("validity", &self.validity())
            .field("generation", &self.generation())
            .finish()
    }
}
