use std::{future::Future, sync::Arc, time::Duration};

use derive_ex::Ex;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    broadcast::{InvalidationBroadcaster, InvalidationSink},
    config::RegistryConfig,
    core::{
        flight::{with_cancel, AbandonGuard, FlightFuture, FlightSlot},
        graph::{FlightOutput, Graph, Node, Snapshot, Value},
        CellId, Generation, Validity,
    },
    Arg, ComputationKey, Error, OperationId, Result, Subscription,
};

mod context;
mod operations;

pub use context::ComputeContext;

use context::Frame;
use operations::{Operation, OperationTable};


type ErasedCompute = Box<dyn FnOnce(ComputeContext) -> BoxFuture<'static, Result<Value>> + Send>;

fn erase<T, F, Fut>(f: F) -> ErasedCompute
where
    T: Send + Sync + 'static,
    F: FnOnce(ComputeContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Box::new(move |cx| f(cx).map(|r| r.map(|value| Arc::new(value) as Value)).boxed())
}

enum Lookup {
    Ready(Snapshot),
    Join(FlightFuture<FlightOutput>),
}

/// Memoizes computations by [`ComputationKey`] and keeps them consistent with their inputs.
///
/// Cloning a registry is cheap; clones share the same cells.
#[derive(Clone)]
pub struct ComputationRegistry(Arc<RegistryInner>);

struct RegistryInner {
    graph: Mutex<Graph>,
    broadcaster: InvalidationBroadcaster,
    operations: RwLock<OperationTable>,
    config: RegistryConfig,
}

impl Default for ComputationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputationRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }
    pub fn with_config(config: RegistryConfig) -> Self {
        Self(Arc::new(RegistryInner {
            graph: Mutex::new(Graph::new()),
            broadcaster: InvalidationBroadcaster::new(),
            operations: RwLock::new(OperationTable::default()),
            config,
        }))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.0.config
    }
    pub fn broadcaster(&self) -> &InvalidationBroadcaster {
        &self.0.broadcaster
    }

    /// Returns the cell for `key`, running `f` only if there is no valid result.
    ///
    /// If another caller is already computing `key`, waits for that computation instead
    /// of starting a new one. Failures of `f` are cached in the returned cell; only
    /// cyclic dependencies and cancellation are returned as `Err`.
    ///
    /// `keep_alive` overrides [`RegistryConfig::keep_alive`] for this cell.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: ComputationKey,
        keep_alive: Option<Duration>,
        f: F,
    ) -> Result<ComputedCell<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(ComputeContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.access_typed(key, None, keep_alive, erase(f), None).await
    }

    /// Like [`get_or_compute`](Self::get_or_compute), but stops waiting when `cancel` fires.
    pub async fn get_or_compute_with_cancel<T, F, Fut>(
        &self,
        key: ComputationKey,
        keep_alive: Option<Duration>,
        f: F,
        cancel: &CancellationToken,
    ) -> Result<ComputedCell<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(ComputeContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.access_typed(key, None, keep_alive, erase(f), Some(cancel)).await
    }

    /// Returns the value of `key`, computing it with `f` if needed.
    ///
    /// A cached failure is returned as `Err`.
    pub async fn compute<T, F, Fut>(&self, key: ComputationKey, f: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(ComputeContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.get_or_compute(key, None, f).await?.value()
    }

    /// Registers the computation run for keys whose operation is `operation`.
    ///
    /// Registering an operation again replaces it and invalidates its cells.
    pub fn register<T, F, Fut>(
        &self,
        operation: impl Into<OperationId>,
        keep_alive: Option<Duration>,
        f: F,
    ) where
        T: Send + Sync + 'static,
        F: Fn(ComputeContext, Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let operation = operation.into();
        let replaced = self
            .0
            .operations
            .write()
            .insert(operation.clone(), Operation::new(keep_alive, f));
        debug!(operation = %operation, replaced, "register");
        if replaced {
            self.invalidate_operation(&operation);
        }
    }

    pub fn is_registered(&self, operation: &OperationId) -> bool {
        self.0.operations.read().contains(operation)
    }

    /// Runs the registered operation of `key` through [`get_or_compute`](Self::get_or_compute).
    pub async fn call_cell<T: Send + Sync + 'static>(
        &self,
        key: ComputationKey,
    ) -> Result<ComputedCell<T>> {
        let (hold, snapshot) = self.call_erased(key.clone(), None, None).await?;
        Ok(ComputedCell::new(hold, key, snapshot))
    }

    pub async fn call<T: Send + Sync + 'static>(&self, key: ComputationKey) -> Result<Arc<T>> {
        self.call_cell(key).await?.value()
    }

    pub async fn call_with_cancel<T: Send + Sync + 'static>(
        &self,
        key: ComputationKey,
        cancel: &CancellationToken,
    ) -> Result<Arc<T>> {
        let (hold, snapshot) = self.call_erased(key.clone(), None, Some(cancel)).await?;
        ComputedCell::<T>::new(hold, key, snapshot).value()
    }

    pub(crate) async fn call_erased(
        &self,
        key: ComputationKey,
        parent: Option<&Frame>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(CellHold, Snapshot)> {
        let operation = self.0.operations.read().get(key.operation());
        let Some(operation) = operation else {
            return Err(Error::UnknownOperation {
                operation: key.operation().clone(),
            });
        };
        let keep_alive = operation.keep_alive;
        let args = key.args().to_vec();
        let compute: ErasedCompute = Box::new(move |cx| operation.call(cx, args));
        self.access(key, parent, keep_alive, compute, cancel).await
    }

    async fn access_typed<T: Send + Sync + 'static>(
        &self,
        key: ComputationKey,
        parent: Option<&Frame>,
        keep_alive: Option<Duration>,
        compute: ErasedCompute,
        cancel: Option<&CancellationToken>,
    ) -> Result<ComputedCell<T>> {
        let (hold, snapshot) = self
            .access(key.clone(), parent, keep_alive, compute, cancel)
            .await?;
        Ok(ComputedCell::new(hold, key, snapshot))
    }

    async fn access(
        &self,
        key: ComputationKey,
        parent: Option<&Frame>,
        keep_alive: Option<Duration>,
        compute: ErasedCompute,
        cancel: Option<&CancellationToken>,
    ) -> Result<(CellHold, Snapshot)> {
        let (hold, lookup) = self.begin(key, parent, keep_alive, compute)?;
        let snapshot = match lookup {
            Lookup::Ready(snapshot) => snapshot,
            Lookup::Join(flight) => with_cancel(flight, cancel).await?,
        };
        Ok((hold, snapshot))
    }

    fn begin(
        &self,
        key: ComputationKey,
        parent: Option<&Frame>,
        keep_alive: Option<Duration>,
        compute: ErasedCompute,
    ) -> Result<(CellHold, Lookup)> {
        // Declared before the lock so the user closure is dropped after it is released.
        let mut compute = Some(compute);
        let mut evicted = Vec::new();
        let mut graph = self.0.graph.lock();
        if graph.find(&key).is_none() && graph.needs_sweep(self.0.config.max_cells) {
            evicted = self.collect_locked(&mut graph);
        }
        let keep_alive = keep_alive.unwrap_or(self.0.config.keep_alive);
        let (id, _) = graph.lookup_or_insert(&key, keep_alive);
        if let Some(parent) = parent {
            link(&mut graph, parent, id, &key)?;
        }

        let existing = graph.node(id).and_then(|node| match node.valid_snapshot() {
            Some(snapshot) => Some(Lookup::Ready(snapshot.clone())),
            None => node.flight.as_ref().and_then(FlightSlot::join).map(Lookup::Join),
        });
        let lookup = if let Some(lookup) = existing {
            trace!(key = %key, hit = matches!(lookup, Lookup::Ready(_)), "reuse");
            lookup
        } else if let Some(compute) = compute.take() {
            self.start_flight(&mut graph, id, key, compute)
        } else {
            return Err(Error::Cancelled);
        };
        if let Some(node) = graph.node_mut(id) {
            node.holders += 1;
        }
        drop(graph);
        drop(evicted);
        Ok((CellHold::new(self.0.clone(), id), lookup))
    }

    fn start_flight(
        &self,
        graph: &mut Graph,
        id: CellId,
        key: ComputationKey,
        compute: ErasedCompute,
    ) -> Lookup {
        let flight = graph.next_flight_id();
        graph.clear_dependencies(id);
        let cx = ComputeContext::new(
            self.clone(),
            Frame {
                id,
                flight,
                key: key.clone(),
            },
        );
        let registry = self.clone();
        let future = async move {
            let guard = AbandonGuard::new({
                let registry = registry.clone();
                move || registry.abandon(id, flight)
            });
            debug!(key = %key, "compute");
            let result = compute(cx).await;
            guard.disarm();
            registry.commit(id, flight, result)
        }
        .boxed();
        let (slot, shared) = FlightSlot::start(flight, future);
        if let Some(node) = graph.node_mut(id) {
            node.flight = Some(slot);
            node.validity = Validity::Invalidating;
        }
        Lookup::Join(shared)
    }

    fn commit(&self, id: CellId, flight: u64, result: Result<Value>) -> FlightOutput {
        let mut graph = self.0.graph.lock();
        let current = graph
            .node(id)
            .and_then(|node| node.flight.as_ref())
            .filter(|slot| slot.id() == flight)
            .map(|slot| slot.invalidated);

        if let Err(e) = &result {
            if !e.is_cacheable() {
                if current.is_some() {
                    reset_to_invalidated(&mut graph, id);
                }
                debug!(error = %e, "computation failed without caching");
                return Err(e.clone());
            }
        }

        let generation = graph.next_generation();
        let snapshot = Snapshot { result, generation };
        let Some(invalidated) = current else {
            return Ok(snapshot);
        };
        let mut previous = None;
        if let Some(node) = graph.node_mut(id) {
            previous = node.snapshot.replace(snapshot.clone());
            node.flight = None;
            node.validity = Validity::Valid;
            trace!(key = %node.key, %generation, "commit");
        }
        if invalidated {
            // An input changed while computing: the result is stale from birth.
            // Propagate again so readers that joined this flight are invalidated too.
            let notices = self.0.broadcaster.propagate(&mut graph, id);
            self.0.broadcaster.dispatch(&notices);
        }
        drop(graph);
        drop(previous);
        Ok(snapshot)
    }

    fn abandon(&self, id: CellId, flight: u64) {
        let mut graph = self.0.graph.lock();
        let is_current = graph
            .node(id)
            .and_then(|node| node.flight.as_ref())
            .is_some_and(|slot| slot.id() == flight);
        if is_current {
            reset_to_invalidated(&mut graph, id);
            debug!(cell = id.0, "computation abandoned");
        }
    }

    /// Marks the cell of `key` and everything that read it as invalidated.
    ///
    /// Idempotent. Returns `true` if a valid result was invalidated.
    pub fn invalidate(&self, key: &ComputationKey) -> bool {
        let mut graph = self.0.graph.lock();
        let Some(id) = graph.find(key) else {
            trace!(key = %key, "invalidate absent cell");
            return false;
        };
        let notices = self.0.broadcaster.propagate(&mut graph, id);
        self.0.broadcaster.dispatch(&notices);
        !notices.is_empty()
    }

    /// Invalidates every cell of `operation`. Returns the number of invalidated results.
    pub fn invalidate_operation(&self, operation: &OperationId) -> usize {
        let mut graph = self.0.graph.lock();
        let mut count = 0;
        for id in graph.ids_of_operation(operation) {
            let notices = self.0.broadcaster.propagate(&mut graph, id);
            self.0.broadcaster.dispatch(&notices);
            count += notices.len();
        }
        count
    }

    fn invalidate_generation(&self, id: CellId, generation: Generation) -> bool {
        let mut graph = self.0.graph.lock();
        if graph.node(id).and_then(|node| node.generation()) != Some(generation) {
            return false;
        }
        let notices = self.0.broadcaster.propagate(&mut graph, id);
        self.0.broadcaster.dispatch(&notices);
        !notices.is_empty()
    }

    pub fn validity(&self, key: &ComputationKey) -> Option<Validity> {
        let graph = self.0.graph.lock();
        Some(graph.node(graph.find(key)?)?.validity)
    }

    pub fn generation(&self, key: &ComputationKey) -> Option<Generation> {
        let graph = self.0.graph.lock();
        graph.node(graph.find(key)?)?.generation()
    }

    pub fn cell_count(&self) -> usize {
        self.0.graph.lock().len()
    }

    /// Evicts unheld cells according to the keep-alive and capacity policy.
    ///
    /// Returns the number of evicted cells.
    pub fn collect_garbage(&self) -> usize {
        let mut graph = self.0.graph.lock();
        let evicted = self.collect_locked(&mut graph);
        drop(graph);
        evicted.len()
    }

    /// Returns the evicted cells so that their values are dropped after the lock is released.
    fn collect_locked(&self, graph: &mut Graph) -> Vec<Node> {
        let (evicted, notices) = graph.collect(Instant::now(), self.0.config.max_cells);
        self.0.broadcaster.dispatch(&notices);
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), remaining = graph.len(), "collect garbage");
        }
        evicted
    }

    /// Subscribes `sink` to invalidation notices for `key`.
    pub fn subscribe(&self, key: &ComputationKey, sink: Arc<dyn InvalidationSink>) -> Subscription {
        self.0.broadcaster.subscribe(key, sink)
    }
}

fn link(graph: &mut Graph, parent: &Frame, child: CellId, key: &ComputationKey) -> Result<()> {
    let is_current = graph
        .node(parent.id)
        .and_then(|node| node.flight.as_ref())
        .is_some_and(|slot| slot.id() == parent.flight);
    if !is_current {
        return Err(Error::Cancelled);
    }
    if !graph.add_dependency(parent.id, child) {
        warn!(key = %key, reader = %parent.key, "cyclic dependency");
        return Err(Error::CyclicDependency { key: key.clone() });
    }
    Ok(())
}

fn reset_to_invalidated(graph: &mut Graph, id: CellId) {
    if let Some(node) = graph.node_mut(id) {
        node.flight = None;
        node.validity = Validity::Invalidated;
        node.invalidated_at = Some(Instant::now());
    }
    graph.clear_dependencies(id);
}

/// Keeps a cell from being evicted.
pub(crate) struct CellHold {
    registry: Arc<RegistryInner>,
    id: CellId,
}

impl CellHold {
    /// The hold count must already have been incremented.
    fn new(registry: Arc<RegistryInner>, id: CellId) -> Self {
        Self { registry, id }
    }
}
impl Clone for CellHold {
    fn clone(&self) -> Self {
        if let Some(node) = self.registry.graph.lock().node_mut(self.id) {
            node.holders += 1;
        }
        Self::new(self.registry.clone(), self.id)
    }
}
impl Drop for CellHold {
    fn drop(&mut self) {
        if let Some(node) = self.registry.graph.lock().node_mut(self.id) {
            node.holders = node.holders.saturating_sub(1);
        }
    }
}

/// A result of [`ComputationRegistry::get_or_compute`].
///
/// Holds the value (or cached failure) together with the generation it was committed
/// under, and keeps the cell from being evicted while alive.
#[derive(Ex)]
#[derive_ex(Clone(bound()))]
pub struct ComputedCell<T> {
    hold: CellHold,
    key: ComputationKey,
    generation: Generation,
    value: Result<Arc<T>>,
}

impl<T: Send + Sync + 'static> ComputedCell<T> {
    fn new(hold: CellHold, key: ComputationKey, snapshot: Snapshot) -> Self {
        let value = snapshot.result.and_then(|value| {
            value
                .downcast::<T>()
                .map_err(|_| Error::TypeMismatch { key: key.clone() })
        });
        Self {
            hold,
            key,
            generation: snapshot.generation,
            value,
        }
    }
}

impl<T> ComputedCell<T> {
    pub fn key(&self) -> &ComputationKey {
        &self.key
    }
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns the value, or the cached failure.
    pub fn value(&self) -> Result<Arc<T>> {
        self.value.clone()
    }

    /// Returns [`Validity::Valid`] while this result is still the current one.
    pub fn validity(&self) -> Validity {
        let graph = self.hold.registry.graph.lock();
        match graph.node(self.hold.id) {
            Some(node)
                if node.generation() == Some(self.generation) && node.validity.is_valid() =>
            {
                Validity::Valid
            }
            _ => Validity::Invalidated,
        }
    }
    pub fn is_valid(&self) -> bool {
        self.validity().is_valid()
    }

    /// Invalidates this result if it is still the current one.
    pub fn invalidate(&self) -> bool {
        ComputationRegistry(self.hold.registry.clone())
            .invalidate_generation(self.hold.id, self.generation)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ComputedCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedCell")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("value", &self.value)
            .finish()
    }
}
