//! Arena of computed cells.
//!
//! Cells live in a [`SlabMap`] and refer to each other by [`CellId`]. Each edge is
//! stored twice: in the reader's `dependencies` and in the source's `dependents`,
//! so invalidation walks dependents in O(edges) and no cell owns another.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use slabmap::SlabMap;
use tokio::time::Instant;

use crate::{
    broadcast::InvalidationNotice,
    core::{flight::FlightSlot, CellId, Generation, Validity},
    ComputationKey, OperationId, Result,
};


pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// A result together with the generation it was committed under.
///
/// Value and generation are always read and written together.
#[derive(Clone)]
pub(crate) struct Snapshot {
    pub result: Result<Value>,
    pub generation: Generation,
}

pub(crate) type FlightOutput = Result<Snapshot>;

pub(crate) struct Node {
    pub key: ComputationKey,
    pub snapshot: Option<Snapshot>,
    pub validity: Validity,
    pub flight: Option<FlightSlot<FlightOutput>>,
    pub dependencies: Vec<CellId>,
    pub dependents: HashSet<CellId>,
    pub holders: usize,
    pub keep_alive: Duration,
    pub invalidated_at: Option<Instant>,
    pub last_access: u64,
}

impl Node {
    fn new(key: ComputationKey, keep_alive: Duration) -> Self {
        Self {
            key,
            snapshot: None,
            validity: Validity::Invalidated,
            flight: None,
            dependencies: Vec::new(),
            dependents: HashSet::new(),
            holders: 0,
            keep_alive,
            invalidated_at: Some(Instant::now()),
            last_access: 0,
        }
    }

    pub fn valid_snapshot(&self) -> Option<&Snapshot> {
        if self.validity.is_valid() {
            self.snapshot.as_ref()
        } else {
            None
        }
    }

    pub fn generation(&self) -> Option<Generation> {
        Some(self.snapshot.as_ref()?.generation)
    }

    /// Marks a valid cell invalidated. Returns `true` if the state changed.
    pub fn mark_invalidated(&mut self) -> bool {
        if self.validity != Validity::Valid {
            return false;
        }
        self.validity = Validity::Invalidated;
        self.invalidated_at = Some(Instant::now());
        true
    }

    fn is_unheld(&self) -> bool {
        self.holders == 0 && self.flight.is_none()
    }
}

pub(crate) struct Graph {
    nodes: SlabMap<Node>,
    index: HashMap<ComputationKey, CellId>,
    generation: u64,
    next_flight: u64,
    clock: u64,
    inserts_since_sweep: usize,
}

/// Number of cell creations between opportunistic sweeps of expired cells.
const SWEEP_INTERVAL: usize = 256;

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: SlabMap::new(),
            index: HashMap::new(),
            generation: 0,
            next_flight: 0,
            clock: 0,
            inserts_since_sweep: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
    pub fn find(&self, key: &ComputationKey) -> Option<CellId> {
        self.index.get(key).copied()
    }
    pub fn node(&self, id: CellId) -> Option<&Node> {
        self.nodes.get(id.0)
    }
    pub fn node_mut(&mut self, id: CellId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0)
    }
    pub fn ids_of_operation(&self, operation: &OperationId) -> Vec<CellId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.key.operation() == operation)
            .map(|(id, _)| CellId(id))
            .collect()
    }

    /// Returns the cell for `key`, creating an invalidated one if it does not exist.
    ///
    /// The second value is `true` if the cell was created.
    pub fn lookup_or_insert(
        &mut self,
        key: &ComputationKey,
        keep_alive: Duration,
    ) -> (CellId, bool) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(id) = self.find(key) {
            if let Some(node) = self.node_mut(id) {
                node.last_access = clock;
            }
            return (id, false);
        }
        self.inserts_since_sweep += 1;
        let mut node = Node::new(key.clone(), keep_alive);
        node.last_access = clock;
        let id = CellId(self.nodes.insert(node));
        self.index.insert(key.clone(), id);
        (id, true)
    }

    pub fn needs_sweep(&self, max_cells: Option<usize>) -> bool {
        self.inserts_since_sweep >= SWEEP_INTERVAL
            || max_cells.is_some_and(|max| self.nodes.len() > max)
    }

    pub fn next_generation(&mut self) -> Generation {
        self.generation += 1;
        Generation(self.generation)
    }
    pub fn next_flight_id(&mut self) -> u64 {
        self.next_flight += 1;
        self.next_flight
    }

    /// Records that `parent` read `child`.
    ///
    /// Returns `false` without recording anything if the edge would close a cycle.
    pub fn add_dependency(&mut self, parent: CellId, child: CellId) -> bool {
        if parent == child || self.depends_on(child, parent) {
            return false;
        }
        let Some(parent_node) = self.nodes.get_mut(parent.0) else {
            return true;
        };
        if parent_node.dependencies.contains(&child) {
            return true;
        }
        parent_node.dependencies.push(child);
        if let Some(child_node) = self.nodes.get_mut(child.0) {
            child_node.dependents.insert(parent);
        }
        true
    }

    /// Returns `true` if `from` reads `target`, directly or transitively.
    ///
    /// Edges of invalidated cells that are not recomputing belong to a past computation
    /// and are not followed.
    pub fn depends_on(&self, from: CellId, target: CellId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(id.0) {
                if node.validity == Validity::Invalidated && node.flight.is_none() {
                    continue;
                }
                stack.extend(node.dependencies.iter().copied());
            }
        }
        false
    }

    pub fn clear_dependencies(&mut self, id: CellId) {
        let Some(node) = self.nodes.get_mut(id.0) else {
            return;
        };
        for dependency in std::mem::take(&mut node.dependencies) {
            if let Some(source) = self.nodes.get_mut(dependency.0) {
                source.dependents.remove(&id);
            }
        }
    }

    /// Removes a cell and every edge that mentions it.
    ///
    /// Edges are pruned here rather than on traversal because arena slots are reused.
    fn remove(&mut self, id: CellId) -> Option<Node> {
        self.clear_dependencies(id);
        let node = self.nodes.remove(id.0)?;
        for dependent in &node.dependents {
            if let Some(reader) = self.nodes.get_mut(dependent.0) {
                reader.dependencies.retain(|d| *d != id);
            }
        }
        self.index.remove(&node.key);
        Some(node)
    }

    /// Evicts cells that nobody holds.
    ///
    /// First every invalidated cell whose keep-alive window has elapsed. Then, while
    /// the arena holds more than `max_cells`, cells nothing depends on, invalidated
    /// ones first and otherwise least recently used. Evicting a valid cell announces
    /// it as invalidated, since later changes to its inputs can no longer reach it.
    ///
    /// Returns the evicted cells so the caller can drop their values outside any lock.
    pub fn collect(
        &mut self,
        now: Instant,
        max_cells: Option<usize>,
    ) -> (Vec<Node>, Vec<InvalidationNotice>) {
        self.inserts_since_sweep = 0;
        let mut notices = Vec::new();
        let expired: Vec<CellId> = self
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.is_unheld()
                    && node.validity == Validity::Invalidated
                    && node
                        .invalidated_at
                        .is_some_and(|at| now.saturating_duration_since(at) >= node.keep_alive)
            })
            .map(|(id, _)| CellId(id))
            .collect();
        let mut evicted: Vec<Node> = expired.into_iter().filter_map(|id| self.remove(id)).collect();

        if let Some(max_cells) = max_cells {
            if self.nodes.len() > max_cells {
                let mut candidates: Vec<(bool, u64, CellId)> = self
                    .nodes
                    .iter()
                    .filter(|(_, node)| node.is_unheld() && node.dependents.is_empty())
                    .map(|(id, node)| (node.validity.is_valid(), node.last_access, CellId(id)))
                    .collect();
                candidates.sort();
                for (_, _, id) in candidates {
                    if self.nodes.len() <= max_cells {
                        break;
                    }
                    if let Some(node) = self.remove(id) {
                        if let Some(generation) = node.valid_snapshot().map(|s| s.generation) {
                            notices.push(InvalidationNotice::new(node.key.clone(), generation));
                        }
                        evicted.push(node);
                    }
                }
            }
        }
        (evicted, notices)
    }
}
