use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slabmap::SlabMap;
use tracing::{debug, trace};

use crate::{
    core::{graph::Graph, CellId, Generation},
    ComputationKey, Subscription,
};

#[cfg(test)]
mod tests;

/// Announcement that the result of `key` committed under `generation` (and anything
/// older) is stale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationNotice {
    pub key: ComputationKey,
    pub generation: Generation,
}

impl InvalidationNotice {
    pub fn new(key: ComputationKey, generation: Generation) -> Self {
        Self { key, generation }
    }
}

/// Receiver of invalidation notices.
///
/// Notices are delivered while the registry is being updated, so implementations
/// must return quickly and must not call back into the registry. Delivery is
/// at-least-once: the same notice may arrive more than once.
pub trait InvalidationSink: Send + Sync + 'static {
    fn notify(&self, notice: &InvalidationNotice);
}
impl<F> InvalidationSink for F
where
    F: Fn(&InvalidationNotice) + Send + Sync + 'static,
{
    fn notify(&self, notice: &InvalidationNotice) {
        self(notice)
    }
}

type Sinks = HashMap<ComputationKey, SlabMap<Arc<dyn InvalidationSink>>>;

/// Propagates invalidation through the dependents graph and announces it to subscribers.
#[derive(Clone, Default)]
pub struct InvalidationBroadcaster {
    sinks: Arc<Mutex<Sinks>>,
}

impl InvalidationBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sink` for notices about `key`. Dropping the subscription unregisters it.
    pub fn subscribe(&self, key: &ComputationKey, sink: Arc<dyn InvalidationSink>) -> Subscription {
        let slot = self
            .sinks
            .lock()
            .entry(key.clone())
            .or_default()
            .insert(sink);
        let key = key.clone();
        Subscription::from_weak_fn(Arc::downgrade(&self.sinks), move |sinks| {
            let mut sinks = sinks.lock();
            if let Some(entries) = sinks.get_mut(&key) {
                entries.remove(slot);
                if entries.is_empty() {
                    sinks.remove(&key);
                }
            }
        })
    }

    pub fn subscriber_count(&self, key: &ComputationKey) -> usize {
        self.sinks.lock().get(key).map_or(0, |entries| entries.len())
    }

    /// Marks `start` and everything that transitively read it as invalidated.
    ///
    /// Walks dependents breadth-first. Each valid cell turns invalidated exactly once
    /// and yields a notice; a cell with a computation in flight has that flight marked
    /// so its result is stored as stale. Cells that are already invalidated stop the walk.
    pub(crate) fn propagate(&self, graph: &mut Graph, start: CellId) -> Vec<InvalidationNotice> {
        let mut notices = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = graph.node_mut(id) else {
                continue;
            };
            let changed = if node.mark_invalidated() {
                if let Some(generation) = node.generation() {
                    notices.push(InvalidationNotice::new(node.key.clone(), generation));
                }
                true
            } else if let Some(flight) = &mut node.flight {
                !std::mem::replace(&mut flight.invalidated, true)
            } else {
                false
            };
            if !changed {
                continue;
            }
            trace!(key = %node.key, validity = %node.validity, "invalidate");
            queue.extend(node.dependents.iter().copied());
        }
        if !notices.is_empty() {
            debug!(count = notices.len(), root = %notices[0].key, "invalidated");
        }
        notices
    }

    /// Delivers notices to the sinks subscribed to their keys.
    ///
    /// Callers hold the registry lock while dispatching, which keeps notices for one
    /// key in the order they were produced.
    pub fn dispatch(&self, notices: &[InvalidationNotice]) {
        if notices.is_empty() {
            return;
        }
        let mut targets = Vec::new();
        {
            let sinks = self.sinks.lock();
            for notice in notices {
                if let Some(entries) = sinks.get(&notice.key) {
                    for sink in entries.values() {
                        targets.push((sink.clone(), notice));
                    }
                }
            }
        }
        for (sink, notice) in targets {
            sink.notify(notice);
        }
    }
}
