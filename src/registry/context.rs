use std::{future::Future, sync::Arc, time::Duration};

use crate::{core::CellId, ComputationKey, ComputationRegistry, ComputedCell, Result};

use super::erase;

/// The computation currently running for a cell.
pub(crate) struct Frame {
    pub id: CellId,
    pub flight: u64,
    pub key: ComputationKey,
}

/// Handle passed to a running computation.
///
/// Reads made through the context are recorded as dependencies of the cell being
/// computed, so invalidating what was read invalidates that cell too.
#[derive(Clone)]
pub struct ComputeContext {
    registry: ComputationRegistry,
    frame: Arc<Frame>,
}

impl ComputeContext {
    pub(crate) fn new(registry: ComputationRegistry, frame: Frame) -> Self {
        Self {
            registry,
            frame: Arc::new(frame),
        }
    }

    /// The key being computed.
    pub fn key(&self) -> &ComputationKey {
        &self.frame.key
    }

    /// The registry, for reads that must not become dependencies.
    pub fn untracked(&self) -> &ComputationRegistry {
        &self.registry
    }

    pub async fn read_cell<T, F, Fut>(
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
        self.registry
            .access_typed(key, Some(&self.frame), keep_alive, erase(f), None)
            .await
    }

    /// Reads `key` as a dependency, computing it with `f` if needed.
    ///
    /// A cached failure of `key` is returned as `Err`.
    pub async fn read<T, F, Fut>(&self, key: ComputationKey, f: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(ComputeContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.read_cell(key, None, f).await?.value()
    }

    /// Reads `key` as a dependency through its registered operation.
    pub async fn call<T: Send + Sync + 'static>(&self, key: ComputationKey) -> Result<Arc<T>> {
        let (hold, snapshot) = self
            .registry
            .call_erased(key.clone(), Some(&self.frame), None)
            .await?;
        ComputedCell::<T>::new(hold, key, snapshot).value()
    }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("key", &self.frame.key)
            .finish_non_exhaustive()
    }
}
