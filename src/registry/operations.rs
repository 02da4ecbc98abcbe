use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use futures::future::{BoxFuture, FutureExt};

use crate::{core::graph::Value, Arg, OperationId, Result};

use super::ComputeContext;

type ErasedOperation =
    Box<dyn Fn(ComputeContext, Vec<Arg>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

pub(crate) struct Operation {
    pub keep_alive: Option<Duration>,
    compute: ErasedOperation,
}

impl Operation {
    pub fn new<T, F, Fut>(keep_alive: Option<Duration>, f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(ComputeContext, Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            keep_alive,
            compute: Box::new(move |cx, args| {
                f(cx, args)
                    .map(|r| r.map(|value| Arc::new(value) as Value))
                    .boxed()
            }),
        }
    }

    pub fn call(&self, cx: ComputeContext, args: Vec<Arg>) -> BoxFuture<'static, Result<Value>> {
        (self.compute)(cx, args)
    }
}

#[derive(Default)]
pub(crate) struct OperationTable(HashMap<OperationId, Arc<Operation>>);

impl OperationTable {
    /// Returns `true` if an operation with the same id was replaced.
    pub fn insert(&mut self, id: OperationId, operation: Operation) -> bool {
        self.0.insert(id, Arc::new(operation)).is_some()
    }
    pub fn get(&self, id: &OperationId) -> Option<Arc<Operation>> {
        self.0.get(id).cloned()
    }
    pub fn contains(&self, id: &OperationId) -> bool {
        self.0.contains_key(id)
    }
}
