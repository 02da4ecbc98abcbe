//! Single-flight slots.
//!
//! A flight is a boxed future wrapped in [`Shared`]. Every caller that wants the
//! result polls its own `Shared` clone, while the owner of the slot only keeps a
//! [`WeakShared`]. When the last caller stops waiting, the future is dropped, which
//! is how a computation or fetch nobody waits for anymore gets cancelled.

use std::future::Future;

use futures::{
    future::{select, BoxFuture, Either, FutureExt, Shared, WeakShared},
    pin_mut,
};
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

#[cfg(test)]
mod tests;

pub(crate) type FlightFuture<T> = Shared<BoxFuture<'static, T>>;

pub(crate) struct FlightSlot<T> {
    id: u64,
    weak: Option<WeakShared<BoxFuture<'static, T>>>,
    /// Set when the inputs of this flight were invalidated before it finished.
    pub invalidated: bool,
}

impl<T: Clone> FlightSlot<T> {
    /// Starts a flight. The returned future must be polled by the caller.
    pub fn start(id: u64, future: BoxFuture<'static, T>) -> (Self, FlightFuture<T>) {
        let shared = future.shared();
        let slot = FlightSlot {
            id,
            weak: shared.downgrade(),
            invalidated: false,
        };
        (slot, shared)
    }

    /// Joins the flight, or returns `None` if every caller has already left it.
    pub fn join(&self) -> Option<FlightFuture<T>> {
        self.weak.as_ref()?.upgrade()
    }
}

impl<T> FlightSlot<T> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Runs a callback when dropped unless disarmed.
///
/// Placed inside a flight future so that dropping the future before it
/// completes can restore the state it was about to update.
pub(crate) struct AbandonGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> AbandonGuard<F> {
    pub fn new(on_abandon: F) -> Self {
        Self(Some(on_abandon))
    }
    pub fn disarm(mut self) {
        self.0 = None;
    }
}
impl<F: FnOnce()> Drop for AbandonGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Waits for `future`, giving up with [`Error::Cancelled`] once `cancel` fires.
///
/// Cancellation is checked before `future` is polled, so a future that becomes ready
/// at the same time as the cancellation is dropped unfinished.
///
/// Giving up drops `future`, which only leaves a shared flight; the flight itself
/// keeps running for the callers still waiting on it.
pub(crate) async fn with_cancel<T>(
    future: impl Future<Output = Result<T>>,
    cancel: Option<&CancellationToken>,
) -> Result<T> {
    let Some(cancel) = cancel else {
        return future.await;
    };
    let cancelled = cancel.cancelled();
    pin_mut!(future);
    pin_mut!(cancelled);
    match select(cancelled, future).await {
        Either::Left(((), _)) => Err(Error::Cancelled),
        Either::Right((result, _)) => result,
    }
}
