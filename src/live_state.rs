//! Debounced recomputation of a derived value.
//!
//! A [`LiveState`] runs its updater once on creation and again, after
//! [`LiveStateConfig::update_delay`], whenever something it read is invalidated or its
//! parameters change. Each result is published to an observer.

use std::{future::Future, mem::replace, sync::Arc, sync::Weak, time::Duration};

use futures::{
    future::{select, BoxFuture, Either, FutureExt},
    pin_mut,
};
use parking_lot::{Mutex, ReentrantMutex};
use parse_display::Display;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    broadcast::{InvalidationNotice, InvalidationSink},
    config::LiveStateConfig,
    core::flight::with_cancel,
    ComputationKey, ComputationRegistry, ComputeContext, ReplicaMirror, Result, Subscription,
};


#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// The latest result is current.
    Idle,
    /// An invalidation arrived; the update runs after the update delay.
    Scheduled,
    /// The updater is running.
    Computing,
    /// The updater failed; it is retried after the retry delay.
    Error,
    Disposed,
}

/// Receives every result of a [`LiveState`].
///
/// Called from the task driving the live state; must not block.
pub trait LiveStateObserver<T>: Send + Sync + 'static {
    fn on_changed(&self, result: &Result<Arc<T>>);
}
impl<T, F> LiveStateObserver<T> for F
where
    F: Fn(&Result<Arc<T>>) + Send + Sync + 'static,
{
    fn on_changed(&self, result: &Result<Arc<T>>) {
        self(result)
    }
}

type Updater<P, T> = Box<dyn Fn(LiveContext<P>) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// A value recomputed from its parameters and the sources it reads.
///
/// Dropping a `LiveState` disposes it.
pub struct LiveState<P, T> {
    inner: Arc<LiveInner<P, T>>,
}

struct LiveInner<P, T> {
    config: LiveStateConfig,
    state: Mutex<LiveData<P, T>>,
    delivery: ReentrantMutex<()>,
    wake: Notify,
    cancel: CancellationToken,
    updater: Updater<P, T>,
    observer: Box<dyn LiveStateObserver<T>>,
    sink: Arc<dyn InvalidationSink>,
}

struct LiveData<P, T> {
    phase: Phase,
    params: P,
    latest: Option<Result<Arc<T>>>,
    rerun: bool,
    subscriptions: Vec<Subscription>,
}

struct LiveSink<P, T>(Weak<LiveInner<P, T>>);

impl<P, T> InvalidationSink for LiveSink<P, T>
where
    P: Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    fn notify(&self, notice: &InvalidationNotice) {
        if let Some(inner) = self.0.upgrade() {
            trace!(key = %notice.key, "live state source invalidated");
            inner.invalidate();
        }
    }
}

impl<P, T> LiveState<P, T>
where
    P: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    /// Creates a live state and starts its first update.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F, Fut>(
        config: LiveStateConfig,
        params: P,
        updater: F,
        observer: impl LiveStateObserver<T>,
    ) -> Self
    where
        F: Fn(LiveContext<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let inner = Arc::new_cyclic(|this: &Weak<LiveInner<P, T>>| LiveInner {
            config,
            state: Mutex::new(LiveData {
                phase: Phase::Scheduled,
                params,
                latest: None,
                rerun: false,
                subscriptions: Vec::new(),
            }),
            delivery: ReentrantMutex::new(()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            updater: Box::new(move |cx| updater(cx).boxed()),
            observer: Box::new(observer),
            sink: Arc::new(LiveSink(this.clone())),
        });
        tokio::spawn(inner.clone().drive());
        Self { inner }
    }

    /// Schedules an update unless one is already scheduled or running.
    pub fn invalidate(&self) {
        self.inner.invalidate()
    }

    pub fn set_params(&self, params: P) {
        let old = replace(&mut self.inner.state.lock().params, params);
        drop(old);
        self.inner.invalidate();
    }

    /// Like [`set_params`](Self::set_params), but does nothing if `params` is unchanged.
    pub fn set_params_dedup(&self, params: P) -> bool
    where
        P: PartialEq,
    {
        let old = {
            let mut data = self.inner.state.lock();
            if data.params == params {
                return false;
            }
            replace(&mut data.params, params)
        };
        drop(old);
        self.inner.invalidate();
        true
    }

    pub fn update_params(&self, f: impl FnOnce(&mut P)) {
        f(&mut self.inner.state.lock().params);
        self.inner.invalidate();
    }

    pub fn params(&self) -> P {
        self.inner.state.lock().params.clone()
    }

    /// The result of the last completed update.
    pub fn latest(&self) -> Option<Result<Arc<T>>> {
        self.inner.state.lock().latest.clone()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    /// Stops the live state. No result is delivered to the observer afterwards.
    pub fn dispose(&self) {
        self.inner.dispose()
    }

    pub fn is_disposed(&self) -> bool {
        self.phase() == Phase::Disposed
    }
}

impl<P, T> Drop for LiveState<P, T> {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl<P, T> std::fmt::Debug for LiveState<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveState")
            .field("phase", &self.inner.state.lock().phase)
            .finish_non_exhaustive()
    }
}

impl<P, T> LiveInner<P, T> {
    fn invalidate(&self) {
        let mut data = self.state.lock();
        match data.phase {
            Phase::Idle | Phase::Error => {
                data.phase = Phase::Scheduled;
                drop(data);
                self.wake.notify_one();
            }
            Phase::Computing => data.rerun = true,
            Phase::Scheduled | Phase::Disposed => {}
        }
    }

    fn dispose(&self) {
        let _delivery = self.delivery.lock();
        let subscriptions = {
            let mut data = self.state.lock();
            if data.phase == Phase::Disposed {
                return;
            }
            data.phase = Phase::Disposed;
            std::mem::take(&mut data.subscriptions)
        };
        self.cancel.cancel();
        drop(subscriptions);
        debug!("live state disposed");
    }

    fn is_scheduled(&self) -> bool {
        self.state.lock().phase == Phase::Scheduled
    }

    async fn wait_scheduled(&self) {
        loop {
            let notified = self.wake.notified();
            if self.is_scheduled() {
                return;
            }
            notified.await;
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Ok(());
        }
        with_cancel(tokio::time::sleep(duration).map(Ok), Some(&self.cancel)).await
    }
}

impl<P, T> LiveInner<P, T>
where
    P: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    async fn drive(self: Arc<Self>) {
        let mut delay = Duration::ZERO;
        loop {
            if self.sleep(delay).await.is_err() {
                return;
            }
            let Some(result) = self.update().await else {
                return;
            };
            let Some(next) = self.publish(result) else {
                return;
            };
            delay = match next {
                Phase::Scheduled => self.config.update_delay,
                Phase::Error => match self.wait_retry().await {
                    Ok(true) => Duration::ZERO,
                    Ok(false) => self.config.update_delay,
                    Err(_) => return,
                },
                _ => {
                    if with_cancel(self.wait_scheduled().map(Ok), Some(&self.cancel))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    self.config.update_delay
                }
            };
        }
    }

    /// Runs the updater once. Returns `None` if the live state was disposed meanwhile.
    async fn update(&self) -> Option<Result<Arc<T>>> {
        let cx = {
            let mut data = self.state.lock();
            if data.phase == Phase::Disposed {
                return None;
            }
            data.phase = Phase::Computing;
            data.rerun = false;
            LiveContext {
                params: data.params.clone(),
                sink: self.sink.clone(),
                subscriptions: Arc::new(Mutex::new(Vec::new())),
            }
        };
        let subscriptions = cx.subscriptions.clone();
        trace!("live state update");
        let future = (self.updater)(cx);
        let result = if self.config.is_cancellation_supported {
            with_cancel(future, Some(&self.cancel)).await
        } else {
            future.await
        };
        if self.cancel.is_cancelled() {
            return None;
        }
        let subscriptions = std::mem::take(&mut *subscriptions.lock());
        let previous = replace(&mut self.state.lock().subscriptions, subscriptions);
        drop(previous);
        Some(result.map(Arc::new))
    }

    /// Stores `result` and hands it to the observer. Returns the next phase.
    fn publish(&self, result: Result<Arc<T>>) -> Option<Phase> {
        let _delivery = self.delivery.lock();
        let next = {
            let mut data = self.state.lock();
            if data.phase == Phase::Disposed {
                return None;
            }
            data.phase = if data.rerun {
                Phase::Scheduled
            } else if result.is_err() {
                Phase::Error
            } else {
                Phase::Idle
            };
            data.rerun = false;
            data.latest = Some(result.clone());
            data.phase
        };
        match &result {
            Ok(_) => debug!(phase = %next, "live state updated"),
            Err(e) => warn!(error = %e, phase = %next, "live state update failed"),
        }
        self.observer.on_changed(&result);
        Some(next)
    }

    /// Waits for the retry delay or an earlier invalidation.
    ///
    /// Returns `Ok(true)` if the retry is due, `Ok(false)` if an invalidation came first.
    async fn wait_retry(&self) -> Result<bool> {
        let retry = tokio::time::sleep(self.config.retry_delay);
        let scheduled = self.wait_scheduled();
        pin_mut!(retry);
        pin_mut!(scheduled);
        let first = select(retry, scheduled).map(|r| Ok(matches!(r, Either::Left(_))));
        let retry_due = with_cancel(first, Some(&self.cancel)).await?;
        if retry_due {
            let mut data = self.state.lock();
            if data.phase == Phase::Error {
                data.phase = Phase::Scheduled;
            }
        }
        Ok(retry_due)
    }
}

/// Passed to the updater of a [`LiveState`].
///
/// Reads made through the context subscribe the live state to what was read, so it
/// updates again when any of it is invalidated.
pub struct LiveContext<P> {
    params: P,
    sink: Arc<dyn InvalidationSink>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl<P> LiveContext<P> {
    /// Parameters as they were when this update started.
    pub fn params(&self) -> &P {
        &self.params
    }

    fn track(&self, subscription: Subscription) {
        self.subscriptions.lock().push(subscription);
    }

    /// Reads `key` from `registry`, computing it with `f` if needed.
    pub async fn read<T, F, Fut>(
        &self,
        registry: &ComputationRegistry,
        key: ComputationKey,
        f: F,
    ) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce(ComputeContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.track(registry.subscribe(&key, self.sink.clone()));
        registry.compute(key, f).await
    }

    /// Reads `key` through its registered operation.
    pub async fn call<T: Send + Sync + 'static>(
        &self,
        registry: &ComputationRegistry,
        key: ComputationKey,
    ) -> Result<Arc<T>> {
        self.track(registry.subscribe(&key, self.sink.clone()));
        registry.call(key).await
    }

    pub async fn read_replica<T: Send + Sync + 'static>(
        &self,
        mirror: &ReplicaMirror<T>,
    ) -> Result<Arc<T>> {
        self.track(mirror.subscribe(self.sink.clone()));
        mirror.read().await
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for LiveContext<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveContext")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}
