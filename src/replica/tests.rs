use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use assert_call::{call, CallRecorder};
use futures::future::BoxFuture;
use tokio::sync::Notify;

use super::*;
use crate::{ComputationRegistry, LocalEndpoint};

fn key(name: &'static str) -> ComputationKey {
    ComputationKey::new(name)
}

/// A registry publishing `value`, which reads the shared counter.
fn source() -> (ComputationRegistry, Arc<AtomicI64>) {
    let registry = ComputationRegistry::new();
    let counter = Arc::new(AtomicI64::new(0));
    registry.register("value", None, {
        let counter = counter.clone();
        move |_, _| {
            let counter = counter.clone();
            async move {
                call!("compute");
                Ok(counter.load(Ordering::SeqCst))
            }
        }
    });
    (registry, counter)
}

struct FlakyEndpoint {
    inner: LocalEndpoint,
    down: Arc<AtomicBool>,
}

impl RemoteEndpoint for FlakyEndpoint {
    fn fetch(&self, key: &ComputationKey) -> BoxFuture<'static, Result<RemoteSnapshot>> {
        if self.down.load(Ordering::SeqCst) {
            let key = key.clone();
            return async move { Err(Error::remote_unavailable(key, "connection refused")) }.boxed();
        }
        self.inner.fetch(key)
    }
    fn subscribe(
        &self,
        key: &ComputationKey,
        sink: Arc<dyn InvalidationSink>,
    ) -> Result<Subscription> {
        self.inner.subscribe(key, sink)
    }
}

#[tokio::test]
async fn read_fetches_once_while_valid() {
    let mut cr = CallRecorder::new();
    let (registry, _) = source();
    let client = ReplicaClient::new(LocalEndpoint::new(registry));
    let mirror = client.mirror::<i64>(key("value")).unwrap();
    assert_eq!(mirror.validity(), Validity::Invalidated);
    assert_eq!(*mirror.read().await.unwrap(), 0);
    assert_eq!(*mirror.read().await.unwrap(), 0);
    cr.verify("compute");
    assert!(mirror.is_valid());
}

#[tokio::test]
async fn notice_invalidates_without_refetch() {
    let mut cr = CallRecorder::new();
    let (registry, counter) = source();
    let client = ReplicaClient::new(LocalEndpoint::new(registry.clone()));
    let mirror = client.mirror::<i64>(key("value")).unwrap();
    mirror.read().await.unwrap();
    cr.verify("compute");

    counter.store(1, Ordering::SeqCst);
    registry.invalidate(&key("value"));
    assert_eq!(mirror.validity(), Validity::Invalidated);
    cr.verify(());

    assert_eq!(*mirror.read().await.unwrap(), 1);
    cr.verify("compute");
    assert!(mirror.is_valid());
}

#[tokio::test]
async fn transport_failure_is_retryable() {
    let mut cr = CallRecorder::new();
    let (registry, _) = source();
    let down = Arc::new(AtomicBool::new(true));
    let client = ReplicaClient::new(FlakyEndpoint {
        inner: LocalEndpoint::new(registry),
        down: down.clone(),
    });
    let mirror = client.mirror::<i64>(key("value")).unwrap();
    let e = mirror.read().await.unwrap_err();
    assert!(matches!(e, Error::RemoteUnavailable { .. }), "{e}");
    assert_eq!(mirror.validity(), Validity::Invalidated);

    cr.verify(());

    down.store(false, Ordering::SeqCst);
    assert_eq!(*mirror.read().await.unwrap(), 0);
    assert!(mirror.is_valid());
    cr.verify("compute");
}

#[tokio::test]
async fn unknown_remote_operation_is_unavailable() {
    let client = ReplicaClient::new(LocalEndpoint::new(ComputationRegistry::new()));
    let e = client.read::<i64>(key("missing")).await.unwrap_err();
    assert!(matches!(e, Error::RemoteUnavailable { .. }), "{e}");
}

#[tokio::test]
async fn computation_failure_travels_as_result() {
    let registry = ComputationRegistry::new();
    registry.register("bad", None, |_, _| async { Err::<i64, _>(Error::failed("boom")) });
    let client = ReplicaClient::new(LocalEndpoint::new(registry));
    let mirror = client.mirror::<i64>(key("bad")).unwrap();
    let e = mirror.read().await.unwrap_err();
    assert!(matches!(e, Error::ComputationFailed(_)), "{e}");
    assert!(mirror.is_valid());
}

#[tokio::test]
async fn concurrent_reads_share_one_fetch() {
    let mut cr = CallRecorder::new();
    let registry = ComputationRegistry::new();
    let gate = Arc::new(Notify::new());
    registry.register("slow", None, {
        let gate = gate.clone();
        move |_, _| {
            let gate = gate.clone();
            async move {
                call!("compute");
                gate.notified().await;
                Ok(5_i64)
            }
        }
    });
    let client = ReplicaClient::new(LocalEndpoint::new(registry));
    let mirror = client.mirror::<i64>(key("slow")).unwrap();
    let release = async {
        tokio::task::yield_now().await;
        gate.notify_one();
    };
    let (a, b, ()) = tokio::join!(mirror.read(), mirror.read(), release);
    assert_eq!(*a.unwrap(), 5);
    assert_eq!(*b.unwrap(), 5);
    cr.verify("compute");
}

#[tokio::test]
async fn old_notices_are_ignored() {
    let mut cr = CallRecorder::new();
    let (registry, _) = source();
    let client = ReplicaClient::new(LocalEndpoint::new(registry));
    let mirror = client.mirror::<i64>(key("value")).unwrap();
    mirror.read().await.unwrap();
    cr.verify("compute");
    let generation = mirror.generation().unwrap();

    mirror
        .node
        .on_notice(&InvalidationNotice::new(key("value"), Generation(generation.0 - 1)));
    assert!(mirror.is_valid());
    mirror
        .node
        .on_notice(&InvalidationNotice::new(key("value"), generation));
    assert!(!mirror.is_valid());
}

#[tokio::test]
async fn fetched_result_already_announced_stale_stays_invalidated() {
    let mut cr = CallRecorder::new();
    let (registry, _) = source();
    let client = ReplicaClient::new(LocalEndpoint::new(registry.clone()));
    let current = registry.call_cell::<i64>(key("value")).await.unwrap();
    let mirror = client.mirror::<i64>(key("value")).unwrap();

    // The notice for the current generation arrives before the fetch completes.
    mirror
        .node
        .on_notice(&InvalidationNotice::new(key("value"), current.generation()));
    assert_eq!(*mirror.read().await.unwrap(), 0);
    assert_eq!(mirror.validity(), Validity::Invalidated);
    cr.verify("compute");
}

#[tokio::test]
async fn observed_values_follow_source() {
    let mut cr = CallRecorder::new();
    let (registry, counter) = source();
    let client = ReplicaClient::new(LocalEndpoint::new(registry.clone()));
    let mirror = client.mirror::<i64>(key("value")).unwrap();
    let mut seen = Vec::new();
    for i in 1..=3 {
        seen.push(*mirror.read().await.unwrap());
        seen.push(*mirror.read().await.unwrap());
        counter.store(i, Ordering::SeqCst);
        registry.invalidate(&key("value"));
    }
    seen.push(*mirror.read().await.unwrap());
    assert_eq!(seen, vec![0, 0, 1, 1, 2, 2, 3]);
    cr.verify(["compute", "compute", "compute", "compute"]);
}

#[tokio::test]
async fn local_invalidate_refetches_without_recompute() {
    let mut cr = CallRecorder::new();
    let (registry, _) = source();
    let client = ReplicaClient::new(LocalEndpoint::new(registry.clone()));
    let mirror = client.mirror::<i64>(key("value")).unwrap();
    mirror.read().await.unwrap();
    let generation = mirror.generation();
    cr.verify("compute");

    assert!(mirror.invalidate());
    assert!(!mirror.invalidate());
    assert_eq!(registry.validity(&key("value")), Some(Validity::Valid));
    mirror.read().await.unwrap();
    cr.verify(());
    assert_eq!(mirror.generation(), generation);
    assert!(mirror.is_valid());
}

#[tokio::test]
async fn mirrors_are_shared_per_key_and_dropped_with_last_handle() {
    let (registry, _) = source();
    let client = ReplicaClient::new(LocalEndpoint::new(registry.clone()));
    let m1 = client.mirror::<i64>(key("value")).unwrap();
    let m2 = client.mirror::<i64>(key("value")).unwrap();
    assert!(Arc::ptr_eq(&m1.node, &m2.node));
    assert_eq!(client.mirror_count(), 1);
    assert_eq!(registry.broadcaster().subscriber_count(&key("value")), 1);

    drop(m1);
    assert_eq!(client.mirror_count(), 1);
    drop(m2);
    assert_eq!(client.mirror_count(), 0);
    assert_eq!(registry.broadcaster().subscriber_count(&key("value")), 0);
}

#[tokio::test]
async fn subscribe_forwards_invalidation() {
    let mut cr = CallRecorder::new();
    let (registry, _) = source();
    let client = ReplicaClient::new(LocalEndpoint::new(registry.clone()));
    let mirror = client.mirror::<i64>(key("value")).unwrap();
    mirror.read().await.unwrap();
    cr.verify("compute");
    let s = mirror.subscribe(Arc::new(|n: &InvalidationNotice| call!("forward {}", n.key)));

    registry.invalidate(&key("value"));
    cr.verify("forward value()");
    drop(s);
    mirror.read().await.unwrap();
    registry.invalidate(&key("value"));
    cr.verify("compute");
}

#[tokio::test]
async fn cancelled_read_leaves_mirror_invalidated() {
    let registry = ComputationRegistry::new();
    registry.register("never", None, |_, _| async {
        futures::future::pending::<()>().await;
        Ok(0_i64)
    });
    let client = ReplicaClient::new(LocalEndpoint::new(registry));
    let mirror = client.mirror::<i64>(key("never")).unwrap();
    let cancel = CancellationToken::new();
    let trigger = async {
        tokio::task::yield_now().await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(mirror.read_with_cancel(&cancel), trigger);
    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(mirror.validity(), Validity::Invalidated);
}
