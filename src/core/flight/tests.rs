use futures::future::{pending, ready};

use super::*;

#[tokio::test]
async fn with_cancel_without_token_awaits_future() {
    assert_eq!(with_cancel(ready(Ok(1)), None).await.unwrap(), 1);
}

#[tokio::test]
async fn with_cancel_gives_up_on_cancellation() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let e = with_cancel(pending::<Result<i32>>(), Some(&cancel)).await.unwrap_err();
    assert!(e.is_cancelled());
}

#[tokio::test]
async fn with_cancel_prefers_cancellation_over_ready_future() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let e = with_cancel(ready(Ok(1)), Some(&cancel)).await.unwrap_err();
    assert!(e.is_cancelled());
}

#[tokio::test]
async fn with_cancel_returns_result_before_cancellation() {
    let cancel = CancellationToken::new();
    assert_eq!(with_cancel(ready(Ok(2)), Some(&cancel)).await.unwrap(), 2);
    cancel.cancel();
}

#[tokio::test]
async fn join_fails_after_every_caller_left() {
    let (slot, shared) = FlightSlot::start(1, pending::<i32>().boxed());
    assert!(slot.join().is_some());
    drop(shared);
    assert!(slot.join().is_none());
    assert_eq!(slot.id(), 1);
}
