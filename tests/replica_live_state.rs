use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use assert_call::{call, CallRecorder};
use recompute::{
    ComputationKey, ComputationRegistry, LiveContext, LiveState, LiveStateConfig, LocalEndpoint,
    Phase, ReplicaClient, ReplicaMirror, Result,
};
use tokio::time::sleep;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server side: a published price that can be changed.
struct PriceService {
    registry: ComputationRegistry,
    price: Arc<AtomicI64>,
}

impl PriceService {
    fn new() -> Self {
        let registry = ComputationRegistry::new();
        let price = Arc::new(AtomicI64::new(100));
        registry.register("price", None, {
            let price = price.clone();
            move |_, _| {
                let price = price.clone();
                async move {
                    call!("fetch price");
                    Ok(price.load(Ordering::SeqCst))
                }
            }
        });
        Self { registry, price }
    }

    fn set_price(&self, price: i64) {
        self.price.store(price, Ordering::SeqCst);
        self.registry.invalidate(&ComputationKey::new("price"));
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Order {
    quantity: i64,
}

/// Client side: the total of an order, combining the remote price with a local
/// discount computation.
fn total(
    local: ComputationRegistry,
    price: ReplicaMirror<i64>,
) -> impl Fn(LiveContext<Order>) -> futures::future::BoxFuture<'static, Result<i64>> {
    move |cx| {
        let local = local.clone();
        let price = price.clone();
        Box::pin(async move {
            let quantity = cx.params().quantity;
            let discount = cx
                .read(
                    &local,
                    ComputationKey::new("discount").arg(quantity),
                    move |_| async move {
                        call!("discount {quantity}");
                        Ok(if quantity >= 10 { 10_i64 } else { 0 })
                    },
                )
                .await?;
            let price = cx.read_replica(&price).await?;
            Ok(*price * quantity * (100 - *discount) / 100)
        })
    }
}

fn observer(r: &Result<Arc<i64>>) {
    match r {
        Ok(v) => call!("total {v}"),
        Err(e) => call!("error {e}"),
    }
}

#[tokio::test(start_paused = true)]
async fn live_total_follows_remote_price_and_local_params() {
    init_tracing();
    let mut cr = CallRecorder::new();
    let server = PriceService::new();
    let client = ReplicaClient::new(LocalEndpoint::new(server.registry.clone()));
    let price = client.mirror::<i64>(ComputationKey::new("price")).unwrap();
    let local = ComputationRegistry::new();

    let config = LiveStateConfig::default().with_update_delay(Duration::from_millis(50));
    let updater = total(local.clone(), price.clone());
    let live = LiveState::new(config, Order { quantity: 2 }, updater, observer);
    sleep(Duration::from_millis(1)).await;
    cr.verify(["discount 2", "fetch price", "total 200"]);

    server.set_price(120);
    assert_eq!(live.phase(), Phase::Scheduled);
    server.set_price(130);
    cr.verify(());
    sleep(Duration::from_millis(100)).await;
    cr.verify(["fetch price", "total 260"]);

    live.set_params(Order { quantity: 10 });
    sleep(Duration::from_millis(100)).await;
    cr.verify(["discount 10", "total 1170"]);

    assert!(!live.set_params_dedup(Order { quantity: 10 }));
    sleep(Duration::from_millis(100)).await;
    cr.verify(());

    drop(live);
    server.set_price(1);
    sleep(Duration::from_millis(100)).await;
    cr.verify(());
    assert!(!price.is_valid());
}

#[tokio::test(start_paused = true)]
async fn live_state_reports_unavailable_remote_and_recovers() {
    init_tracing();
    let mut cr = CallRecorder::new();
    let server = PriceService::new();
    let client = ReplicaClient::new(LocalEndpoint::new(server.registry.clone()));
    let missing = client.mirror::<i64>(ComputationKey::new("unregistered")).unwrap();

    let config = LiveStateConfig::default().with_retry_delay(Duration::from_secs(1));
    let live = LiveState::new(
        config,
        (),
        move |cx: LiveContext<()>| {
            let missing = missing.clone();
            async move { Ok(*cx.read_replica(&missing).await?) }
        },
        observer,
    );
    sleep(Duration::from_millis(1)).await;
    cr.verify("error remote `unregistered()` unavailable: unknown operation `unregistered`");
    assert_eq!(live.phase(), Phase::Error);

    server.registry.register("unregistered", None, |_, _| async { Ok(7_i64) });
    sleep(Duration::from_secs(1)).await;
    cr.verify("total 7");
    assert_eq!(live.phase(), Phase::Idle);
}
