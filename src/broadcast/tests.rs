use std::time::Duration;

use assert_call::{call, CallRecorder};
use futures::{future::pending, FutureExt};

use super::*;
use crate::core::{
    flight::FlightSlot,
    graph::{FlightOutput, Snapshot, Value},
    Validity,
};

fn key(name: &'static str) -> ComputationKey {
    ComputationKey::new(name)
}

fn valid(graph: &mut Graph, name: &'static str) -> CellId {
    let (id, _) = graph.lookup_or_insert(&key(name), Duration::ZERO);
    let generation = graph.next_generation();
    let node = graph.node_mut(id).unwrap();
    node.snapshot = Some(Snapshot {
        result: Ok(Arc::new(()) as Value),
        generation,
    });
    node.validity = Validity::Valid;
    id
}

fn recorder(name: &'static str) -> Arc<dyn InvalidationSink> {
    Arc::new(move |n: &InvalidationNotice| call!("{name}:{}:{}", n.key, n.generation))
}

#[test]
fn propagate_walks_dependents_once() {
    let mut g = Graph::new();
    let a = valid(&mut g, "a");
    let b = valid(&mut g, "b");
    let c = valid(&mut g, "c");
    let d = valid(&mut g, "d");
    // d reads b and c, both read a.
    g.add_dependency(b, a);
    g.add_dependency(c, a);
    g.add_dependency(d, b);
    g.add_dependency(d, c);

    let broadcaster = InvalidationBroadcaster::new();
    let notices = broadcaster.propagate(&mut g, a);
    let mut keys: Vec<_> = notices.iter().map(|n| n.key.to_string()).collect();
    assert_eq!(keys[0], "a()");
    keys.sort();
    assert_eq!(keys, vec!["a()", "b()", "c()", "d()"]);
    for id in [a, b, c, d] {
        assert_eq!(g.node(id).unwrap().validity, Validity::Invalidated);
    }
}

#[test]
fn propagate_is_idempotent() {
    let mut g = Graph::new();
    let a = valid(&mut g, "a");
    let b = valid(&mut g, "b");
    g.add_dependency(b, a);

    let broadcaster = InvalidationBroadcaster::new();
    assert_eq!(broadcaster.propagate(&mut g, a).len(), 2);
    assert!(broadcaster.propagate(&mut g, a).is_empty());
    assert!(broadcaster.propagate(&mut g, b).is_empty());
}

#[test]
fn propagate_marks_flight_and_continues() {
    let mut g = Graph::new();
    let a = valid(&mut g, "a");
    let b = valid(&mut g, "b");
    let c = valid(&mut g, "c");
    g.add_dependency(b, a);
    g.add_dependency(c, b);
    let (slot, _flight) = FlightSlot::start(1, pending::<FlightOutput>().boxed());
    {
        let node = g.node_mut(b).unwrap();
        node.flight = Some(slot);
        node.validity = Validity::Invalidating;
    }

    let broadcaster = InvalidationBroadcaster::new();
    let notices = broadcaster.propagate(&mut g, a);
    let keys: Vec<_> = notices.iter().map(|n| n.key.to_string()).collect();
    assert_eq!(keys, vec!["a()", "c()"]);
    assert!(g.node(b).unwrap().flight.as_ref().unwrap().invalidated);
    assert_eq!(g.node(b).unwrap().validity, Validity::Invalidating);
}

#[test]
fn dispatch_delivers_to_subscribers_of_key() {
    let mut cr = CallRecorder::new();
    let broadcaster = InvalidationBroadcaster::new();
    let _s1 = broadcaster.subscribe(&key("a"), recorder("s1"));
    let _s2 = broadcaster.subscribe(&key("b"), recorder("s2"));

    broadcaster.dispatch(&[InvalidationNotice::new(key("a"), Generation(3))]);
    cr.verify("s1:a():#3");
}

#[test]
fn dispatch_keeps_order_per_key() {
    let mut cr = CallRecorder::new();
    let broadcaster = InvalidationBroadcaster::new();
    let _s = broadcaster.subscribe(&key("a"), recorder("s"));

    broadcaster.dispatch(&[
        InvalidationNotice::new(key("a"), Generation(1)),
        InvalidationNotice::new(key("a"), Generation(2)),
    ]);
    cr.verify(["s:a():#1", "s:a():#2"]);
}

#[test]
fn dropping_subscription_unsubscribes() {
    let mut cr = CallRecorder::new();
    let broadcaster = InvalidationBroadcaster::new();
    let s = broadcaster.subscribe(&key("a"), recorder("s"));
    assert_eq!(broadcaster.subscriber_count(&key("a")), 1);
    drop(s);
    assert_eq!(broadcaster.subscriber_count(&key("a")), 0);

    broadcaster.dispatch(&[InvalidationNotice::new(key("a"), Generation(1))]);
    cr.verify(());
}

#[test]
fn sink_may_subscribe_during_dispatch() {
    let mut cr = CallRecorder::new();
    let broadcaster = InvalidationBroadcaster::new();
    let inner = broadcaster.clone();
    let _s = broadcaster.subscribe(
        &key("a"),
        Arc::new(move |_: &InvalidationNotice| {
            inner.subscribe(&key("b"), recorder("late")).forget();
            call!("subscribed");
        }),
    );
    broadcaster.dispatch(&[InvalidationNotice::new(key("a"), Generation(1))]);
    cr.verify("subscribed");
    assert_eq!(broadcaster.subscriber_count(&key("b")), 1);
}

#[test]
fn notice_serializes_as_json() {
    let notice = InvalidationNotice::new(ComputationKey::new("get").arg(1), Generation(7));
    let json = serde_json::to_string(&notice).unwrap();
    assert_eq!(json, r#"{"key":{"operation":"get","args":[1]},"generation":7}"#);
    let back: InvalidationNotice = serde_json::from_str(&json).unwrap();
    assert_eq!(back, notice);
}
