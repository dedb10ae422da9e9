//! Scenario: exchange semantics over a live router.
//!
//! Covers the delivery rules end to end (publisher queue → drain worker →
//! transport → subscriber loop → handler): DIRECT exact matching, TOPIC
//! prefix matching, FANOUT to everyone, HEADERS capability filtering with
//! comma-list values, and per-pair publish ordering.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uvd_bus::{handler_fn, BusConfig, BusRouter, ExchangeType, Message};

type Seen = Arc<Mutex<Vec<String>>>;

fn collector() -> (Seen, uvd_bus::Handler) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = handler_fn(move |delivery| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(delivery.body_str().into_owned());
        }
    });
    (seen, handler)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

fn hdrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn direct_topic_match_is_verbatim() {
    let router = BusRouter::new(BusConfig::default());
    let sub = router.subscriber("inproc://direct");
    let (seen, handler) = collector();
    sub.subscribe(vec!["order_log_task".into()], handler, ExchangeType::Direct);

    let publisher = router.publisher("inproc://direct");
    publisher
        .publish(Message::direct("order_log_task", b"hit".to_vec()))
        .unwrap();
    publisher
        .publish(Message::direct("order_log_task_extra", b"miss".to_vec()))
        .unwrap();

    settle().await;
    assert_eq!(*seen.lock().unwrap(), vec!["hit".to_string()]);
}

#[tokio::test]
async fn topic_prefix_matches_composite_frame() {
    let router = BusRouter::new(BusConfig::default());
    let sub = router.subscriber("inproc://topic");
    let (seen, handler) = collector();
    sub.subscribe(vec!["cn.east".into()], handler, ExchangeType::Topic);

    let publisher = router.publisher("inproc://topic");
    publisher
        .publish(Message::topic("cn.east", "orders", b"hit".to_vec()))
        .unwrap();
    publisher
        .publish(Message::topic("cn.west", "orders", b"miss".to_vec()))
        .unwrap();

    settle().await;
    assert_eq!(*seen.lock().unwrap(), vec!["hit".to_string()]);
}

#[tokio::test]
async fn fanout_reaches_every_subscriber() {
    let router = BusRouter::new(BusConfig::default());
    let sub = router.subscriber("inproc://fanout");
    let (seen_a, handler_a) = collector();
    let (seen_b, handler_b) = collector();
    sub.subscribe(vec![], handler_a, ExchangeType::Fanout);
    sub.subscribe(vec![], handler_b, ExchangeType::Fanout);

    let publisher = router.publisher("inproc://fanout");
    publisher
        .publish(Message::fanout("broadcast", b"x".to_vec()))
        .unwrap();

    settle().await;
    assert_eq!(seen_a.lock().unwrap().len(), 1);
    assert_eq!(seen_b.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn headers_filter_routes_by_capability() {
    let router = BusRouter::new(BusConfig::default());
    let sub = router.subscriber("inproc://headers");

    // A vehicle that serves types 701 and 101.
    let (seen_match, handler_match) = collector();
    sub.subscribe_headers(
        hdrs(&[("type", "701,101"), ("channel", "vehicle_orders")]),
        handler_match,
        Some("vehicle_orders".into()),
    );
    // A vehicle that serves only type 601.
    let (seen_other, handler_other) = collector();
    sub.subscribe_headers(
        hdrs(&[("type", "601"), ("channel", "vehicle_orders")]),
        handler_other,
        Some("vehicle_orders".into()),
    );

    let publisher = router.publisher("inproc://headers");
    publisher
        .publish(Message::headers(
            "vehicle_orders",
            b"order-701".to_vec(),
            hdrs(&[("type", "701"), ("channel", "vehicle_orders")]),
        ))
        .unwrap();

    settle().await;
    assert_eq!(*seen_match.lock().unwrap(), vec!["order-701".to_string()]);
    assert!(seen_other.lock().unwrap().is_empty());
}

#[tokio::test]
async fn raw_tap_sees_every_exchange() {
    let router = BusRouter::new(BusConfig::default());
    let sub = router.subscriber("inproc://raw");
    let (seen, handler) = collector();
    sub.subscribe_raw(handler);

    let publisher = router.publisher("inproc://raw");
    publisher.publish(Message::direct("a", b"1".to_vec())).unwrap();
    publisher.publish(Message::fanout("b", b"2".to_vec())).unwrap();
    publisher
        .publish(Message::headers("c", b"3".to_vec(), hdrs(&[("k", "v")])))
        .unwrap();

    settle().await;
    let mut got = seen.lock().unwrap().clone();
    got.sort();
    assert_eq!(got, vec!["1".to_string(), "2".to_string(), "3".to_string()]);
}

#[tokio::test]
async fn publish_order_is_preserved_per_pair() {
    let router = BusRouter::new(BusConfig::default());
    let sub = router.subscriber("inproc://order");
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    sub.subscribe(
        vec!["seq".into()],
        handler_fn(move |delivery| {
            sink.lock().unwrap().push(delivery.body_str().into_owned());
            async {}
        }),
        ExchangeType::Direct,
    );

    let publisher = router.publisher("inproc://order");
    for i in 0..50 {
        publisher
            .publish(Message::direct("seq", format!("{i:03}").into_bytes()))
            .unwrap();
    }

    settle().await;
    let got = seen.lock().unwrap().clone();
    assert_eq!(got.len(), 50);
    let mut sorted = got.clone();
    sorted.sort();
    assert_eq!(got, sorted, "messages arrived out of publish order");
}
