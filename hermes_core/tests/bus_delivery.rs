//! End-to-end delivery scenarios over the in-process bus.
//!
//! Nodes here live in one process, so delivery goes through the dispatch
//! lanes; discovery, service announcement and the shared registry still run
//! underneath exactly as they do across processes.

use hermes_core::{HermesError, Node};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn unique(tag: &str) -> String {
    format!(
        "{}_{}_{}",
        tag,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
            % 10_000_000
    )
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn single_subscriber_receives_exactly_once() {
    let a = Node::create(&unique("scn1_a")).unwrap();
    let b = Node::create(&unique("scn1_b")).unwrap();
    let group = unique("sensor");

    let hits = Arc::new(AtomicU32::new(0));
    let hits_clone = Arc::clone(&hits);
    b.subscribe(
        &group,
        &["temperature"],
        Arc::new(move |_group, topic, payload| {
            assert_eq!(topic, "temperature");
            assert_eq!(payload, b"T=21C");
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    a.publish(&group, "temperature", b"T=21C").unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) >= 1
    }));
    // Give a duplicate a chance to show up before insisting on exactly once
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn three_nodes_cross_subscribe_without_self_reception() {
    let a = Node::create(&unique("scn2_a")).unwrap();
    let b = Node::create(&unique("scn2_b")).unwrap();
    let c = Node::create(&unique("scn2_c")).unwrap();
    let group = unique("plant");

    // A -> temperature, B -> pressure, C -> humidity;
    // A listens to pressure, B to humidity, C to temperature.
    let make_recorder = || {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: hermes_core::Callback = Arc::new(move |_g: &str, _t: &str, payload: &[u8]| {
            sink.lock().push(String::from_utf8_lossy(payload).into_owned());
        });
        (seen, cb)
    };
    let (a_seen, a_cb) = make_recorder();
    let (b_seen, b_cb) = make_recorder();
    let (c_seen, c_cb) = make_recorder();

    a.subscribe(&group, &["pressure"], a_cb).unwrap();
    b.subscribe(&group, &["humidity"], b_cb).unwrap();
    c.subscribe(&group, &["temperature"], c_cb).unwrap();

    for i in 0..50 {
        a.publish(&group, "temperature", format!("TEMP-A-{}", i).as_bytes())
            .unwrap();
        b.publish(&group, "pressure", format!("PRES-B-{}", i).as_bytes())
            .unwrap();
        c.publish(&group, "humidity", format!("HUM-C-{}", i).as_bytes())
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || {
        a_seen.lock().len() >= 50 && b_seen.lock().len() >= 50 && c_seen.lock().len() >= 50
    }));

    let a_msgs = a_seen.lock().clone();
    assert_eq!(a_msgs.len(), 50);
    assert!(a_msgs.iter().all(|m| m.starts_with("PRES-B-")));
    assert!(!a_msgs.iter().any(|m| m.starts_with("TEMP-A-")));

    let b_msgs = b_seen.lock().clone();
    assert_eq!(b_msgs.len(), 50);
    assert!(b_msgs.iter().all(|m| m.starts_with("HUM-C-")));

    let c_msgs = c_seen.lock().clone();
    assert_eq!(c_msgs.len(), 50);
    assert!(c_msgs.iter().all(|m| m.starts_with("TEMP-A-")));
}

#[test]
fn paced_stream_arrives_complete() {
    let sender = Node::create(&unique("scn3_tx")).unwrap();
    let receiver = Node::create(&unique("scn3_rx")).unwrap();
    let group = unique("test");

    let ids: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let ids_clone = Arc::clone(&ids);
    receiver
        .subscribe(
            &group,
            &["data"],
            Arc::new(move |_g, _t, payload| {
                ids_clone
                    .lock()
                    .insert(String::from_utf8_lossy(payload).into_owned());
            }),
        )
        .unwrap();

    for i in 1..=200 {
        sender
            .publish(&group, "data", format!("MSG-{}", i).as_bytes())
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
    }

    assert!(
        wait_until(Duration::from_secs(10), || ids.lock().len() == 200),
        "only {} of 200 distinct messages arrived",
        ids.lock().len()
    );
    let seen = ids.lock();
    for i in 1..=200 {
        assert!(seen.contains(&format!("MSG-{}", i)), "missing MSG-{}", i);
    }
}

#[test]
fn unsubscribed_topic_stops_delivering() {
    let sender = Node::create(&unique("unsub_tx")).unwrap();
    let receiver = Node::create(&unique("unsub_rx")).unwrap();
    let group = unique("grp");

    let hits = Arc::new(AtomicU32::new(0));
    let hits_clone = Arc::clone(&hits);
    receiver
        .subscribe(
            &group,
            &["t"],
            Arc::new(move |_, _, _| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    sender.publish(&group, "t", b"before").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 1
    }));

    receiver.unsubscribe(&group, &["t"]).unwrap();
    sender.publish(&group, "t", b"after").unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(
        hits.load(Ordering::SeqCst),
        1,
        "callback fired after unsubscribe"
    );
}

#[test]
fn publish_to_nobody_is_ok() {
    let node = Node::create(&unique("lonely")).unwrap();
    let group = unique("void");
    node.publish(&group, "echo", b"anyone?").unwrap();
}

#[test]
fn errors_surface_as_typed_variants() {
    let node = Node::create(&unique("errs")).unwrap();
    assert!(matches!(
        node.publish("", "t", b"x"),
        Err(HermesError::InvalidInput(_))
    ));
    assert!(matches!(
        node.unsubscribe(&unique("nope"), &[]),
        Err(HermesError::NotFound(_))
    ));
}
