mod common;

use blipstore::core::catalog::QueueDecl;
use blipstore::{Disposition, Message, Store};

use common::{drain, open};

const KEY: &str = "LVQ_key";

fn keyed(key: &str, body: &str) -> Message {
    Message::new(body.as_bytes().to_vec())
        .durable(true)
        .with_property(KEY, key)
}

fn publish(store: &Store, items: &[&str]) {
    for item in items {
        // "A1" -> key "A"
        let key = &item[..1];
        store.accept("lvq", &keyed(key, item), None).unwrap();
    }
}

#[test]
fn newest_value_per_key_survives_restart_and_held_values_are_kept() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = open(tmp.path());
        store
            .declare_queue(QueueDecl::new("lvq").durable(true).lvq_key(KEY))
            .unwrap();
        publish(&store, &["B1", "A1", "A2", "B2", "B3", "C1"]);
    }

    let store = open(tmp.path());
    let mut held = Vec::new();
    while let Some(delivery) = store.fetch("lvq").unwrap() {
        held.push(delivery);
    }
    let bodies: Vec<&[u8]> = held.iter().map(|d| &d.message.body[..]).collect();
    assert_eq!(bodies, vec![&b"B3"[..], b"A2", b"C1"]);

    // Held records cannot be replaced; new values queue up behind them.
    publish(&store, &["C2", "C3", "A3", "A4", "C4"]);
    for delivery in &held {
        store
            .acknowledge(delivery, Disposition::Accepted, None)
            .unwrap();
    }
    assert_eq!(drain(&store, "lvq"), vec!["C4", "A4"]);
}

#[test]
fn released_stale_value_is_dropped() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    store
        .declare_queue(QueueDecl::new("lvq").durable(true).lvq_key(KEY))
        .unwrap();
    publish(&store, &["A1"]);
    let held = store.fetch("lvq").unwrap().unwrap();
    publish(&store, &["A2"]);
    store.release(&held).unwrap();
    assert_eq!(drain(&store, "lvq"), vec!["A2"]);
}

#[test]
fn messages_without_the_key_are_queued_normally() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    store
        .declare_queue(QueueDecl::new("lvq").lvq_key(KEY))
        .unwrap();
    store
        .accept("lvq", &Message::new(&b"plain-1"[..]), None)
        .unwrap();
    store
        .accept("lvq", &Message::new(&b"plain-2"[..]), None)
        .unwrap();
    publish(&store, &["A1", "A2"]);
    assert_eq!(drain(&store, "lvq"), vec!["plain-1", "plain-2", "A2"]);
}

#[test]
fn transaction_keeps_only_its_last_value_per_key() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = open(tmp.path());
        store
            .declare_queue(QueueDecl::new("lvq").durable(true).lvq_key(KEY))
            .unwrap();
        publish(&store, &["A1"]);
        let txn = store.begin().unwrap();
        for item in ["A2", "B1", "A3"] {
            store
                .accept("lvq", &keyed(&item[..1], item), Some(txn))
                .unwrap();
        }
        store.commit(txn).unwrap();
    }
    let store = open(tmp.path());
    assert_eq!(drain(&store, "lvq"), vec!["A3", "B1"]);
}
