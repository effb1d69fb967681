#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use blipstore::core::journal::JournalGeometry;
use blipstore::core::wal::WalConfig;
use blipstore::{Message, Store, StoreOptions};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = blipstore::logging::init_logging(Some("blipstore=debug"));
    });
}

/// Small journals without fsync; a dropped store still leaves its writes in the
/// page cache, which is all a restart in the same process sees.
pub fn options(dir: &Path) -> StoreOptions {
    StoreOptions::new(dir)
        .with_wal(WalConfig::from_policy("none").unwrap())
        .with_default_journal(JournalGeometry::new(4, 4).unwrap())
}

pub fn open(dir: &Path) -> Store {
    init_logging();
    Store::open(options(dir)).unwrap()
}

pub fn durable(body: &str) -> Message {
    Message::new(body.as_bytes().to_vec())
        .durable(true)
        .with_correlation_id(body)
}

pub fn transient(body: &str) -> Message {
    Message::new(body.as_bytes().to_vec()).with_correlation_id(body)
}

/// Fetch and acknowledge everything, returning the bodies in delivery order.
pub fn drain(store: &Store, queue: &str) -> Vec<String> {
    let mut bodies = Vec::new();
    while let Some(delivery) = store.fetch(queue).unwrap() {
        bodies.push(String::from_utf8(delivery.message.body.to_vec()).unwrap());
        store
            .acknowledge(&delivery, blipstore::Disposition::Accepted, None)
            .unwrap();
    }
    bodies
}

/// Like [`drain`], settling every delivery under one transaction that is
/// committed once the queue is empty.
pub fn drain_in_txn(store: &Store, queue: &str) -> Vec<String> {
    let txn = store.begin().unwrap();
    let mut bodies = Vec::new();
    while let Some(delivery) = store.fetch(queue).unwrap() {
        bodies.push(String::from_utf8(delivery.message.body.to_vec()).unwrap());
        store
            .acknowledge(&delivery, blipstore::Disposition::Accepted, Some(txn))
            .unwrap();
    }
    store.commit(txn).unwrap();
    bodies
}

/// Accept numbered durable messages until the queue's journal reports full;
/// returns how many were accepted.
pub fn fill_until_full(store: &Store, queue: &str) -> usize {
    let mut accepted = 0;
    loop {
        match store.accept(queue, &durable(&format!("{accepted:06}")), None) {
            Ok(_) => accepted += 1,
            Err(err) => {
                assert!(
                    matches!(err, blipstore::StoreError::JournalFull { .. }),
                    "{err}"
                );
                return accepted;
            }
        }
    }
}
