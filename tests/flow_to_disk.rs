mod common;

use blipstore::core::catalog::QueueDecl;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use blipstore::{
    AdmissionPolicy, Disposition, FlowCause, FlowEventKind, FlowState, LimitKind, Residency,
    Store, StoreError,
};

use common::{drain, drain_in_txn, durable, open, transient};

struct Case {
    name: &'static str,
    durable_queue: bool,
    durable_messages: bool,
    policy: AdmissionPolicy,
    body_len: usize,
    published: usize,
    /// Accepted as resident before the threshold is reached.
    resident: usize,
    /// Whether messages past the threshold are paged (true) or refused.
    pages: bool,
}

const CASES: &[Case] = &[
    Case {
        name: "count reject",
        durable_queue: false,
        durable_messages: false,
        policy: AdmissionPolicy {
            max_count: Some(10),
            max_size: None,
            mode: blipstore::PolicyMode::Reject,
        },
        body_len: 10,
        published: 15,
        resident: 10,
        pages: false,
    },
    Case {
        name: "size reject",
        durable_queue: true,
        durable_messages: true,
        policy: AdmissionPolicy {
            max_count: None,
            max_size: Some(1000),
            mode: blipstore::PolicyMode::Reject,
        },
        body_len: 300,
        published: 6,
        resident: 3,
        pages: false,
    },
    Case {
        name: "count flow-to-disk, durable",
        durable_queue: true,
        durable_messages: true,
        policy: AdmissionPolicy {
            max_count: Some(10),
            max_size: None,
            mode: blipstore::PolicyMode::FlowToDisk,
        },
        body_len: 100,
        published: 25,
        resident: 10,
        pages: true,
    },
    Case {
        name: "size flow-to-disk, transient messages on durable queue",
        durable_queue: true,
        durable_messages: false,
        policy: AdmissionPolicy {
            max_count: None,
            max_size: Some(5000),
            mode: blipstore::PolicyMode::FlowToDisk,
        },
        body_len: 1000,
        published: 12,
        resident: 5,
        pages: true,
    },
    Case {
        name: "flow-to-disk on non-durable queue refuses",
        durable_queue: false,
        durable_messages: false,
        policy: AdmissionPolicy {
            max_count: Some(4),
            max_size: None,
            mode: blipstore::PolicyMode::FlowToDisk,
        },
        body_len: 10,
        published: 8,
        resident: 4,
        pages: false,
    },
];

fn body(i: usize, len: usize) -> String {
    let prefix = format!("m{i:04}-");
    format!("{prefix}{}", "x".repeat(len - prefix.len()))
}

/// How a row is produced, consumed and whether the store restarts in between.
#[derive(Debug, Clone, Copy)]
struct Mode {
    txn_produce: bool,
    txn_consume: bool,
    recover: bool,
}

fn modes() -> Vec<Mode> {
    let mut modes = Vec::new();
    for txn_produce in [false, true] {
        for txn_consume in [false, true] {
            for recover in [false, true] {
                modes.push(Mode {
                    txn_produce,
                    txn_consume,
                    recover,
                });
            }
        }
    }
    modes
}

/// Publish a row, each message in its own transaction when `txn_produce` is
/// set, and return the accepted bodies.
fn produce(store: &Store, case: &Case, mode: Mode) -> Vec<String> {
    let mut accepted = Vec::new();
    for i in 0..case.published {
        let text = body(i, case.body_len);
        let message = if case.durable_messages {
            durable(&text)
        } else {
            transient(&text)
        };
        let txn = mode.txn_produce.then(|| store.begin().unwrap());
        match store.accept("q", &message, txn) {
            Ok(result) => {
                let expected = if i < case.resident {
                    Residency::Resident
                } else {
                    Residency::Paged
                };
                assert_eq!(result.residency, expected, "{}: {mode:?} message {i}", case.name);
                if let Some(txn) = txn {
                    store.commit(txn).unwrap();
                }
                accepted.push(text);
            }
            Err(err) => {
                assert!(!case.pages, "{}: {mode:?} unexpected refusal {err}", case.name);
                assert!(i >= case.resident, "{}: {mode:?} refused too early", case.name);
                assert!(matches!(err, StoreError::ResourceLimitExceeded { .. }));
                if let Some(txn) = txn {
                    store.abort(txn).unwrap();
                }
            }
        }
    }
    accepted
}

#[test]
fn admission_table() {
    for case in CASES {
        for mode in modes() {
            let label = format!("{} {mode:?}", case.name);
            let tmp = tempfile::tempdir().unwrap();
            let store = open(tmp.path());
            let events = store.subscribe_flow_events();
            store
                .declare_queue(
                    QueueDecl::new("q")
                        .durable(case.durable_queue)
                        .policy(case.policy),
                )
                .unwrap();

            let accepted = produce(&store, case, mode);
            let expected_accepted = if case.pages {
                case.published
            } else {
                case.resident
            };
            assert_eq!(accepted.len(), expected_accepted, "{label}");
            if case.pages {
                let paged: Vec<_> = events
                    .try_iter()
                    .filter(|e| e.kind == FlowEventKind::Paged)
                    .collect();
                assert_eq!(paged.len(), case.published - case.resident, "{label}");
                assert!(
                    paged.iter().all(|e| if mode.txn_produce {
                        matches!(e.cause, FlowCause::Commit(_))
                    } else {
                        e.cause == FlowCause::Accept
                    }),
                    "{label}"
                );
            }

            let (store, expected) = if mode.recover {
                drop(store);
                let store = open(tmp.path());
                if !case.durable_queue {
                    assert!(
                        matches!(store.query_queue("q"), Err(StoreError::NotFound(_))),
                        "{label}"
                    );
                    continue;
                }
                let survivors = if case.durable_messages {
                    accepted
                } else {
                    Vec::new()
                };
                (store, survivors)
            } else {
                (store, accepted)
            };

            let info = store.query_queue("q").unwrap();
            let resident = expected.len().min(case.resident);
            assert_eq!(info.depth as usize, expected.len(), "{label}");
            assert_eq!(info.flow.count as usize, resident, "{label}");
            assert_eq!(info.paged as usize, expected.len() - resident, "{label}");

            let drained = if mode.txn_consume {
                drain_in_txn(&store, "q")
            } else {
                drain(&store, "q")
            };
            assert_eq!(drained, expected, "{label}");
            let info = store.query_queue("q").unwrap();
            assert_eq!(info.depth, 0, "{label}");
            assert_eq!(info.flow.count, 0, "{label}");
            assert_eq!(info.flow.size, 0, "{label}");
        }
    }
}

#[test]
fn limit_error_names_queue_and_threshold() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    store
        .declare_queue(QueueDecl::new("d01").policy(AdmissionPolicy::reject(Some(10), None)))
        .unwrap();
    for i in 0..10 {
        store.accept("d01", &transient(&format!("m{i}")), None).unwrap();
    }
    let err = store.accept("d01", &transient("m10"), None).unwrap_err();
    match &err {
        StoreError::ResourceLimitExceeded {
            queue,
            kind,
            max,
            current,
        } => {
            assert_eq!(queue, "d01");
            assert_eq!(*kind, LimitKind::Count);
            assert_eq!((*max, *current), (10, 10));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(
        err.to_string(),
        "resource-limit-exceeded: Policy exceeded on d01, policy: type=reject(count: max=10, current=10;)"
    );
}

#[test]
fn dequeue_releases_paged_records_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    let events = store.subscribe_flow_events();
    store
        .declare_queue(
            QueueDecl::new("q")
                .durable(true)
                .policy(AdmissionPolicy::flow_to_disk(Some(2), None)),
        )
        .unwrap();
    for body in ["a", "b", "c", "d"] {
        store.accept("q", &durable(body), None).unwrap();
    }
    assert_eq!(store.query_queue("q").unwrap().paged, 2);

    let first = store.fetch("q").unwrap().unwrap();
    store
        .acknowledge(&first, blipstore::Disposition::Accepted, None)
        .unwrap();
    let released: Vec<String> = events
        .try_iter()
        .filter(|e| e.kind == FlowEventKind::Released)
        .filter_map(|e| e.correlation_id)
        .collect();
    assert_eq!(released, vec!["c"]);
    let info = store.query_queue("q").unwrap();
    assert_eq!((info.flow.count, info.paged), (2, 1));
}

#[test]
fn paged_records_are_paged_again_after_restart() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = open(tmp.path());
        store
            .declare_queue(
                QueueDecl::new("q")
                    .durable(true)
                    .policy(AdmissionPolicy::flow_to_disk(Some(3), None)),
            )
            .unwrap();
        for i in 0..8 {
            store.accept("q", &durable(&format!("m{i}")), None).unwrap();
        }
    }
    let store = open(tmp.path());
    let info = store.query_queue("q").unwrap();
    assert_eq!((info.depth, info.flow.count, info.paged), (8, 3, 5));
    let expected: Vec<String> = (0..8).map(|i| format!("m{i}")).collect();
    assert_eq!(drain(&store, "q"), expected);
}

#[test]
fn transient_paged_records_do_not_survive_restart() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = open(tmp.path());
        store
            .declare_queue(
                QueueDecl::new("q")
                    .durable(true)
                    .policy(AdmissionPolicy::flow_to_disk(Some(1), None)),
            )
            .unwrap();
        store.accept("q", &durable("kept"), None).unwrap();
        store.accept("q", &transient("paged-1"), None).unwrap();
        store.accept("q", &transient("paged-2"), None).unwrap();
        assert_eq!(store.query_queue("q").unwrap().paged, 2);
    }
    let store = open(tmp.path());
    assert_eq!(drain(&store, "q"), vec!["kept"]);
}

#[test]
fn fanout_decides_per_queue() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    store
        .declare_queue(QueueDecl::new("full").policy(AdmissionPolicy::reject(Some(1), None)))
        .unwrap();
    store.declare_queue(QueueDecl::new("open")).unwrap();
    store.accept("full", &transient("first"), None).unwrap();

    let results = store.accept_all(&["full", "open"], &transient("fan"), None);
    assert!(results[0].as_ref().unwrap_err().is_resource_limit());
    assert!(results[1].is_ok());
    assert_eq!(drain(&store, "open"), vec!["fan"]);
}

#[test]
fn concurrent_producers_and_consumers_keep_flow_consistent() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: usize = 200;
    let total = PRODUCERS * PER_PRODUCER;

    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    store
        .declare_queue(
            QueueDecl::new("q")
                .durable(true)
                .policy(AdmissionPolicy::flow_to_disk(Some(20), None)),
        )
        .unwrap();

    let consumed = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for p in 0..PRODUCERS {
            let store = &store;
            scope.spawn(move || {
                for i in 0..PER_PRODUCER {
                    store
                        .accept("q", &durable(&format!("p{p}-{i}")), None)
                        .unwrap();
                }
            });
        }
        for _ in 0..CONSUMERS {
            let store = &store;
            let consumed = &consumed;
            scope.spawn(move || {
                while consumed.load(Ordering::SeqCst) < total {
                    if let Some(delivery) =
                        store.fetch_timeout("q", Duration::from_millis(20)).unwrap()
                    {
                        store
                            .acknowledge(&delivery, Disposition::Accepted, None)
                            .unwrap();
                        consumed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }
    });

    assert_eq!(consumed.load(Ordering::SeqCst), total);
    let queue = store.queue("q").unwrap();
    let stats = queue.stats().unwrap();
    assert_eq!(stats.depth, 0);
    assert_eq!(stats.flow, queue.recompute_flow());
    assert_eq!(stats.flow, FlowState::default());
    assert_eq!(store.query_queue("q").unwrap().paged, 0);
}
