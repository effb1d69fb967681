mod common;

use std::sync::Arc;

use blipstore::core::catalog::{ExchangeDecl, ExchangeKind, QueueDecl};
use blipstore::core::journal::JournalGeometry;
use blipstore::{
    AdmissionPolicy, Disposition, FlowCause, FlowEventKind, Residency, Session, StoreError,
};

use common::{drain, durable, fill_until_full, open, transient};

#[test]
fn commit_spanning_queues_is_atomic_across_restart() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = open(tmp.path());
        for name in ["q1", "q2", "q3"] {
            store.declare_queue(QueueDecl::new(name).durable(true)).unwrap();
        }
        let txn = store.begin().unwrap();
        let results = store.accept_all(&["q1", "q2", "q3"], &durable("fan"), Some(txn));
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(store.query_queue("q1").unwrap().depth, 0);
        store.commit(txn).unwrap();
        assert_eq!(store.query_queue("q3").unwrap().depth, 1);
    }
    let store = open(tmp.path());
    for name in ["q1", "q2", "q3"] {
        assert_eq!(drain(&store, name), vec!["fan"], "{name}");
    }
}

#[test]
fn uncommitted_work_vanishes_on_restart() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = open(tmp.path());
        store.declare_queue(QueueDecl::new("q1").durable(true)).unwrap();
        store.declare_queue(QueueDecl::new("q2").durable(true)).unwrap();
        store.accept("q1", &durable("existing"), None).unwrap();

        let txn = store.begin().unwrap();
        let delivery = store.fetch("q1").unwrap().unwrap();
        store
            .acknowledge(&delivery, Disposition::Accepted, Some(txn))
            .unwrap();
        store.accept("q2", &durable("moved"), Some(txn)).unwrap();
        // No commit: the process goes away with the transaction open.
    }
    let store = open(tmp.path());
    assert_eq!(drain(&store, "q1"), vec!["existing"]);
    assert!(drain(&store, "q2").is_empty());
}

#[test]
fn rollback_returns_dequeued_records_and_drops_enqueues() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(open(tmp.path()));
    store.declare_queue(QueueDecl::new("in").durable(true)).unwrap();
    store.declare_queue(QueueDecl::new("out").durable(true)).unwrap();
    store.accept("in", &durable("job"), None).unwrap();

    let mut session = Session::transactional(Arc::clone(&store)).unwrap();
    let delivery = session.fetch("in").unwrap().unwrap();
    session
        .acknowledge(&delivery, Disposition::Accepted)
        .unwrap();
    session.publish("out", &durable("result")).unwrap();
    session.rollback().unwrap();

    assert_eq!(store.query_queue("out").unwrap().depth, 0);
    let again = store.fetch("in").unwrap().unwrap();
    assert!(again.redelivered);
    assert_eq!(&again.message.body[..], b"job");
    store.release(&again).unwrap();

    let delivery = session.fetch("in").unwrap().unwrap();
    session
        .acknowledge(&delivery, Disposition::Accepted)
        .unwrap();
    session.publish("out", &durable("result")).unwrap();
    session.commit().unwrap();
    assert_eq!(drain(&store, "out"), vec!["result"]);
    assert_eq!(store.query_queue("in").unwrap().depth, 0);
    session.close().unwrap();
}

#[test]
fn settled_record_cannot_be_settled_again_outside_the_transaction() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    store.declare_queue(QueueDecl::new("q")).unwrap();
    store.accept("q", &transient("m"), None).unwrap();
    let txn = store.begin().unwrap();
    let delivery = store.fetch("q").unwrap().unwrap();
    store
        .acknowledge(&delivery, Disposition::Accepted, Some(txn))
        .unwrap();
    assert!(matches!(
        store.acknowledge(&delivery, Disposition::Accepted, None),
        Err(StoreError::InvalidArgument(_))
    ));
    store.commit(txn).unwrap();
    assert_eq!(store.query_queue("q").unwrap().depth, 0);
}

#[test]
fn provisional_refusal_dooms_the_transaction() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    store
        .declare_queue(QueueDecl::new("q").policy(AdmissionPolicy::reject(Some(2), None)))
        .unwrap();
    store.declare_queue(QueueDecl::new("other")).unwrap();
    let txn = store.begin().unwrap();
    store.accept("other", &transient("side"), Some(txn)).unwrap();
    store.accept("q", &transient("1"), Some(txn)).unwrap();
    store.accept("q", &transient("2"), Some(txn)).unwrap();
    let refused = store.accept("q", &transient("3"), Some(txn)).unwrap_err();
    assert!(refused.is_resource_limit());

    let err = store.commit(txn).unwrap_err();
    assert!(matches!(err, StoreError::Internal(_)));
    assert!(err.to_string().starts_with("internal-error: Commit failed"));
    assert_eq!(store.query_queue("q").unwrap().depth, 0);
    assert_eq!(store.query_queue("other").unwrap().depth, 0);
}

#[test]
fn commit_is_judged_against_committed_state() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    store
        .declare_queue(
            QueueDecl::new("q")
                .durable(true)
                .policy(AdmissionPolicy::reject(Some(2), None)),
        )
        .unwrap();
    store.declare_queue(QueueDecl::new("log").durable(true)).unwrap();

    let txn = store.begin().unwrap();
    store.accept("log", &durable("audit"), Some(txn)).unwrap();
    store.accept("q", &durable("late"), Some(txn)).unwrap();
    // Another producer fills the queue before the commit.
    store.accept("q", &durable("a"), None).unwrap();
    store.accept("q", &durable("b"), None).unwrap();

    let err = store.commit(txn).unwrap_err();
    let text = err.to_string();
    assert!(text.starts_with("internal-error: Commit failed"), "{text}");
    assert!(text.contains("resource-limit-exceeded"), "{text}");
    assert!(drain(&store, "log").is_empty());
    assert_eq!(drain(&store, "q"), vec!["a", "b"]);
}

#[test]
fn transactional_paging_and_abort_events() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    let events = store.subscribe_flow_events();
    store
        .declare_queue(
            QueueDecl::new("q")
                .durable(true)
                .policy(AdmissionPolicy::flow_to_disk(Some(1), None)),
        )
        .unwrap();

    let txn = store.begin().unwrap();
    let first = store.accept("q", &durable("1"), Some(txn)).unwrap();
    let second = store.accept("q", &durable("2"), Some(txn)).unwrap();
    assert_eq!(first.residency, Residency::Resident);
    assert_eq!(second.residency, Residency::Paged);
    store.abort(txn).unwrap();
    let blocked: Vec<_> = events.try_iter().collect();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].kind, FlowEventKind::Blocked);
    assert_eq!(blocked[0].cause, FlowCause::Abort(txn));

    let txn = store.begin().unwrap();
    store.accept("q", &durable("1"), Some(txn)).unwrap();
    store.accept("q", &durable("2"), Some(txn)).unwrap();
    store.commit(txn).unwrap();
    let paged: Vec<_> = events.try_iter().collect();
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].kind, FlowEventKind::Paged);
    assert_eq!(paged[0].cause, FlowCause::Commit(txn));
    assert_eq!(drain(&store, "q"), vec!["1", "2"]);
}

#[test]
fn transactional_reject_hands_back_dead_letter() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    store
        .declare_exchange(ExchangeDecl::new("dlx", ExchangeKind::Fanout))
        .unwrap();
    store
        .declare_queue(QueueDecl::new("work").alternate_exchange("dlx"))
        .unwrap();
    store.declare_queue(QueueDecl::new("dead")).unwrap();
    store.accept("work", &transient("bad"), None).unwrap();

    let txn = store.begin().unwrap();
    let delivery = store.fetch("work").unwrap().unwrap();
    let dead = store
        .acknowledge(&delivery, Disposition::Rejected, Some(txn))
        .unwrap()
        .unwrap();
    assert_eq!(dead.exchange, "dlx");
    // The routing layer resolves dlx to "dead" and publishes in the same txn.
    store.accept("dead", &dead.message, Some(txn)).unwrap();
    store.commit(txn).unwrap();
    assert_eq!(drain(&store, "dead"), vec!["bad"]);
    assert_eq!(store.query_queue("work").unwrap().depth, 0);
}

#[test]
fn flush_after_multi_queue_commits_keeps_them_durable() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = open(tmp.path());
        store.declare_queue(QueueDecl::new("a").durable(true)).unwrap();
        store.declare_queue(QueueDecl::new("b").durable(true)).unwrap();
        for i in 0..3 {
            let txn = store.begin().unwrap();
            store.accept("a", &durable(&format!("a{i}")), Some(txn)).unwrap();
            store.accept("b", &durable(&format!("b{i}")), Some(txn)).unwrap();
            store.commit(txn).unwrap();
        }
        store.flush().unwrap();
    }
    let store = open(tmp.path());
    assert_eq!(drain(&store, "a"), vec!["a0", "a1", "a2"]);
    assert_eq!(drain(&store, "b"), vec!["b0", "b1", "b2"]);
}

fn small_journal_queue(store: &blipstore::Store, name: &str) {
    store
        .declare_queue(
            QueueDecl::new(name)
                .durable(true)
                .journal(JournalGeometry::new(4, 1).unwrap()),
        )
        .unwrap();
}

#[test]
fn full_journal_drains_under_one_transaction() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    small_journal_queue(&store, "q");
    let filled = fill_until_full(&store, "q");
    assert!(filled > 1_000);

    let txn = store.begin().unwrap();
    let mut settled = 0;
    while let Some(delivery) = store.fetch("q").unwrap() {
        store
            .acknowledge(&delivery, Disposition::Accepted, Some(txn))
            .unwrap();
        settled += 1;
    }
    assert_eq!(settled, filled);
    store.commit(txn).unwrap();
    assert_eq!(store.query_queue("q").unwrap().depth, 0);

    store.accept("q", &durable("after"), None).unwrap();
    drop(store);
    let store = open(tmp.path());
    assert_eq!(drain(&store, "q"), vec!["after"]);
}

#[test]
fn full_journal_drains_after_prefetching_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open(tmp.path());
    small_journal_queue(&store, "q");
    let filled = fill_until_full(&store, "q");

    let mut deliveries = Vec::new();
    while let Some(delivery) = store.fetch("q").unwrap() {
        deliveries.push(delivery);
    }
    assert_eq!(deliveries.len(), filled);
    for delivery in &deliveries {
        store
            .acknowledge(delivery, Disposition::Accepted, None)
            .unwrap();
    }
    assert_eq!(store.query_queue("q").unwrap().depth, 0);
}

#[test]
fn journal_full_at_commit_leaves_every_queue_untouched() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = open(tmp.path());
        store.declare_queue(QueueDecl::new("a").durable(true)).unwrap();
        small_journal_queue(&store, "full");
        store.accept("a", &durable("pre"), None).unwrap();
        let filled = fill_until_full(&store, "full");
        let before_a = store.query_queue("a").unwrap();
        let before_full = store.query_queue("full").unwrap();

        let txn = store.begin().unwrap();
        store.accept("a", &durable("x"), Some(txn)).unwrap();
        store.accept("full", &durable("yyyyyy"), Some(txn)).unwrap();
        let err = store.commit(txn).unwrap_err();
        assert!(matches!(err, StoreError::Internal(_)), "{err}");

        assert_eq!(store.query_queue("a").unwrap(), before_a);
        assert_eq!(store.query_queue("full").unwrap(), before_full);
        assert_eq!(before_full.depth as usize, filled);
    }
    let store = open(tmp.path());
    assert_eq!(drain(&store, "a"), vec!["pre"]);
}
