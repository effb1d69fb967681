mod common;

use std::path::PathBuf;

use blipstore::core::journal::JournalGeometry;
use blipstore::lifecycle::{self, ExitStatus};
use blipstore::{Message, PolicyMode, StoreConfig};

// Environment variables are process-wide, so everything touching them lives in
// this one test.
#[test]
fn file_then_environment_overrides() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("blipstore.toml");
    std::fs::write(
        &path,
        r#"
dir = "./from-file"
num_jfiles = 16
jfile_size_pgs = 8
fsync_policy = "always"
log = "warn"

[[queues]]
name = "jobs"
durable = true
policy = { max_count = 100, mode = "flow_to_disk" }
"#,
    )
    .unwrap();

    let cfg = StoreConfig::load(Some(path.to_str().unwrap())).unwrap();
    assert_eq!(cfg.dir, PathBuf::from("./from-file"));
    assert_eq!((cfg.num_jfiles, cfg.jfile_size_pgs), (16, 8));
    assert_eq!(cfg.log_filter.as_deref(), Some("warn"));
    assert_eq!(cfg.flush_interval_ms, 1000);
    assert_eq!(
        cfg.queues[0].policy.map(|p| p.mode),
        Some(PolicyMode::FlowToDisk)
    );

    std::env::set_var("BLIPSTORE_DIR", "/tmp/from-env");
    std::env::set_var("BLIPSTORE_NUM_JFILES", "4");
    std::env::set_var("BLIPSTORE_LOG", "debug");
    let cfg = StoreConfig::load(Some(path.to_str().unwrap())).unwrap();
    assert_eq!(cfg.dir, PathBuf::from("/tmp/from-env"));
    assert_eq!(cfg.num_jfiles, 4);
    assert_eq!(cfg.jfile_size_pgs, 8);
    assert_eq!(cfg.log_filter.as_deref(), Some("debug"));
    let options = cfg.store_options().unwrap();
    assert_eq!(options.default_journal, JournalGeometry::new(4, 8).unwrap());

    std::env::set_var("BLIPSTORE_NUM_JFILES", "many");
    assert!(StoreConfig::load(Some(path.to_str().unwrap())).is_err());

    for var in ["BLIPSTORE_DIR", "BLIPSTORE_NUM_JFILES", "BLIPSTORE_LOG"] {
        std::env::remove_var(var);
    }
}

#[tokio::test]
async fn lifecycle_round_trip_keeps_configured_queues() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        dir: tmp.path().to_path_buf(),
        num_jfiles: 4,
        jfile_size_pgs: 1,
        flush_interval_ms: 20,
        queues: vec![blipstore::core::catalog::QueueDecl::new("jobs").durable(true)],
        ..StoreConfig::default()
    };

    let handle = lifecycle::start(config.clone()).await.unwrap();
    let store = handle.store();
    for i in 0..3 {
        store
            .accept("jobs", &Message::new(format!("j{i}").into_bytes()).durable(true), None)
            .unwrap();
    }
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    drop(store);
    assert_eq!(lifecycle::stop(handle).await, ExitStatus::Clean);

    let handle = lifecycle::start(config).await.unwrap();
    let info = handle.store().query_queue("jobs").unwrap();
    assert_eq!(info.depth, 3);
    assert_eq!(lifecycle::stop(handle).await, ExitStatus::Clean);
}
