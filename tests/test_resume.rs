mod fixtures;
use fixtures::*;

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use wineventlog::{Bookmark, CheckpointStore, Shutdown};

#[test]
fn test_resume_after_restart_has_no_gap_or_duplicate() {
    ensure_env_logger_initialized();
    let h = Harness::new();
    h.log.register_provider(service_provider());
    append_service_records(&h.log, "System", 10);

    let shutdown = Shutdown::new();
    let checkpoints = h.open_checkpoints();
    let first = read_all(&h.reader(stop_config("System", 3), &checkpoints, &shutdown));
    assert_eq!(record_ids(&first), (1..=10).collect::<Vec<u64>>());
    checkpoints.shutdown();
    drop(checkpoints);
    assert!(file_contains(&h.checkpoint_path(), "record_number: 10"));

    // New records arrive while nothing is running.
    append_service_records(&h.log, "System", 5);

    let checkpoints = h.open_checkpoints();
    let reader = h.reader(stop_config("System", 3), &checkpoints, &shutdown);
    assert_eq!(
        reader.initial_position(),
        wineventlog::Position::Bookmark(Bookmark::new("System", 10))
    );
    let second = read_all(&reader);
    assert_eq!(record_ids(&second), (11..=15).collect::<Vec<u64>>());

    let event = &second[0].event;
    assert_eq!(event.message, "The svc0 service entered the running state.");
    assert_eq!(event.keywords, vec!["Classic".to_owned()]);
}

#[test]
fn test_bounds_failures_are_recovered_end_to_end() {
    ensure_env_logger_initialized();
    let h = Harness::new();
    append_service_records(&h.log, "System", 25);
    h.log.set_batch_bound(Some(3));

    let shutdown = Shutdown::new();
    let checkpoints = h.open_checkpoints();
    let records = read_all(&h.reader(stop_config("System", 16), &checkpoints, &shutdown));

    let ids = record_ids(&records);
    let unique: BTreeSet<u64> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 25);
    assert_eq!(unique.len(), 25);
    assert_eq!(ids, (1..=25).collect::<Vec<u64>>());
    assert_eq!(checkpoints.get("System").unwrap().record_number, 25);
    assert_eq!(h.log.open_handles(), 0);
}

#[test]
fn test_checkpoint_written_within_flush_interval() {
    let h = Harness::new();
    let path = h.dir.path().join("registry.yml");
    let store = CheckpointStore::open(&path, Duration::from_secs(2)).unwrap();

    store.persist(wineventlog::CheckpointState {
        name: "App".to_owned(),
        record_number: 1,
        timestamp: jiff::Timestamp::now(),
        bookmark: String::new(),
    });
    assert!(!path.exists());
    store.persist(wineventlog::CheckpointState {
        name: "App".to_owned(),
        record_number: 2,
        timestamp: jiff::Timestamp::now(),
        bookmark: Bookmark::new("App", 2).serialize(),
    });

    let deadline = Instant::now() + Duration::from_secs(4);
    while !file_contains(&path, "record_number: 2") && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(file_contains(&path, "record_number: 2"));
    assert!(file_contains(&path, "RecordId=\\\"2\\\"") || file_contains(&path, "RecordId=\"2\""));
}

#[test]
fn test_truncated_log_restarts_from_the_beginning() {
    let h = Harness::new();
    append_service_records(&h.log, "System", 4);

    let shutdown = Shutdown::new();
    let checkpoints = h.open_checkpoints();
    read_all(&h.reader(stop_config("System", 10), &checkpoints, &shutdown));

    // The log was cleared and refilled; the bookmarked record no longer exists.
    h.log.clear("System");
    append_service_records(&h.log, "System", 2);

    let records = read_all(&h.reader(stop_config("System", 10), &checkpoints, &shutdown));
    assert_eq!(record_ids(&records), vec![5, 6]);
}
