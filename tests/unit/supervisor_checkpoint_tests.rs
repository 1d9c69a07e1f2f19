//! Supervisor checkpoint file format and atomic replacement.

use gridvisor::supervisor::{CheckpointStore, SupervisorCheckpoint, CHECKPOINT_FILE};

#[test]
fn line_format_is_count_then_six_decimals() {
    let checkpoint = SupervisorCheckpoint {
        tasks_completed: 2,
        cumulative_cpu_time: 12.5,
        cumulative_runtime: 30.25,
    };
    assert_eq!(checkpoint.to_line(), "2 12.500000 30.250000\n");
}

#[test]
fn parse_accepts_trailing_whitespace_and_rejects_garbage() {
    let parsed = SupervisorCheckpoint::parse("1 0.5 1.0\n").unwrap();
    assert_eq!(parsed.tasks_completed, 1);
    assert!((parsed.cumulative_cpu_time - 0.5).abs() < 1e-9);
    assert!((parsed.cumulative_runtime - 1.0).abs() < 1e-9);

    assert_eq!(SupervisorCheckpoint::parse(""), None);
    assert_eq!(SupervisorCheckpoint::parse("1 0.5"), None);
    assert_eq!(SupervisorCheckpoint::parse("-1 0.5 1.0"), None);
    assert_eq!(SupervisorCheckpoint::parse("1 inf 1.0"), None);
}

#[test]
fn store_round_trips_and_replaces() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path());
    assert_eq!(store.path(), dir.path().join(CHECKPOINT_FILE));
    assert_eq!(store.load(), None);

    let first = SupervisorCheckpoint {
        tasks_completed: 1,
        cumulative_cpu_time: 3.0,
        cumulative_runtime: 4.0,
    };
    store.save(&first).unwrap();
    assert_eq!(store.load(), Some(first));

    let second = SupervisorCheckpoint {
        tasks_completed: 2,
        ..first
    };
    store.save(&second).unwrap();
    assert_eq!(store.load(), Some(second));

    let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftovers, 1, "no temporary files left behind");
}

#[test]
fn corrupt_file_means_start_over() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(CHECKPOINT_FILE), "not a checkpoint").unwrap();
    assert_eq!(CheckpointStore::new(dir.path()).load(), None);
}

#[test]
fn save_into_missing_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(&dir.path().join("absent"));
    assert!(matches!(
        store.save(&SupervisorCheckpoint::default()),
        Err(gridvisor::AppError::Checkpoint(_))
    ));
}
