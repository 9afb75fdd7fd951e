//! Startup recovery integration tests.
//!
//! Writes jobs into an on-disk store the way a crashed process would leave
//! them, then starts a fresh scheduler on the same file.

mod common;

use std::path::Path;

use common::{fast_config, job, ScriptedConverter, TestHarness};
use transq::service::{recover_interrupted, Recovery};
use transq_common::{JobId, JobStatus};
use transq_db::store::INTERRUPTED_MESSAGE;
use transq_db::JobStore;

/// Leave one job in every state in the database at `path`.
fn seed_crashed_store(path: &Path) {
    let store = JobStore::open(path).unwrap();

    store.upsert(&job("pending")).unwrap();

    let mut running = job("running");
    running.start();
    running.record_progress(40.0);
    store.upsert(&running).unwrap();

    let mut retrying = job("retrying");
    retrying.start();
    retrying.mark_retrying("first attempt failed");
    store.upsert(&retrying).unwrap();

    let mut exhausted = job("exhausted").with_max_retries(0);
    exhausted.start();
    store.upsert(&exhausted).unwrap();

    let mut done = job("done");
    done.start();
    done.complete();
    store.upsert(&done).unwrap();
}

fn harness_on(path: &Path) -> TestHarness {
    let store = JobStore::open(path).unwrap();
    TestHarness::with_store(fast_config(), ScriptedConverter::succeeding(), 1, store)
}

#[tokio::test]
async fn interrupted_jobs_are_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transq.db");
    seed_crashed_store(&path);

    let harness = harness_on(&path);
    let recovery = recover_interrupted(&harness.store, &harness.scheduler, true).unwrap();
    assert_eq!(
        recovery,
        Recovery {
            interrupted: 4,
            resumed: 3,
        }
    );

    let pending = harness
        .wait_for(&JobId::from("pending"), JobStatus::Completed)
        .await;
    assert_eq!(pending.retry_count, 0);

    // The attempt cut short by the crash counts against the budget.
    let running = harness
        .wait_for(&JobId::from("running"), JobStatus::Completed)
        .await;
    assert_eq!(running.retry_count, 1);

    let retrying = harness
        .wait_for(&JobId::from("retrying"), JobStatus::Completed)
        .await;
    assert_eq!(retrying.retry_count, 1);

    let exhausted = harness
        .store
        .get(&JobId::from("exhausted"))
        .unwrap()
        .unwrap();
    assert_eq!(exhausted.status, JobStatus::Failed);
    assert_eq!(exhausted.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
    assert!(harness.scheduler.status(&exhausted.id).is_none());

    let done = harness.store.get(&JobId::from("done")).unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(harness.converter.calls(), 3);
}

#[tokio::test]
async fn interrupted_jobs_fail_when_resume_is_off() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transq.db");
    seed_crashed_store(&path);

    let harness = harness_on(&path);
    let recovery = recover_interrupted(&harness.store, &harness.scheduler, false).unwrap();
    assert_eq!(recovery.interrupted, 4);
    assert_eq!(recovery.resumed, 0);

    for id in ["pending", "running", "retrying", "exhausted"] {
        let stored = harness.store.get(&JobId::from(id)).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed, "job {id}");
        assert_eq!(stored.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert!(stored.completed_at.is_some());
    }
    assert_eq!(harness.converter.calls(), 0);
}

#[tokio::test]
async fn clean_store_needs_no_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transq.db");

    let harness = harness_on(&path);
    let recovery = recover_interrupted(&harness.store, &harness.scheduler, true).unwrap();
    assert_eq!(recovery, Recovery::default());
}

#[tokio::test]
async fn second_recovery_finds_nothing_left() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transq.db");
    seed_crashed_store(&path);

    let harness = harness_on(&path);
    recover_interrupted(&harness.store, &harness.scheduler, false).unwrap();
    let again = recover_interrupted(&harness.store, &harness.scheduler, false).unwrap();
    assert_eq!(again.interrupted, 0);
}
