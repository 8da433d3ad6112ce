use hookq::events::Event;
use hookq::store::{JobStats, JobStatus, JobStore};
use std::path::Path;
use tempfile::tempdir;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

fn event() -> Event {
    Event::new("push", "octocat", Some("acme/widgets"))
}

#[test]
fn lifecycle_records_every_transition() {
    let store = JobStore::open_in_memory().unwrap();
    let id = store.enqueue("build", &event()).unwrap();

    let job = store.get_job(id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.started_at.is_none());

    assert!(store.claim_running(id).unwrap());
    let job = store.get_job(id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.started_at.is_some());

    assert!(store.mark_completed(id, Path::new("/logs/job-1-build.log")).unwrap());
    let job = store.get_job(id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
    assert_eq!(job.log_file.as_deref(), Some("/logs/job-1-build.log"));
    assert!(job.error.is_none());
}

#[test]
fn second_claim_of_same_job_is_refused() {
    let store = JobStore::open_in_memory().unwrap();
    let id = store.enqueue("build", &event()).unwrap();
    assert!(store.claim_running(id).unwrap());
    assert!(!store.claim_running(id).unwrap());
    assert_eq!(store.count_running().unwrap(), 1);
}

#[test]
fn reset_stuck_jobs_requeues_only_running() {
    let tmp = tempdir().unwrap();
    let db = tmp.path().join("state.db");
    let (running, pending) = {
        let store = JobStore::open(&db).unwrap();
        let running = store.enqueue("build", &event()).unwrap();
        let pending = store.enqueue("build", &event()).unwrap();
        store.claim_running(running).unwrap();
        (running, pending)
    };

    let store = JobStore::open(&db).unwrap();
    assert_eq!(store.reset_stuck_jobs().unwrap(), 1);
    let stats = store.stats().unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.running, 0);

    let recovered = store.get_job(running).unwrap().unwrap();
    assert!(recovered.started_at.is_none());
    let ids = store
        .fetch_pending_candidates(10)
        .unwrap()
        .iter()
        .map(|j| j.id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![running, pending]);
}

#[test]
fn deferred_job_keeps_its_place_in_line() {
    let store = JobStore::open_in_memory().unwrap();
    let first = store.enqueue("build", &event()).unwrap();
    let second = store.enqueue("build", &event()).unwrap();
    let created_at = store.get_job(first).unwrap().unwrap().created_at;

    store.claim_running(first).unwrap();
    assert!(store.reset_to_pending(first).unwrap());

    let job = store.get_job(first).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.created_at, created_at);
    assert!(job.started_at.is_none());
    assert_eq!(store.fetch_pending_candidates(1).unwrap()[0].id, first);
    assert!(!store.reset_to_pending(second).unwrap());
}

#[test]
fn purge_keeps_row_exactly_at_cutoff() {
    let tmp = tempdir().unwrap();
    let db = tmp.path().join("state.db");
    let store = JobStore::open(&db).unwrap();
    let id = store.enqueue("build", &event()).unwrap();
    store.claim_running(id).unwrap();
    store.mark_failed(id, "exit 1", None).unwrap();
    let completed_at = store.get_job(id).unwrap().unwrap().completed_at.unwrap();

    assert_eq!(store.purge_older_than_at(7, completed_at + 7 * DAY_MS).unwrap(), 0);
    assert!(store.get_job(id).unwrap().is_some());

    assert_eq!(
        store.purge_older_than_at(7, completed_at + 7 * DAY_MS + 1).unwrap(),
        1
    );
    assert!(store.get_job(id).unwrap().is_none());
}

#[test]
fn purge_removes_logs_of_purged_jobs_only() {
    let tmp = tempdir().unwrap();
    let store = JobStore::open(&tmp.path().join("state.db")).unwrap();
    let old_log = tmp.path().join("job-1-build.log");
    let other_log = tmp.path().join("job-2-build.log");
    std::fs::write(&old_log, "old output").unwrap();
    std::fs::write(&other_log, "other output").unwrap();

    let old = store.enqueue("build", &event()).unwrap();
    let pending = store.enqueue("build", &event()).unwrap();
    store.claim_running(old).unwrap();
    store.mark_failed(old, "exit 1", Some(&old_log)).unwrap();
    let completed_at = store.get_job(old).unwrap().unwrap().completed_at.unwrap();

    assert_eq!(
        store.purge_older_than_at(7, completed_at + 7 * DAY_MS + 1).unwrap(),
        1
    );
    assert!(store.get_job(old).unwrap().is_none());
    assert!(store.get_job(pending).unwrap().is_some());
    assert!(!old_log.exists());
    assert!(other_log.exists());
}

#[test]
fn purge_with_current_clock_spares_fresh_rows() {
    let store = JobStore::open_in_memory().unwrap();
    let id = store.enqueue("build", &event()).unwrap();
    store.claim_running(id).unwrap();
    store.mark_completed(id, Path::new("x.log")).unwrap();
    assert_eq!(store.purge_older_than(1).unwrap(), 0);
}

#[test]
fn stats_count_each_status() {
    let store = JobStore::open_in_memory().unwrap();
    let ids = (0..5)
        .map(|_| store.enqueue("build", &event()).unwrap())
        .collect::<Vec<_>>();
    store.claim_running(ids[0]).unwrap();
    store.claim_running(ids[1]).unwrap();
    store.mark_completed(ids[1], Path::new("a.log")).unwrap();
    store.claim_running(ids[2]).unwrap();
    store.mark_failed(ids[2], "boom", Some(Path::new("b.log"))).unwrap();

    assert_eq!(
        store.stats().unwrap(),
        JobStats {
            pending: 2,
            running: 1,
            completed: 1,
            failed: 1,
        }
    );
}

#[test]
fn event_snapshot_survives_roundtrip() {
    let store = JobStore::open_in_memory().unwrap();
    let original = event().with_data("ref", serde_json::json!("refs/heads/main"));
    let id = store.enqueue("build", &original).unwrap();
    let decoded = store.get_job(id).unwrap().unwrap().event().unwrap();
    assert_eq!(decoded, original);
}
