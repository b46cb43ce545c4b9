//! Behaviour every `JobStore` adapter must share.
//!
//! Checks only look at jobs they created, so they also hold against a
//! database that other tests write to concurrently.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use jobforge_core::{ClaimId, Handler, JobId, JobStatus, JobType, JobTypeRegistry, StoreError};
use jobforge_infra::jobs::{Expect, FieldUpdate, FieldValue, Job, JobField, JobStore};

pub fn job_type() -> Arc<JobType> {
    JobTypeRegistry::new()
        .register("conformance", 2, Handler::new(|| Ok(())))
        .unwrap()
}

pub fn job(priority: i64, time: i64) -> Job {
    Job::new(&job_type(), priority, time, 0, b"null".to_vec())
}

fn own(ids: Vec<JobId>, mine: &[JobId]) -> Vec<JobId> {
    ids.into_iter().filter(|id| mine.contains(id)).collect()
}

fn claim<S: JobStore>(store: &S, id: JobId) -> Result<Job, StoreError> {
    store.compare_and_set_status(
        id,
        Expect::status(JobStatus::Queued),
        JobStatus::Executing,
        &[FieldUpdate::claim(Some(ClaimId::new())), FieldUpdate::started(Some(1))],
    )
}

pub fn create_and_read<S: JobStore>(store: &S) {
    let j = job(100, 1_000);
    store.create_job(&j).unwrap();

    assert_eq!(store.get_job(j.id()).unwrap(), j);
    assert_eq!(store.get_field(j.id(), JobField::Priority).unwrap(), FieldValue::Int(100));
    assert_eq!(
        store.get_field(j.id(), JobField::Data).unwrap(),
        FieldValue::Bytes(b"null".to_vec())
    );
    assert_eq!(store.get_field(j.id(), JobField::Claim).unwrap(), FieldValue::Null);
    assert_eq!(store.create_job(&j), Err(StoreError::AlreadyExists(j.id())));

    let missing = JobId::new();
    assert_eq!(store.get_job(missing), Err(StoreError::NotFound(missing)));
}

pub fn ranks_eligible_jobs<S: JobStore>(store: &S) {
    let low = job(-3, 10);
    let high_late = job(7, 30);
    let high_early = job(7, 20);
    let future = job(1_000, 5_000_000_000_000_000_000);
    let mine: Vec<JobId> = [&low, &high_late, &high_early, &future]
        .iter()
        .map(|j| j.id())
        .collect();
    for j in [&low, &high_late, &high_early, &future] {
        store.create_job(j).unwrap();
    }

    let ids = own(store.query_eligible(1_000, 10_000).unwrap(), &mine);
    assert_eq!(ids, vec![high_early.id(), high_late.id(), low.id()]);
}

pub fn transitions_maintain_index<S: JobStore>(store: &S) {
    let j = job(0, 10);
    store.create_job(&j).unwrap();

    let running = claim(store, j.id()).unwrap();
    assert_eq!(running.status(), JobStatus::Executing);
    let token = running.claim().unwrap();
    assert!(own(store.query_eligible(1_000, 10_000).unwrap(), &[j.id()]).is_empty());

    assert!(matches!(
        claim(store, j.id()),
        Err(StoreError::Conflict { actual: JobStatus::Executing, .. })
    ));
    assert!(matches!(
        store.compare_and_set_status(j.id(), Expect::claimed(ClaimId::new()), JobStatus::Finished, &[]),
        Err(StoreError::Conflict { .. })
    ));

    let retried = store
        .compare_and_set_status(
            j.id(),
            Expect::claimed(token),
            JobStatus::Queued,
            &[
                FieldUpdate::retries_left(1),
                FieldUpdate::last_error(Some("boom".into())),
                FieldUpdate::claim(None),
                FieldUpdate::started(None),
            ],
        )
        .unwrap();
    assert_eq!(retried.retries_left(), 1);
    assert_eq!(retried.last_error(), Some("boom"));
    assert_eq!(retried.claim(), None);
    assert_eq!(store.get_job(j.id()).unwrap(), retried);
    assert_eq!(own(store.query_eligible(1_000, 10_000).unwrap(), &[j.id()]), vec![j.id()]);

    store
        .compare_and_set_status(j.id(), Expect::status(JobStatus::Queued), JobStatus::Cancelled, &[])
        .unwrap();
    assert_eq!(
        store.compare_and_set_status(j.id(), Expect::status(JobStatus::Cancelled), JobStatus::Queued, &[]),
        Err(StoreError::IllegalTransition {
            from: JobStatus::Cancelled,
            to: JobStatus::Queued
        })
    );
    assert!(own(store.query_eligible(1_000, 10_000).unwrap(), &[j.id()]).is_empty());

    let missing = JobId::new();
    assert_eq!(claim(store, missing), Err(StoreError::NotFound(missing)));
}

pub fn set_field_reranks<S: JobStore>(store: &S) {
    let a = job(5, 10);
    let b = job(1, 10);
    store.create_job(&a).unwrap();
    store.create_job(&b).unwrap();
    let mine = [a.id(), b.id()];

    store.set_field(b.id(), JobField::Priority, FieldValue::Int(9)).unwrap();
    assert_eq!(own(store.query_eligible(1_000, 10_000).unwrap(), &mine), vec![b.id(), a.id()]);

    store.set_field(b.id(), JobField::Time, FieldValue::Int(2_000)).unwrap();
    assert_eq!(own(store.query_eligible(1_000, 10_000).unwrap(), &mine), vec![a.id()]);
    assert_eq!(store.get_job(b.id()).unwrap().time(), 2_000);

    store
        .set_field(a.id(), JobField::LastError, FieldValue::Text("note".into()))
        .unwrap();
    store.set_field(a.id(), JobField::LastError, FieldValue::Null).unwrap();
    assert_eq!(store.get_job(a.id()).unwrap().last_error(), None);

    assert!(matches!(
        store.set_field(a.id(), JobField::Status, FieldValue::Text("finished".into())),
        Err(StoreError::InvalidField(_))
    ));
    let missing = JobId::new();
    assert_eq!(
        store.set_field(missing, JobField::Priority, FieldValue::Int(1)),
        Err(StoreError::NotFound(missing))
    );
}

pub fn deletes<S: JobStore>(store: &S) {
    let j = job(0, 10);
    store.create_job(&j).unwrap();

    store.delete_from_index(j.id()).unwrap();
    store.delete_from_index(j.id()).unwrap();
    assert!(own(store.query_eligible(1_000, 10_000).unwrap(), &[j.id()]).is_empty());
    assert_eq!(store.get_job(j.id()).unwrap().status(), JobStatus::Queued);

    // Field writes leave an unindexed job unindexed.
    store
        .set_field(j.id(), JobField::LastError, FieldValue::Text("note".into()))
        .unwrap();
    store.set_field(j.id(), JobField::Priority, FieldValue::Int(50)).unwrap();
    assert!(own(store.query_eligible(1_000, 10_000).unwrap(), &[j.id()]).is_empty());
    assert_eq!(store.get_job(j.id()).unwrap().priority(), 50);

    store.delete_job(j.id()).unwrap();
    assert_eq!(store.get_job(j.id()), Err(StoreError::NotFound(j.id())));
    assert_eq!(store.delete_job(j.id()), Err(StoreError::NotFound(j.id())));
}

pub fn guarded_writes<S: JobStore>(store: &S) {
    let j = job(0, 10);
    store.create_job(&j).unwrap();

    let moved = store
        .set_field_if(j.id(), JobStatus::Queued, JobField::Time, FieldValue::Int(20))
        .unwrap();
    assert_eq!(moved.time(), 20);
    assert_eq!(store.get_job(j.id()).unwrap(), moved);
    assert_eq!(own(store.query_eligible(15, 10_000).unwrap(), &[j.id()]), Vec::<JobId>::new());
    assert_eq!(own(store.query_eligible(20, 10_000).unwrap(), &[j.id()]), vec![j.id()]);

    claim(store, j.id()).unwrap();
    assert_eq!(
        store.set_field_if(j.id(), JobStatus::Queued, JobField::Time, FieldValue::Int(30)),
        Err(StoreError::Conflict {
            id: j.id(),
            actual: JobStatus::Executing
        })
    );
    assert_eq!(store.get_job(j.id()).unwrap().time(), 20);
    assert!(matches!(
        store.set_field_if(j.id(), JobStatus::Executing, JobField::Claim, FieldValue::Null),
        Err(StoreError::InvalidField(_))
    ));

    assert_eq!(
        store.delete_job_unless(j.id(), JobStatus::Executing),
        Err(StoreError::Conflict {
            id: j.id(),
            actual: JobStatus::Executing
        })
    );
    assert_eq!(store.get_job(j.id()).unwrap().status(), JobStatus::Executing);

    let other = job(0, 10);
    store.create_job(&other).unwrap();
    store.delete_job_unless(other.id(), JobStatus::Executing).unwrap();
    assert_eq!(store.get_job(other.id()), Err(StoreError::NotFound(other.id())));
    assert!(own(store.query_eligible(1_000, 10_000).unwrap(), &[other.id()]).is_empty());
    assert_eq!(
        store.delete_job_unless(other.id(), JobStatus::Executing),
        Err(StoreError::NotFound(other.id()))
    );
}

pub fn lists_and_counts<S: JobStore>(store: &S) {
    let before = store.stats().unwrap();
    let a = job(0, 10);
    let b = job(0, 5);
    store.create_job(&a).unwrap();
    store.create_job(&b).unwrap();
    claim(store, a.id()).unwrap();

    let executing: Vec<JobId> = store
        .list_jobs(JobStatus::Executing, 10_000)
        .unwrap()
        .into_iter()
        .map(|j| j.id())
        .collect();
    assert!(executing.contains(&a.id()));
    assert!(!executing.contains(&b.id()));

    let after = store.stats().unwrap();
    assert!(after.executing > before.executing);
    assert!(after.total() >= before.total() + 2);
}

pub fn racing_claims_have_one_winner<S: JobStore + Clone + 'static>(store: &S) {
    let j = job(0, 10);
    store.create_job(&j).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let id = j.id();
            thread::spawn(move || claim(&store, id).is_ok())
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

/// Run the whole suite.
pub fn conformance<S: JobStore + Clone + 'static>(store: S) {
    create_and_read(&store);
    ranks_eligible_jobs(&store);
    transitions_maintain_index(&store);
    set_field_reranks(&store);
    deletes(&store);
    guarded_writes(&store);
    lists_and_counts(&store);
    racing_claims_have_one_winner(&store);
}
