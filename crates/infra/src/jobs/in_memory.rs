//! In-memory job store for tests/dev.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use jobforge_core::{JobId, JobStatus, StoreError};

use super::job::{FieldUpdate, FieldValue, Job, JobField};
use super::store::{
    Expect, JobStats, JobStore, transitioned, validate_field_write, validate_transition,
};

/// Pending-index entry. Orders by priority descending, then time, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct IndexEntry {
    rank: Reverse<i64>,
    time: i64,
    id: JobId,
}

impl IndexEntry {
    fn of(job: &Job) -> Self {
        Self {
            rank: Reverse(job.priority),
            time: job.time,
            id: job.id,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    pending: BTreeSet<IndexEntry>,
}

impl Inner {
    fn insert(&mut self, job: Job) {
        if job.status == JobStatus::Queued {
            self.pending.insert(IndexEntry::of(&job));
        }
        self.jobs.insert(job.id, job);
    }

    /// Replace a record. An indexed job is re-ranked while it stays Queued,
    /// a job entering Queued is indexed, and a job leaving Queued drops out.
    fn replace(&mut self, job: Job) {
        let (indexed, was_queued) = match self.jobs.get(&job.id) {
            Some(old) => (
                self.pending.remove(&IndexEntry::of(old)),
                old.status == JobStatus::Queued,
            ),
            None => (false, false),
        };
        if job.status == JobStatus::Queued && (indexed || !was_queued) {
            self.pending.insert(IndexEntry::of(&job));
        }
        self.jobs.insert(job.id, job);
    }

    fn write_field(&mut self, id: JobId, field: JobField, value: FieldValue) -> Result<Job, StoreError> {
        let mut job = self.jobs.get(&id).cloned().ok_or(StoreError::NotFound(id))?;
        job.apply(field, value)?;
        self.replace(job.clone());
        Ok(job)
    }
}

/// Single mutex over records and index; every operation is one critical
/// section, which gives the atomicity the trait requires.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of pending-index entries.
    pub fn pending_len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.pending.len())
    }

    /// Drop a record while leaving its index entry behind, as a crashed
    /// writer on a non-transactional backend could. Test support for the
    /// orphan-pruning path.
    #[doc(hidden)]
    pub fn orphan_record(&self, id: JobId) -> Result<(), StoreError> {
        self.lock()?.jobs.remove(&id);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl JobStore for InMemoryJobStore {
    fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        inner.insert(job.clone());
        Ok(())
    }

    fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        self.lock()?
            .jobs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn set_field(&self, id: JobId, field: JobField, value: FieldValue) -> Result<(), StoreError> {
        validate_field_write(field, &value)?;
        self.lock()?.write_field(id, field, value)?;
        Ok(())
    }

    fn set_field_if(
        &self,
        id: JobId,
        status: JobStatus,
        field: JobField,
        value: FieldValue,
    ) -> Result<Job, StoreError> {
        validate_field_write(field, &value)?;
        let mut inner = self.lock()?;
        let actual = inner.jobs.get(&id).ok_or(StoreError::NotFound(id))?.status;
        if actual != status {
            return Err(StoreError::Conflict { id, actual });
        }
        inner.write_field(id, field, value)
    }

    fn compare_and_set_status(
        &self,
        id: JobId,
        expect: Expect,
        new: JobStatus,
        updates: &[FieldUpdate],
    ) -> Result<Job, StoreError> {
        validate_transition(&expect, new, updates)?;
        let mut inner = self.lock()?;
        let current = inner.jobs.get(&id).ok_or(StoreError::NotFound(id))?;
        let next = transitioned(current, &expect, new, updates)?;
        inner.replace(next.clone());
        Ok(next)
    }

    fn query_eligible(&self, now: i64, limit: usize) -> Result<Vec<JobId>, StoreError> {
        Ok(self
            .lock()?
            .pending
            .iter()
            .filter(|entry| entry.time <= now)
            .take(limit)
            .map(|entry| entry.id)
            .collect())
    }

    fn delete_from_index(&self, id: JobId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let Inner { jobs, pending } = &mut *inner;
        match jobs.get(&id) {
            Some(job) => {
                pending.remove(&IndexEntry::of(job));
            }
            None => pending.retain(|entry| entry.id != id),
        }
        Ok(())
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let job = inner.jobs.remove(&id).ok_or(StoreError::NotFound(id))?;
        inner.pending.remove(&IndexEntry::of(&job));
        Ok(())
    }

    fn delete_job_unless(&self, id: JobId, refused: JobStatus) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let actual = inner.jobs.get(&id).ok_or(StoreError::NotFound(id))?.status;
        if actual == refused {
            return Err(StoreError::Conflict { id, actual });
        }
        let job = inner.jobs.remove(&id).ok_or(StoreError::NotFound(id))?;
        inner.pending.remove(&IndexEntry::of(&job));
        Ok(())
    }

    fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StoreError> {
        let inner = self.lock()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|job| job.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.time, job.id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        let inner = self.lock()?;
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::{ClaimId, Handler, JobType, JobTypeRegistry};
    use proptest::prelude::*;

    fn job_type() -> Arc<JobType> {
        JobTypeRegistry::new()
            .register("t", 0, Handler::new(|| Ok(())))
            .unwrap()
    }

    fn job(priority: i64, time: i64) -> Job {
        Job::new(&job_type(), priority, time, 0, Vec::new())
    }

    #[test]
    fn create_indexes_queued_jobs() {
        let store = InMemoryJobStore::new();
        let j = job(1, 10);
        store.create_job(&j).unwrap();
        assert_eq!(store.get_job(j.id()).unwrap(), j);
        assert_eq!(store.pending_len().unwrap(), 1);
        assert_eq!(store.create_job(&j), Err(StoreError::AlreadyExists(j.id())));
    }

    #[test]
    fn eligible_ordering_and_time_filter() {
        let store = InMemoryJobStore::new();
        let low = job(1, 5);
        let high_late = job(9, 8);
        let high_early = job(9, 2);
        let future = job(100, 50);
        for j in [&low, &high_late, &high_early, &future] {
            store.create_job(j).unwrap();
        }

        let ids = store.query_eligible(10, 10).unwrap();
        assert_eq!(ids, vec![high_early.id(), high_late.id(), low.id()]);
        assert_eq!(store.query_eligible(10, 1).unwrap(), vec![high_early.id()]);
    }

    #[test]
    fn cas_maintains_index() {
        let store = InMemoryJobStore::new();
        let j = job(0, 0);
        store.create_job(&j).unwrap();

        let claim = ClaimId::new();
        let running = store
            .compare_and_set_status(
                j.id(),
                Expect::status(JobStatus::Queued),
                JobStatus::Executing,
                &[FieldUpdate::claim(Some(claim))],
            )
            .unwrap();
        assert_eq!(running.claim(), Some(claim));
        assert!(store.query_eligible(i64::MAX, 10).unwrap().is_empty());

        let err = store
            .compare_and_set_status(
                j.id(),
                Expect::status(JobStatus::Queued),
                JobStatus::Executing,
                &[],
            )
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                id: j.id(),
                actual: JobStatus::Executing
            }
        );

        store
            .compare_and_set_status(
                j.id(),
                Expect::claimed(claim),
                JobStatus::Queued,
                &[FieldUpdate::claim(None)],
            )
            .unwrap();
        assert_eq!(store.query_eligible(i64::MAX, 10).unwrap(), vec![j.id()]);
    }

    #[test]
    fn set_field_reranks_queued_job() {
        let store = InMemoryJobStore::new();
        let a = job(5, 0);
        let b = job(1, 0);
        store.create_job(&a).unwrap();
        store.create_job(&b).unwrap();

        store.set_field(b.id(), JobField::Priority, FieldValue::Int(10)).unwrap();
        assert_eq!(store.query_eligible(0, 10).unwrap(), vec![b.id(), a.id()]);

        store.set_field(b.id(), JobField::Time, FieldValue::Int(100)).unwrap();
        assert_eq!(store.query_eligible(0, 10).unwrap(), vec![a.id()]);
        assert_eq!(store.pending_len().unwrap(), 2);
    }

    #[test]
    fn status_and_claim_are_not_settable() {
        let store = InMemoryJobStore::new();
        let j = job(0, 0);
        store.create_job(&j).unwrap();
        for field in [JobField::Status, JobField::Claim] {
            assert!(matches!(
                store.set_field(j.id(), field, FieldValue::Null),
                Err(StoreError::InvalidField(_))
            ));
        }
    }

    #[test]
    fn delete_from_index_prunes_orphans() {
        let store = InMemoryJobStore::new();
        let j = job(0, 0);
        store.create_job(&j).unwrap();
        store.orphan_record(j.id()).unwrap();
        assert_eq!(store.query_eligible(0, 10).unwrap(), vec![j.id()]);

        store.delete_from_index(j.id()).unwrap();
        store.delete_from_index(j.id()).unwrap();
        assert!(store.query_eligible(0, 10).unwrap().is_empty());
    }

    #[test]
    fn unindexed_job_stays_unindexed_through_field_writes() {
        let store = InMemoryJobStore::new();
        let j = job(0, 0);
        store.create_job(&j).unwrap();
        store.delete_from_index(j.id()).unwrap();

        store
            .set_field(j.id(), JobField::LastError, FieldValue::Text("note".into()))
            .unwrap();
        store.set_field(j.id(), JobField::Priority, FieldValue::Int(9)).unwrap();
        assert!(store.query_eligible(0, 10).unwrap().is_empty());
        assert_eq!(store.pending_len().unwrap(), 0);

        // Re-entering Queued indexes it again.
        let claim = ClaimId::new();
        store
            .compare_and_set_status(
                j.id(),
                Expect::status(JobStatus::Queued),
                JobStatus::Executing,
                &[FieldUpdate::claim(Some(claim))],
            )
            .unwrap();
        store
            .compare_and_set_status(j.id(), Expect::claimed(claim), JobStatus::Queued, &[FieldUpdate::claim(None)])
            .unwrap();
        assert_eq!(store.query_eligible(0, 10).unwrap(), vec![j.id()]);
    }

    #[test]
    fn guarded_writes_check_status_under_the_lock() {
        let store = InMemoryJobStore::new();
        let j = job(0, 0);
        store.create_job(&j).unwrap();

        let moved = store
            .set_field_if(j.id(), JobStatus::Queued, JobField::Time, FieldValue::Int(50))
            .unwrap();
        assert_eq!(moved.time(), 50);
        assert_eq!(store.query_eligible(50, 10).unwrap(), vec![j.id()]);

        store
            .compare_and_set_status(j.id(), Expect::status(JobStatus::Queued), JobStatus::Executing, &[])
            .unwrap();
        assert_eq!(
            store.set_field_if(j.id(), JobStatus::Queued, JobField::Time, FieldValue::Int(0)),
            Err(StoreError::Conflict {
                id: j.id(),
                actual: JobStatus::Executing
            })
        );
        assert_eq!(store.get_job(j.id()).unwrap().time(), 50);
        assert_eq!(
            store.delete_job_unless(j.id(), JobStatus::Executing),
            Err(StoreError::Conflict {
                id: j.id(),
                actual: JobStatus::Executing
            })
        );
        assert!(store.get_job(j.id()).is_ok());

        let other = job(0, 0);
        store.create_job(&other).unwrap();
        store.delete_job_unless(other.id(), JobStatus::Executing).unwrap();
        assert_eq!(store.pending_len().unwrap(), 0);
        assert_eq!(
            store.delete_job_unless(other.id(), JobStatus::Executing),
            Err(StoreError::NotFound(other.id()))
        );
    }

    #[test]
    fn delete_and_stats() {
        let store = InMemoryJobStore::new();
        let a = job(0, 0);
        let b = job(0, 1);
        store.create_job(&a).unwrap();
        store.create_job(&b).unwrap();
        store
            .compare_and_set_status(a.id(), Expect::status(JobStatus::Queued), JobStatus::Cancelled, &[])
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!((stats.queued, stats.cancelled, stats.total()), (1, 1, 2));

        store.delete_job(b.id()).unwrap();
        assert_eq!(store.delete_job(b.id()), Err(StoreError::NotFound(b.id())));
        assert_eq!(store.pending_len().unwrap(), 0);
        assert_eq!(store.list_jobs(JobStatus::Cancelled, 10).unwrap(), vec![store.get_job(a.id()).unwrap()]);
    }

    proptest! {
        #[test]
        fn eligible_ids_follow_rank_order(specs in proptest::collection::vec((-5i64..5, 0i64..20), 1..40)) {
            let store = InMemoryJobStore::new();
            let mut jobs = Vec::new();
            for (priority, time) in specs {
                let j = job(priority, time);
                store.create_job(&j).unwrap();
                jobs.push(j);
            }

            let ids = store.query_eligible(10, usize::MAX).unwrap();
            let mut expected: Vec<&Job> = jobs.iter().filter(|j| j.time() <= 10).collect();
            expected.sort_by_key(|j| (Reverse(j.priority()), j.time(), j.id()));
            let expected: Vec<JobId> = expected.into_iter().map(|j| j.id()).collect();
            prop_assert_eq!(ids, expected);
        }
    }
}
