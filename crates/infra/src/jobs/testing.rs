//! Test support: a store that lets another party act right before the
//! first write reaches it.

use std::sync::Mutex;

use jobforge_core::{JobId, JobStatus, StoreError};

use super::job::{FieldUpdate, FieldValue, Job, JobField};
use super::store::{Expect, JobStats, JobStore};

type Hook<S> = Box<dyn FnOnce(&S) + Send>;

/// Runs `hook` against the inner store once, just before the first write
/// call is forwarded. Reads pass straight through.
pub(crate) struct Interleaved<S> {
    inner: S,
    hook: Mutex<Option<Hook<S>>>,
}

impl<S: JobStore> Interleaved<S> {
    pub(crate) fn new(inner: S, hook: impl FnOnce(&S) + Send + 'static) -> Self {
        Self {
            inner,
            hook: Mutex::new(Some(Box::new(hook))),
        }
    }

    pub(crate) fn inner(&self) -> &S {
        &self.inner
    }

    fn before_write(&self) {
        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
    }
}

impl<S: JobStore> JobStore for Interleaved<S> {
    fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        self.before_write();
        self.inner.create_job(job)
    }

    fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        self.inner.get_job(id)
    }

    fn set_field(&self, id: JobId, field: JobField, value: FieldValue) -> Result<(), StoreError> {
        self.before_write();
        self.inner.set_field(id, field, value)
    }

    fn set_field_if(
        &self,
        id: JobId,
        status: JobStatus,
        field: JobField,
        value: FieldValue,
    ) -> Result<Job, StoreError> {
        self.before_write();
        self.inner.set_field_if(id, status, field, value)
    }

    fn compare_and_set_status(
        &self,
        id: JobId,
        expect: Expect,
        new: JobStatus,
        updates: &[FieldUpdate],
    ) -> Result<Job, StoreError> {
        self.before_write();
        self.inner.compare_and_set_status(id, expect, new, updates)
    }

    fn query_eligible(&self, now: i64, limit: usize) -> Result<Vec<JobId>, StoreError> {
        self.inner.query_eligible(now, limit)
    }

    fn delete_from_index(&self, id: JobId) -> Result<(), StoreError> {
        self.before_write();
        self.inner.delete_from_index(id)
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        self.before_write();
        self.inner.delete_job(id)
    }

    fn delete_job_unless(&self, id: JobId, refused: JobStatus) -> Result<(), StoreError> {
        self.before_write();
        self.inner.delete_job_unless(id, refused)
    }

    fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.inner.list_jobs(status, limit)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        self.inner.stats()
    }
}
