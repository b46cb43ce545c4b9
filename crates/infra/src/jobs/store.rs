//! Store adapter boundary.

use std::sync::Arc;

use serde::Serialize;

use jobforge_core::{ClaimId, JobId, JobStatus, StoreError};

use super::job::{FieldUpdate, FieldValue, Job, JobField};

/// Guard for [`JobStore::compare_and_set_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expect {
    pub status: JobStatus,
    /// When set, the job's current claim must equal this token.
    pub claim: Option<ClaimId>,
}

impl Expect {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            claim: None,
        }
    }

    /// Executing under exactly this claim.
    pub fn claimed(claim: ClaimId) -> Self {
        Self {
            status: JobStatus::Executing,
            claim: Some(claim),
        }
    }

    pub fn holds_for(&self, job: &Job) -> bool {
        job.status == self.status && self.claim.is_none_or(|c| job.claim == Some(c))
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub executing: usize,
    pub finished: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Executing => self.executing += count,
            JobStatus::Finished => self.finished += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.executing + self.finished + self.failed + self.cancelled
    }
}

/// Durable job storage.
///
/// The store is the single source of truth for queue state. Besides the job
/// records it maintains a pending index holding exactly the Queued jobs,
/// ranked by priority descending, then scheduled time ascending, then id
/// ascending.
///
/// ## Atomicity
///
/// - `create_job` writes all fields and the index entry, or nothing.
/// - `compare_and_set_status` is the only way to change `status`. Checking
///   the guard, writing the field updates, setting the new status and
///   maintaining the index entry (entering Queued inserts it, leaving Queued
///   removes it) happen as one atomic step. Two racing claimers can never
///   both succeed.
/// - `set_field` on `priority`/`time` of an indexed job re-ranks its index
///   entry in the same step. Field writes never add an entry: a Queued job
///   removed with `delete_from_index` stays unindexed until it next enters
///   Queued through `compare_and_set_status`.
/// - `set_field_if` and `delete_job_unless` check the job's status and
///   write in one step, so a claim can never land between the two.
pub trait JobStore: Send + Sync {
    /// Persist a new job and index it if it is Queued.
    fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Load a full job record.
    fn get_job(&self, id: JobId) -> Result<Job, StoreError>;

    /// Read one field.
    fn get_field(&self, id: JobId, field: JobField) -> Result<FieldValue, StoreError> {
        self.get_job(id).map(|job| job.get(field))
    }

    /// Blind write of one settable field (not `status`/`claim`).
    fn set_field(&self, id: JobId, field: JobField, value: FieldValue) -> Result<(), StoreError>;

    /// Write one settable field only while the job is in `status`.
    ///
    /// Returns the updated job; `Conflict` carries the actual status when it
    /// differs.
    fn set_field_if(
        &self,
        id: JobId,
        status: JobStatus,
        field: JobField,
        value: FieldValue,
    ) -> Result<Job, StoreError>;

    /// Atomically move a job from `expect` to `new`, applying `updates`.
    ///
    /// Returns the updated job. Fails with `NotFound`, with `Conflict` when
    /// the guard does not hold, and with `IllegalTransition` when
    /// `expect.status -> new` is not an edge of the state machine.
    fn compare_and_set_status(
        &self,
        id: JobId,
        expect: Expect,
        new: JobStatus,
        updates: &[FieldUpdate],
    ) -> Result<Job, StoreError>;

    /// Ids of indexed jobs with `time <= now`, in rank order, at most `limit`.
    fn query_eligible(&self, now: i64, limit: usize) -> Result<Vec<JobId>, StoreError>;

    /// Remove a job's pending-index entry, if any. Idempotent.
    fn delete_from_index(&self, id: JobId) -> Result<(), StoreError>;

    /// Delete a job record and its index entry.
    fn delete_job(&self, id: JobId) -> Result<(), StoreError>;

    /// Delete a job unless it is in `refused`, which fails with `Conflict`.
    fn delete_job_unless(&self, id: JobId, refused: JobStatus) -> Result<(), StoreError>;

    /// Jobs in `status`, ordered by scheduled time then id, at most `limit`.
    fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StoreError>;

    fn stats(&self) -> Result<JobStats, StoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        (**self).create_job(job)
    }

    fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        (**self).get_job(id)
    }

    fn get_field(&self, id: JobId, field: JobField) -> Result<FieldValue, StoreError> {
        (**self).get_field(id, field)
    }

    fn set_field(&self, id: JobId, field: JobField, value: FieldValue) -> Result<(), StoreError> {
        (**self).set_field(id, field, value)
    }

    fn set_field_if(
        &self,
        id: JobId,
        status: JobStatus,
        field: JobField,
        value: FieldValue,
    ) -> Result<Job, StoreError> {
        (**self).set_field_if(id, status, field, value)
    }

    fn compare_and_set_status(
        &self,
        id: JobId,
        expect: Expect,
        new: JobStatus,
        updates: &[FieldUpdate],
    ) -> Result<Job, StoreError> {
        (**self).compare_and_set_status(id, expect, new, updates)
    }

    fn query_eligible(&self, now: i64, limit: usize) -> Result<Vec<JobId>, StoreError> {
        (**self).query_eligible(now, limit)
    }

    fn delete_from_index(&self, id: JobId) -> Result<(), StoreError> {
        (**self).delete_from_index(id)
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        (**self).delete_job(id)
    }

    fn delete_job_unless(&self, id: JobId, refused: JobStatus) -> Result<(), StoreError> {
        (**self).delete_job_unless(id, refused)
    }

    fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).list_jobs(status, limit)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        (**self).stats()
    }
}

/// Validate a `set_field` request before touching storage: the field must
/// be settable and the value must have its type.
pub fn validate_field_write(field: JobField, value: &FieldValue) -> Result<(), StoreError> {
    if !field.is_settable() {
        return Err(StoreError::InvalidField(format!(
            "{} is not settable",
            field.as_str()
        )));
    }
    field.check(value)
}

/// Validate a transition request before touching storage: the edge must
/// exist and no update may write `status`.
pub fn validate_transition(
    expect: &Expect,
    new: JobStatus,
    updates: &[FieldUpdate],
) -> Result<(), StoreError> {
    if !expect.status.can_transition_to(new) {
        return Err(StoreError::IllegalTransition {
            from: expect.status,
            to: new,
        });
    }
    for update in updates {
        if update.field == JobField::Status {
            return Err(StoreError::InvalidField(
                "status is set by the transition itself".to_string(),
            ));
        }
        update.field.check(&update.value)?;
    }
    Ok(())
}

/// Compute the post-transition record for a job whose guard was checked
/// under the adapter's lock/transaction.
pub fn transitioned(
    current: &Job,
    expect: &Expect,
    new: JobStatus,
    updates: &[FieldUpdate],
) -> Result<Job, StoreError> {
    if !expect.holds_for(current) {
        return Err(StoreError::Conflict {
            id: current.id,
            actual: current.status,
        });
    }
    let mut next = current.clone();
    for update in updates {
        next.apply(update.field, update.value.clone())?;
    }
    next.status = new;
    Ok(next)
}
