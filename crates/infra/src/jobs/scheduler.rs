//! Client-side job API: schedule, find, cancel, reschedule, destroy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use jobforge_core::registry;
use jobforge_core::{
    Codec, JobError, JobId, JobStatus, JobType, JobTypeRegistry, JsonCodec, Payload, StoreError,
};

use super::job::{FieldValue, Job, JobField, to_nanos};
use super::store::{Expect, JobStore};

/// Creates and manages jobs in a store.
pub struct Scheduler<S: JobStore> {
    store: S,
    codec: Arc<dyn Codec>,
    registry: Arc<JobTypeRegistry>,
}

impl<S: JobStore> Scheduler<S> {
    /// Scheduler over `store` using the process-wide registry and the JSON codec.
    pub fn new(store: S) -> Self {
        Self {
            store,
            codec: Arc::new(JsonCodec),
            registry: registry::global(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_registry(mut self, registry: Arc<JobTypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Schedule a one-shot job.
    ///
    /// The payload is checked against the type's declared parameter before
    /// anything is written. On success the job is persisted Queued with the
    /// type's full retry budget.
    pub fn schedule(
        &self,
        job_type: &JobType,
        priority: i64,
        time: DateTime<Utc>,
        data: Payload,
    ) -> Result<Job, JobError> {
        self.create(job_type, priority, time, 0, data)
    }

    /// Schedule a job that re-arms itself every `freq` after each success.
    pub fn schedule_recurring(
        &self,
        job_type: &JobType,
        priority: i64,
        time: DateTime<Utc>,
        freq: Duration,
        data: Payload,
    ) -> Result<Job, JobError> {
        let freq = i64::try_from(freq.as_nanos())
            .map_err(|_| JobError::invalid_schedule("recurrence interval is too large"))?;
        if freq == 0 {
            return Err(JobError::invalid_schedule(
                "recurrence interval must be positive",
            ));
        }
        self.create(job_type, priority, time, freq, data)
    }

    /// Schedule by registered type name.
    pub fn schedule_by_name(
        &self,
        type_name: &str,
        priority: i64,
        time: DateTime<Utc>,
        data: Payload,
    ) -> Result<Job, JobError> {
        let job_type = self
            .registry
            .get(type_name)
            .ok_or_else(|| JobError::type_not_found(type_name))?;
        self.schedule(&job_type, priority, time, data)
    }

    fn create(
        &self,
        job_type: &JobType,
        priority: i64,
        time: DateTime<Utc>,
        freq: i64,
        data: Payload,
    ) -> Result<Job, JobError> {
        job_type.validate_payload(&data)?;
        let time = to_nanos(time)?;
        let bytes = self.codec.encode(&data)?;

        let job = Job::new(job_type, priority, time, freq, bytes);
        self.store.create_job(&job)?;

        debug!(
            job_id = %job.id(),
            job_type = %job.type_name(),
            priority,
            time,
            freq,
            "scheduled job"
        );
        Ok(job)
    }

    /// Current persisted state of a job.
    pub fn find(&self, id: JobId) -> Result<Job, JobError> {
        Ok(self.store.get_job(id)?)
    }

    /// Cancel a Queued job.
    pub fn cancel(&self, id: JobId) -> Result<Job, JobError> {
        let job = self
            .store
            .compare_and_set_status(
                id,
                Expect::status(JobStatus::Queued),
                JobStatus::Cancelled,
                &[],
            )
            .map_err(|err| lost_race_as_transition(err, JobStatus::Cancelled))?;
        debug!(job_id = %id, "cancelled job");
        Ok(job)
    }

    /// Move a Queued job to a new scheduled time, re-ranking it.
    ///
    /// The status check and the write are one store step; a job claimed
    /// first fails with `InvalidTransition`.
    pub fn reschedule(&self, id: JobId, time: DateTime<Utc>) -> Result<Job, JobError> {
        let time = to_nanos(time)?;
        let job = self
            .store
            .set_field_if(id, JobStatus::Queued, JobField::Time, FieldValue::Int(time))
            .map_err(|err| lost_race_as_transition(err, JobStatus::Queued))?;
        debug!(job_id = %id, time, "rescheduled job");
        Ok(job)
    }

    /// Delete a job that is not executing.
    pub fn destroy(&self, id: JobId) -> Result<(), JobError> {
        match self.store.delete_job_unless(id, JobStatus::Executing) {
            Ok(()) => {
                debug!(job_id = %id, "destroyed job");
                Ok(())
            }
            Err(StoreError::Conflict { .. }) => Err(JobError::StillExecuting(id)),
            Err(err) => Err(err.into()),
        }
    }
}

fn lost_race_as_transition(err: StoreError, to: JobStatus) -> JobError {
    match err {
        StoreError::Conflict { actual, .. } => JobError::InvalidTransition { from: actual, to },
        other => other.into(),
    }
}
