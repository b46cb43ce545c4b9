//! Claim-and-execute engine: one step of a worker loop.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use jobforge_core::{
    ClaimId, Codec, FailureOutcome, JobId, JobStatus, JobType, JobTypeRegistry, StoreError,
};

use super::job::{FieldUpdate, Job, now_nanos};
use super::store::{Expect, JobStore};

/// Recorded on jobs whose type is not registered in the executing process.
pub const UNKNOWN_JOB_TYPE: &str = "unknown job type";

/// Eligibility queries per claim attempt.
const CLAIM_ROUNDS: usize = 2;

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// Executing -> Finished.
    Finished,
    /// Recurring job re-armed Executing -> Queued at `next_time`.
    Rearmed { next_time: i64 },
    /// Failed with budget left: Executing -> Queued.
    Retried { retries_left: u32 },
    /// Failed with the budget exhausted (or an unknown type): Executing -> Failed.
    Failed,
    /// The claim was taken over before completion was recorded.
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub job_id: JobId,
    pub job_type: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub error: Option<String>,
}

/// Claims eligible jobs and runs their handlers.
///
/// Holds no job state between calls; every decision is made against the
/// store.
pub struct Executor<S: JobStore> {
    store: S,
    registry: Arc<JobTypeRegistry>,
    codec: Arc<dyn Codec>,
    batch_size: usize,
}

impl<S: JobStore> Executor<S> {
    pub fn new(store: S, registry: Arc<JobTypeRegistry>, codec: Arc<dyn Codec>) -> Self {
        Self {
            store,
            registry,
            codec,
            batch_size: 16,
        }
    }

    /// Candidates fetched per claim attempt.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Claim the highest-ranked eligible job, if any.
    ///
    /// Candidates that another worker claimed first, or whose record has
    /// vanished, are skipped; vanished ones are pruned from the index. A full
    /// batch lost entirely to other workers is fetched again, since more
    /// eligible jobs may sit behind it.
    pub fn claim_next(&self, now: i64) -> Result<Option<Job>, StoreError> {
        for round in 1..=CLAIM_ROUNDS {
            let ids = self.store.query_eligible(now, self.batch_size)?;
            let full = ids.len() == self.batch_size;
            let mut all_lost = true;
            for id in ids {
                let claim = ClaimId::new();
                let updates = [
                    FieldUpdate::claim(Some(claim)),
                    FieldUpdate::started(Some(now)),
                ];
                match self.store.compare_and_set_status(
                    id,
                    Expect::status(JobStatus::Queued),
                    JobStatus::Executing,
                    &updates,
                ) {
                    Ok(job) if job.time() > now => {
                        // Rescheduled between query and claim.
                        all_lost = false;
                        self.release(&job, claim)?;
                    }
                    Ok(job) => {
                        debug!(job_id = %id, job_type = %job.type_name(), "claimed job");
                        return Ok(Some(job));
                    }
                    Err(StoreError::NotFound(_)) => {
                        all_lost = false;
                        debug!(job_id = %id, "pruning orphaned index entry");
                        if let Err(err) = self.store.delete_from_index(id) {
                            warn!(job_id = %id, error = %err, "failed to prune index entry");
                        }
                    }
                    Err(StoreError::Conflict { .. }) => {}
                    Err(err) => {
                        all_lost = false;
                        warn!(job_id = %id, error = %err, "claim failed, trying next candidate");
                    }
                }
            }
            if !(full && all_lost) {
                break;
            }
            debug!(round, "whole batch claimed elsewhere, querying again");
        }
        Ok(None)
    }

    fn release(&self, job: &Job, claim: ClaimId) -> Result<(), StoreError> {
        let updates = [FieldUpdate::claim(None), FieldUpdate::started(None)];
        match self
            .store
            .compare_and_set_status(job.id(), Expect::claimed(claim), JobStatus::Queued, &updates)
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_lost_race() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Run a claimed job's handler and record the outcome.
    pub fn execute(&self, job: &Job) -> Result<ExecutionReport, StoreError> {
        let claim = match (job.status(), job.claim()) {
            (JobStatus::Executing, Some(claim)) => claim,
            (actual, _) => return Err(StoreError::Conflict { id: job.id(), actual }),
        };

        let Some(job_type) = self.registry.get(job.type_name()) else {
            warn!(job_id = %job.id(), job_type = %job.type_name(), "unknown job type");
            let updates = [
                FieldUpdate::last_error(Some(UNKNOWN_JOB_TYPE.to_string())),
                FieldUpdate::claim(None),
                FieldUpdate::finished(Some(now_nanos())),
            ];
            let outcome = self.complete(job, claim, JobStatus::Failed, &updates, Outcome::Failed)?;
            return Ok(report(job, outcome, Some(UNKNOWN_JOB_TYPE.to_string())));
        };

        match self.run_handler(&job_type, job) {
            Ok(()) => {
                let outcome = self.succeed(job, claim, &job_type)?;
                debug!(job_id = %job.id(), job_type = %job.type_name(), ?outcome, "job completed");
                Ok(report(job, outcome, None))
            }
            Err(error) => {
                warn!(
                    job_id = %job.id(),
                    job_type = %job.type_name(),
                    retries_left = job.retries_left(),
                    error = %error,
                    "job execution failed"
                );
                let outcome = self.fail(job, claim, &error)?;
                Ok(report(job, outcome, Some(error)))
            }
        }
    }

    /// Claim and execute one job. `None` when nothing is eligible.
    pub fn run_next(&self) -> Result<Option<ExecutionReport>, StoreError> {
        match self.claim_next(now_nanos())? {
            Some(job) => self.execute(&job).map(Some),
            None => Ok(None),
        }
    }

    fn run_handler(&self, job_type: &JobType, job: &Job) -> Result<(), String> {
        let payload = self.codec.decode(job.data()).map_err(|e| e.to_string())?;
        match panic::catch_unwind(AssertUnwindSafe(|| job_type.invoke(payload))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(panic) => Err(format!("handler panicked: {}", panic_message(&*panic))),
        }
    }

    fn succeed(&self, job: &Job, claim: ClaimId, job_type: &JobType) -> Result<Outcome, StoreError> {
        let now = now_nanos();
        if job.is_recurring() {
            let next_time = next_occurrence(job.time(), job.freq(), now);
            let updates = [
                FieldUpdate::time(next_time),
                FieldUpdate::retries_left(job_type.retries()),
                FieldUpdate::last_error(None),
                FieldUpdate::claim(None),
                FieldUpdate::started(None),
                FieldUpdate::finished(Some(now)),
            ];
            return self.complete(job, claim, JobStatus::Queued, &updates, Outcome::Rearmed { next_time });
        }
        let updates = [FieldUpdate::claim(None), FieldUpdate::finished(Some(now))];
        self.complete(job, claim, JobStatus::Finished, &updates, Outcome::Finished)
    }

    fn fail(&self, job: &Job, claim: ClaimId, error: &str) -> Result<Outcome, StoreError> {
        let last_error = FieldUpdate::last_error(Some(error.to_string()));
        match FailureOutcome::for_retries_left(job.retries_left()) {
            FailureOutcome::Retry { retries_left } => {
                let updates = [
                    FieldUpdate::retries_left(retries_left),
                    last_error,
                    FieldUpdate::claim(None),
                    FieldUpdate::started(None),
                ];
                self.complete(job, claim, JobStatus::Queued, &updates, Outcome::Retried { retries_left })
            }
            FailureOutcome::Exhausted => {
                let updates = [
                    last_error,
                    FieldUpdate::claim(None),
                    FieldUpdate::finished(Some(now_nanos())),
                ];
                self.complete(job, claim, JobStatus::Failed, &updates, Outcome::Failed)
            }
        }
    }

    fn complete(
        &self,
        job: &Job,
        claim: ClaimId,
        new: JobStatus,
        updates: &[FieldUpdate],
        outcome: Outcome,
    ) -> Result<Outcome, StoreError> {
        match self
            .store
            .compare_and_set_status(job.id(), Expect::claimed(claim), new, updates)
        {
            Ok(_) => Ok(outcome),
            Err(err) if err.is_lost_race() => {
                warn!(job_id = %job.id(), error = %err, "claim lost before completion");
                Ok(Outcome::Lost)
            }
            Err(err) => Err(err),
        }
    }
}

fn report(job: &Job, outcome: Outcome, error: Option<String>) -> ExecutionReport {
    ExecutionReport {
        job_id: job.id(),
        job_type: job.type_name().to_string(),
        outcome,
        error,
    }
}

/// First occurrence of `time + k * freq` (k >= 1) strictly after `now`.
pub fn next_occurrence(time: i64, freq: i64, now: i64) -> i64 {
    let (time, freq, now) = (i128::from(time), i128::from(freq.max(1)), i128::from(now));
    let steps = if now < time { 1 } else { (now - time) / freq + 1 };
    i64::try_from(time + steps * freq).unwrap_or(i64::MAX)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
