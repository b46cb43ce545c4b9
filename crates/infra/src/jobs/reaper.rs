//! Recovery of jobs whose worker died mid-execution.

use std::time::Duration;

use tracing::{debug, warn};

use jobforge_core::{JobStatus, StoreError};

use super::job::FieldUpdate;
use super::store::{Expect, JobStore};

/// Returns stale Executing jobs to the queue.
///
/// A job counts as stale once its claim is older than `stale_timeout`. The
/// retry budget is left untouched: the execution never reported an outcome.
/// Each job is moved with a claim-guarded compare-and-set, so a worker that
/// finishes concurrently either wins (and the sweep skips the job) or loses
/// its completion.
pub struct Reaper<S: JobStore> {
    store: S,
    stale_timeout: Duration,
}

impl<S: JobStore> Reaper<S> {
    pub fn new(store: S, stale_timeout: Duration) -> Self {
        Self {
            store,
            stale_timeout,
        }
    }

    /// Requeue every job claimed before `now - stale_timeout`. Returns the
    /// number of jobs requeued.
    pub fn sweep(&self, now: i64) -> Result<usize, StoreError> {
        let timeout = i64::try_from(self.stale_timeout.as_nanos()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(timeout);

        let mut reaped = 0;
        for job in self.store.list_jobs(JobStatus::Executing, usize::MAX)? {
            let claimed_at = job.started.unwrap_or(i64::MIN);
            if claimed_at > cutoff {
                continue;
            }
            let expect = match job.claim() {
                Some(claim) => Expect::claimed(claim),
                None => Expect::status(JobStatus::Executing),
            };
            let updates = [FieldUpdate::claim(None), FieldUpdate::started(None)];
            match self
                .store
                .compare_and_set_status(job.id(), expect, JobStatus::Queued, &updates)
            {
                Ok(_) => {
                    warn!(job_id = %job.id(), job_type = %job.type_name(), "requeued stale job");
                    reaped += 1;
                }
                Err(err) if err.is_lost_race() => {
                    debug!(job_id = %job.id(), "stale job settled before reaping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(reaped)
    }
}
