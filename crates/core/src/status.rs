//! Job status state machine.
//!
//! ```text
//!            claim                 ok
//!  Queued ───────────▶ Executing ───────▶ Finished
//!    │  ▲                 │  │
//!    │  └── retry/recur ──┘  └─ fail, no retries left ─▶ Failed
//!    │      /reap
//!    └─ cancel ─▶ Cancelled
//! ```
//!
//! Finished, Failed and Cancelled are terminal. Store adapters enforce the
//! table below with a compare-and-set on the current status; this module is
//! the single definition of which edges exist.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::JobError;

/// Persisted job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the pending index.
    Queued,
    /// Claimed by exactly one worker.
    Executing,
    /// Handler returned successfully.
    Finished,
    /// Handler failed with no retries left, or the job type is unknown.
    Failed,
    /// Cancelled before it was claimed.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Executing,
        JobStatus::Finished,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Executing => "executing",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Executing)
                | (Queued, Cancelled)
                | (Executing, Finished)
                | (Executing, Queued)
                | (Executing, Failed)
        )
    }

    /// Validate `self -> to`, returning the target status.
    pub fn transition_to(self, to: JobStatus) -> Result<JobStatus, JobError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(JobError::InvalidTransition { from: self, to })
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// What a failed execution does to a job.
///
/// `retries` on a job type counts re-executions after the first failure, so
/// a type registered with `retries = n` runs at most `n + 1` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to Queued with the decremented budget.
    Retry { retries_left: u32 },
    /// Budget exhausted: Failed.
    Exhausted,
}

impl FailureOutcome {
    pub fn for_retries_left(retries_left: u32) -> Self {
        match retries_left.checked_sub(1) {
            Some(left) => FailureOutcome::Retry { retries_left: left },
            None => FailureOutcome::Exhausted,
        }
    }

    pub fn next_status(&self) -> JobStatus {
        match self {
            FailureOutcome::Retry { .. } => JobStatus::Queued,
            FailureOutcome::Exhausted => JobStatus::Failed,
        }
    }
}
