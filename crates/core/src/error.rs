//! Error model shared by the registry, scheduler, store adapters and workers.

use thiserror::Error;

use crate::id::JobId;
use crate::payload::PayloadKind;
use crate::status::JobStatus;

/// Result type used by the scheduling API.
pub type JobResult<T> = Result<T, JobError>;

/// Caller-facing error.
///
/// Registry and scheduling validation errors are deterministic and
/// non-retryable: the caller has to fix the input. `Store` wraps the durable
/// layer's failure with its cause preserved.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// A job type with this name is already registered.
    #[error("job type already registered: {0}")]
    NameAlreadyRegistered(String),

    /// The handler descriptor is not invocable or has an unsupported arity.
    #[error("invalid handler: {0}")]
    InvalidHandler(String),

    /// Payload shape does not match the handler's declared parameter.
    #[error("invalid data for job type '{job_type}': expected {expected}, got {found}")]
    InvalidJobData {
        job_type: String,
        expected: PayloadKind,
        found: PayloadKind,
    },

    /// Scheduled time or recurrence interval cannot be represented.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Illegal status change (terminal source, or claim of a non-queued job).
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// The job is being executed and cannot be destroyed.
    #[error("job {0} is executing")]
    StillExecuting(JobId),

    /// Operation on a nonexistent job or job type.
    #[error("not found: {0}")]
    NotFound(String),

    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Store(StoreError),
}

impl JobError {
    pub fn invalid_handler(msg: impl Into<String>) -> Self {
        Self::InvalidHandler(msg.into())
    }

    pub fn invalid_schedule(msg: impl Into<String>) -> Self {
        Self::InvalidSchedule(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn job_not_found(id: JobId) -> Self {
        Self::NotFound(format!("job {id}"))
    }

    pub fn type_not_found(name: &str) -> Self {
        Self::NotFound(format!("job type {name}"))
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::job_not_found(id),
            StoreError::IllegalTransition { from, to } => Self::InvalidTransition { from, to },
            other => Self::Store(other),
        }
    }
}

/// Payload encode/decode failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),
}

/// Store adapter error.
///
/// `NotFound` and `Conflict` are the expected outcomes of racing workers;
/// the remaining variants describe the durable layer itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The compare-and-set guard did not hold.
    #[error("conflict on job {id}: current status is {actual}")]
    Conflict { id: JobId, actual: JobStatus },

    /// `expected -> new` is not an edge of the state machine.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: JobStatus, to: JobStatus },

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    /// The field cannot be written through `set_field`, or the value has the wrong type.
    #[error("invalid field update: {0}")]
    InvalidField(String),

    /// A persisted record could not be parsed back into a job.
    #[error("corrupt job record: {0}")]
    Corrupt(String),

    #[error("storage lock poisoned")]
    LockPoisoned,

    /// I/O or transaction failure in the backing engine.
    #[error("storage error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// True for outcomes a worker treats as "someone else got there first".
    pub fn is_lost_race(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::NotFound(_))
    }
}
