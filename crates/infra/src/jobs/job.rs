//! Persisted job entity and its field model.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use jobforge_core::{ClaimId, JobError, JobId, JobStatus, JobType, StoreError};

use super::store::JobStore;

/// Current time as UTC nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    to_nanos(Utc::now()).unwrap_or(i64::MAX)
}

/// Normalize a timestamp to UTC nanoseconds.
///
/// Times before the epoch or past the i64 nanosecond range (year 2262)
/// are rejected.
pub fn to_nanos(time: DateTime<Utc>) -> Result<i64, JobError> {
    let nanos = time
        .timestamp_nanos_opt()
        .ok_or_else(|| JobError::invalid_schedule(format!("{time} is out of range")))?;
    if nanos < 0 {
        return Err(JobError::invalid_schedule(format!(
            "{time} is before the Unix epoch"
        )));
    }
    Ok(nanos)
}

/// One persisted unit of work.
///
/// A `Job` value is a snapshot; the store is the source of truth. Use
/// [`Job::refresh`] to reload it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub(crate) id: JobId,
    pub(crate) type_name: String,
    pub(crate) priority: i64,
    pub(crate) time: i64,
    pub(crate) freq: i64,
    #[serde(skip)]
    pub(crate) data: Vec<u8>,
    pub(crate) status: JobStatus,
    pub(crate) retries_left: u32,
    pub(crate) last_error: Option<String>,
    pub(crate) claim: Option<ClaimId>,
    pub(crate) started: Option<i64>,
    pub(crate) finished: Option<i64>,
}

impl Job {
    /// Fresh Queued job for `job_type` with an unused id.
    pub fn new(job_type: &JobType, priority: i64, time: i64, freq: i64, data: Vec<u8>) -> Self {
        Self {
            id: JobId::new(),
            type_name: job_type.name().to_string(),
            priority,
            time,
            freq,
            data,
            status: JobStatus::Queued,
            retries_left: job_type.retries(),
            last_error: None,
            claim: None,
            started: None,
            finished: None,
        }
    }

    /// Rebuild a job from stored fields. `fields` must cover every required
    /// field (`type_name`, `priority`, `time`, `data`, `status`, `retries_left`).
    pub fn from_fields(
        id: JobId,
        fields: impl IntoIterator<Item = (JobField, FieldValue)>,
    ) -> Result<Self, StoreError> {
        let mut job = Self {
            id,
            type_name: String::new(),
            priority: 0,
            time: 0,
            freq: 0,
            data: Vec::new(),
            status: JobStatus::Queued,
            retries_left: 0,
            last_error: None,
            claim: None,
            started: None,
            finished: None,
        };
        let mut seen = Vec::new();
        for (field, value) in fields {
            job.apply(field, value)?;
            seen.push(field);
        }
        if let Some(missing) = JobField::REQUIRED.iter().find(|f| !seen.contains(f)) {
            return Err(StoreError::corrupt(format!(
                "job {id} is missing field '{}'",
                missing.as_str()
            )));
        }
        Ok(job)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Store identifier of the job's record.
    pub fn key(&self) -> String {
        format!("jobs:{}", self.id)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    /// Scheduled time, UTC nanoseconds.
    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn scheduled_time(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.time)
    }

    /// Recurrence interval in nanoseconds; 0 for one-shot jobs.
    pub fn freq(&self) -> i64 {
        self.freq
    }

    pub fn is_recurring(&self) -> bool {
        self.freq > 0
    }

    /// Encoded payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn claim(&self) -> Option<ClaimId> {
        self.claim
    }

    /// When the current (or last) execution was claimed.
    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.started.map(|ns| Utc.timestamp_nanos(ns))
    }

    pub fn finished(&self) -> Option<DateTime<Utc>> {
        self.finished.map(|ns| Utc.timestamp_nanos(ns))
    }

    /// Reload this snapshot from the store.
    pub fn refresh<S: JobStore + ?Sized>(&mut self, store: &S) -> Result<(), JobError> {
        *self = store.get_job(self.id)?;
        Ok(())
    }

    /// Read one field.
    pub fn get(&self, field: JobField) -> FieldValue {
        match field {
            JobField::TypeName => FieldValue::Text(self.type_name.clone()),
            JobField::Priority => FieldValue::Int(self.priority),
            JobField::Time => FieldValue::Int(self.time),
            JobField::Freq => FieldValue::Int(self.freq),
            JobField::Data => FieldValue::Bytes(self.data.clone()),
            JobField::Status => FieldValue::Text(self.status.as_str().to_string()),
            JobField::RetriesLeft => FieldValue::Int(i64::from(self.retries_left)),
            JobField::LastError => self
                .last_error
                .clone()
                .map_or(FieldValue::Null, FieldValue::Text),
            JobField::Claim => self
                .claim
                .map_or(FieldValue::Null, |c| FieldValue::Text(c.to_string())),
            JobField::Started => self.started.map_or(FieldValue::Null, FieldValue::Int),
            JobField::Finished => self.finished.map_or(FieldValue::Null, FieldValue::Int),
        }
    }

    /// Write one field after checking its type. Used by store adapters; does
    /// not consult the state machine.
    pub fn apply(&mut self, field: JobField, value: FieldValue) -> Result<(), StoreError> {
        field.check(&value)?;
        match (field, value) {
            (JobField::TypeName, FieldValue::Text(s)) => self.type_name = s,
            (JobField::Priority, FieldValue::Int(n)) => self.priority = n,
            (JobField::Time, FieldValue::Int(n)) => self.time = n,
            (JobField::Freq, FieldValue::Int(n)) => self.freq = n,
            (JobField::Data, FieldValue::Bytes(b)) => self.data = b,
            (JobField::Status, FieldValue::Text(s)) => {
                self.status = s.parse::<JobStatus>().map_err(|e| StoreError::corrupt(format!("{e}")))?
            }
            (JobField::RetriesLeft, FieldValue::Int(n)) => {
                self.retries_left = u32::try_from(n).map_err(|_| {
                    StoreError::InvalidField(format!("retries_left out of range: {n}"))
                })?
            }
            (JobField::LastError, FieldValue::Text(s)) => self.last_error = Some(s),
            (JobField::LastError, FieldValue::Null) => self.last_error = None,
            (JobField::Claim, FieldValue::Text(s)) => {
                self.claim = Some(s.parse::<ClaimId>().map_err(|e| StoreError::corrupt(format!("{e}")))?)
            }
            (JobField::Claim, FieldValue::Null) => self.claim = None,
            (JobField::Started, FieldValue::Int(n)) => self.started = Some(n),
            (JobField::Started, FieldValue::Null) => self.started = None,
            (JobField::Finished, FieldValue::Int(n)) => self.finished = Some(n),
            (JobField::Finished, FieldValue::Null) => self.finished = None,
            (field, value) => {
                return Err(StoreError::InvalidField(format!(
                    "{} cannot hold {value:?}",
                    field.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// Named fields of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobField {
    TypeName,
    Priority,
    Time,
    Freq,
    Data,
    Status,
    RetriesLeft,
    LastError,
    Claim,
    Started,
    Finished,
}

impl JobField {
    pub const ALL: [JobField; 11] = [
        JobField::TypeName,
        JobField::Priority,
        JobField::Time,
        JobField::Freq,
        JobField::Data,
        JobField::Status,
        JobField::RetriesLeft,
        JobField::LastError,
        JobField::Claim,
        JobField::Started,
        JobField::Finished,
    ];

    const REQUIRED: [JobField; 6] = [
        JobField::TypeName,
        JobField::Priority,
        JobField::Time,
        JobField::Data,
        JobField::Status,
        JobField::RetriesLeft,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobField::TypeName => "type_name",
            JobField::Priority => "priority",
            JobField::Time => "time",
            JobField::Freq => "freq",
            JobField::Data => "data",
            JobField::Status => "status",
            JobField::RetriesLeft => "retries_left",
            JobField::LastError => "last_error",
            JobField::Claim => "claim",
            JobField::Started => "started",
            JobField::Finished => "finished",
        }
    }

    pub fn parse(name: &str) -> Option<JobField> {
        JobField::ALL.into_iter().find(|f| f.as_str() == name)
    }

    /// Whether `set_field` may write this field. Status and claim change
    /// only through compare-and-set.
    pub fn is_settable(&self) -> bool {
        !matches!(self, JobField::Status | JobField::Claim)
    }

    /// Whether the field takes part in pending-index ranking.
    pub fn is_ranked(&self) -> bool {
        matches!(self, JobField::Priority | JobField::Time)
    }

    fn is_nullable(&self) -> bool {
        matches!(
            self,
            JobField::LastError | JobField::Claim | JobField::Started | JobField::Finished
        )
    }

    /// Type-check a value for this field.
    pub fn check(&self, value: &FieldValue) -> Result<(), StoreError> {
        let ok = match (self, value) {
            (f, FieldValue::Null) => f.is_nullable(),
            (JobField::Time | JobField::Freq | JobField::RetriesLeft, FieldValue::Int(n)) => *n >= 0,
            (JobField::Priority | JobField::Started | JobField::Finished, FieldValue::Int(_)) => true,
            (JobField::Data, FieldValue::Bytes(_)) => true,
            (
                JobField::TypeName | JobField::Status | JobField::LastError | JobField::Claim,
                FieldValue::Text(_),
            ) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::InvalidField(format!(
                "{} cannot hold {value:?}",
                self.as_str()
            )))
        }
    }
}

/// Value of a single job field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Null,
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// One field write carried by a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    pub field: JobField,
    pub value: FieldValue,
}

impl FieldUpdate {
    pub fn new(field: JobField, value: FieldValue) -> Self {
        Self { field, value }
    }

    pub fn time(nanos: i64) -> Self {
        Self::new(JobField::Time, FieldValue::Int(nanos))
    }

    pub fn retries_left(n: u32) -> Self {
        Self::new(JobField::RetriesLeft, FieldValue::Int(i64::from(n)))
    }

    pub fn last_error(error: Option<String>) -> Self {
        Self::new(
            JobField::LastError,
            error.map_or(FieldValue::Null, FieldValue::Text),
        )
    }

    pub fn claim(claim: Option<ClaimId>) -> Self {
        Self::new(
            JobField::Claim,
            claim.map_or(FieldValue::Null, |c| FieldValue::Text(c.to_string())),
        )
    }

    pub fn started(nanos: Option<i64>) -> Self {
        Self::new(JobField::Started, nanos.map_or(FieldValue::Null, FieldValue::Int))
    }

    pub fn finished(nanos: Option<i64>) -> Self {
        Self::new(JobField::Finished, nanos.map_or(FieldValue::Null, FieldValue::Int))
    }
}
