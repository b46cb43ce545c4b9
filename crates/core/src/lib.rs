//! `jobforge-core`: job scheduling building blocks.
//!
//! This crate contains the storage-agnostic pieces: identifiers, the error
//! taxonomy, payloads and their codec, the status state machine, job types
//! and the process-wide registry.

pub mod codec;
pub mod error;
pub mod id;
pub mod job_type;
pub mod payload;
pub mod registry;
pub mod status;

pub use codec::{Codec, JsonCodec};
pub use error::{CodecError, JobError, JobResult, StoreError};
pub use id::{ClaimId, JobId};
pub use job_type::{Handler, HandlerResult, JobType};
pub use payload::{JobPayload, Payload, PayloadKind};
pub use registry::{JobTypeRegistry, register_job_type};
pub use status::{FailureOutcome, JobStatus};
