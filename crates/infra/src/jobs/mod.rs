//! Persistent background jobs.
//!
//! ## Design
//!
//! - The store is the only queue: workers rank eligible jobs by querying it
//!   and claim one with an atomic compare-and-set on its status
//! - A job runs at most once at a time; a crashed execution is recovered by
//!   the reaper and run again (at-least-once)
//! - Handler failures and panics are recorded on the job and drive retries
//!
//! ## Components
//!
//! - `Job`: persisted unit of work and its field model
//! - `JobStore`: storage boundary (in-memory, Redis, Postgres)
//! - `Scheduler`: creates, finds, cancels, reschedules and destroys jobs
//! - `Executor`: claims one job and records the outcome of running it
//! - `WorkerPool`: worker threads running the executor in a loop
//! - `Reaper`: requeues jobs whose claim went stale

pub mod executor;
pub mod in_memory;
pub mod job;
pub mod pool;
pub mod postgres;
pub mod reaper;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;

pub use executor::{ExecutionReport, Executor, Outcome};
pub use in_memory::InMemoryJobStore;
pub use job::{FieldUpdate, FieldValue, Job, JobField, now_nanos, to_nanos};
pub use pool::{ExecutorStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use postgres::PostgresJobStore;
pub use reaper::Reaper;
#[cfg(feature = "redis")]
pub use redis_store::RedisJobStore;
pub use scheduler::Scheduler;
pub use store::{Expect, JobStats, JobStore};
