//! Job type registry.
//!
//! A process-wide registry (see [`global`]) is initialized empty on first
//! use and lives until process exit. Registration is rare and takes the
//! write lock; lookups from schedulers and workers share the read lock.
//! Independent registries can be built with [`JobTypeRegistry::new`] for
//! isolated pools and tests.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::debug;

use crate::error::JobError;
use crate::job_type::{Handler, JobType};

#[derive(Debug, Default)]
pub struct JobTypeRegistry {
    types: RwLock<HashMap<String, Arc<JobType>>>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job type.
    ///
    /// Fails with `NameAlreadyRegistered` for a duplicate name and with
    /// `InvalidHandler` for a body-less or multi-parameter handler; in both
    /// cases the registry is unchanged.
    pub fn register(
        &self,
        name: impl Into<String>,
        retries: u32,
        handler: Handler,
    ) -> Result<Arc<JobType>, JobError> {
        let name = name.into();
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        if types.contains_key(&name) {
            return Err(JobError::NameAlreadyRegistered(name));
        }

        let job_type = Arc::new(JobType::new(name.clone(), retries, handler)?);
        types.insert(name, job_type.clone());

        debug!(
            job_type = %job_type.name(),
            retries,
            arity = job_type.handler_arity(),
            "registered job type"
        );
        Ok(job_type)
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobType>> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.types.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Drop every registration. Test isolation only.
    pub fn reset(&self) {
        self.types.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

static GLOBAL: OnceLock<Arc<JobTypeRegistry>> = OnceLock::new();

/// The process-wide registry.
pub fn global() -> Arc<JobTypeRegistry> {
    GLOBAL.get_or_init(|| Arc::new(JobTypeRegistry::new())).clone()
}

/// Register a job type in the process-wide registry.
pub fn register_job_type(
    name: impl Into<String>,
    retries: u32,
    handler: Handler,
) -> Result<Arc<JobType>, JobError> {
    global().register(name, retries, handler)
}

/// Look up a job type in the process-wide registry.
pub fn job_type(name: &str) -> Option<Arc<JobType>> {
    global().get(name)
}
