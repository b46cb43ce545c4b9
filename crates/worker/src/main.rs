//! Worker process: builds a store from the environment, registers the demo
//! job types and runs a pool until Ctrl-C.

use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use jobforge_core::{Handler, Payload, register_job_type, registry};
use jobforge_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore, Scheduler, WorkerPool};
use jobforge_infra::{Settings, StoreBackend};

fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;
    tracing::info!(
        store = settings.store.kind(),
        workers = settings.workers,
        pool = %settings.pool_name,
        "starting worker"
    );

    register_demo_types()?;
    let seed = std::env::var("JOBFORGE_SEED_DEMO").is_ok_and(|v| v == "1" || v == "true");

    match &settings.store {
        StoreBackend::Memory => run(InMemoryJobStore::arc(), &settings, seed),
        StoreBackend::Postgres {
            url,
            max_connections,
        } => {
            let store = PostgresJobStore::connect(url, *max_connections)
                .context("failed to connect to Postgres")?;
            store.migrate().context("failed to apply job schema")?;
            run(store, &settings, seed)
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis { url, prefix } => {
            let store = jobforge_infra::jobs::RedisJobStore::new(url, Some(prefix.clone()))
                .context("failed to create Redis client")?;
            run(store, &settings, seed)
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis { .. } => {
            anyhow::bail!("JOBFORGE_STORE=redis requires building with the `redis` feature")
        }
    }
}

fn register_demo_types() -> anyhow::Result<()> {
    register_job_type(
        "log_message",
        3,
        Handler::typed(|message: String| {
            tracing::info!(%message, "log_message job");
            Ok(())
        }),
    )?;
    register_job_type("noop", 0, Handler::new(|| Ok(())))?;
    Ok(())
}

fn seed_demo_jobs<S: JobStore>(store: S) -> anyhow::Result<()> {
    let scheduler = Scheduler::new(store);
    let now = Utc::now();
    scheduler.schedule_by_name("log_message", 10, now, Payload::from("hello from jobforge"))?;
    scheduler.schedule_by_name("noop", 0, now, Payload::Null)?;

    let heartbeat = registry::job_type("log_message").context("log_message not registered")?;
    scheduler.schedule_recurring(
        &heartbeat,
        0,
        now,
        Duration::from_secs(30),
        Payload::from("heartbeat"),
    )?;
    tracing::info!("seeded demo jobs");
    Ok(())
}

fn run<S>(store: S, settings: &Settings, seed: bool) -> anyhow::Result<()>
where
    S: JobStore + Clone + 'static,
{
    if seed {
        seed_demo_jobs(store.clone())?;
    }
    match store.stats() {
        Ok(stats) => tracing::info!(queued = stats.queued, executing = stats.executing, "queue state"),
        Err(err) => tracing::warn!(error = %err, "failed to read queue stats"),
    }

    let handle = WorkerPool::new(store)
        .with_config(settings.pool_config())
        .start(settings.workers)
        .context("failed to start worker pool")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")?;

    tracing::info!("shutdown requested; waiting for in-flight jobs");
    let stats = handle.stats();
    handle.stop();
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        retried = stats.jobs_retried,
        lost = stats.jobs_lost,
        reaped = stats.jobs_reaped,
        uptime_secs = stats.uptime_secs,
        "worker stopped"
    );
    Ok(())
}
