//! Worker pool: concurrent execution loops over one shared store.

use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

use jobforge_core::{Codec, JobTypeRegistry, JsonCodec, registry};

use super::executor::{Executor, Outcome};
use super::job::now_nanos;
use super::reaper::Reaper;
use super::store::JobStore;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Name for logging and thread names
    pub name: String,
    /// Idle backoff when no job is eligible
    pub poll_interval: Duration,
    /// Candidates fetched per claim attempt
    pub batch_size: usize,
    /// Claims older than this are requeued; `None` disables the reaper
    pub stale_timeout: Option<Duration>,
    /// How often the reaper sweeps
    pub reaper_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "jobforge".to_string(),
            poll_interval: Duration::from_millis(200),
            batch_size: 16,
            stale_timeout: None,
            reaper_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = Some(timeout);
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub jobs_lost: u64,
    pub jobs_reaped: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: &Outcome) {
        self.jobs_processed += 1;
        match outcome {
            Outcome::Finished | Outcome::Rearmed { .. } => self.jobs_succeeded += 1,
            Outcome::Retried { .. } => self.jobs_retried += 1,
            Outcome::Failed => self.jobs_failed += 1,
            Outcome::Lost => self.jobs_lost += 1,
        }
    }
}

/// Stop flag that also wakes idle waiters.
#[derive(Debug, Default)]
struct Shutdown {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Shutdown {
    fn signal(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`; true if shutdown was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = self
            .wake
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }
}

/// Background worker pool.
///
/// Each worker is an OS thread that repeatedly claims the highest-ranked
/// eligible job from the store and executes it. Workers share nothing but
/// the store, the registry and the stats counters.
pub struct WorkerPool<S: JobStore> {
    store: S,
    registry: Arc<JobTypeRegistry>,
    codec: Arc<dyn Codec>,
    config: WorkerPoolConfig,
}

impl<S> WorkerPool<S>
where
    S: JobStore + Clone + 'static,
{
    /// Pool over `store` using the process-wide registry and the JSON codec.
    pub fn new(store: S) -> Self {
        Self {
            store,
            registry: registry::global(),
            codec: Arc::new(JsonCodec),
            config: WorkerPoolConfig::default(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<JobTypeRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_config(mut self, config: WorkerPoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn `concurrency` workers (at least one), plus a reaper thread when
    /// a stale timeout is configured.
    pub fn start(self, concurrency: usize) -> io::Result<WorkerPoolHandle> {
        let concurrency = concurrency.max(1);
        let config = self.config;
        let executor = Arc::new(
            Executor::new(self.store.clone(), self.registry, self.codec)
                .with_batch_size(config.batch_size),
        );

        let mut handle = WorkerPoolHandle {
            name: config.name.clone(),
            shutdown: Arc::new(Shutdown::default()),
            threads: Vec::with_capacity(concurrency + 1),
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
            started: Instant::now(),
        };

        for index in 0..concurrency {
            let worker = format!("{}-{index}", config.name);
            let executor = executor.clone();
            let shutdown = handle.shutdown.clone();
            let stats = handle.stats.clone();
            let poll_interval = config.poll_interval;
            // On spawn failure the partially built handle is dropped, which
            // stops and joins the workers already running.
            let join = thread::Builder::new().name(worker.clone()).spawn(move || {
                worker_loop(&worker, &executor, &shutdown, &stats, poll_interval);
            })?;
            handle.threads.push(join);
        }

        if let Some(stale_timeout) = config.stale_timeout {
            let name = format!("{}-reaper", config.name);
            let reaper = Reaper::new(self.store, stale_timeout);
            let shutdown = handle.shutdown.clone();
            let stats = handle.stats.clone();
            let interval = config.reaper_interval;
            let join = thread::Builder::new().name(name.clone()).spawn(move || {
                reaper_loop(&name, &reaper, &shutdown, &stats, interval);
            })?;
            handle.threads.push(join);
        }

        info!(pool = %config.name, concurrency, "worker pool started");
        Ok(handle)
    }
}

/// Handle to control a running pool. Dropping it stops the pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    name: String,
    shutdown: Arc<Shutdown>,
    threads: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Graceful shutdown: no new claims; in-flight handlers run to
    /// completion before this returns.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    /// Current pool statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    fn stop_and_join(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.shutdown.signal();
        for join in self.threads.drain(..) {
            if join.join().is_err() {
                error!(pool = %self.name, "pool thread panicked");
            }
        }
        info!(pool = %self.name, "worker pool stopped");
    }
}

impl Drop for WorkerPoolHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn worker_loop<S: JobStore>(
    worker: &str,
    executor: &Executor<S>,
    shutdown: &Shutdown,
    stats: &Mutex<ExecutorStats>,
    poll_interval: Duration,
) {
    debug!(worker, "worker started");

    while !shutdown.is_set() {
        match executor.claim_next(now_nanos()) {
            Ok(Some(job)) => {
                stats.lock().unwrap_or_else(PoisonError::into_inner).current_running += 1;

                let result = executor.execute(&job);

                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.current_running = s.current_running.saturating_sub(1);
                match result {
                    Ok(report) => s.record(&report.outcome),
                    Err(err) => {
                        s.jobs_processed += 1;
                        error!(worker, job_id = %job.id(), error = %err, "failed to record job outcome");
                    }
                }
            }
            Ok(None) => {
                if shutdown.wait(poll_interval) {
                    break;
                }
            }
            Err(err) => {
                error!(worker, error = %err, "failed to claim job");
                if shutdown.wait(poll_interval) {
                    break;
                }
            }
        }
    }

    debug!(worker, "worker stopped");
}

fn reaper_loop<S: JobStore>(
    name: &str,
    reaper: &Reaper<S>,
    shutdown: &Shutdown,
    stats: &Mutex<ExecutorStats>,
    interval: Duration,
) {
    while !shutdown.wait(interval) {
        match reaper.sweep(now_nanos()) {
            Ok(0) => {}
            Ok(reaped) => {
                info!(reaper = name, reaped, "requeued stale jobs");
                stats.lock().unwrap_or_else(PoisonError::into_inner).jobs_reaped += reaped as u64;
            }
            Err(err) => error!(reaper = name, error = %err, "stale job sweep failed"),
        }
    }
}
