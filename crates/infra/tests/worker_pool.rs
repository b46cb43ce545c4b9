use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use jobforge_core::{Handler, JobId, JobStatus, JobTypeRegistry, Payload};
use jobforge_infra::jobs::{InMemoryJobStore, JobStore, Scheduler, WorkerPool, WorkerPoolConfig};

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn fast_config() -> WorkerPoolConfig {
    WorkerPoolConfig::default()
        .with_name("test-pool")
        .with_poll_interval(Duration::from_millis(5))
        .with_batch_size(4)
}

#[test]
fn every_job_runs_exactly_once_under_contention() -> anyhow::Result<()> {
    let store = InMemoryJobStore::arc();
    let registry = Arc::new(JobTypeRegistry::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let jt = registry.register(
        "record",
        0,
        Handler::typed(move |n: u64| {
            sink.lock().unwrap().push(n);
            Ok(())
        }),
    )?;

    let scheduler = Scheduler::new(store.clone()).with_registry(registry.clone());
    for n in 0..200u64 {
        scheduler.schedule(&jt, (n % 5) as i64, Utc::now(), Payload::from(n))?;
    }

    let handle = WorkerPool::new(store.clone())
        .with_registry(registry)
        .with_config(fast_config())
        .start(8)?;
    assert!(wait_until(Duration::from_secs(10), || {
        store.stats().map(|s| s.finished == 200).unwrap_or(false)
    }));
    handle.stop();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 200);
    let unique: HashSet<u64> = seen.iter().copied().collect();
    assert_eq!(unique.len(), 200);
    assert_eq!(store.pending_len()?, 0);
    Ok(())
}

#[test]
fn concurrent_scheduling_assigns_unique_ids() {
    let store = InMemoryJobStore::arc();
    let registry = Arc::new(JobTypeRegistry::new());
    let jt = registry
        .register("noop", 0, Handler::new(|| Ok(())))
        .unwrap();
    let scheduler = Arc::new(Scheduler::new(store.clone()).with_registry(registry));

    let producers: Vec<_> = (0..8)
        .map(|_| {
            let scheduler = scheduler.clone();
            let jt = jt.clone();
            thread::spawn(move || {
                (0..50)
                    .map(|_| {
                        scheduler
                            .schedule(&jt, 0, Utc::now(), Payload::Null)
                            .unwrap()
                            .id()
                    })
                    .collect::<Vec<JobId>>()
            })
        })
        .collect();

    let ids: HashSet<JobId> = producers
        .into_iter()
        .flat_map(|p| p.join().unwrap())
        .collect();
    assert_eq!(ids.len(), 400);
    assert_eq!(store.stats().unwrap().queued, 400);
}

#[test]
fn failing_job_exhausts_retries_then_fails() {
    let store = InMemoryJobStore::arc();
    let registry = Arc::new(JobTypeRegistry::new());
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let jt = registry
        .register(
            "flaky",
            2,
            Handler::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("downstream unavailable")
            }),
        )
        .unwrap();
    let job = Scheduler::new(store.clone())
        .with_registry(registry.clone())
        .schedule(&jt, 0, Utc::now(), Payload::Null)
        .unwrap();

    let handle = WorkerPool::new(store.clone())
        .with_registry(registry)
        .with_config(fast_config())
        .start(2)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        store.get_job(job.id()).unwrap().status() == JobStatus::Failed
    }));
    let stats = handle.stats();
    handle.stop();

    let failed = store.get_job(job.id()).unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(failed.retries_left(), 0);
    assert_eq!(failed.last_error(), Some("downstream unavailable"));
    assert!(failed.finished().is_some());
    assert_eq!(stats.jobs_retried, 2);
    assert_eq!(stats.jobs_failed, 1);
}

#[test]
fn single_worker_runs_by_priority_then_time() {
    let store = InMemoryJobStore::arc();
    let registry = Arc::new(JobTypeRegistry::new());
    let order = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    let jt = registry
        .register(
            "ordered",
            0,
            Handler::typed(move |label: String| {
                sink.lock().unwrap().push(label);
                Ok(())
            }),
        )
        .unwrap();

    let scheduler = Scheduler::new(store.clone()).with_registry(registry.clone());
    let base = Utc::now() - chrono::Duration::seconds(60);
    for (label, priority, offset) in [("low", 1, 0), ("high-late", 9, 20), ("high-early", 9, 10), ("mid", 5, 0)] {
        scheduler
            .schedule(
                &jt,
                priority,
                base + chrono::Duration::seconds(offset),
                Payload::from(label),
            )
            .unwrap();
    }

    let handle = WorkerPool::new(store.clone())
        .with_registry(registry)
        .with_config(fast_config())
        .start(1)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || order.lock().unwrap().len() == 4));
    handle.stop();

    assert_eq!(*order.lock().unwrap(), vec!["high-early", "high-late", "mid", "low"]);
}

#[test]
fn future_jobs_wait_and_recurring_jobs_rearm() {
    let store = InMemoryJobStore::arc();
    let registry = Arc::new(JobTypeRegistry::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let jt = registry
        .register(
            "tick",
            0,
            Handler::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

    let scheduler = Scheduler::new(store.clone()).with_registry(registry.clone());
    let later = scheduler
        .schedule(&jt, 0, Utc::now() + chrono::Duration::hours(1), Payload::Null)
        .unwrap();
    let recurring = scheduler
        .schedule_recurring(&jt, 0, Utc::now(), Duration::from_secs(3600), Payload::Null)
        .unwrap();

    let handle = WorkerPool::new(store.clone())
        .with_registry(registry)
        .with_config(fast_config())
        .start(2)
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) == 1));
    thread::sleep(Duration::from_millis(50));
    handle.stop();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_job(later.id()).unwrap().status(), JobStatus::Queued);

    let rearmed = store.get_job(recurring.id()).unwrap();
    assert_eq!(rearmed.status(), JobStatus::Queued);
    assert!(rearmed.time() > recurring.time());
    assert_eq!(rearmed.claim(), None);
}
