//! Tests using the Shuttle testing framework.

#![cfg(feature = "shuttle")]

use jobsteal::JobSystem;
use jobsteal::JobSystemConfig;
use shuttle::sync::Arc;
use shuttle::sync::atomic::AtomicU32;
use shuttle::sync::atomic::Ordering;

// -----------------------------------------------------------------------------
// Infrastructure

const ITERATIONS: usize = 200;

fn config() -> JobSystemConfig {
    JobSystemConfig::default().with_workers(2).with_max_jobs(16)
}

// -----------------------------------------------------------------------------
// Lifecycle

/// Starts a pool, then shuts it down without giving it any work.
#[test]
pub fn start_and_shutdown() {
    shuttle::check_random(
        || {
            let jobs = JobSystem::start(config());
            jobs.shutdown();
            assert_eq!(jobs.running_workers(), 0);
        },
        ITERATIONS,
    );
}

// -----------------------------------------------------------------------------
// Core API

/// Runs one job while the workers race the waiting thread for it.
#[test]
pub fn run_and_wait() {
    shuttle::check_random(
        || {
            let jobs = JobSystem::start(config());
            let runs = Arc::new(AtomicU32::new(0));

            let counter = runs.clone();
            let job = jobs.create_job(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
            jobs.run_and_wait(job);

            assert_eq!(runs.load(Ordering::Relaxed), 1);
        },
        ITERATIONS,
    );
}

/// A parent is not complete until both of its children are.
#[test]
pub fn parent_and_children() {
    shuttle::check_random(
        || {
            let jobs = JobSystem::start(config());
            let runs = Arc::new(AtomicU32::new(0));

            let counter = runs.clone();
            let parent = jobs.create_job(move |cx| {
                for _ in 0..2 {
                    let counter = counter.clone();
                    cx.spawn_child(move |_| {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
            jobs.run_and_wait(parent);

            assert_eq!(runs.load(Ordering::Relaxed), 2);
        },
        ITERATIONS,
    );
}

/// Slots are recycled while other threads still hold handles to them.
#[test]
pub fn slot_reuse() {
    shuttle::check_random(
        || {
            let jobs = JobSystem::start(JobSystemConfig::default().with_workers(2).with_max_jobs(2));
            let runs = Arc::new(AtomicU32::new(0));

            let mut handles = Vec::new();
            for _ in 0..4 {
                let counter = runs.clone();
                let handle = loop {
                    let counter = counter.clone();
                    let handle = jobs.create_job(move |_| {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                    if handle.is_valid() {
                        break handle;
                    }
                    shuttle::thread::yield_now();
                };
                jobs.run(handle);
                handles.push(handle);
            }
            jobs.wait_all();

            assert_eq!(runs.load(Ordering::Relaxed), 4);
            assert!(handles.iter().all(|&handle| jobs.is_complete(handle)));
        },
        ITERATIONS,
    );
}

/// A late `run` of a finished job races the creation of the job that reuses
/// its slot. It must never submit the new job.
#[test]
pub fn rerun_races_slot_reuse() {
    shuttle::check_random(
        || {
            // The workers are never started, so queued jobs only run when
            // this thread waits.
            let jobs = Arc::new(JobSystem::new(
                JobSystemConfig::default().with_workers(1).with_max_jobs(1),
            ));

            let first = jobs.create_job(|_| {});
            jobs.run_and_wait(first);

            let late = {
                let jobs = jobs.clone();
                shuttle::thread::spawn(move || jobs.run(first))
            };

            let runs = Arc::new(AtomicU32::new(0));
            let counter = runs.clone();
            let second = jobs.create_job(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
            late.join().unwrap();

            assert!(second.is_valid());
            assert_eq!(jobs.pending_jobs(), 0);

            jobs.run_and_wait(second);
            assert_eq!(runs.load(Ordering::Relaxed), 1);
        },
        ITERATIONS,
    );
}
