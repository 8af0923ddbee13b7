//! A fixed-capacity, dependency-aware job scheduler built on work-stealing
//! deques.
//!
//! Jobsteal runs many short-lived units of work across a pool of worker
//! threads. Jobs live in a preallocated pool and are referred to by small
//! [`JobHandle`]s, which pair a slot index with a generation so that a handle
//! to a finished job can never be confused with whatever occupies its slot
//! next. Each worker owns a lock-free Chase–Lev deque of slot indices; a
//! single shared overflow deque accepts work from threads outside the pool.
//!
//! Jobs may be created as children of other jobs. A parent is only complete
//! once its own function and all of its children have finished, which makes
//! it easy to fan out a tree of work and wait on its root.
//!
//! Waiting never parks the calling thread. Instead, [`JobSystem::wait`] and
//! [`JobSystem::wait_all`] execute other pending jobs until the awaited work
//! is done, so waiting threads add throughput instead of idling.
//!
//! ```
//! # #![cfg(not(loom))]
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! use jobsteal::{JobSystem, JobSystemConfig};
//!
//! let jobs = JobSystem::start(JobSystemConfig::default().with_workers(4));
//! let counter = Arc::new(AtomicU32::new(0));
//!
//! let total = counter.clone();
//! let root = jobs.create_job(move |cx| {
//!     for _ in 0..10 {
//!         let total = total.clone();
//!         cx.spawn_child(move |_| {
//!             total.fetch_add(1, Ordering::Relaxed);
//!         });
//!     }
//! });
//!
//! jobs.run_and_wait(root);
//! assert_eq!(counter.load(Ordering::Relaxed), 10);
//! jobs.shutdown();
//! ```
//!
//! # Priorities
//!
//! Every job carries a [`JobPriority`]. The priority is stored and can be
//! read back, but no dispatch path consults it yet; jobs of every priority
//! share the same queues.
//!
//! # Job graphs
//!
//! Parent/child relationships must form a forest. Nothing checks for cycles,
//! and a job that waits on one of its own ancestors will never return.

#![no_std]
#![cfg_attr(feature = "shuttle", allow(dead_code))]
#![cfg_attr(feature = "shuttle", allow(unused_imports))]

// -----------------------------------------------------------------------------
// Boilerplate for building without the standard library

extern crate alloc;
extern crate std;

// -----------------------------------------------------------------------------
// Modules

#[cfg(doctest)]
mod compile_fail;
mod config;
mod error;
mod job;
mod job_system;
mod queue;
mod unwind;
mod util;
mod worker;

// -----------------------------------------------------------------------------
// Top-level exports

pub use config::JobSystemConfig;
pub use config::PanicHandler;
pub use error::JobError;
pub use job::JobHandle;
pub use job::JobPriority;
pub use job_system::GLOBAL_QUEUE_CAPACITY;
pub use job_system::JobContext;
pub use job_system::JobSystem;
pub use queue::QueueItem;
pub use queue::WorkStealingQueue;
pub use worker::IDLE_SLEEP;
pub use worker::LOCAL_QUEUE_CAPACITY;

// -----------------------------------------------------------------------------
// Platform Support

// This crate uses `loom` and `shuttle` for testing, which requires mocking all
// of the core threading primitives (`Mutex` and the like).
//
// To make things a bit simpler, we re-export all the important types in the
// `platform` module.

#[cfg(not(any(loom, feature = "shuttle")))]
mod platform {

    // Core exports

    pub use alloc::sync::Arc;
    pub use core::sync::atomic::AtomicBool;
    pub use core::sync::atomic::AtomicI32;
    pub use core::sync::atomic::AtomicIsize;
    pub use core::sync::atomic::AtomicU8;
    pub use core::sync::atomic::AtomicU32;
    pub use core::sync::atomic::AtomicU64;
    pub use core::sync::atomic::AtomicUsize;
    pub use core::sync::atomic::Ordering;
    pub use core::sync::atomic::fence;
    pub use std::sync::Condvar;
    pub use std::sync::Mutex;
    pub use std::thread::Builder as ThreadBuilder;
    pub use std::thread::JoinHandle;
    pub use std::thread::available_parallelism;
    pub use std::thread::yield_now;
    pub use std::thread_local;
}

#[cfg(all(loom, not(feature = "shuttle")))]
mod platform {

    // Core exports

    pub use loom::sync::Arc;
    pub use loom::sync::Condvar;
    pub use loom::sync::Mutex;
    pub use loom::sync::atomic::AtomicBool;
    pub use loom::sync::atomic::AtomicI32;
    pub use loom::sync::atomic::AtomicIsize;
    pub use loom::sync::atomic::AtomicU8;
    pub use loom::sync::atomic::AtomicU32;
    pub use loom::sync::atomic::AtomicU64;
    pub use loom::sync::atomic::AtomicUsize;
    pub use loom::sync::atomic::Ordering;
    pub use loom::sync::atomic::fence;
    pub use loom::thread::Builder as ThreadBuilder;
    pub use loom::thread::JoinHandle;
    pub use loom::thread::yield_now;
    pub use loom::thread_local;

    // Available parallelism

    pub fn available_parallelism() -> std::io::Result<core::num::NonZero<usize>> {
        Ok(core::num::NonZero::<usize>::MIN.saturating_add(1))
    }
}

#[cfg(feature = "shuttle")]
mod platform {

    // Core exports

    pub use shuttle::sync::Arc;
    pub use shuttle::sync::Condvar;
    pub use shuttle::sync::Mutex;
    pub use shuttle::sync::atomic::AtomicBool;
    pub use shuttle::sync::atomic::AtomicI32;
    pub use shuttle::sync::atomic::AtomicIsize;
    pub use shuttle::sync::atomic::AtomicU8;
    pub use shuttle::sync::atomic::AtomicU32;
    pub use shuttle::sync::atomic::AtomicU64;
    pub use shuttle::sync::atomic::AtomicUsize;
    pub use shuttle::sync::atomic::Ordering;
    pub use shuttle::sync::atomic::fence;
    pub use shuttle::thread::Builder as ThreadBuilder;
    pub use shuttle::thread::JoinHandle;
    pub use shuttle::thread::yield_now;
    pub use shuttle::thread_local;

    // Available parallelism

    pub fn available_parallelism() -> std::io::Result<core::num::NonZero<usize>> {
        panic!("available_parallelism does not work on shuttle");
    }
}
