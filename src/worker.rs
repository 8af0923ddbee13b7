//! This module contains the per-thread half of the scheduler: the worker
//! record shared with the rest of the system, and the loop each worker
//! thread runs.

use alloc::format;
use core::cell::Cell;
use core::time::Duration;
use std::sync::PoisonError;

use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::job_system::Registry;
use crate::platform::*;
use crate::queue::WorkStealingQueue;
use crate::util::XorShift64Star;

/// Capacity of each worker's local queue.
pub const LOCAL_QUEUE_CAPACITY: usize = 4096;

/// The longest an idle worker sleeps before polling for work again, even if
/// nobody wakes it.
pub const IDLE_SLEEP: Duration = Duration::from_millis(1);

// -----------------------------------------------------------------------------
// Thread local worker identity

/// Identifies a worker thread: which system it belongs to, and its index.
#[derive(Clone, Copy, PartialEq, Eq)]
struct WorkerTag {
    registry: usize,
    index: u32,
}

#[cfg(not(any(loom, feature = "shuttle")))]
thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerTag>> = const { Cell::new(None) };
    static RNG: XorShift64Star = XorShift64Star::new();
}

#[cfg(any(loom, feature = "shuttle"))]
thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerTag>> = Cell::new(None);
    static RNG: XorShift64Star = XorShift64Star::new();
}

/// Returns the index of the calling thread within the given registry, or
/// `None` if the calling thread is not one of its workers.
#[inline]
pub(crate) fn current_worker(registry: usize) -> Option<u32> {
    CURRENT_WORKER.with(|current| match current.get() {
        Some(tag) if tag.registry == registry => Some(tag.index),
        _ => None,
    })
}

/// Returns a value from `0..n` drawn from the calling thread's generator.
#[inline]
pub(crate) fn random_index(n: usize) -> usize {
    RNG.with(|rng| rng.next_usize(n))
}

// -----------------------------------------------------------------------------
// Worker

/// The shared record for one worker thread.
///
/// The record outlives the thread: it is allocated with the registry, and a
/// thread is attached to it by [`Worker::start`] and detached by
/// [`Worker::stop`]. Other threads use the record to steal from the worker's
/// queue and to wake it.
pub(crate) struct Worker {
    /// This worker's position in the registry.
    index: u32,
    /// Job slot indices. Only the worker thread pushes and pops.
    queue: WorkStealingQueue<u32, LOCAL_QUEUE_CAPACITY>,
    /// Tells the thread to exit its loop.
    halt: AtomicBool,
    /// Set while the thread is inside its loop.
    running: AtomicBool,
    /// Held only around condition variable operations.
    sleep: Mutex<()>,
    /// Signaled when work may be available.
    wake: Condvar,
    /// The handle used to wait for the thread to complete.
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn new(index: u32) -> Worker {
        Worker {
            index,
            queue: WorkStealingQueue::new(),
            halt: AtomicBool::new(false),
            running: AtomicBool::new(false),
            sleep: Mutex::new(()),
            wake: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    #[inline(always)]
    pub(crate) fn id(&self) -> u32 {
        self.index
    }

    /// Returns true while the worker thread is inside its main loop.
    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Spawns the worker thread.
    #[cold]
    pub(crate) fn start(&self, registry: Arc<Registry>) {
        let index = self.index;
        self.halt.store(false, Ordering::Relaxed);

        debug!("spawning worker {}", index);
        let spawned = ThreadBuilder::new()
            .name(format!("jobsteal worker {index}"))
            .spawn(move || main_loop(registry, index));

        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(err) => {
                // The system still makes progress through cooperative waits,
                // just with one less thread.
                error!("failed to spawn worker {}: {}", index, err);
            }
        }
    }

    /// Asks the worker thread to exit and joins it.
    #[cold]
    pub(crate) fn stop(&self) {
        self.halt.store(true, Ordering::Release);
        self.wake_up();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("worker {} terminated by a panic", self.index);
            }
        }
    }

    /// Pushes a job onto the local queue. Returns false if the queue is full.
    ///
    /// # Safety
    ///
    /// Must only be called from this worker's own thread.
    #[inline]
    pub(crate) unsafe fn push_job(&self, index: u32) -> bool {
        // SAFETY: The caller ensures we are on the owning thread.
        unsafe { self.queue.push(index) }
    }

    /// Steals the oldest job from the local queue.
    #[inline]
    pub(crate) fn steal(&self) -> Option<u32> {
        self.queue.steal()
    }

    /// Wakes the worker if it is sleeping.
    ///
    /// The sleep mutex is held around the notification. Without it, the
    /// notification could land after the worker checked for work but before
    /// it started waiting, and would be lost.
    #[inline]
    pub(crate) fn wake_up(&self) {
        let _guard = self.sleep.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_one();
    }

    /// Finds a job for this worker: local queue first, then the global
    /// queue, then the other workers.
    ///
    /// # Safety
    ///
    /// Must only be called from this worker's own thread.
    #[inline]
    pub(crate) unsafe fn get_job(&self, registry: &Registry) -> Option<u32> {
        // SAFETY: The caller ensures we are on the owning thread.
        unsafe { self.queue.pop() }
            .or_else(|| registry.pop_global())
            .or_else(|| registry.steal_from_others(Some(self.index)))
    }

    /// Sleeps until woken, or until [`IDLE_SLEEP`] has passed.
    #[inline]
    fn idle(&self) {
        let guard = self.sleep.lock().unwrap_or_else(PoisonError::into_inner);
        if self.halt.load(Ordering::Acquire) || !self.queue.is_empty() {
            return;
        }
        let _ = self.wake.wait_timeout(guard, IDLE_SLEEP);
    }
}

// -----------------------------------------------------------------------------
// Main worker loop

/// This is the main loop for a worker thread. Workers run the most recently
/// queued local job first, so a job tree stays on the core that built it,
/// and only look further afield once their own queue is empty.
fn main_loop(registry: Arc<Registry>, index: u32) {
    let tag = WorkerTag {
        registry: registry.id(),
        index,
    };
    CURRENT_WORKER.with(|current| current.set(Some(tag)));

    let worker = registry.worker(index);
    worker.running.store(true, Ordering::Relaxed);
    trace!("starting worker {}", index);

    while !worker.halt.load(Ordering::Acquire) {
        // SAFETY: This is the worker's own thread.
        match unsafe { worker.get_job(&registry) } {
            Some(job) => registry.execute(job as usize, Some(index)),
            None => worker.idle(),
        }
    }

    worker.running.store(false, Ordering::Relaxed);
    CURRENT_WORKER.with(|current| current.set(None));
    trace!("exiting worker {}", index);
}
