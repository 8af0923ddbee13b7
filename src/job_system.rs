//! This module contains the api and coordination logic for the job system.

use alloc::boxed::Box;
use core::any::Any;
use core::fmt;
use core::ptr;
use std::sync::PoisonError;

use tracing::debug;
use tracing::trace;
use tracing::trace_span;
use tracing::warn;

use crate::config::JobSystemConfig;
use crate::config::PanicHandler;
use crate::error::JobError;
use crate::job::JobFn;
use crate::job::JobHandle;
use crate::job::JobPriority;
use crate::job::JobSlot;
use crate::platform::*;
use crate::queue::WorkStealingQueue;
use crate::unwind;
use crate::worker;
use crate::worker::Worker;

/// Capacity of the shared overflow queue.
pub const GLOBAL_QUEUE_CAPACITY: usize = 8192;

// -----------------------------------------------------------------------------
// Registry

/// The state shared between a [`JobSystem`], its worker threads and every
/// [`JobContext`] it hands out.
pub(crate) struct Registry {
    /// The job pool. Its size never changes.
    slots: Box<[JobSlot]>,
    /// Where the next allocation scan starts.
    next_slot: AtomicUsize,
    /// Source of job generations.
    generation: AtomicU32,
    /// One record per worker thread.
    workers: Box<[Worker]>,
    /// Overflow queue for external submitters and full local queues.
    global: WorkStealingQueue<u32, GLOBAL_QUEUE_CAPACITY>,
    /// Serializes producers on `global`; stealers never take it.
    global_push: Mutex<()>,
    /// Jobs passed to `run` that have not yet completed.
    pending: AtomicUsize,
    panic_handler: Option<PanicHandler>,
}

/// The outcome of asking a thread to help with pending work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Yield {
    Executed,
    Idle,
}

impl Registry {
    fn new(config: &JobSystemConfig) -> Registry {
        let max_jobs = config.resolved_max_jobs();
        let num_workers = config.resolved_workers();

        Registry {
            slots: (0..max_jobs).map(|_| JobSlot::new()).collect(),
            next_slot: AtomicUsize::new(0),
            generation: AtomicU32::new(1),
            workers: (0..num_workers).map(Worker::new).collect(),
            global: WorkStealingQueue::new(),
            global_push: Mutex::new(()),
            pending: AtomicUsize::new(0),
            panic_handler: config.panic_handler.clone(),
        }
    }

    /// Returns an opaque identifier for this registry.
    #[inline(always)]
    pub(crate) fn id(&self) -> usize {
        // The registry lives behind an `Arc` and never moves.
        ptr::from_ref(self) as usize
    }

    #[inline(always)]
    pub(crate) fn worker(&self, index: u32) -> &Worker {
        &self.workers[index as usize]
    }

    #[inline]
    fn current_worker(&self) -> Option<u32> {
        worker::current_worker(self.id())
    }

    /// Returns the pool index of a handle that still names a live job.
    #[inline]
    fn live_index(&self, handle: JobHandle) -> Option<usize> {
        // Unused slots carry generation zero, which no job is ever given.
        if handle.generation == 0 {
            return None;
        }
        let index = handle.index()?;
        let slot = self.slots.get(index)?;
        (slot.generation() == handle.generation).then_some(index)
    }

    // -------------------------------------------------------------------------
    // Allocation

    /// Claims a free slot, scanning the whole pool once from a rotating start.
    fn allocate(&self) -> Option<usize> {
        let len = self.slots.len();
        let start = self.next_slot.fetch_add(1, Ordering::Relaxed) % len;
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&index| self.slots[index].try_claim())
    }

    fn try_create(
        &self,
        parent: JobHandle,
        priority: JobPriority,
        function: JobFn,
    ) -> Result<JobHandle, JobError> {
        let Some(index) = self.allocate() else {
            trace!("job pool exhausted");
            return Err(JobError::PoolExhausted {
                capacity: self.slots.len(),
            });
        };

        let generation = self.next_generation();

        // SAFETY: We just claimed the slot and have not published its handle.
        unsafe { self.slots[index].populate(generation, parent, priority, function) };

        Ok(JobHandle::from_index(index, generation))
    }

    /// Returns a fresh generation, skipping zero when the counter wraps.
    #[inline]
    fn next_generation(&self) -> u32 {
        loop {
            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            if generation != 0 {
                return generation;
            }
        }
    }

    fn try_create_child(
        &self,
        parent: JobHandle,
        priority: JobPriority,
        function: JobFn,
    ) -> Result<JobHandle, JobError> {
        if !parent.is_valid() {
            return self.try_create(JobHandle::INVALID, priority, function);
        }

        let parent_index = self
            .live_index(parent)
            .ok_or(JobError::InvalidParent(parent))?;
        let parent_slot = &self.slots[parent_index];

        // Count the child before it exists, so the parent can never be seen
        // complete while the child is being created.
        if !parent_slot.try_add_child() {
            return Err(JobError::ParentComplete(parent));
        }

        // The slot may have been recycled between the check and the
        // increment, in which case we just delayed some other job.
        if parent_slot.generation() != parent.generation {
            self.finish_job(parent_index);
            return Err(JobError::InvalidParent(parent));
        }

        self.try_create(parent, priority, function)
            .inspect_err(|_| self.finish_job(parent_index))
    }

    // -------------------------------------------------------------------------
    // Dispatch

    fn run(&self, handle: JobHandle) {
        let Some(index) = self.live_index(handle) else {
            trace!("ignoring run of stale or invalid handle {}", handle);
            return;
        };

        // The claim only succeeds while the slot still holds this exact job,
        // so a late `run` of a recycled handle cannot submit its successor.
        if !self.slots[index].mark_submitted(handle.generation) {
            warn!("{} was already submitted or has been recycled; ignoring", handle);
            return;
        }

        self.pending.fetch_add(1, Ordering::Relaxed);

        let job = index as u32;
        let current = self.current_worker();

        if let Some(worker) = current {
            // SAFETY: `current_worker` only returns our own index on the
            // worker's own thread.
            if unsafe { self.worker(worker).push_job(job) } {
                self.wake_all();
                return;
            }
            trace!("local queue of worker {} is full", worker);
        }

        let pushed = {
            let _producer = self
                .global_push
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // SAFETY: Holding the producer lock makes this thread the only
            // one pushing to (or popping from) the owner end of the queue.
            unsafe { self.global.push(job) }
        };

        if pushed {
            self.wake_all();
            return;
        }

        trace!("global queue is full; running {} inline", handle);
        self.execute(index, current);
    }

    #[inline]
    pub(crate) fn pop_global(&self) -> Option<u32> {
        self.global.steal()
    }

    /// Steals from the other workers, starting at a random victim and
    /// scanning round-robin from there.
    pub(crate) fn steal_from_others(&self, thief: Option<u32>) -> Option<u32> {
        let len = self.workers.len();
        if len == 0 || (len == 1 && thief.is_some()) {
            return None;
        }

        let start = worker::random_index(len);
        (0..len)
            .map(|offset| &self.workers[(start + offset) % len])
            .filter(|victim| Some(victim.id()) != thief)
            .find_map(Worker::steal)
    }

    fn wake_all(&self) {
        for worker in self.workers.iter() {
            worker.wake_up();
        }
    }

    /// Finds a job for the calling thread, using the same search as an idle
    /// worker.
    #[inline]
    fn find_work(&self, current: Option<u32>) -> Option<u32> {
        match current {
            // SAFETY: `current` is the calling thread's own worker index.
            Some(worker) => unsafe { self.worker(worker).get_job(self) },
            None => self
                .pop_global()
                .or_else(|| self.steal_from_others(None)),
        }
    }

    /// Executes one pending job on the calling thread, if one can be found.
    fn help_with_job(&self) -> Yield {
        let current = self.current_worker();
        match self.find_work(current) {
            Some(job) => {
                self.execute(job as usize, current);
                Yield::Executed
            }
            None => Yield::Idle,
        }
    }

    // -------------------------------------------------------------------------
    // Execution and completion

    /// Runs the job in the given slot and then records its completion.
    ///
    /// The caller must have dequeued the slot index (or be the submitter
    /// running it inline), which makes it the only thread executing the job.
    pub(crate) fn execute(&self, index: usize, worker: Option<u32>) {
        let slot = &self.slots[index];

        // SAFETY: The caller dequeued this index, and every index is queued at
        // most once, so no other thread is touching the function.
        let function = unsafe { slot.take_function() };
        let handle = JobHandle::from_index(index, slot.generation());

        debug_assert!(function.is_some(), "{handle} was dequeued without a function");

        let panic = function.and_then(|function| {
            let span = trace_span!("job", id = handle.id, generation = handle.generation);
            let _enter = span.enter();

            let cx = JobContext {
                registry: self,
                handle,
                priority: slot.priority(),
                worker,
            };
            unwind::halt_unwinding(|| function(&cx)).err()
        });

        // Completion is recorded even if the job panicked.
        self.finish_job(index);

        if let Some(payload) = panic {
            self.report_panic(payload);
        }
    }

    #[cold]
    fn report_panic(&self, payload: Box<dyn Any + Send>) {
        match &self.panic_handler {
            Some(handler) => {
                let abort_guard = unwind::AbortOnDrop;
                handler(payload);
                core::mem::forget(abort_guard);
            }
            None => unwind::log_panic(payload),
        }
    }

    /// Records that one unit of work in the given slot has finished. When a
    /// job's counter reaches zero it is released and its parent is notified,
    /// walking up the chain of ancestors iteratively.
    fn finish_job(&self, index: usize) {
        let mut next = Some(index);
        while let Some(index) = next.take() {
            let slot = &self.slots[index];
            if !slot.finish_one() {
                break;
            }

            // Read the parent before the slot can be reused.
            next = slot.parent().index();
            slot.release();
            self.pending.fetch_sub(1, Ordering::Release);
        }
    }

    // -------------------------------------------------------------------------
    // Waiting

    fn is_complete(&self, handle: JobHandle) -> bool {
        let Some(slot) = handle.index().and_then(|index| self.slots.get(index)) else {
            return true;
        };

        if slot.generation() != handle.generation || slot.unfinished() == 0 {
            return true;
        }

        // A non-zero counter may belong to a job that has just been written
        // into the slot. Its generation is stamped first, so look again.
        slot.generation() != handle.generation
    }

    fn wait(&self, handle: JobHandle) {
        while !self.is_complete(handle) {
            if self.help_with_job() == Yield::Idle {
                yield_now();
            }
        }
    }

    fn wait_all(&self) {
        while self.pending.load(Ordering::Acquire) > 0 {
            if self.help_with_job() == Yield::Idle {
                yield_now();
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Job system

/// A pool of worker threads executing jobs from a fixed-size job pool.
///
/// # Lifecycle
///
/// [`JobSystem::new`] allocates the job pool and the worker records but
/// starts no threads. [`JobSystem::initialize`] spawns the workers, and
/// [`JobSystem::shutdown`] waits for all submitted work before joining them.
/// A system can be initialized again after it has been shut down. Dropping a
/// system shuts it down.
///
/// Jobs can be created and run on a system that has not been initialized (or
/// has been shut down). They are queued, and are executed by whichever thread
/// next waits on them.
///
/// # Creating jobs
///
/// Jobs are closures receiving a [`JobContext`]. Creating a job claims a slot
/// in the pool and returns a [`JobHandle`]; the job does not run until it is
/// passed to [`JobSystem::run`]. When the pool is full, creation returns
/// [`JobHandle::INVALID`] (or [`JobError::PoolExhausted`] from the `try_`
/// variants) and the caller should wait for some work to finish.
///
/// ```
/// # #![cfg(not(loom))]
/// use jobsteal::{JobSystem, JobSystemConfig};
///
/// let jobs = JobSystem::start(JobSystemConfig::default().with_workers(2));
///
/// let parent = jobs.create_job(|_| println!("parent"));
/// let child = jobs.create_job_as_child(parent, |_| println!("child"));
/// jobs.run(child);
/// jobs.run(parent);
///
/// // Waits for both the parent and the child.
/// jobs.wait(parent);
/// assert!(jobs.is_complete(child));
/// ```
pub struct JobSystem {
    registry: Arc<Registry>,
    /// Resizing the set of running threads is a critical section.
    lifecycle: Mutex<()>,
    initialized: AtomicBool,
}

impl JobSystem {
    /// Creates a new job system without starting any threads.
    pub fn new(config: JobSystemConfig) -> JobSystem {
        debug!("creating job system with {:?}", config);
        JobSystem {
            registry: Arc::new(Registry::new(&config)),
            lifecycle: Mutex::new(()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Creates a new job system and starts its worker threads.
    pub fn start(config: JobSystemConfig) -> JobSystem {
        let system = JobSystem::new(config);
        system.initialize();
        system
    }

    /// Spawns the worker threads. Does nothing if they are already running.
    #[cold]
    pub fn initialize(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if self.initialized.load(Ordering::Relaxed) {
            return;
        }

        debug!("starting {} worker(s)", self.registry.workers.len());
        for worker in self.registry.workers.iter() {
            worker.start(self.registry.clone());
        }

        self.initialized.store(true, Ordering::Release);
        debug!("job system initialized");
    }

    /// Waits for all submitted jobs, then stops and joins the worker threads.
    /// Does nothing if the system is not initialized.
    ///
    /// This must not be called from inside a job running on this system,
    /// since the calling job would be waiting for itself. Such calls are
    /// ignored.
    #[cold]
    pub fn shutdown(&self) {
        if self.registry.current_worker().is_some() {
            warn!("shutdown called from one of the system's own workers; ignoring");
            return;
        }

        let _lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.initialized.load(Ordering::Relaxed) {
            return;
        }

        debug!("shutting down job system");
        self.registry.wait_all();

        for worker in self.registry.workers.iter() {
            worker.stop();
        }

        self.initialized.store(false, Ordering::Release);
        debug!("job system shut down");
    }

    /// Returns true between [`initialize`](Self::initialize) and
    /// [`shutdown`](Self::shutdown).
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Job creation

    /// Creates a job with [`JobPriority::Normal`]. Returns
    /// [`JobHandle::INVALID`] if the pool is exhausted.
    pub fn create_job<F>(&self, f: F) -> JobHandle
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.create_job_with_priority(JobPriority::Normal, f)
    }

    /// Creates a job with the given priority. Returns [`JobHandle::INVALID`]
    /// if the pool is exhausted.
    pub fn create_job_with_priority<F>(&self, priority: JobPriority, f: F) -> JobHandle
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.try_create_job(priority, f)
            .unwrap_or(JobHandle::INVALID)
    }

    /// Creates a job with the given priority, reporting why creation failed.
    pub fn try_create_job<F>(&self, priority: JobPriority, f: F) -> Result<JobHandle, JobError>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.registry
            .try_create(JobHandle::INVALID, priority, Box::new(f))
    }

    /// Creates a job as a child of `parent`. The parent will not complete
    /// until the child has. If `parent` is [`JobHandle::INVALID`], this is the
    /// same as [`create_job`](Self::create_job).
    ///
    /// Returns [`JobHandle::INVALID`] if the pool is exhausted, or if
    /// `parent` no longer names a live, unfinished job.
    pub fn create_job_as_child<F>(&self, parent: JobHandle, f: F) -> JobHandle
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.create_job_as_child_with_priority(parent, JobPriority::Normal, f)
    }

    /// Like [`create_job_as_child`](Self::create_job_as_child), with an
    /// explicit priority.
    pub fn create_job_as_child_with_priority<F>(
        &self,
        parent: JobHandle,
        priority: JobPriority,
        f: F,
    ) -> JobHandle
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.try_create_job_as_child(parent, priority, f)
            .unwrap_or(JobHandle::INVALID)
    }

    /// Creates a child job, reporting why creation failed.
    pub fn try_create_job_as_child<F>(
        &self,
        parent: JobHandle,
        priority: JobPriority,
        f: F,
    ) -> Result<JobHandle, JobError>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.registry
            .try_create_child(parent, priority, Box::new(f))
    }

    // -------------------------------------------------------------------------
    // Scheduling

    /// Queues a job for execution.
    ///
    /// On a worker thread of this system the job goes to that worker's local
    /// queue; otherwise (or if the local queue is full) it goes to the shared
    /// queue. If the shared queue is full too, the job is executed right away
    /// on the calling thread. Either way the job will run.
    ///
    /// Invalid and stale handles are ignored, as is a second `run` of the
    /// same job.
    #[inline]
    pub fn run(&self, handle: JobHandle) {
        self.registry.run(handle);
    }

    /// Queues a job and waits for it (and its children) to complete.
    pub fn run_and_wait(&self, handle: JobHandle) {
        self.run(handle);
        self.wait(handle);
    }

    /// Waits for a job and all of its children to complete.
    ///
    /// Rather than blocking, the calling thread executes other pending jobs
    /// while it waits. Returns immediately for invalid or stale handles.
    pub fn wait(&self, handle: JobHandle) {
        self.registry.wait(handle);
    }

    /// Waits for every job passed to [`run`](Self::run) to complete, helping
    /// to execute them in the meantime.
    pub fn wait_all(&self) {
        self.registry.wait_all();
    }

    /// Returns true if the job has completed. Invalid handles, and handles to
    /// jobs whose slot has since been reused, are always complete.
    #[inline]
    pub fn is_complete(&self, handle: JobHandle) -> bool {
        self.registry.is_complete(handle)
    }

    // -------------------------------------------------------------------------
    // Introspection

    /// The number of worker threads this system runs.
    #[inline]
    pub fn worker_count(&self) -> u32 {
        self.registry.workers.len() as u32
    }

    /// The number of worker threads currently inside their main loop.
    pub fn running_workers(&self) -> u32 {
        self.registry
            .workers
            .iter()
            .filter(|worker| worker.is_running())
            .count() as u32
    }

    /// The index of the calling thread among this system's workers, or
    /// `None` if it is not one of them.
    #[inline]
    pub fn current_worker_id(&self) -> Option<u32> {
        self.registry.current_worker()
    }

    /// The size of the job pool.
    #[inline]
    pub fn max_jobs(&self) -> usize {
        self.registry.slots.len()
    }

    /// The number of jobs that have been run but have not completed. This
    /// is a snapshot, and may be stale as soon as it returns.
    #[inline]
    pub fn pending_jobs(&self) -> usize {
        self.registry.pending.load(Ordering::Relaxed)
    }

    /// The number of occupied pool slots. Like
    /// [`pending_jobs`](Self::pending_jobs), this is only a snapshot.
    pub fn allocated_jobs(&self) -> usize {
        self.registry
            .slots
            .iter()
            .filter(|slot| slot.is_allocated())
            .count()
    }

    /// The priority an unfinished job was created with, or `None` if the
    /// handle is invalid, stale or complete.
    pub fn priority_of(&self, handle: JobHandle) -> Option<JobPriority> {
        let index = self.registry.live_index(handle)?;
        let priority = self.registry.slots[index].priority();
        // Recheck, in case the job finished or the slot was reused while we
        // were reading.
        (!self.registry.is_complete(handle)).then_some(priority)
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSystem")
            .field("initialized", &self.is_initialized())
            .field("workers", &self.worker_count())
            .field("max_jobs", &self.max_jobs())
            .field("pending_jobs", &self.pending_jobs())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Job context

/// Passed to every job while it executes.
///
/// The context identifies the running job and lets it submit more work to
/// the same system, most commonly children of itself.
///
/// ```
/// # #![cfg(not(loom))]
/// use jobsteal::{JobSystem, JobSystemConfig};
///
/// let jobs = JobSystem::start(JobSystemConfig::default().with_workers(2));
/// let root = jobs.create_job(|cx| {
///     for part in 0..4 {
///         cx.spawn_child(move |_| {
///             let _ = part * 2;
///         });
///     }
/// });
/// jobs.run_and_wait(root);
/// ```
pub struct JobContext<'a> {
    registry: &'a Registry,
    handle: JobHandle,
    priority: JobPriority,
    worker: Option<u32>,
}

impl JobContext<'_> {
    /// The handle of the running job.
    #[inline]
    pub fn handle(&self) -> JobHandle {
        self.handle
    }

    /// The priority the running job was created with.
    #[inline]
    pub fn priority(&self) -> JobPriority {
        self.priority
    }

    /// The index of the worker executing the job, or `None` when the job is
    /// being executed by a thread outside the pool (one that is waiting, or
    /// one whose submission overflowed every queue).
    #[inline]
    pub fn worker_id(&self) -> Option<u32> {
        self.worker
    }

    /// Creates an independent job. See [`JobSystem::create_job`].
    pub fn create_job<F>(&self, f: F) -> JobHandle
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.registry
            .try_create(JobHandle::INVALID, JobPriority::Normal, Box::new(f))
            .unwrap_or(JobHandle::INVALID)
    }

    /// Creates a child of the running job, with the running job's priority.
    /// The running job will not complete until the child has. Returns
    /// [`JobHandle::INVALID`] if the pool is exhausted.
    pub fn create_child<F>(&self, f: F) -> JobHandle
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.try_create_child(self.priority, f)
            .unwrap_or(JobHandle::INVALID)
    }

    /// Creates a child of the running job, reporting why creation failed.
    pub fn try_create_child<F>(&self, priority: JobPriority, f: F) -> Result<JobHandle, JobError>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.registry
            .try_create_child(self.handle, priority, Box::new(f))
    }

    /// Creates a child of the running job and queues it. Returns the child's
    /// handle, or [`JobHandle::INVALID`] if the pool is exhausted (in which
    /// case nothing was queued).
    pub fn spawn_child<F>(&self, f: F) -> JobHandle
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        let child = self.create_child(f);
        self.registry.run(child);
        child
    }

    /// Queues a job. See [`JobSystem::run`].
    #[inline]
    pub fn run(&self, handle: JobHandle) {
        self.registry.run(handle);
    }

    /// Waits for a job, executing other work meanwhile. See
    /// [`JobSystem::wait`].
    ///
    /// Waiting on the running job itself, or on one of its ancestors, never
    /// returns.
    pub fn wait(&self, handle: JobHandle) {
        self.registry.wait(handle);
    }

    /// Returns true if the job has completed. See [`JobSystem::is_complete`].
    #[inline]
    pub fn is_complete(&self, handle: JobHandle) -> bool {
        self.registry.is_complete(handle)
    }
}

impl fmt::Debug for JobContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("handle", &self.handle)
            .field("priority", &self.priority)
            .field("worker", &self.worker)
            .finish()
    }
}
