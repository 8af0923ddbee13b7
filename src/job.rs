//! This module defines the pooled representation of a job, and the handles
//! used to refer to it.
//!
//! Jobs are never moved. The pool allocates every [`JobSlot`] up front, and
//! queues refer to slots by index. A [`JobHandle`] adds a generation to the
//! index so that handles to a finished job can be told apart from handles to
//! whatever job reuses the slot later.
//!
//! When using a slot, one must be careful to ensure that:
//! (a) Only the thread that claimed the slot writes its function.
//! (b) The function is taken, and run, exactly once.
//! (c) The slot is only released after its counter has reached zero.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::fmt;

use crate::job_system::JobContext;
use crate::platform::*;

// -----------------------------------------------------------------------------
// Handles

/// Identifies one specific job instance.
///
/// The `id` is the 1-based index of the job's slot in the pool; `0` is
/// reserved for [`JobHandle::INVALID`]. The `generation` is stamped when the
/// job is created and is unique among all jobs created by one
/// [`JobSystem`](crate::JobSystem) (until the counter wraps). Generation `0`
/// is never stamped, so a handle carrying it never names a live job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct JobHandle {
    /// 1-based slot index, or `0` for the invalid handle.
    pub id: u32,
    /// Generation stamped at creation time.
    pub generation: u32,
}

impl JobHandle {
    /// The handle returned when a job could not be created.
    pub const INVALID: JobHandle = JobHandle {
        id: 0,
        generation: 0,
    };

    /// Returns true unless this is [`JobHandle::INVALID`] (or any other handle
    /// with an `id` of zero).
    #[inline(always)]
    pub const fn is_valid(self) -> bool {
        self.id != 0
    }

    /// The 0-based pool index, if the handle is valid.
    #[inline(always)]
    pub(crate) fn index(self) -> Option<usize> {
        self.id.checked_sub(1).map(|index| index as usize)
    }

    #[inline(always)]
    pub(crate) fn from_index(index: usize, generation: u32) -> JobHandle {
        JobHandle {
            id: index as u32 + 1,
            generation,
        }
    }

    #[inline(always)]
    fn pack(self) -> u64 {
        (u64::from(self.id) << 32) | u64::from(self.generation)
    }

    #[inline(always)]
    fn unpack(bits: u64) -> JobHandle {
        JobHandle {
            id: (bits >> 32) as u32,
            generation: bits as u32,
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "job#{}@{}", self.id, self.generation)
        } else {
            f.write_str("job#invalid")
        }
    }
}

// -----------------------------------------------------------------------------
// Priority

/// The priority of a job.
///
/// Priorities are recorded with each job but do not currently influence the
/// order in which jobs are dispatched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum JobPriority {
    /// Background work.
    Low = 0,
    /// The default priority.
    #[default]
    Normal = 1,
    /// Work on the critical path of a frame.
    High = 2,
    /// Work that everything else is waiting on.
    Critical = 3,
}

impl JobPriority {
    #[inline(always)]
    fn from_u8(value: u8) -> JobPriority {
        match value {
            0 => JobPriority::Low,
            2 => JobPriority::High,
            3 => JobPriority::Critical,
            _ => JobPriority::Normal,
        }
    }
}

// -----------------------------------------------------------------------------
// Slots

/// The type-erased body of a job.
pub(crate) type JobFn = Box<dyn FnOnce(&JobContext<'_>) + Send + 'static>;

/// The submitted bit of `JobSlot::state`.
const SUBMITTED: u64 = 1;

/// One element of the job pool.
///
/// Every field other than `function` is atomic, because handle validation
/// and completion queries read them from arbitrary threads while the slot is
/// being recycled.
pub(crate) struct JobSlot {
    /// Set while the slot belongs to a live job.
    allocated: AtomicBool,
    /// The generation of the job currently (or most recently) in this slot in
    /// the high half, and in bit zero whether that job has been handed to
    /// `run`. Keeping both in one word ties the submit claim to a generation.
    state: AtomicU64,
    /// Packed handle of the parent job, or zero.
    parent: AtomicU64,
    /// Stored as the `JobPriority` discriminant.
    priority: AtomicU8,
    /// One for the job itself, plus one for each unfinished child.
    unfinished: AtomicI32,
    /// The function to execute. Written by the creating thread before the job
    /// is published, taken by the single thread that executes it.
    function: UnsafeCell<Option<JobFn>>,
}

// SAFETY: `function` is only accessed by the thread that claimed the slot
// (before it is published through a queue) and by the thread that dequeued it
// (after it was published). All other fields are atomic.
unsafe impl Sync for JobSlot {}

impl JobSlot {
    pub(crate) fn new() -> JobSlot {
        JobSlot {
            allocated: AtomicBool::new(false),
            state: AtomicU64::new(0),
            parent: AtomicU64::new(0),
            priority: AtomicU8::new(JobPriority::Normal as u8),
            unfinished: AtomicI32::new(0),
            function: UnsafeCell::new(None),
        }
    }

    /// Attempts to claim the slot for a new job.
    #[inline]
    pub(crate) fn try_claim(&self) -> bool {
        self.allocated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Returns the slot to the pool.
    #[inline]
    pub(crate) fn release(&self) {
        self.allocated.store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_allocated(&self) -> bool {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Fills a freshly claimed slot.
    ///
    /// The generation is stamped before the counter is reset, so a reader
    /// that observes the new counter also observes the new generation.
    ///
    /// # Safety
    ///
    /// The caller must have claimed the slot with `try_claim` and must not
    /// have published its handle yet.
    pub(crate) unsafe fn populate(
        &self,
        generation: u32,
        parent: JobHandle,
        priority: JobPriority,
        function: JobFn,
    ) {
        // SAFETY: The slot was just claimed and its handle is unpublished, so
        // no other thread can be reading or writing the function.
        unsafe { *self.function.get() = Some(function) };
        self.priority.store(priority as u8, Ordering::Relaxed);
        self.parent.store(parent.pack(), Ordering::Relaxed);
        self.state.store(u64::from(generation) << 32, Ordering::Release);
        self.unfinished.store(1, Ordering::Release);
    }

    /// Takes the function out of the slot.
    ///
    /// # Safety
    ///
    /// The caller must be the single thread executing this job: either the
    /// one that dequeued its index, or the submitter running it inline.
    #[inline]
    pub(crate) unsafe fn take_function(&self) -> Option<JobFn> {
        // SAFETY: The caller has exclusive access to the function.
        unsafe { (*self.function.get()).take() }
    }

    /// Marks the job of the given generation as submitted. Returns false if
    /// it already was, or if the slot no longer holds that generation.
    #[inline]
    pub(crate) fn mark_submitted(&self, generation: u32) -> bool {
        let unsubmitted = u64::from(generation) << 32;
        self.state
            .compare_exchange(
                unsubmitted,
                unsubmitted | SUBMITTED,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        (self.state.load(Ordering::Acquire) >> 32) as u32
    }

    #[inline]
    pub(crate) fn parent(&self) -> JobHandle {
        JobHandle::unpack(self.parent.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn priority(&self) -> JobPriority {
        JobPriority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn unfinished(&self) -> i32 {
        self.unfinished.load(Ordering::Acquire)
    }

    /// Adds a child to the job, unless the job has already completed.
    #[inline]
    pub(crate) fn try_add_child(&self) -> bool {
        let mut count = self.unfinished.load(Ordering::Acquire);
        while count > 0 {
            match self.unfinished.compare_exchange_weak(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => count = current,
            }
        }
        false
    }

    /// Records that the job itself or one of its children finished. Returns
    /// true if that was the last outstanding piece of work.
    #[inline]
    pub(crate) fn finish_one(&self) -> bool {
        let previous = self.unfinished.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "job completion counter went negative");
        previous == 1
    }
}
