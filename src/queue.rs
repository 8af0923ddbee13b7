//! A fixed-capacity lock-free work-stealing deque.
//!
//! This is the Chase–Lev deque, specialized to a fixed power-of-two ring
//! buffer. The owning thread pushes and pops at the *bottom* end (LIFO) with
//! almost no synchronization. Any other thread may steal from the *top* end
//! (FIFO) using a single compare-and-swap.

use alloc::boxed::Box;
use core::fmt;
use core::marker::PhantomData;

use crossbeam_utils::CachePadded;

use crate::platform::*;

// -----------------------------------------------------------------------------
// Items

/// A value that can be stored in a [`WorkStealingQueue`].
///
/// Items live in the ring buffer as 64-bit atomic words. A stealer reads its
/// candidate slot before it knows whether it has won the item, possibly at
/// the same moment the owner overwrites that slot; storing the raw bits
/// atomically keeps that read well defined, and the value is discarded if
/// the steal fails.
pub trait QueueItem: Copy + Send {
    /// Encodes the item as a 64-bit word.
    fn into_bits(self) -> u64;

    /// Decodes an item previously encoded by [`into_bits`](Self::into_bits).
    fn from_bits(bits: u64) -> Self;
}

macro_rules! impl_queue_item {
    ($($ty:ty),*) => {
        $(
            impl QueueItem for $ty {
                #[inline(always)]
                fn into_bits(self) -> u64 {
                    self as u64
                }

                #[inline(always)]
                fn from_bits(bits: u64) -> Self {
                    bits as $ty
                }
            }
        )*
    };
}

impl_queue_item!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

// -----------------------------------------------------------------------------
// Queue

/// A bounded work-stealing deque holding up to `N` items of type `T`.
///
/// `N` must be a power of two. The scheduler only ever queues 32-bit slot
/// indices, so items are plain integers (see [`QueueItem`]).
///
/// Only one thread, the *owner*, may call [`push`](Self::push) and
/// [`pop`](Self::pop). Both are `unsafe` for that reason. [`steal`](Self::steal)
/// may be called from any thread at any time.
///
/// ```
/// # #![cfg(not(loom))]
/// use jobsteal::WorkStealingQueue;
///
/// let queue = WorkStealingQueue::<u32, 4>::new();
/// // SAFETY: This thread is the only one touching the owner end.
/// unsafe {
///     assert!(queue.push(1));
///     assert!(queue.push(2));
///     assert_eq!(queue.pop(), Some(2));
/// }
/// assert_eq!(queue.steal(), Some(1));
/// assert!(queue.is_empty());
/// ```
pub struct WorkStealingQueue<T, const N: usize> {
    /// The index of the oldest item. Only ever advanced, by CAS.
    top: CachePadded<AtomicIsize>,
    /// One past the index of the newest item. Written only by the owner.
    bottom: CachePadded<AtomicIsize>,
    /// The ring buffer. Slot `i` holds the item with logical index `i & MASK`.
    buffer: Box<[AtomicU64]>,
    _items: PhantomData<T>,
}

impl<T: QueueItem, const N: usize> WorkStealingQueue<T, N> {
    const MASK: isize = {
        assert!(N.is_power_of_two(), "capacity must be a power of two");
        assert!(N <= isize::MAX as usize, "capacity must fit in an isize");
        (N - 1) as isize
    };

    /// Creates an empty queue.
    pub fn new() -> Self {
        // Force evaluation of the capacity checks.
        let _ = Self::MASK;

        Self {
            top: CachePadded::new(AtomicIsize::new(0)),
            bottom: CachePadded::new(AtomicIsize::new(0)),
            buffer: (0..N).map(|_| AtomicU64::new(0)).collect(),
            _items: PhantomData,
        }
    }

    /// The maximum number of items the queue can hold.
    #[inline(always)]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline(always)]
    fn slot(&self, index: isize) -> &AtomicU64 {
        &self.buffer[(index & Self::MASK) as usize]
    }

    /// Pushes an item onto the bottom of the queue. Returns `false`, leaving
    /// the queue untouched, if the queue already holds `N` items.
    ///
    /// # Safety
    ///
    /// Must only be called by the owner thread, and never concurrently with
    /// another call to `push` or `pop` on the same queue.
    #[inline]
    pub unsafe fn push(&self, item: T) -> bool {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);

        if bottom.wrapping_sub(top) >= N as isize {
            return false;
        }

        // The capacity check above guarantees no live item occupies the slot.
        // A stealer that lost its race may still be reading it; it discards
        // whatever it sees.
        self.slot(bottom).store(item.into_bits(), Ordering::Relaxed);

        // Publish the item before the new bottom becomes visible.
        fence(Ordering::Release);
        self.bottom.store(bottom.wrapping_add(1), Ordering::Relaxed);
        true
    }

    /// Pops the most recently pushed item from the bottom of the queue.
    ///
    /// When a single item remains, the owner races stealers for it; losing
    /// the race returns `None`.
    ///
    /// # Safety
    ///
    /// Must only be called by the owner thread, and never concurrently with
    /// another call to `push` or `pop` on the same queue.
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        let bottom = self.bottom.load(Ordering::Relaxed).wrapping_sub(1);
        self.bottom.store(bottom, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let top = self.top.load(Ordering::Relaxed);

        let len = bottom.wrapping_sub(top);
        if len < 0 {
            // The queue was already empty.
            self.bottom.store(bottom.wrapping_add(1), Ordering::Relaxed);
            return None;
        }

        // `top <= bottom`, so the slot holds an item written by an earlier
        // `push` on this thread.
        let item = T::from_bits(self.slot(bottom).load(Ordering::Relaxed));

        if len > 0 {
            return Some(item);
        }

        // Exactly one item was left: whoever advances `top` owns it.
        let won = self
            .top
            .compare_exchange(
                top,
                top.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok();
        self.bottom.store(bottom.wrapping_add(1), Ordering::Relaxed);
        won.then_some(item)
    }

    /// Steals the oldest item from the top of the queue.
    ///
    /// This never retries: if another thread wins the race for the item,
    /// `None` is returned and the caller may try again or move on to a
    /// different queue.
    #[inline]
    pub fn steal(&self) -> Option<T> {
        let top = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::Acquire);

        if bottom.wrapping_sub(top) <= 0 {
            return None;
        }

        // Read the slot before claiming it. Once another thread has advanced
        // `top` the owner may overwrite it, so the bits only count as an item
        // if the CAS below succeeds.
        let bits = self.slot(top).load(Ordering::Relaxed);

        self.top
            .compare_exchange(
                top,
                top.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| T::from_bits(bits))
    }

    /// Returns the number of items in the queue. This is a racy snapshot
    /// and must only be used as a heuristic.
    #[inline]
    pub fn len(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        usize::try_from(bottom.wrapping_sub(top)).unwrap_or(0)
    }

    /// Returns true if the queue appears empty. Racy, like [`len`](Self::len).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: QueueItem, const N: usize> Default for WorkStealingQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> fmt::Debug for WorkStealingQueue<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkStealingQueue")
            .field("top", &self.top.load(Ordering::Relaxed))
            .field("bottom", &self.bottom.load(Ordering::Relaxed))
            .field("capacity", &N)
            .finish()
    }
}
