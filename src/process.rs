//! Process-wide heaps over the real program break, with one pair of plain
//! entry points per concurrency strategy.
//!
//! All three heaps extend the same break through [`Sbrk`], which serializes
//! every `sbrk` call in the process, so they can be mixed freely. A pointer
//! must still go back to the release function matching the allocate function
//! that produced it.

use super::*;
use core::ptr;

static LOCKED: GlobalLockHeap<Sbrk, SpinLock> =
    GlobalLockHeap::new(Sbrk, SpinLock::new(), SpinLock::new());

static SPLIT: SplitLockHeap<Sbrk, SpinLock, SpinLock> =
    SplitLockHeap::new(Sbrk, SpinLock::new(), SpinLock::new());

#[inline]
fn or_null(result: Result<NonNull<u8>, AllocError>) -> *mut u8 {
    result.map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Allocate `size` bytes from the process-wide global-lock heap.
///
/// Returns null when the program break cannot be extended.
pub fn allocate_locked(size: usize) -> *mut u8 {
    or_null(LOCKED.allocate(size))
}

/// Release a pointer obtained from [`allocate_locked`]. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or have come from [`allocate_locked`] and not have been
/// released since.
pub unsafe fn release_locked(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        LOCKED.release(ptr);
    }
}

/// Allocate `size` bytes from the process-wide split-lock heap.
///
/// Returns null when the program break cannot be extended.
pub fn allocate_split(size: usize) -> *mut u8 {
    or_null(SPLIT.allocate(size))
}

/// Release a pointer obtained from [`allocate_split`]. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or have come from [`allocate_split`] and not have been
/// released since.
pub unsafe fn release_split(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        SPLIT.release(ptr);
    }
}

/// The process-wide global-lock heap as a [`RawHeap`], for use with
/// [`HeapAllocator`].
///
/// ```no_run
/// use brkalloc::{HeapAllocator, Locked};
///
/// #[global_allocator]
/// static ALLOC: HeapAllocator<Locked> = HeapAllocator(Locked);
///
/// fn main() {
///     let v = vec![1, 2, 3];
///     assert_eq!(v.iter().sum::<i32>(), 6);
/// }
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Locked;

impl RawHeap for Locked {
    #[inline]
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        LOCKED.allocate(size)
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>) {
        LOCKED.release(ptr);
    }
}

/// The process-wide split-lock heap as a [`RawHeap`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Split;

impl RawHeap for Split {
    #[inline]
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        SPLIT.allocate(size)
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>) {
        SPLIT.release(ptr);
    }
}

cfg_if! {
    if #[cfg(feature = "std")] {
        use core::cell::RefCell;

        static PER_THREAD: ThreadLocalHeap<Sbrk, SpinLock> =
            ThreadLocalHeap::new(Sbrk, SpinLock::new());

        std::thread_local! {
            static LOCAL: RefCell<Option<LocalArena<'static, Sbrk, SpinLock>>> =
                const { RefCell::new(None) };
        }

        /// Run `f` against the calling thread's arena, opening it on first use.
        ///
        /// `None` during thread teardown, or on re-entry from inside `f`.
        fn with_local<R>(f: impl FnOnce(&mut LocalArena<'static, Sbrk, SpinLock>) -> R) -> Option<R> {
            LOCAL
                .try_with(|cell| {
                    let mut slot = cell.try_borrow_mut().ok()?;
                    Some(f(slot.get_or_insert_with(|| PER_THREAD.local())))
                })
                .ok()
                .flatten()
        }

        /// Allocate `size` bytes from the calling thread's private arena.
        ///
        /// Returns null when the program break cannot be extended, or when the
        /// thread's arena is unavailable because the thread is exiting.
        pub fn allocate_thread_local(size: usize) -> *mut u8 {
            with_local(|arena| arena.allocate(size)).map_or(ptr::null_mut(), or_null)
        }

        /// Release a pointer obtained from [`allocate_thread_local`] on the
        /// calling thread. Null is ignored.
        ///
        /// Pointers allocated on another thread are not released: they stay
        /// allocated and a warning is logged.
        ///
        /// # Safety
        ///
        /// `ptr` must be null or have come from [`allocate_thread_local`] and
        /// not have been released since.
        pub unsafe fn release_thread_local(ptr: *mut u8) {
            if let Some(ptr) = NonNull::new(ptr) {
                with_local(|arena| arena.release(ptr));
            }
        }

        /// The calling thread's private arena as a [`RawHeap`].
        ///
        /// Blocks released on a thread other than the one that allocated them
        /// are never reclaimed.
        #[derive(Clone, Copy, Debug, Default)]
        pub struct PerThread;

        impl RawHeap for PerThread {
            #[inline]
            fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
                with_local(|arena| arena.allocate(size)).unwrap_or(Err(AllocError))
            }

            #[inline]
            unsafe fn release(&self, ptr: NonNull<u8>) {
                with_local(|arena| arena.release(ptr));
            }
        }
    }
}
