//! The split-lock heap.
//!
//! Like [`GlobalLockHeap`], except that every touch of the free list is its
//! own short critical section. In particular, handing a freshly grown block to
//! the list only inserts it; the search that follows takes the lock again, so
//! a thread stuck behind a slow break extension never holds up readers of the
//! list for longer than one insertion.

use super::*;
use crate::{
    arena::{self, Arena},
    engine::{self, ListAccess, Missing},
    freelist::FreeList,
    header::{Header, SHARED},
    mutex::Mutex,
};

/// A heap whose free list and program break are guarded by two independent
/// locks, neither of which is ever held while the other is taken.
///
/// `L` guards the free list and `G` guards arena growth.
pub struct SplitLockHeap<B, L, G> {
    list: Mutex<FreeList, L>,
    arena: Arena<B, G>,
}

impl<B, L, G> SplitLockHeap<B, L, G>
where
    B: ProgramBreak,
    L: Lock,
    G: Lock,
{
    /// Create a new, empty heap growing from `brk`.
    pub const fn new(brk: B, list_lock: L, break_lock: G) -> Self {
        SplitLockHeap {
            list: Mutex::new(FreeList::new(), list_lock),
            arena: Arena::new(brk, break_lock),
        }
    }

    /// Batch arena growth up to `units` header units instead of
    /// [`DEFAULT_MIN_BATCH_UNITS`].
    ///
    /// # Panics
    ///
    /// Panics if `units` is zero.
    pub const fn with_min_batch(mut self, units: usize) -> Self {
        self.arena.min_batch = arena::checked_batch(units);
        self
    }

    /// Allocate at least `size` bytes aligned to [`HEADER_ALIGN`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        engine::allocate(&mut Phased(&self.list), &self.arena, SHARED, size)
    }

    /// Return a block to the heap.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// same heap and must not have been released since.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        engine::release(&mut self.list.lock(), ptr);
    }

    /// A snapshot of the heap's bookkeeping.
    pub fn stats(&self) -> HeapStats {
        self.list.lock().stats()
    }

    /// Check the free list's structural invariants.
    pub fn validate(&self) -> Result<(), &'static str> {
        self.list.lock().validate()
    }
}

impl<B, L, G> RawHeap for SplitLockHeap<B, L, G>
where
    B: ProgramBreak,
    L: Lock,
    G: Lock,
{
    #[inline]
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        SplitLockHeap::allocate(self, size)
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>) {
        SplitLockHeap::release(self, ptr);
    }
}

/// Insertion and search are separate phases with the lock dropped in between.
struct Phased<'a, L>(&'a Mutex<FreeList, L>);

impl<L> ListAccess for Phased<'_, L>
where
    L: Lock,
{
    fn search(&mut self, units: usize) -> Result<NonNull<Header>, Missing> {
        self.0.lock().search(units)
    }

    fn refill(&mut self, grown: NonNull<Header>, _units: usize) -> Option<NonNull<Header>> {
        unsafe { self.0.lock().adopt(grown) };
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, vec::Vec};

    #[test]
    fn growth_then_search_in_separate_sections() {
        // Distinct lock types for the two roles; `SingleThreadedLock` would
        // panic if the insertion phase were still held during the search.
        let heap = SplitLockHeap::new(
            brk::leaked(1 << 16),
            SingleThreadedLock::new(),
            SpinLock::new(),
        )
        .with_min_batch(8);

        let a = heap.allocate(200).unwrap();
        assert!(unsafe { usable_size(a) } >= 200);
        let b = heap.allocate(1).unwrap();
        assert_ne!(a, b);

        unsafe {
            heap.release(a);
            heap.release(b);
        }
        let stats = heap.stats();
        assert_eq!(heap.validate(), Ok(()));
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, stats.arena_bytes - HEADER_SIZE);
    }

    fn heap(bytes: usize) -> SplitLockHeap<FixedBreak, SingleThreadedLock, SingleThreadedLock> {
        SplitLockHeap::new(
            brk::leaked(bytes),
            SingleThreadedLock::new(),
            SingleThreadedLock::new(),
        )
    }

    #[test]
    fn round_trip_restores_free_capacity() {
        let heap = heap(1 << 16);
        let warm = heap.allocate(8).unwrap();
        unsafe { heap.release(warm) };

        for size in [0, 1, 15, 16, 17, 100, 1000] {
            let before = heap.stats();
            let p = heap.allocate(size).unwrap();
            assert!(unsafe { usable_size(p) } >= size);
            unsafe { heap.release(p) };
            assert_eq!(heap.stats(), before, "size {size}");

            let q = heap.allocate(size).unwrap();
            assert_eq!(heap.stats().arena_bytes, before.arena_bytes);
            unsafe { heap.release(q) };
        }
        assert_eq!(heap.validate(), Ok(()));
    }

    #[test]
    fn growth_converges_in_one_cycle() {
        let heap = heap(1 << 20).with_min_batch(4);
        let small = heap.allocate(16).unwrap();
        let before = heap.stats();

        let size = 64 * HEADER_SIZE;
        assert!(before.free_bytes < size);
        let big = heap.allocate(size).unwrap();
        assert!(unsafe { usable_size(big) } >= size);

        // The inserted block satisfies the second search; nothing else grows.
        let after = heap.stats();
        assert_eq!(after.arena_bytes - before.arena_bytes, 65 * HEADER_SIZE);
        assert_eq!(after.free_bytes, before.free_bytes);

        unsafe {
            heap.release(big);
            heap.release(small);
        }
        assert_eq!(heap.validate(), Ok(()));
    }

    #[test]
    fn exhaustion_leaves_the_heap_usable() {
        let heap = heap(4096).with_min_batch(1);
        assert!(heap.allocate(1 << 20).is_err());
        let p = heap.allocate(32).unwrap();
        unsafe { heap.release(p) };
    }

    #[test]
    fn threads_share_one_list() {
        let heap = SplitLockHeap::new(brk::leaked(8 << 20), SpinLock::new(), SpinLock::new())
            .with_min_batch(128);

        thread::scope(|s| {
            for t in 1..=4u8 {
                let heap = &heap;
                s.spawn(move || {
                    let blocks: Vec<_> = (0..300usize)
                        .map(|i| {
                            let size = (i * 29 + t as usize) % 700;
                            let p = heap.allocate(size).unwrap();
                            unsafe { p.as_ptr().write_bytes(t, size) };
                            (p, size)
                        })
                        .collect();
                    for (p, size) in blocks {
                        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
                        assert!(bytes.iter().all(|&b| b == t));
                        unsafe { heap.release(p) };
                    }
                });
            }
        });

        let stats = heap.stats();
        assert_eq!(heap.validate(), Ok(()));
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, stats.arena_bytes - HEADER_SIZE);
    }
}
