//! The global-lock heap: one lock around the free list, one around the break.

use super::*;
use crate::{
    arena::{self, Arena},
    engine::{self, ListAccess, Missing},
    freelist::FreeList,
    header::{Header, SHARED},
    mutex::Mutex,
};

/// A heap whose single free list is guarded by one lock for the whole of
/// every search, carve, and insertion.
///
/// Growing the arena is the one thing that happens outside that lock: the list
/// lock is dropped, the break is extended under its own lock, and then the
/// list lock is reacquired to insert the new block and resume the search in
/// that same critical section.
pub struct GlobalLockHeap<B, L> {
    list: Mutex<FreeList, L>,
    arena: Arena<B, L>,
}

impl<B, L> GlobalLockHeap<B, L>
where
    B: ProgramBreak,
    L: Lock,
{
    /// Create a new, empty heap growing from `brk`.
    ///
    /// Nothing is requested from `brk` until the first allocation.
    pub const fn new(brk: B, list_lock: L, break_lock: L) -> Self {
        GlobalLockHeap {
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
    ///
    /// Fails only when the program break cannot be extended any further.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        engine::allocate(&mut Reacquire(&self.list), &self.arena, SHARED, size)
    }

    /// Return a block to the heap, merging it with any free neighbours.
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

impl<B, L> RawHeap for GlobalLockHeap<B, L>
where
    B: ProgramBreak,
    L: Lock,
{
    #[inline]
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        GlobalLockHeap::allocate(self, size)
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>) {
        GlobalLockHeap::release(self, ptr);
    }
}

/// Every list access takes the lock afresh; a refill inserts and searches
/// again without letting go.
struct Reacquire<'a, L>(&'a Mutex<FreeList, L>);

impl<L> ListAccess for Reacquire<'_, L>
where
    L: Lock,
{
    fn search(&mut self, units: usize) -> Result<NonNull<Header>, Missing> {
        self.0.lock().search(units)
    }

    fn refill(&mut self, grown: NonNull<Header>, units: usize) -> Option<NonNull<Header>> {
        self.0.lock().refill(grown, units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, vec::Vec};

    fn heap(bytes: usize) -> GlobalLockHeap<FixedBreak, SingleThreadedLock> {
        GlobalLockHeap::new(
            brk::leaked(bytes),
            SingleThreadedLock::new(),
            SingleThreadedLock::new(),
        )
    }

    #[test]
    fn round_trip_restores_free_capacity() {
        let heap = heap(1 << 16);
        // Bootstrap the list so the first growth is out of the picture.
        let warm = heap.allocate(8).unwrap();
        unsafe { heap.release(warm) };

        for size in [0, 1, 15, 16, 17, 100, 1000] {
            let before = heap.stats();
            let p = heap.allocate(size).unwrap();
            assert!(unsafe { usable_size(p) } >= size);
            unsafe { heap.release(p) };
            assert_eq!(heap.stats(), before, "size {size}");

            // Enough capacity remains, so no further growth.
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

        // Exactly one growth of exactly the requested units.
        let after = heap.stats();
        assert_eq!(after.arena_bytes - before.arena_bytes, 65 * HEADER_SIZE);

        unsafe {
            heap.release(big);
            heap.release(small);
        }
        assert_eq!(heap.validate(), Ok(()));
    }

    #[test]
    fn exhaustion_returns_an_error_and_releases_every_lock() {
        let heap = heap(8 * 1024).with_min_batch(1);
        assert_eq!(heap.allocate(64 * 1024), Err(AllocError));
        assert_eq!(heap.allocate(usize::MAX), Err(AllocError));

        // `SingleThreadedLock` panics on re-entry, so these would blow up if
        // the failed paths above had left a lock held.
        let p = heap.allocate(64).unwrap();
        unsafe { heap.release(p) };
        assert_eq!(heap.stats().free_blocks, 1);
    }

    #[test]
    fn freed_space_is_reused_before_growing() {
        let heap = heap(1 << 16).with_min_batch(64);
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        let grown = heap.stats().arena_bytes;

        unsafe { heap.release(a) };
        let c = heap.allocate(100).unwrap();
        assert_eq!(heap.stats().arena_bytes, grown);
        assert_ne!(c, b);

        unsafe {
            heap.release(b);
            heap.release(c);
        }
    }

    #[test]
    fn live_allocations_never_overlap() {
        let heap = heap(1 << 20).with_min_batch(32);
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

        for i in 0..200usize {
            let size = (i * 37) % 300;
            let p = heap.allocate(size).unwrap();
            assert_eq!(p.as_ptr() as usize % HEADER_ALIGN, 0);
            unsafe { p.as_ptr().write_bytes(i as u8, size) };
            live.push((p, size));

            // Release every third allocation to keep the list busy.
            if i % 3 == 2 {
                let (p, _) = live.remove(i % live.len());
                unsafe { heap.release(p) };
            }
        }

        for (i, &(a, a_len)) in live.iter().enumerate() {
            let a_start = a.as_ptr() as usize;
            for &(b, b_len) in &live[i + 1..] {
                let b_start = b.as_ptr() as usize;
                assert!(
                    a_start + a_len.max(1) <= b_start || b_start + b_len.max(1) <= a_start,
                    "{a:p}+{a_len} overlaps {b:p}+{b_len}"
                );
            }
        }

        for (p, _) in live {
            unsafe { heap.release(p) };
        }
        let stats = heap.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, stats.arena_bytes - HEADER_SIZE);
    }

    #[test]
    fn threads_share_one_list() {
        let heap = GlobalLockHeap::new(brk::leaked(8 << 20), SpinLock::new(), SpinLock::new())
            .with_min_batch(256);

        thread::scope(|s| {
            for t in 0..4u8 {
                let heap = &heap;
                s.spawn(move || {
                    let mut mine = Vec::new();
                    for i in 0..500usize {
                        let size = 1 + (i * 13 + t as usize * 7) % 512;
                        let p = heap.allocate(size).unwrap();
                        unsafe { p.as_ptr().write_bytes(t, size) };
                        mine.push((p, size));
                        if i % 2 == 1 {
                            let (p, size) = mine.swap_remove(i % mine.len());
                            let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
                            assert!(bytes.iter().all(|&b| b == t), "block clobbered");
                            unsafe { heap.release(p) };
                        }
                    }
                    for (p, size) in mine {
                        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
                        assert!(bytes.iter().all(|&b| b == t), "block clobbered");
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
