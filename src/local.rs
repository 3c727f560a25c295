//! Per-thread heaps.
//!
//! A [`ThreadLocalHeap`] owns nothing but the program break. Each thread that
//! wants to allocate from it opens its own [`LocalArena`], a private free list
//! that is touched without any locking at all. Only growth goes through the
//! heap, because the break is a single process-wide resource.
//!
//! Every block carries the id of the arena that grew it. Releasing a block
//! into a different arena would splice one thread's memory into another
//! thread's list, so the release path checks that id first.

use super::*;
use crate::{
    arena::{self, Arena},
    engine,
    freelist::FreeList,
    header::{self, Owner},
};
use core::{
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Arena ids handed out so far. Zero is reserved for the shared heaps.
static NEXT_OWNER: AtomicUsize = AtomicUsize::new(1);

fn next_owner() -> Owner {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

/// The growth side of a family of per-thread arenas.
pub struct ThreadLocalHeap<B, L> {
    arena: Arena<B, L>,
}

impl<B, L> ThreadLocalHeap<B, L>
where
    B: ProgramBreak,
    L: Lock,
{
    /// Create a new heap growing from `brk`, with `break_lock` serializing
    /// growth across every arena opened on it.
    pub const fn new(brk: B, break_lock: L) -> Self {
        ThreadLocalHeap {
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

    /// Open a fresh private arena for the calling thread.
    ///
    /// The arena starts empty and grows on first use. Dropping it strands its
    /// free blocks: the break is never given back.
    pub fn local(&self) -> LocalArena<'_, B, L> {
        LocalArena {
            heap: self,
            list: FreeList::new(),
            owner: next_owner(),
            _not_send: PhantomData,
        }
    }
}

/// One thread's private free list over a shared [`ThreadLocalHeap`].
///
/// Not `Send`: an arena stays on the thread that opened it.
pub struct LocalArena<'a, B, L> {
    heap: &'a ThreadLocalHeap<B, L>,
    list: FreeList,
    owner: Owner,
    _not_send: PhantomData<*const ()>,
}

impl<B, L> LocalArena<'_, B, L>
where
    B: ProgramBreak,
    L: Lock,
{
    /// Allocate at least `size` bytes aligned to [`HEADER_ALIGN`].
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        engine::allocate(&mut self.list, &self.heap.arena, self.owner, size)
    }

    /// Return a block to this arena.
    ///
    /// A block that some other arena handed out is left alone and a warning is
    /// logged; it stays allocated for good. Use
    /// [`try_release`](Self::try_release) to find out.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`LocalArena::allocate`] on some arena
    /// and must not have been released since.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        if let Err(foreign) = self.try_release(ptr) {
            log::warn!("dropping release: {foreign}");
        }
    }

    /// Return a block to this arena, or report that it belongs to another
    /// one.
    ///
    /// # Safety
    ///
    /// Same as [`release`](Self::release).
    pub unsafe fn try_release(&mut self, ptr: NonNull<u8>) -> Result<(), ForeignBlock> {
        let block = header::from_payload(ptr);
        if (*block.as_ptr()).owner != self.owner {
            return Err(ForeignBlock { ptr });
        }
        engine::release(&mut self.list, ptr);
        Ok(())
    }

    /// A snapshot of this arena's bookkeeping.
    pub fn stats(&self) -> HeapStats {
        self.list.stats()
    }

    /// Check this arena's free-list invariants.
    pub fn validate(&self) -> Result<(), &'static str> {
        self.list.validate()
    }
}

impl<B, L> fmt::Debug for LocalArena<'_, B, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalArena")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// A release was attempted on an arena that did not hand out the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ForeignBlock {
    ptr: NonNull<u8>,
}

impl ForeignBlock {
    /// The rejected payload pointer.
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }
}

impl fmt::Display for ForeignBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p} belongs to another thread's arena", self.ptr)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ForeignBlock {}
