//! The allocation and release paths shared by every heap variant.
//!
//! Variants differ only in how they reach their free list: through a lock,
//! through two short critical sections, or directly because the list is
//! private to the calling thread. [`ListAccess`] captures exactly that.

use crate::{
    arena::Arena,
    brk::ProgramBreak,
    freelist::FreeList,
    header::{self, Header, Owner},
    mutex::Lock,
    AllocError,
};
use core::ptr::NonNull;

/// A best-fit search came up empty.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Missing {
    /// The list has no sentinel yet, so the next growth must reserve a unit
    /// for it.
    pub(crate) needs_sentinel: bool,
}

/// How an allocation reaches its free list.
///
/// Each method is one critical section. Implementations must not hold any
/// lock between calls: the core grows the arena between `search` and
/// `refill`, and growth must never run under a free-list lock.
pub(crate) trait ListAccess {
    /// Search the list for `units` and take the block on success.
    fn search(&mut self, units: usize) -> Result<NonNull<Header>, Missing>;

    /// Hand a freshly grown block to the list. May go on to search within the
    /// same critical section; `None` sends the core back to `search`.
    fn refill(&mut self, grown: NonNull<Header>, units: usize) -> Option<NonNull<Header>>;
}

impl ListAccess for FreeList {
    #[inline]
    fn search(&mut self, units: usize) -> Result<NonNull<Header>, Missing> {
        unsafe { self.take_best(units) }.ok_or(Missing {
            needs_sentinel: !self.is_ready(),
        })
    }

    #[inline]
    fn refill(&mut self, grown: NonNull<Header>, units: usize) -> Option<NonNull<Header>> {
        unsafe {
            self.adopt(grown);
            self.take_best(units)
        }
    }
}

/// Search, carve, and grow-then-retry until `size` bytes are found or the
/// break is exhausted.
pub(crate) fn allocate<A, B, L>(
    list: &mut A,
    arena: &Arena<B, L>,
    owner: Owner,
    size: usize,
) -> Result<NonNull<u8>, AllocError>
where
    A: ListAccess,
    B: ProgramBreak,
    L: Lock,
{
    let units = header::units_for(size).ok_or(AllocError)?;
    loop {
        let missing = match list.search(units) {
            Ok(block) => return Ok(header::payload(block)),
            Err(missing) => missing,
        };

        if missing.needs_sentinel {
            log::debug!("bootstrapping the free list of owner {owner}");
        }
        let grown = arena
            .grow(units + usize::from(missing.needs_sentinel), owner)
            .ok_or(AllocError)?;

        if let Some(block) = list.refill(grown, units) {
            return Ok(header::payload(block));
        }
    }
}

/// Put the block behind `ptr` back on `list`.
///
/// ### Safety
///
/// `ptr` must have been returned by an allocation against `list` and must not
/// have been released since.
#[inline]
pub(crate) unsafe fn release(list: &mut FreeList, ptr: NonNull<u8>) {
    list.insert(header::from_payload(ptr));
}
