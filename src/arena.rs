//! Arena growth: turning fresh program-break space into free blocks.

use crate::{
    brk::ProgramBreak,
    header::{Header, Owner, HEADER_SIZE},
    mutex::{Lock, Mutex},
};
use core::ptr::NonNull;

/// Growth requests smaller than this many header units are batched up towards
/// it, so that a run of tiny allocations does not extend the break once per
/// call.
pub const DEFAULT_MIN_BATCH_UNITS: usize = 1024;

pub(crate) struct Arena<B, L> {
    /// The break primitive is not safe for concurrent use, and it has nothing
    /// to do with the shape of any free list, so it gets its own lock.
    brk: Mutex<B, L>,
    pub(crate) min_batch: usize,
}

/// Validate a minimum growth batch handed to a heap constructor.
pub(crate) const fn checked_batch(units: usize) -> usize {
    assert!(units > 0, "the minimum growth batch must be at least one unit");
    units
}

impl<B, L> Arena<B, L>
where
    B: ProgramBreak,
    L: Lock,
{
    pub(crate) const fn new(brk: B, lock: L) -> Self {
        Arena {
            brk: Mutex::new(brk, lock),
            min_batch: DEFAULT_MIN_BATCH_UNITS,
        }
    }

    /// Scale a small request up to the largest multiple of itself that still
    /// fits in the minimum batch.
    #[inline]
    pub(crate) fn batch_units(&self, units: usize) -> usize {
        if units < self.min_batch {
            units * (self.min_batch / units)
        } else {
            units
        }
    }

    /// Extend the break by at least `units` header units and return the new
    /// space as a single block stamped with `owner`, ready to be handed to a
    /// free list.
    pub(crate) fn grow(&self, units: usize, owner: Owner) -> Option<NonNull<Header>> {
        debug_assert!(units > 0);
        let units = self.batch_units(units);
        let bytes = units.checked_mul(HEADER_SIZE)?;

        let start = self.brk.lock().extend(bytes);
        let Some(start) = start else {
            log::warn!("program break exhausted: cannot grow the arena by {bytes} bytes");
            return None;
        };

        log::trace!("grew the arena by {bytes} bytes at {start:p} for owner {owner}");
        // Safety: `ProgramBreak` guarantees the range is fresh, writable, and
        // aligned for a header.
        Some(unsafe { Header::write(start.cast(), units, owner) })
    }
}
