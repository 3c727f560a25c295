//! The free-list engine.
//!
//! Free blocks form a circular singly-linked list sorted by ascending address.
//! A size-0 sentinel block, carved off the very first arena growth, keeps the
//! ring non-empty forever. There is no fixed head: a roving cursor remembers
//! where the previous operation left off and the next search starts just past
//! it.
//!
//! ```text
//!                  cursor
//!                    |
//!                    v
//!   +----------+   +------+   +------+   +------+
//!   | sentinel |-->| free |-->| free |-->| free |--+
//!   |  size 0  |   +------+   +------+   +------+  |
//!   +----------+                                 |
//!        ^                                       |
//!        +---------------------------------------+
//! ```
//!
//! Insertion keeps the ring sorted and eagerly merges a released block with
//! its address-adjacent neighbours, so no two free blocks ever touch.

use crate::header::{self, Header, HEADER_SIZE};
use core::ptr::NonNull;

/// A snapshot of a heap's bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes obtained from the program break, sentinel included.
    pub arena_bytes: usize,
    /// Bytes sitting in free blocks, their headers included.
    pub free_bytes: usize,
    /// Number of free blocks, not counting the sentinel.
    pub free_blocks: usize,
}

/// Outcome of a successful best-fit search.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Fit {
    /// A block of exactly the requested size. It is unlinked whole.
    Exact {
        block: NonNull<Header>,
        prev: NonNull<Header>,
    },
    /// The block with the smallest positive remainder. It gets carved.
    Best {
        block: NonNull<Header>,
        prev: NonNull<Header>,
    },
}

pub(crate) struct FreeList {
    /// The roving cursor. `None` until the sentinel is installed.
    cursor: Option<NonNull<Header>>,
    /// Units adopted from arena growth.
    arena_units: usize,
}

// Safety: every node is heap memory owned by this list; nothing about it is
// tied to the thread that built it.
unsafe impl Send for FreeList {}

impl FreeList {
    pub(crate) const fn new() -> Self {
        FreeList {
            cursor: None,
            arena_units: 0,
        }
    }

    /// Has the sentinel been installed yet?
    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        self.cursor.is_some()
    }

    /// Install `sentinel` as the single node of the ring.
    ///
    /// ### Safety
    ///
    /// `sentinel` must be valid for writes of one header and owned by this
    /// list for the rest of its life.
    pub(crate) unsafe fn bootstrap(&mut self, sentinel: NonNull<Header>, owner: header::Owner) {
        debug_assert!(!self.is_ready());
        Header::write(sentinel, 0, owner);
        (*sentinel.as_ptr()).next = sentinel;
        self.cursor = Some(sentinel);
    }

    /// Take ownership of a block fresh from arena growth.
    ///
    /// If the list has no sentinel yet, the first unit of the block becomes
    /// the sentinel and the rest is inserted.
    ///
    /// ### Safety
    ///
    /// `grown` must be a freshly grown block, not on any list, that nothing
    /// else references.
    pub(crate) unsafe fn adopt(&mut self, grown: NonNull<Header>) {
        let Header { size, owner, .. } = *grown.as_ptr();
        self.arena_units += size;

        let block = if self.is_ready() {
            grown
        } else {
            debug_assert!(size >= 2, "no room for the sentinel in {size} units");
            let rest = NonNull::new_unchecked(grown.as_ptr().add(1));
            Header::write(rest, size - 1, owner);
            self.bootstrap(grown, owner);
            rest
        };
        self.insert(block);
    }

    /// Best-fit search over one full revolution of the ring, starting just past
    /// the cursor and visiting the cursor last.
    ///
    /// An exact fit wins immediately. Otherwise the first block with the
    /// smallest positive remainder wins.
    pub(crate) unsafe fn find_best(&self, units: usize) -> Option<Fit> {
        debug_assert!(units > 0);
        let start = self.cursor?;

        let mut prev = start;
        let mut best: Option<(NonNull<Header>, NonNull<Header>, usize)> = None;
        loop {
            let block = (*prev.as_ptr()).next;
            let size = (*block.as_ptr()).size;

            if size == units {
                return Some(Fit::Exact { block, prev });
            }
            if size > units {
                let remainder = size - units;
                if best.map_or(true, |(_, _, r)| remainder < r) {
                    best = Some((block, prev, remainder));
                }
            }

            if block == start {
                break;
            }
            prev = block;
        }

        best.map(|(block, prev, _)| Fit::Best { block, prev })
    }

    /// Hand out the block picked by `find_best`. The cursor moves to the
    /// predecessor of the picked block.
    pub(crate) unsafe fn take(&mut self, fit: Fit, units: usize) -> NonNull<Header> {
        match fit {
            Fit::Exact { block, prev } => {
                (*prev.as_ptr()).next = (*block.as_ptr()).next;
                (*block.as_ptr()).next = NonNull::dangling();
                self.cursor = Some(prev);
                block
            }
            Fit::Best { block, prev } => {
                self.cursor = Some(prev);
                Self::carve(block, units)
            }
        }
    }

    /// Search and take in one go.
    #[inline]
    pub(crate) unsafe fn take_best(&mut self, units: usize) -> Option<NonNull<Header>> {
        let fit = self.find_best(units)?;
        Some(self.take(fit, units))
    }

    /// Split `units` off the tail of `block`. The shrunken head stays on the
    /// list at its original address.
    pub(crate) unsafe fn carve(block: NonNull<Header>, units: usize) -> NonNull<Header> {
        let head = &mut *block.as_ptr();
        debug_assert!(head.size > units);
        head.size -= units;
        let tail = NonNull::new_unchecked(block.as_ptr().add(head.size));
        Header::write(tail, units, head.owner)
    }

    /// Insert `block` at its address-ordered position, merging it with the
    /// free blocks directly above and below it. The cursor is left at the
    /// predecessor of the insertion point.
    ///
    /// ### Safety
    ///
    /// The list must be ready, and `block` must be a valid block owned by the
    /// caller that is not already free.
    pub(crate) unsafe fn insert(&mut self, block: NonNull<Header>) {
        let Some(start) = self.cursor else {
            debug_assert!(false, "insert into a free list without a sentinel");
            return;
        };

        // Find `temp` such that `block` sits between `temp` and `temp.next`,
        // taking the wraparound from the highest address back to the lowest
        // into account.
        let mut temp = start;
        loop {
            let next = (*temp.as_ptr()).next;
            let between = block > temp && block < next;
            let past_wrap = temp >= next && (block > temp || block < next);
            if between || past_wrap {
                break;
            }
            temp = next;
            if temp == start {
                debug_assert!(false, "{block:p} is already on the free list");
                return;
            }
        }

        let next = (*temp.as_ptr()).next;
        let b = &mut *block.as_ptr();

        // Upper coalescing. The sentinel is never absorbed.
        if header::end(block) == next.as_ptr() && (*next.as_ptr()).size != 0 {
            debug_assert_eq!(b.owner, (*next.as_ptr()).owner);
            b.size += (*next.as_ptr()).size;
            b.next = (*next.as_ptr()).next;
        } else {
            b.next = next;
        }

        // Lower coalescing.
        let t = &mut *temp.as_ptr();
        if t.size != 0 && header::end(temp) == block.as_ptr() {
            debug_assert_eq!(t.owner, b.owner);
            t.size += b.size;
            t.next = b.next;
        } else {
            t.next = block;
        }

        self.cursor = Some(temp);
        debug_assert_eq!(self.validate(), Ok(()), "after inserting {block:p}");
    }

    /// Every node of the ring, in traversal order, sentinel included.
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            start: self.cursor,
            next: self.cursor.map(|c| unsafe { (*c.as_ptr()).next }),
            _list: self,
        }
    }

    pub(crate) fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            arena_bytes: self.arena_units * HEADER_SIZE,
            ..HeapStats::default()
        };
        for block in self.iter() {
            let size = unsafe { (*block.as_ptr()).size };
            if size != 0 {
                stats.free_bytes += size * HEADER_SIZE;
                stats.free_blocks += 1;
            }
        }
        stats
    }

    /// Check the structural invariants of the ring: it closes, holds exactly
    /// one sentinel, is sorted with a single wraparound, and contains no
    /// overlapping or uncoalesced neighbours.
    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        let Some(start) = self.cursor else {
            return Ok(());
        };

        // Every node but the sentinel spans at least one unit, which bounds
        // the walk even on a corrupted ring.
        let limit = self.arena_units + 1;
        let (mut nodes, mut sentinels, mut wraps) = (0, 0, 0);
        let mut block = start;
        loop {
            nodes += 1;
            if nodes > limit {
                return Err("free list does not close into a ring");
            }

            let (next, size) = unsafe { ((*block.as_ptr()).next, (*block.as_ptr()).size) };
            let end = unsafe { header::end(block) };
            if size == 0 {
                sentinels += 1;
            }

            if next <= block {
                wraps += 1;
            } else if end > next.as_ptr() {
                return Err("free blocks overlap");
            } else if end == next.as_ptr() && size != 0 && unsafe { (*next.as_ptr()).size } != 0 {
                return Err("adjacent free blocks were not coalesced");
            }

            block = next;
            if block == start {
                break;
            }
        }

        if sentinels != 1 {
            return Err("free list must hold exactly one sentinel");
        }
        if wraps != 1 {
            return Err("free list is not sorted by address");
        }
        Ok(())
    }
}

pub(crate) struct Iter<'a> {
    start: Option<NonNull<Header>>,
    next: Option<NonNull<Header>>,
    _list: &'a FreeList,
}

impl Iterator for Iter<'_> {
    type Item = NonNull<Header>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        self.next = if Some(block) == self.start {
            None
        } else {
            Some(unsafe { (*block.as_ptr()).next })
        };
        Some(block)
    }
}
