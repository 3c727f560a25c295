//! The block header stored immediately before every block.
//!
//! ```text
//! +---------------------+ <------+
//! |        next         |        |
//! +---------------------+        |
//! |        size         |        | -> Header (one unit)
//! +---------------------+        |
//! |        owner        |        |
//! +---------------------+ <------+ <-- pointer handed to the caller
//! |       Payload       |        |
//! |         ...         |        | -> (size - 1) units
//! +---------------------+ <------+
//! ```
//!
//! The allocator exclusively owns the header; the caller exclusively owns the
//! payload once it has been returned. `next` is only meaningful while the block
//! sits on a free list.

use core::{mem, ptr::NonNull};

/// Identity of the arena a block was grown for.
pub(crate) type Owner = usize;

/// Owner stamp for blocks whose free list is shared by every thread.
pub(crate) const SHARED: Owner = 0;

/// Alignment of every header, and therefore of every payload we return.
pub const HEADER_ALIGN: usize = 16;

/// Size of one header in bytes. This is also the allocation granularity: every
/// block spans a whole number of header-sized units.
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

#[derive(Clone, Copy, Debug)]
#[repr(C, align(16))]
pub(crate) struct Header {
    /// Next free block in address order. Dangling while the block is allocated.
    pub(crate) next: NonNull<Header>,
    /// Units spanned by the block, header included. Zero only for the sentinel.
    pub(crate) size: usize,
    /// Stamped at growth time and inherited by carved tails.
    pub(crate) owner: Owner,
}

const _: () = assert!(mem::align_of::<Header>() == HEADER_ALIGN);
const _: () = assert!(HEADER_SIZE % HEADER_ALIGN == 0);

impl Header {
    pub(crate) const fn new(size: usize, owner: Owner) -> Self {
        Header {
            next: NonNull::dangling(),
            size,
            owner,
        }
    }

    /// Write a fresh header at `at`.
    ///
    /// ### Safety
    ///
    /// `at` must be valid for writes and aligned to `HEADER_ALIGN`.
    #[inline]
    pub(crate) unsafe fn write(at: NonNull<Header>, size: usize, owner: Owner) -> NonNull<Header> {
        at.as_ptr().write(Header::new(size, owner));
        at
    }
}

/// Number of header units needed to satisfy a request for `size` payload bytes,
/// header included. `None` if the block could not be described by a `Layout`.
#[inline]
pub(crate) fn units_for(size: usize) -> Option<usize> {
    let units = size.checked_add(HEADER_SIZE - 1)? / HEADER_SIZE + 1;
    let bytes = units.checked_mul(HEADER_SIZE)?;
    (bytes <= isize::MAX as usize).then_some(units)
}

/// The payload pointer of `block`.
#[inline]
pub(crate) fn payload(block: NonNull<Header>) -> NonNull<u8> {
    // Safety: every block spans at least its own header, so one past the
    // header is still inside (or one past the end of) the block.
    unsafe { NonNull::new_unchecked(block.as_ptr().add(1)).cast() }
}

/// The header of the block whose payload starts at `ptr`.
///
/// ### Safety
///
/// `ptr` must have been returned by one of this crate's heaps.
#[inline]
pub(crate) unsafe fn from_payload(ptr: NonNull<u8>) -> NonNull<Header> {
    NonNull::new_unchecked(ptr.cast::<Header>().as_ptr().sub(1))
}

/// The address one past the end of `block`. Only ever compared, never read.
///
/// ### Safety
///
/// `block` must point to a valid header.
#[inline]
pub(crate) unsafe fn end(block: NonNull<Header>) -> *mut Header {
    block.as_ptr().wrapping_add((*block.as_ptr()).size)
}

/// Bytes the caller may use behind a pointer returned by any heap in this
/// crate. Always at least the size that was requested.
///
/// # Safety
///
/// `ptr` must have been returned by one of this crate's heaps and must not have
/// been released yet.
pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
    let block = from_payload(ptr);
    ((*block.as_ptr()).size - 1) * HEADER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_cover_payload_and_header() {
        assert_eq!(units_for(0), Some(1));
        for size in 1..=HEADER_SIZE {
            assert_eq!(units_for(size), Some(2));
        }
        assert_eq!(units_for(HEADER_SIZE + 1), Some(3));
        assert_eq!(units_for(10 * HEADER_SIZE), Some(11));
    }

    #[test]
    fn oversized_requests_have_no_units() {
        assert_eq!(units_for(usize::MAX), None);
        assert_eq!(units_for(isize::MAX as usize), None);
    }

    #[test]
    fn payload_round_trips_to_header() {
        let mut slab = [Header::new(3, SHARED); 3];
        let block = NonNull::from(&mut slab[0]);
        let ptr = payload(block);
        assert_eq!(ptr.as_ptr() as usize, block.as_ptr() as usize + HEADER_SIZE);
        assert_eq!(ptr.as_ptr() as usize % HEADER_ALIGN, 0);
        unsafe {
            assert_eq!(from_payload(ptr), block);
            assert_eq!(usable_size(ptr), 2 * HEADER_SIZE);
            assert_eq!(end(block), block.as_ptr().add(3));
        }
    }
}
