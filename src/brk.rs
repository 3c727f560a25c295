//! Program-break providers: where fresh arena space comes from.
//!
//! Heaps only ever ask for more bytes at the end of their arena and never give
//! anything back, so the whole collaborator boundary is a single `extend`
//! operation.

use crate::header::HEADER_ALIGN;
use core::ptr::NonNull;

/// A source of fresh, contiguous memory shaped like `sbrk(2)`.
///
/// # Safety
///
/// * A successful `extend(bytes)` must return a pointer aligned to
///   [`HEADER_ALIGN`](crate::HEADER_ALIGN) that is valid for reads and writes
///   of `bytes` bytes for the rest of the program.
///
/// * Ranges returned by distinct calls must never overlap.
///
/// * `extend` must not allocate through the heap that owns this provider.
pub unsafe trait ProgramBreak {
    /// Extend the break by `bytes` bytes and return the start of the new range,
    /// or `None` when no more address space is available.
    fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>>;
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use crate::mutex::{Mutex, SpinLock};

        /// The process's real program break, grown with `sbrk(2)`.
        ///
        /// `sbrk` is not safe to call concurrently and the break is a single
        /// process-wide resource, so every `Sbrk` shares one lock no matter
        /// which heap it belongs to.
        #[derive(Clone, Copy, Debug, Default)]
        pub struct Sbrk;

        static BREAK: Mutex<(), SpinLock> = Mutex::new((), SpinLock::new());

        const SBRK_FAILED: *mut libc::c_void = usize::MAX as *mut libc::c_void;

        unsafe impl ProgramBreak for Sbrk {
            fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>> {
                let bytes = isize::try_from(bytes).ok()?;
                let _break = BREAK.lock();
                unsafe { sbrk_aligned(bytes) }
            }
        }

        /// Extend the break by `bytes`, first padding it up to `HEADER_ALIGN`.
        ///
        /// The break only stays aligned between our calls if nobody else moves
        /// it, so the padding is recomputed every time.
        unsafe fn sbrk_aligned(bytes: isize) -> Option<NonNull<u8>> {
            let current = libc::sbrk(0);
            if current == SBRK_FAILED {
                return None;
            }

            let pad = (current as usize).wrapping_neg() % HEADER_ALIGN;
            let total = bytes.checked_add(pad as isize)?;
            let base = libc::sbrk(total as libc::intptr_t);
            if base == SBRK_FAILED {
                return None;
            }

            let base = base as usize;
            let start = (base + HEADER_ALIGN - 1) & !(HEADER_ALIGN - 1);
            let have = base + total as usize;
            let want = start + bytes as usize;

            // Someone moved the break between our two calls, so the padding
            // we asked for is short.
            if want > have {
                let extra = libc::sbrk((want - have) as libc::intptr_t);
                if extra == SBRK_FAILED || extra as usize != have {
                    return None;
                }
            }

            NonNull::new(start as *mut u8)
        }
    }
}

/// A break that bumps through a caller-provided byte region.
///
/// Useful where there is no `sbrk`, for carving a heap out of a static buffer,
/// and for tests that need deterministic addresses and a hard memory limit.
#[derive(Debug)]
pub struct FixedBreak {
    start: *mut u8,
    len: usize,
    used: usize,
}

// Safety: the region is exclusively owned by this break.
unsafe impl Send for FixedBreak {}

impl FixedBreak {
    /// Create a break over the given region.
    pub fn new(region: &'static mut [u8]) -> Self {
        unsafe { Self::from_raw_parts(region.as_mut_ptr(), region.len()) }
    }

    /// Create a break over `len` bytes starting at `ptr`. Leading bytes are
    /// skipped until the first `HEADER_ALIGN`-aligned address.
    ///
    /// # Safety
    ///
    /// The region must be valid for reads and writes, must outlive every heap
    /// using this break and every pointer those heaps hand out, and must not be
    /// accessed by anything else.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        let pad = ptr.align_offset(HEADER_ALIGN).min(len);
        FixedBreak {
            start: ptr.add(pad),
            len: len - pad,
            used: 0,
        }
    }

    /// Bytes still available for growth.
    pub fn remaining(&self) -> usize {
        self.len - self.used
    }
}

unsafe impl ProgramBreak for FixedBreak {
    fn extend(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        debug_assert_eq!(bytes % HEADER_ALIGN, 0);
        if bytes > self.remaining() {
            return None;
        }
        let ptr = unsafe { self.start.add(self.used) };
        self.used += bytes;
        NonNull::new(ptr)
    }
}

/// A `FixedBreak` over a leaked, zeroed buffer of `bytes` bytes.
#[cfg(test)]
pub(crate) fn leaked(bytes: usize) -> FixedBreak {
    let region = std::boxed::Box::leak(std::vec![0u8; bytes].into_boxed_slice());
    FixedBreak::new(region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HEADER_SIZE;

    #[test]
    fn fixed_break_aligns_its_start() {
        let region = std::boxed::Box::leak(std::vec![0u8; 256].into_boxed_slice());
        let misaligned = unsafe { region.as_mut_ptr().add(1) };
        let mut brk = unsafe { FixedBreak::from_raw_parts(misaligned, 255) };

        let ptr = brk.extend(HEADER_SIZE).unwrap();
        let addr = ptr.as_ptr() as usize;
        assert_eq!(addr % HEADER_ALIGN, 0);
        assert!(addr >= misaligned as usize);
        assert!(addr + HEADER_SIZE <= region.as_ptr() as usize + 256);
        assert_eq!(brk.remaining(), 255 - (addr - misaligned as usize) - HEADER_SIZE);
    }

    #[test]
    fn fixed_break_is_contiguous_until_exhausted() {
        let mut brk = leaked(4 * HEADER_SIZE + HEADER_ALIGN);
        let a = brk.extend(2 * HEADER_SIZE).unwrap();
        let b = brk.extend(HEADER_SIZE).unwrap();
        assert_eq!(b.as_ptr() as usize, a.as_ptr() as usize + 2 * HEADER_SIZE);

        assert!(brk.extend(8 * HEADER_SIZE).is_none());
        // A failed extension does not consume anything.
        assert!(brk.remaining() >= HEADER_SIZE);
        assert!(brk.extend(HEADER_SIZE).is_some());
    }

    #[cfg(unix)]
    #[test]
    fn sbrk_returns_aligned_writable_memory() {
        let mut brk = Sbrk;
        let ptr = brk.extend(4 * HEADER_SIZE).unwrap();
        assert_eq!(ptr.as_ptr() as usize % HEADER_ALIGN, 0);
        unsafe {
            ptr.as_ptr().write_bytes(0xAB, 4 * HEADER_SIZE);
            assert_eq!(*ptr.as_ptr().add(4 * HEADER_SIZE - 1), 0xAB);
        }
    }

    #[cfg(unix)]
    #[test]
    fn sbrk_refuses_impossible_requests() {
        assert!(Sbrk.extend(usize::MAX).is_none());
    }
}
