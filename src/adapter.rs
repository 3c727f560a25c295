use super::*;
use core::{alloc::GlobalAlloc, ptr};

/// A heap that hands out maximally aligned blocks by byte count.
///
/// Implemented by every heap that can be shared across threads by reference.
pub trait RawHeap {
    /// Allocate at least `size` bytes aligned to [`HEADER_ALIGN`].
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Return a block to the heap.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this same heap and must
    /// not have been released since.
    unsafe fn release(&self, ptr: NonNull<u8>);
}

impl<H> RawHeap for &H
where
    H: RawHeap + ?Sized,
{
    #[inline]
    fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate(size)
    }

    #[inline]
    unsafe fn release(&self, ptr: NonNull<u8>) {
        (**self).release(ptr);
    }
}

/// A wrapper around a heap `H` that speaks `Layout`, so it can back
/// collections through [`Allocator`] or the whole program through
/// [`GlobalAlloc`].
///
/// Layouts aligned beyond [`HEADER_ALIGN`] are refused.
#[derive(Debug, Default)]
pub struct HeapAllocator<H>(pub H);

impl<H> HeapAllocator<H>
where
    H: RawHeap,
{
    #[inline]
    fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.align() > HEADER_ALIGN {
            return Err(AllocError);
        }
        self.0.allocate(layout.size())
    }
}

unsafe impl<H> Allocator for HeapAllocator<H>
where
    H: RawHeap,
{
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        let ptr = self.allocate_layout(layout)?;
        // Safety: `ptr` was just handed out by our heap.
        let len = unsafe { usable_size(ptr) };
        Ok(NonNull::slice_from_raw_parts(ptr, len))
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        self.0.release(ptr);
    }
}

unsafe impl<H> GlobalAlloc for HeapAllocator<H>
where
    H: RawHeap,
{
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_layout(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.0.release(ptr);
        }
    }
}
