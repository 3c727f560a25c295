#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

#[cfg(any(test, feature = "std"))]
extern crate std;

use cfg_if::cfg_if;
use core::{alloc::Layout, ptr::NonNull};

mod adapter;
mod arena;
mod brk;
mod engine;
mod freelist;
mod header;
mod local;
mod locked;
mod mutex;
mod split;

pub use adapter::{HeapAllocator, RawHeap};
pub use arena::DEFAULT_MIN_BATCH_UNITS;
pub use brk::{FixedBreak, ProgramBreak};
pub use freelist::HeapStats;
pub use header::{usable_size, HEADER_ALIGN, HEADER_SIZE};
pub use local::{ForeignBlock, LocalArena, ThreadLocalHeap};
pub use locked::GlobalLockHeap;
pub use mutex::{Lock, SingleThreadedLock, SpinLock};
pub use split::SplitLockHeap;

cfg_if! {
    if #[cfg(unix)] {
        mod process;
        pub use brk::Sbrk;
        pub use process::{
            allocate_locked, allocate_split, release_locked, release_split, Locked, Split,
        };

        #[cfg(feature = "std")]
        pub use process::{allocate_thread_local, release_thread_local, PerThread};
    }
}

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
