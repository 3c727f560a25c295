//! Provides a mutex container type similar to `std::sync::Mutex<T>` but
//! parameterized over any type `L` that implements the `Lock` trait. An
//! allocator cannot lean on `std::sync::Mutex` without risking re-entry into
//! itself, and the crate is `no_std`.

use core::{
    cell::{Cell, UnsafeCell},
    mem,
    ops::{Deref, DerefMut},
};
use spin::mutex::SpinMutex;

/// A trait for providing mutual exclusion.
///
/// If you do not need to share a heap between threads, you may use
/// [`SingleThreadedLock`], which is the moral equivalent of a `RefCell`.
/// Otherwise use [`SpinLock`] or bring your own.
///
/// # Safety
///
/// * If the implementation type is `Sync`, then a heap using this lock will be
///   `Sync`, and therefore this method must provide actual mutual exclusion
///   and prevent against unsynchronized accesses.
///
/// * Even in single-threaded contexts, where real synchronization is not
///   required, this type must prevent recursive locking and re-entering the
///   lock when it is already held. The prevention may be a panic, abort,
///   infinite loop, or etc...
///
/// * Implementations must not allocate.
pub unsafe trait Lock {
    /// Lock this mutex.
    ///
    /// If it is already locked, this must result in a panic, abort, infinite
    /// loop, or etc... and locking must not succeed.
    fn lock(&self);

    /// Unlock this mutex.
    fn unlock(&self);
}

/// A single-threaded implementation of [`Lock`].
///
/// This is effectively a `RefCell`: it panics instead of blocking, which makes
/// it handy in tests for proving that every exit path releases its lock.
#[derive(Debug)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get());
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadedLock {
    /// Construct a new `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

/// A spin lock backed by [`spin::mutex::SpinMutex`].
///
/// Critical sections in this crate are short list walks and never include a
/// system call, so spinning is cheaper than parking.
#[derive(Debug)]
pub struct SpinLock {
    raw: SpinMutex<()>,
}

unsafe impl Lock for SpinLock {
    #[inline]
    fn lock(&self) {
        // The guard is released by `unlock`, not by its destructor.
        mem::forget(self.raw.lock());
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.raw.is_locked());
        // Safety: `Lock::unlock` is only called by the holder of the lock.
        unsafe { self.raw.force_unlock() }
    }
}

impl Default for SpinLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    /// Construct a new, unlocked `SpinLock`.
    #[inline]
    pub const fn new() -> Self {
        SpinLock {
            raw: SpinMutex::new(()),
        }
    }
}

pub(crate) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: if `T` and `L` can be sent between threads, then the mutex can as
// well. The API, implementation, and borrow checker do not allow for
// unsynchronized accesses in the face of sending these across threads.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `Lock` trait's implementation contract.
//
// Additionally, `T` must be `Send` because locking a mutex from another thread
// and getting a mutex guard allows getting `&mut T`, which can be used to
// `mem::replace()` the `T`, effectively sending it between threads.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(crate) const fn new(value: T, lock: L) -> Self {
        let value = UnsafeCell::new(value);
        Mutex { lock, value }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }
}

pub(crate) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<'a, T, L> Drop for MutexGuard<'a, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, vec::Vec};

    #[test]
    #[should_panic]
    fn single_threaded_lock_rejects_reentry() {
        let mutex = Mutex::new(0u32, SingleThreadedLock::new());
        let _outer = mutex.lock();
        let _inner = mutex.lock();
    }

    #[test]
    fn guard_drop_unlocks() {
        let mutex = Mutex::new(1u32, SingleThreadedLock::new());
        *mutex.lock() += 1;
        assert_eq!(*mutex.lock(), 2);
    }

    #[test]
    fn spin_lock_is_released_with_its_guard() {
        let mutex = Mutex::new(7u32, SpinLock::new());
        {
            let mut guard = mutex.lock();
            assert!(mutex.lock.raw.is_locked());
            *guard += 1;
        }
        assert!(!mutex.lock.raw.is_locked());
        assert_eq!(*mutex.lock(), 8);
        assert!(!mutex.lock.raw.is_locked());
    }

    #[test]
    fn spin_lock_excludes_other_threads() {
        let mutex = Arc::new(Mutex::new(0usize, SpinLock::new()));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 40_000);
    }
}
