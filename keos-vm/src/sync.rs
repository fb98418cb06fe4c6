//! SMP-supported spinlock.
//!
//! Every shared structure of the VM core (the frame table, each page, the
//! file I/O lock, the soft page table) is protected by a [`SpinLock`]. The
//! evictor relies on [`SpinLock::try_lock`] to skip pages that are busy
//! elsewhere instead of waiting on them.

use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};
use crossbeam_utils::{Backoff, CachePadded};

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct WouldBlock;

/// A mutual exclusion primitive useful for protecting shared data.
///
/// This spinlock will spin threads waiting for the lock to become available.
/// The data can only be accessed through the guards returned from [`lock`]
/// and [`try_lock`], which guarantees that the data is only ever accessed
/// when the spinlock is locked.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```
/// use keos_vm::sync::SpinLock;
///
/// let spinlock = SpinLock::new(0);
/// let mut guard = spinlock.lock();
/// *guard += 1;
/// guard.unlock();
/// assert_eq!(spinlock.into_inner(), 1);
/// ```
pub struct SpinLock<T: ?Sized> {
    locked: CachePadded<AtomicBool>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: CachePadded::new(AtomicBool::new(false)),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires a spinlock, spinning until it is able to do so.
    ///
    /// Upon returning, the thread is the only thread with the lock held.
    /// Locking a spinlock twice from the same thread deadlocks.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
        SpinLockGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// This function does not block.
    ///
    /// # Errors
    ///
    /// If the spinlock could not be acquired because it is already locked,
    /// then this call will return the [`WouldBlock`] error.
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(SpinLockGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// Returns true if some thread currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a spinlock.
///
/// Release the lock with [`unlock`] once the critical section is over. A
/// guard dropped on an early return (e.g. through `?`) releases the lock as
/// well.
///
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    _not_send: PhantomData<*mut ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`].
    pub fn unlock(self) {
        drop(self)
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
