//! Spinlock with an explicit-unlock guard.
//!
//! The guard pairs the lock flag with an interrupt-disable section, so on
//! this single-hart machine a lock taken in thread context cannot deadlock
//! against an interrupt handler. Contended acquisition spins with
//! interrupts restored, re-disabling them only for the next claim attempt.
//!
//! Guards must be released with an explicit [`SpinLockGuard::unlock`];
//! letting one fall out of scope still locked panics. The same discipline
//! applies to every held-resource guard in the kernel, which keeps lock
//! lifetimes visible in the code instead of hidden in drop order.

use crate::interrupt::InterruptGuard;
use core::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A busy-waiting mutual exclusion primitive protecting a `T`.
pub struct SpinLock<T: ?Sized> {
    held: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock around `t`.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            held: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, spinning until it is free.
    ///
    /// Interrupts are disabled for as long as the returned guard lives.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let mut intr = InterruptGuard::new();
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin with interrupts restored so the holder can make
            // progress, and claim again only once the flag looks free.
            drop(intr);
            while self.held.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
            intr = InterruptGuard::new();
        }
        SpinLockGuard {
            lock: self,
            released: false,
            _intr: intr,
        }
    }
}

/// Scoped access to the data of a locked [`SpinLock`].
///
/// Release with [`unlock`]; a guard dropped while still holding the lock
/// panics.
///
/// [`unlock`]: Self::unlock
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    released: bool,
    _intr: InterruptGuard,
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the lock.
    pub fn unlock(mut self) {
        self.released = true;
        self.lock.held.store(false, Ordering::Release);
        // Dropping the guard now also restores the interrupt state.
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
        if !self.released {
            panic!("spinlock guard dropped while the lock is still held");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_serializes_access() {
        let lock = SpinLock::new(0u32);
        let mut guard = lock.lock();
        *guard += 1;
        guard.unlock();
        let guard = lock.lock();
        assert_eq!(*guard, 1);
        guard.unlock();
    }
}
