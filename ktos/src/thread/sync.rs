//! Conditions and locks.
//!
//! A [`Condition`] parks threads on a FIFO wait list until another thread
//! broadcasts it. A [`Lock`] is the blocking, recursive mutual-exclusion
//! primitive built on top: reacquisition by the owner nests, and every lock
//! a thread holds is tracked so the exit path can force-release them.
//!
//! Wait lists are tid-chained like the ready list and are only touched with
//! interrupts disabled.

use super::{Thread, ThreadState, Tid, current, current_tid, running_thread_suspend, thread_ptr};
use bedrock::interrupt::InterruptGuard;
use core::cell::UnsafeCell;
use core::ptr::NonNull;

/// A condition variable with a FIFO wait list.
pub struct Condition {
    name: &'static str,
    waiters: UnsafeCell<super::TidList>,
}

// Single hart; the wait list is only accessed inside interrupt-disable
// sections.
unsafe impl Send for Condition {}
unsafe impl Sync for Condition {}

impl Condition {
    /// Creates a new condition.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            waiters: UnsafeCell::new(super::TidList::new()),
        }
    }

    /// The condition's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block the running thread until the next [`Condition::broadcast`].
    ///
    /// May be called while the caller already holds an interrupt-disable
    /// guard; the thread is enqueued before the suspension, so a broadcast
    /// between the caller's predicate check and this call is never lost.
    pub fn wait(&self) {
        {
            let _guard = InterruptGuard::new();
            let cur = current();
            assert_eq!(cur.state, ThreadState::Running);
            cur.state = ThreadState::Waiting;
            cur.wait_cond = self as *const Condition;
            unsafe { (*self.waiters.get()).insert(cur) };
        }
        running_thread_suspend();
    }

    /// Wake every thread on the wait list, FIFO, moving each to the tail of
    /// the ready list.
    pub fn broadcast(&self) {
        let _guard = InterruptGuard::new();
        unsafe {
            while let Some(tid) = (*self.waiters.get()).remove() {
                let thr = &mut *thread_ptr(tid);
                thr.state = ThreadState::Ready;
                thr.wait_cond = core::ptr::null();
                super::ready_list().insert(thr);
            }
        }
    }
}

struct LockInner {
    owner: Option<Tid>,
    // Reacquisition depth beyond the first acquire.
    count: usize,
}

/// A blocking, recursive lock.
///
/// Contended acquisition waits on the lock's release condition rather than
/// spinning. The owner may reacquire; releases must balance. Locks held at
/// thread exit are force-released by the scheduler.
pub struct Lock {
    inner: UnsafeCell<LockInner>,
    released: Condition,
}

unsafe impl Send for Lock {}
unsafe impl Sync for Lock {}

impl Lock {
    /// Creates a new, unowned lock.
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(LockInner {
                owner: None,
                count: 0,
            }),
            released: Condition::new("lock.released"),
        }
    }

    /// Acquire the lock, blocking while another thread owns it.
    pub fn acquire(&self) {
        loop {
            let _guard = InterruptGuard::new();
            let inner = unsafe { &mut *self.inner.get() };
            match inner.owner {
                Some(owner) if owner == current_tid() => {
                    inner.count += 1;
                    return;
                }
                None => {
                    inner.owner = Some(current_tid());
                    register_held(self);
                    return;
                }
                Some(_) => self.released.wait(),
            }
        }
    }

    /// Release the lock. Panics if the caller is not the owner.
    pub fn release(&self) {
        let _guard = InterruptGuard::new();
        let inner = unsafe { &mut *self.inner.get() };
        assert_eq!(
            inner.owner,
            Some(current_tid()),
            "lock released by a non-owner"
        );
        if inner.count > 0 {
            inner.count -= 1;
        } else {
            unregister_held(self);
            inner.owner = None;
            self.released.broadcast();
        }
    }

    // Drops ownership regardless of depth. Used when reaping an exited
    // thread.
    fn force_release(&self) {
        let inner = unsafe { &mut *self.inner.get() };
        inner.owner = None;
        inner.count = 0;
        self.released.broadcast();
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "riscv64")]
fn register_held(lock: &Lock) {
    current()
        .held_locks
        .push(NonNull::from(lock));
}

#[cfg(target_arch = "riscv64")]
fn unregister_held(lock: &Lock) {
    let held = &mut current().held_locks;
    if let Some(at) = held
        .iter()
        .position(|l| l.as_ptr() as *const Lock == lock as *const Lock)
    {
        held.remove(at);
    }
}

// The host stand-in thread is shared between test threads, so per-thread
// lock bookkeeping is skipped off target.
#[cfg(not(target_arch = "riscv64"))]
fn register_held(_lock: &Lock) {}

#[cfg(not(target_arch = "riscv64"))]
fn unregister_held(_lock: &Lock) {}

// Release every lock the exited thread still holds, recursion included.
pub(super) fn force_release_held(thr: &mut Thread) {
    let held: alloc::vec::Vec<NonNull<Lock>> = core::mem::take(&mut thr.held_locks);
    for lock in held {
        unsafe { lock.as_ref().force_release() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_reacquisition_nests() {
        let lock = Lock::new();
        lock.acquire();
        lock.acquire();
        lock.release();
        // Still owned after one release of a doubly-acquired lock.
        let inner = unsafe { &*lock.inner.get() };
        assert_eq!(inner.owner, Some(current_tid()));
        lock.release();
        let inner = unsafe { &*lock.inner.get() };
        assert_eq!(inner.owner, None);
    }
}
