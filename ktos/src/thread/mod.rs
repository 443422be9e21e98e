//! Threads.
//!
//! The kernel keeps its threads in a fixed table of [`NTHR`] slots. Index 0
//! is the boot thread and the last index is the idle thread, which is always
//! resident. Threads refer to each other by [`Tid`] — parent links, ready
//! list and wait lists are all tid-chained through the table, so a reclaimed
//! slot can never leave a dangling reference behind.
//!
//! Scheduling is FIFO among READY threads, preempted by the timer tick.
//! Every list manipulation happens with interrupts disabled; the suspension
//! path re-enables interrupts before the context switch and each thread's
//! critical sections restore their own saved state on resume.

pub mod sync;

pub use sync::{Condition, Lock};

use crate::{KernelError, mm::Page};
use alloc::boxed::Box;
use alloc::vec::Vec;
use bedrock::addressing::PAGE_SIZE;
use bedrock::interrupt::{InterruptGuard, InterruptState};
use core::ptr::NonNull;

/// Maximum number of threads.
pub const NTHR: usize = 16;

const MAIN_TID: Tid = Tid(0);
const IDLE_TID: Tid = Tid(NTHR - 1);

/// A thread id: the index of the thread's slot in the thread table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Tid(pub usize);

impl core::fmt::Display for Tid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A possible state of a thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Blocked on a condition.
    Waiting,
    /// Currently executing.
    Running,
    /// On the ready list, waiting for a CPU slot.
    Ready,
    /// Finished; waiting to be reclaimed by `join`.
    Exited,
}

/// Saved callee context of a suspended thread.
///
/// ## WARNING
/// DO NOT CHANGE THE LAYOUT OF THIS STRUCT.
/// The field offsets are hard-coded in the context-switch assembly, and the
/// context must stay the first member of [`Thread`].
#[repr(C)]
struct ThreadContext {
    s: [usize; 12],
    ra: usize,
    sp: usize,
}

/// Sentinel at the top of each thread's stack, holding a back-pointer to
/// the owning thread.
#[repr(C)]
struct StackAnchor {
    ktp: *mut Thread,
    kgp: usize,
}

/// A thread control block.
#[repr(C)]
pub struct Thread {
    // Must be the first member; see the context-switch assembly.
    ctx: ThreadContext,
    id: Tid,
    state: ThreadState,
    name: &'static str,
    stack: Option<Page>,
    stack_anchor: usize,
    parent: Tid,
    next: Option<Tid>,
    wait_cond: *const Condition,
    child_exit: Condition,
    pub(crate) proc: Option<usize>,
    held_locks: Vec<NonNull<Lock>>,
}

impl Thread {
    const fn empty(name: &'static str, id: Tid, state: ThreadState) -> Self {
        Self {
            ctx: ThreadContext {
                s: [0; 12],
                ra: 0,
                sp: 0,
            },
            id,
            state,
            name,
            stack: None,
            stack_anchor: 0,
            parent: MAIN_TID,
            next: None,
            wait_cond: core::ptr::null(),
            child_exit: Condition::new("child_exit"),
            proc: None,
            held_locks: Vec::new(),
        }
    }
}

/// An intrusive FIFO list of threads, linked through `Thread::next`.
struct TidList {
    head: Option<Tid>,
    tail: Option<Tid>,
}

impl TidList {
    const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    // Callers hold an interrupt-disable guard.
    unsafe fn insert(&mut self, thr: &mut Thread) {
        thr.next = None;
        match self.tail {
            Some(tail) => unsafe { (*thread_ptr(tail)).next = Some(thr.id) },
            None => self.head = Some(thr.id),
        }
        self.tail = Some(thr.id);
    }

    unsafe fn remove(&mut self) -> Option<Tid> {
        let tid = self.head?;
        unsafe {
            let thr = &mut *thread_ptr(tid);
            self.head = thr.next.take();
        }
        if self.head.is_none() {
            self.tail = None;
        }
        Some(tid)
    }
}

static mut THRTAB: [*mut Thread; NTHR] = [core::ptr::null_mut(); NTHR];
static mut READY_LIST: TidList = TidList::new();

// The thread table and ready list are only touched inside interrupt-disable
// sections on this single-hart machine.
unsafe fn thrtab() -> &'static mut [*mut Thread; NTHR] {
    unsafe { &mut *core::ptr::addr_of_mut!(THRTAB) }
}

pub(crate) unsafe fn thread_ptr(tid: Tid) -> *mut Thread {
    unsafe { thrtab()[tid.0] }
}

unsafe fn ready_list() -> &'static mut TidList {
    unsafe { &mut *core::ptr::addr_of_mut!(READY_LIST) }
}

#[cfg(target_arch = "riscv64")]
fn current_ptr() -> *mut Thread {
    let tp: *mut Thread;
    unsafe { core::arch::asm!("mv {}, tp", out(reg) tp) };
    tp
}

#[cfg(target_arch = "riscv64")]
fn set_current_ptr(thr: *mut Thread) {
    unsafe { core::arch::asm!("mv tp, {}", in(reg) thr) };
}

#[cfg(not(target_arch = "riscv64"))]
mod host {
    // A stand-in current thread so lock bookkeeping works in unit tests.
    use super::*;
    pub(super) static mut HOST_THREAD: Thread =
        Thread::empty("host-test", MAIN_TID, ThreadState::Running);
}

#[cfg(not(target_arch = "riscv64"))]
fn current_ptr() -> *mut Thread {
    core::ptr::addr_of_mut!(host::HOST_THREAD)
}

#[cfg(not(target_arch = "riscv64"))]
fn set_current_ptr(_thr: *mut Thread) {}

pub(crate) fn current() -> &'static mut Thread {
    unsafe { &mut *current_ptr() }
}

/// The id of the running thread.
pub fn current_tid() -> Tid {
    current().id
}

/// The name of the running thread.
pub fn current_name() -> &'static str {
    current().name
}

/// The name of thread `tid`, if the slot is live.
pub fn thread_name(tid: Tid) -> Option<&'static str> {
    let _guard = InterruptGuard::new();
    unsafe {
        if tid.0 < NTHR && !thread_ptr(tid).is_null() {
            Some((*thread_ptr(tid)).name)
        } else {
            None
        }
    }
}

/// Stack anchor of the running thread, for the trap-exit path.
pub fn current_stack_anchor() -> *mut u8 {
    current().stack_anchor as *mut u8
}

/// Initialize the thread manager: adopt the boot thread as the main thread
/// and spawn the idle thread.
#[cfg(target_arch = "riscv64")]
pub fn init() {
    unsafe extern "C" {
        static _main_stack_anchor: u8;
    }

    let mut main = Box::new(Thread::empty("main", MAIN_TID, ThreadState::Running));
    main.stack_anchor = unsafe { &_main_stack_anchor as *const u8 as usize };
    let main = Box::into_raw(main);

    let guard = InterruptGuard::new();
    unsafe {
        thrtab()[MAIN_TID.0] = main;
        let anchor = (*main).stack_anchor as *mut StackAnchor;
        (*anchor).ktp = main;
    }
    drop(guard);
    set_current_ptr(main);

    spawn_at(Some(IDLE_TID), "idle", idle_loop).expect("failed to spawn the idle thread");
}

/// Create a new thread running `f` and place it at the tail of the ready
/// list. Returns the new thread's id.
pub fn spawn<F: FnOnce() + Send + 'static>(
    name: &'static str,
    f: F,
) -> Result<Tid, KernelError> {
    spawn_at(None, name, f)
}

fn spawn_at<F: FnOnce() + Send + 'static>(
    want: Option<Tid>,
    name: &'static str,
    f: F,
) -> Result<Tid, KernelError> {
    let stack = Page::new().ok_or(KernelError::NoMemory)?;
    let anchor = stack.kva().into_usize() + PAGE_SIZE - core::mem::size_of::<StackAnchor>();

    let mut thr = Box::new(Thread::empty(name, Tid(0), ThreadState::Ready));
    thr.parent = current_tid();
    thr.stack = Some(stack);
    thr.stack_anchor = anchor;
    thr.ctx.sp = anchor;
    thr.ctx.ra = thread_startup::<F> as usize;
    let entry = Box::into_raw(Box::new(f));
    thr.ctx.s[0] = entry as usize;

    let guard = InterruptGuard::new();
    // The lowest free slot wins; the last slot belongs to the idle thread.
    let tid = match want {
        Some(tid) => tid,
        None => {
            let Some(tid) = (1..NTHR - 1)
                .map(Tid)
                .find(|&t| unsafe { thread_ptr(t).is_null() })
            else {
                drop(guard);
                unsafe { drop(Box::from_raw(entry)) };
                return Err(KernelError::NoThread);
            };
            tid
        }
    };
    thr.id = tid;
    let thr = Box::into_raw(thr);
    unsafe {
        debug_assert!(thread_ptr(tid).is_null());
        thrtab()[tid.0] = thr;
        (*(anchor as *mut StackAnchor)).ktp = thr;
        (*(anchor as *mut StackAnchor)).kgp = 0;
        ready_list().insert(&mut *thr);
    }
    drop(guard);
    Ok(tid)
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    running_thread_suspend();
}

/// Terminate the running thread. Never returns.
///
/// The parent is woken through its `child_exit` condition; the main thread
/// exiting halts the machine.
pub fn exit() -> ! {
    if current_tid() == MAIN_TID {
        bedrock::sbi::halt_success();
    }
    // The EXITED transition, the parent wakeup and the final suspension
    // happen without a preemption window: a tick that lands after the state
    // change would reap this thread before the broadcast.
    let _guard = InterruptGuard::new();
    current().state = ThreadState::Exited;
    let parent = current().parent;
    unsafe { (*thread_ptr(parent)).child_exit.broadcast() };
    running_thread_suspend();
    bedrock::sbi::halt_failure();
}

/// Wait for a child to exit and reclaim its slot.
///
/// With `tid == Tid(0)`, waits for any child of the caller; otherwise waits
/// for the named thread. Returns the reclaimed tid.
pub fn join(tid: Tid) -> Result<Tid, KernelError> {
    if tid.0 >= NTHR {
        return Err(KernelError::InvalidArgument);
    }
    if tid != Tid(0) {
        loop {
            // The guard spans the state check and the wait, so an exit
            // broadcast cannot slip in between.
            let _guard = InterruptGuard::new();
            let thr = unsafe { thread_ptr(tid) };
            if thr.is_null() {
                return Err(KernelError::InvalidArgument);
            }
            if unsafe { (*thr).state } == ThreadState::Exited {
                reclaim(tid);
                return Ok(tid);
            }
            current().child_exit.wait();
        }
    }

    // Any child: scan for an exited one, waiting whenever every child is
    // still live.
    loop {
        let _guard = InterruptGuard::new();
        let mut have_child = false;
        for i in 1..NTHR {
            let thr = unsafe { thread_ptr(Tid(i)) };
            if thr.is_null() || unsafe { (*thr).parent } != current_tid() {
                continue;
            }
            have_child = true;
            if unsafe { (*thr).state } == ThreadState::Exited {
                reclaim(Tid(i));
                return Ok(Tid(i));
            }
        }
        if !have_child {
            return Err(KernelError::InvalidArgument);
        }
        current().child_exit.wait();
    }
}

// Frees an exited thread's slot and reparents its children.
fn reclaim(tid: Tid) {
    let guard = InterruptGuard::new();
    unsafe {
        let thr = thread_ptr(tid);
        debug_assert!(!thr.is_null() && (*thr).state == ThreadState::Exited);
        for i in 1..NTHR {
            let child = thread_ptr(Tid(i));
            if !child.is_null() && (*child).parent == tid {
                (*child).parent = (*thr).parent;
            }
        }
        thrtab()[tid.0] = core::ptr::null_mut();
        drop(guard);
        drop(Box::from_raw(thr));
    }
}

/// Suspend the running thread and resume the next thread on the ready list.
///
/// If the caller is RUNNING it is marked READY and re-enqueued, so control
/// returns once the scheduler comes back around. Interrupts are enabled
/// across the switch itself. When the thread switched away from has EXITED,
/// its held locks are force-released and its stack is freed here, from the
/// next thread's context.
pub(crate) fn running_thread_suspend() {
    let next = {
        let _guard = InterruptGuard::new();
        let cur = current();
        if cur.state == ThreadState::Running {
            cur.state = ThreadState::Ready;
            unsafe { ready_list().insert(cur) };
        }
        let next_tid = unsafe { ready_list().remove() }.expect("ready list empty");
        let next = unsafe { &mut *thread_ptr(next_tid) };
        next.state = ThreadState::Running;
        next as *mut Thread
    };

    unsafe {
        InterruptState::enable();
        if let Some(idx) = (*next).proc {
            crate::process::activate_mspace(idx);
        }
        let old = thread_switch(next);
        if (*old).state == ThreadState::Exited {
            let _guard = InterruptGuard::new();
            sync::force_release_held(&mut *old);
            (*old).stack = None;
        }
    }
}

fn idle_loop() {
    loop {
        // If there are runnable threads, yield to them.
        loop {
            let guard = InterruptGuard::new();
            let empty = unsafe { ready_list().is_empty() };
            drop(guard);
            if empty {
                break;
            }
            yield_now();
        }

        // No runnable threads. The list must be re-checked with interrupts
        // disabled before stalling, or an ISR could mark a thread ready
        // between the check and the wfi.
        let guard = InterruptGuard::new();
        if unsafe { ready_list().is_empty() } {
            bedrock::riscv::wfi();
        }
        drop(guard);
    }
}

// Context switch: saves the callee context into the current thread (held in
// `tp`), installs the next thread's context, and returns the previous
// thread.
#[cfg(target_arch = "riscv64")]
#[unsafe(naked)]
unsafe extern "C" fn thread_switch(next: *mut Thread) -> *mut Thread {
    core::arch::naked_asm!(
        "sd s0, 0(tp)",
        "sd s1, 8(tp)",
        "sd s2, 16(tp)",
        "sd s3, 24(tp)",
        "sd s4, 32(tp)",
        "sd s5, 40(tp)",
        "sd s6, 48(tp)",
        "sd s7, 56(tp)",
        "sd s8, 64(tp)",
        "sd s9, 72(tp)",
        "sd s10, 80(tp)",
        "sd s11, 88(tp)",
        "sd ra, 96(tp)",
        "sd sp, 104(tp)",
        "mv t0, a0",
        "mv a0, tp",
        "mv tp, t0",
        "ld s0, 0(tp)",
        "ld s1, 8(tp)",
        "ld s2, 16(tp)",
        "ld s3, 24(tp)",
        "ld s4, 32(tp)",
        "ld s5, 40(tp)",
        "ld s6, 48(tp)",
        "ld s7, 56(tp)",
        "ld s8, 64(tp)",
        "ld s9, 72(tp)",
        "ld s10, 80(tp)",
        "ld s11, 88(tp)",
        "ld ra, 96(tp)",
        "ld sp, 104(tp)",
        "ret",
    )
}

#[cfg(not(target_arch = "riscv64"))]
unsafe extern "C" fn thread_switch(_next: *mut Thread) -> *mut Thread {
    unreachable!("context switching exists only on the target")
}

// The very beginning of a spawned thread: the saved s0 carries the boxed
// closure, which becomes the first argument of the entry shim.
#[cfg(target_arch = "riscv64")]
#[unsafe(naked)]
unsafe extern "C" fn thread_startup<F: FnOnce() + Send>() -> ! {
    core::arch::naked_asm!(
        "mv a0, s0",
        "j {}",
        sym thread_entry::<F>,
    )
}

#[cfg(not(target_arch = "riscv64"))]
unsafe extern "C" fn thread_startup<F: FnOnce() + Send>() -> ! {
    unreachable!("thread startup exists only on the target")
}

extern "C" fn thread_entry<F: FnOnce() + Send>(f: *mut F) -> ! {
    unsafe { InterruptState::enable() };
    let f = unsafe { Box::from_raw(f) };
    f();
    exit()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The list logic runs against a private slice of table slots.
    fn fake_threads(n: usize) -> Vec<Box<Thread>> {
        (0..n)
            .map(|i| Box::new(Thread::empty("t", Tid(i), ThreadState::Ready)))
            .collect()
    }

    #[test]
    fn tid_list_is_fifo() {
        let mut threads = fake_threads(3);
        let _guard = InterruptGuard::new();
        unsafe {
            for (i, t) in threads.iter_mut().enumerate() {
                thrtab()[i] = t.as_mut() as *mut Thread;
            }
            let mut list = TidList::new();
            assert!(list.is_empty());
            list.insert(&mut threads[0]);
            list.insert(&mut threads[1]);
            list.insert(&mut threads[2]);
            assert_eq!(list.remove(), Some(Tid(0)));
            assert_eq!(list.remove(), Some(Tid(1)));
            assert_eq!(list.remove(), Some(Tid(2)));
            assert_eq!(list.remove(), None);
            assert!(list.is_empty());
            for i in 0..3 {
                thrtab()[i] = core::ptr::null_mut();
            }
        }
    }
}
