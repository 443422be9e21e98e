//! Timer alarms and the preemption tick.
//!
//! An [`Alarm`] couples a wake time in ticks of the 10 MHz platform clock
//! with a condition to broadcast. Sleeping threads sit on a singly-linked
//! list sorted by wake time; the timer interrupt pops every expired alarm,
//! wakes its waiters, and reprograms the comparator for the next deadline.
//!
//! The same interrupt drives preemption: every 20 ms the trap layer is told
//! to yield the running thread.

use crate::thread::Condition;
use bedrock::interrupt::InterruptGuard;
use bedrock::riscv;
use bedrock::sbi;
use core::ptr::NonNull;

/// Ticks of the platform clock per second.
pub const TIMER_FREQ: u64 = 10_000_000;
/// Ticks between preemption points (20 ms).
const PREEMPT_TICKS: u64 = TIMER_FREQ / 50;

/// A one-shot wake-up at an absolute tick count.
pub struct Alarm {
    cond: Condition,
    twake: u64,
    next: Option<NonNull<Alarm>>,
}

impl Alarm {
    /// Create an alarm anchored at the current time.
    pub fn new(name: &'static str) -> Self {
        Self {
            cond: Condition::new(name),
            twake: riscv::rdtime(),
            next: None,
        }
    }

    /// Sleep until `tcnt` ticks past the alarm's anchor, then re-anchor.
    ///
    /// Consecutive calls produce a drift-free periodic wake-up.
    pub fn sleep(&mut self, tcnt: u64) {
        self.twake = self.twake.saturating_add(tcnt);
        if self.twake <= riscv::rdtime() {
            return;
        }

        {
            let _guard = InterruptGuard::new();
            unsafe { enqueue(NonNull::from(&mut *self)) };
            program_next();
        }
        // Expired alarms are unlinked by the interrupt before the
        // broadcast, so a wake with time left is a stray broadcast.
        loop {
            let _guard = InterruptGuard::new();
            if riscv::rdtime() >= self.twake {
                break;
            }
            self.cond.wait();
        }
    }

    /// Sleep for `us` microseconds.
    pub fn sleep_us(&mut self, us: u64) {
        self.sleep(us.saturating_mul(TIMER_FREQ / 1_000_000));
    }

    /// Sleep for `ms` milliseconds.
    pub fn sleep_ms(&mut self, ms: u64) {
        self.sleep(ms.saturating_mul(TIMER_FREQ / 1_000));
    }
}

static mut SLEEP_LIST: Option<NonNull<Alarm>> = None;
static mut PREEMPT_DEADLINE: u64 = u64::MAX;

unsafe fn sleep_list() -> &'static mut Option<NonNull<Alarm>> {
    unsafe { &mut *core::ptr::addr_of_mut!(SLEEP_LIST) }
}

// Links `al` at its wake-time-ordered position. Interrupts disabled.
unsafe fn enqueue(mut al: NonNull<Alarm>) {
    unsafe {
        let twake = al.as_ref().twake;
        let mut cur = sleep_list();
        while let Some(mut head) = *cur {
            if head.as_ref().twake > twake {
                break;
            }
            cur = &mut head.as_mut().next;
        }
        al.as_mut().next = *cur;
        *cur = Some(al);
    }
}

// Arms the comparator for the earliest pending deadline.
fn program_next() {
    unsafe {
        let head = sleep_list().map(|a| a.as_ref().twake).unwrap_or(u64::MAX);
        sbi::set_timer(head.min(*core::ptr::addr_of!(PREEMPT_DEADLINE)));
    }
}

/// Start the preemption tick.
pub fn init() {
    let _guard = InterruptGuard::new();
    unsafe {
        PREEMPT_DEADLINE = riscv::rdtime() + PREEMPT_TICKS;
    }
    program_next();
}

/// Handle a timer interrupt: wake expired alarms, re-arm the comparator,
/// and report whether the running thread's time slice is up.
pub fn on_interrupt() -> bool {
    let _guard = InterruptGuard::new();
    let now = riscv::rdtime();

    unsafe {
        while let Some(head) = *sleep_list() {
            if head.as_ref().twake > now {
                break;
            }
            *sleep_list() = head.as_ref().next;
            head.as_ref().cond.broadcast();
        }
    }

    let preempt = unsafe {
        if now >= PREEMPT_DEADLINE {
            PREEMPT_DEADLINE = now + PREEMPT_TICKS;
            true
        } else {
            false
        }
    };
    program_next();
    preempt
}

/// Sleep the running thread for at least `us` microseconds.
pub fn sleep_us(us: u64) {
    Alarm::new("usleep").sleep_us(us);
}

/// Sleep the running thread for at least `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    Alarm::new("msleep").sleep_ms(ms);
}
