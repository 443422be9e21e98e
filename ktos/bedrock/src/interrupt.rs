//! Interrupt masking.

use crate::riscv;

/// Enumeration representing the interrupt state.
#[derive(PartialEq, Eq, Debug)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Reads the current interrupt state.
    pub fn current() -> Self {
        if riscv::csrr_sstatus() & riscv::SSTATUS_SIE != 0 {
            Self::On
        } else {
            Self::Off
        }
    }

    /// Enable supervisor interrupts.
    ///
    /// # Safety
    /// The caller must not be inside a critical section that relies on
    /// interrupts staying masked.
    pub unsafe fn enable() {
        riscv::csrs_sstatus(riscv::SSTATUS_SIE);
    }

    /// Disable supervisor interrupts.
    ///
    /// # Safety
    /// Pair with a later [`InterruptState::enable`] or a saved restore;
    /// prefer [`InterruptGuard`].
    pub unsafe fn disable() {
        riscv::csrc_sstatus(riscv::SSTATUS_SIE);
    }
}

/// An RAII guard for interrupt-disable critical sections.
///
/// Creating the guard saves the current interrupt state and disables
/// interrupts; dropping it restores the saved state. Each guard carries its
/// own saved state, so guards nest the way a saved-and-restored flag does,
/// and a suspension point that forcibly re-enables interrupts before a
/// context switch leaves the outer guards consistent on resume.
pub struct InterruptGuard {
    was_on: bool,
    // Guards pin the critical section to the current thread.
    _not_send: core::marker::PhantomData<*mut ()>,
}

impl InterruptGuard {
    /// Creates a new guard, disabling interrupts.
    pub fn new() -> Self {
        let was_on = InterruptState::current() == InterruptState::On;
        unsafe { InterruptState::disable() };
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        Self {
            was_on,
            _not_send: core::marker::PhantomData,
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        if self.was_on {
            unsafe { InterruptState::enable() };
        }
    }
}
