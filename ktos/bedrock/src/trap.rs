//! The trap-frame contract shared with the trap-entry assembly.
//!
//! The trap entry/exit code saves and restores registers in assembly; this
//! module fixes the frame layout both sides agree on, byte for byte. The
//! kernel receives a saved frame from the entry path and resumes execution
//! with [`trap_frame_jump`].

/// Saved register state produced by the trap-entry assembly.
///
/// ## WARNING
/// DO NOT CHANGE THE LAYOUT OF THIS STRUCT.
/// The field offsets are hard-coded in the trap entry/exit assembly.
#[repr(C)]
#[derive(Clone)]
pub struct TrapFrame {
    /// `x1`, the return address register.
    pub ra: usize,
    /// `x2`, the stack pointer.
    pub sp: usize,
    /// `x3`, the global pointer.
    pub gp: usize,
    /// `x4`, the thread pointer.
    pub tp: usize,
    /// `x5`-`x7`, caller-saved temporaries.
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    /// `x8`-`x9`, callee-saved registers.
    pub s0: usize,
    pub s1: usize,
    /// `x10`-`x17`, argument registers.
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    /// `x18`-`x27`, callee-saved registers.
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    /// `x28`-`x31`, caller-saved temporaries.
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
    /// Program counter at the trap.
    pub sepc: usize,
    /// Saved `sstatus`; `SPP` and `SPIE` select the resume mode.
    pub sstatus: usize,
}

crate::const_assert!(core::mem::size_of::<TrapFrame>() == 33 * 8);

impl TrapFrame {
    /// An all-zero frame.
    pub const fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

#[cfg(target_arch = "riscv64")]
unsafe extern "C" {
    /// Restores `tfr` and resumes at `tfr.sepc` in the mode selected by
    /// `tfr.sstatus`, with `sscratch` pointed at `stack_anchor` so the next
    /// trap lands on this thread's kernel stack. Provided by the trap-exit
    /// assembly.
    pub fn trap_frame_jump(tfr: *mut TrapFrame, stack_anchor: *mut u8) -> !;
}

#[cfg(not(target_arch = "riscv64"))]
#[allow(clippy::missing_safety_doc)]
pub unsafe fn trap_frame_jump(_tfr: *mut TrapFrame, _stack_anchor: *mut u8) -> ! {
    unreachable!("trap exit exists only on the target")
}
