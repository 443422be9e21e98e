//! Supervisor-mode CSR accessors and fences.
//!
//! On a host build (unit tests) the CSRs are backed by process-local
//! atomics so the memory-management and scheduling logic above this layer
//! can run without the machine.

#[cfg(not(target_arch = "riscv64"))]
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// `sstatus.SIE` — supervisor interrupt enable.
pub const SSTATUS_SIE: usize = 1 << 1;
/// `sstatus.SPIE` — interrupt-enable state prior to the trap.
pub const SSTATUS_SPIE: usize = 1 << 5;
/// `sstatus.SPP` — privilege mode prior to the trap (0 = user).
pub const SSTATUS_SPP: usize = 1 << 8;
/// `sstatus.SUM` — permit supervisor access to user-accessible pages.
pub const SSTATUS_SUM: usize = 1 << 18;

/// `sie.STIE` — supervisor timer interrupt enable.
pub const SIE_STIE: usize = 1 << 5;
/// `sie.SEIE` — supervisor external interrupt enable.
pub const SIE_SEIE: usize = 1 << 9;

/// `scause` interrupt flag.
pub const SCAUSE_INTERRUPT: usize = 1 << 63;
/// `scause` code for a supervisor timer interrupt.
pub const SCAUSE_STI: usize = 5;
/// `scause` code for a supervisor external interrupt.
pub const SCAUSE_SEI: usize = 9;
/// `scause` code for an environment call from U-mode.
pub const SCAUSE_ECALL_UMODE: usize = 8;
/// `scause` code for a load page fault.
pub const SCAUSE_LOAD_PAGE_FAULT: usize = 13;
/// `scause` code for a store/AMO page fault.
pub const SCAUSE_STORE_PAGE_FAULT: usize = 15;

#[cfg(target_arch = "riscv64")]
mod imp {
    use core::arch::asm;

    #[inline]
    pub fn csrr_sstatus() -> usize {
        let v: usize;
        unsafe { asm!("csrr {}, sstatus", out(reg) v) };
        v
    }

    #[inline]
    pub fn csrs_sstatus(mask: usize) {
        unsafe { asm!("csrs sstatus, {}", in(reg) mask) };
    }

    #[inline]
    pub fn csrc_sstatus(mask: usize) {
        unsafe { asm!("csrc sstatus, {}", in(reg) mask) };
    }

    #[inline]
    pub fn csrs_sie(mask: usize) {
        unsafe { asm!("csrs sie, {}", in(reg) mask) };
    }

    #[inline]
    pub fn csrr_satp() -> usize {
        let v: usize;
        unsafe { asm!("csrr {}, satp", out(reg) v) };
        v
    }

    #[inline]
    pub fn csrw_satp(v: usize) {
        unsafe { asm!("csrw satp, {}", in(reg) v) };
    }

    #[inline]
    pub fn csrrw_satp(v: usize) -> usize {
        let prev: usize;
        unsafe { asm!("csrrw {}, satp, {}", out(reg) prev, in(reg) v) };
        prev
    }

    #[inline]
    pub fn csrr_scause() -> usize {
        let v: usize;
        unsafe { asm!("csrr {}, scause", out(reg) v) };
        v
    }

    #[inline]
    pub fn csrr_stval() -> usize {
        let v: usize;
        unsafe { asm!("csrr {}, stval", out(reg) v) };
        v
    }

    /// Read the `time` CSR (ticks of the 10 MHz platform clock).
    #[inline]
    pub fn rdtime() -> u64 {
        let v: u64;
        unsafe { asm!("rdtime {}", out(reg) v) };
        v
    }

    /// Flush the whole TLB for the current address space.
    #[inline]
    pub fn sfence_vma() {
        unsafe { asm!("sfence.vma zero, zero") };
    }

    /// Stall the hart until the next interrupt.
    #[inline]
    pub fn wfi() {
        unsafe { asm!("wfi") };
    }
}

#[cfg(not(target_arch = "riscv64"))]
mod imp {
    use super::*;

    // Host stand-ins, used only by the unit tests.
    static MOCK_SSTATUS: AtomicUsize = AtomicUsize::new(0);
    static MOCK_SATP: AtomicUsize = AtomicUsize::new(0);
    static MOCK_TIME: AtomicU64 = AtomicU64::new(0);

    pub fn csrr_sstatus() -> usize {
        MOCK_SSTATUS.load(Ordering::SeqCst)
    }

    pub fn csrs_sstatus(mask: usize) {
        MOCK_SSTATUS.fetch_or(mask, Ordering::SeqCst);
    }

    pub fn csrc_sstatus(mask: usize) {
        MOCK_SSTATUS.fetch_and(!mask, Ordering::SeqCst);
    }

    pub fn csrs_sie(_mask: usize) {}

    pub fn csrr_satp() -> usize {
        MOCK_SATP.load(Ordering::SeqCst)
    }

    pub fn csrw_satp(v: usize) {
        MOCK_SATP.store(v, Ordering::SeqCst);
    }

    pub fn csrrw_satp(v: usize) -> usize {
        MOCK_SATP.swap(v, Ordering::SeqCst)
    }

    pub fn csrr_scause() -> usize {
        0
    }

    pub fn csrr_stval() -> usize {
        0
    }

    pub fn rdtime() -> u64 {
        MOCK_TIME.fetch_add(1, Ordering::SeqCst)
    }

    pub fn sfence_vma() {}

    pub fn wfi() {}
}

pub use imp::*;
