//! Platform support for the QEMU `virt` machine, RISC-V supervisor mode.
//!
//! This crate holds everything below the kernel proper: address newtypes,
//! CSR accessors, interrupt masking, spinlocks, MMIO helpers, the console
//! sink, the SEE (SBI) calls, the trap-frame contract shared with the
//! trap-entry assembly, and the PLIC.
//!
//! Instruction-level pieces are gated on `target_arch = "riscv64"`; a host
//! build gets inert stand-ins so the kernel's logic-level subsystems can be
//! unit-tested off target.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod addressing;
pub mod interrupt;
#[macro_use]
pub mod kprint;
pub mod mmio;
pub mod plic;
pub mod riscv;
pub mod sbi;
pub mod spinlock;
pub mod trap;

/// Compile-time assertion, checked when the containing item is compiled.
#[macro_export]
macro_rules! const_assert {
    ($cond:expr) => {
        const _: () = assert!($cond);
    };
}
