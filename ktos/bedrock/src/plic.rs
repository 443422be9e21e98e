//! Platform-level interrupt controller.
//!
//! The contract the kernel needs is small: enable a source with a priority,
//! claim the next pending source, and mark it completed. Register layout is
//! the SiFive PLIC as instantiated by the QEMU `virt` machine; the kernel
//! drives context 1, hart 0's S-mode context.

const PLIC_BASE: usize = 0x0c00_0000;
const PLIC_CONTEXT: usize = 1;

const ENABLE_BASE: usize = 0x2000;
const ENABLE_STRIDE: usize = 0x80;
const CONTEXT_BASE: usize = 0x20_0000;
const CONTEXT_STRIDE: usize = 0x1000;

fn reg(offset: usize) -> *mut u32 {
    (PLIC_BASE + offset) as *mut u32
}

/// Set the priority threshold of the S-mode context to accept all sources.
pub fn init() {
    unsafe {
        core::ptr::write_volatile(reg(CONTEXT_BASE + PLIC_CONTEXT * CONTEXT_STRIDE), 0);
    }
}

/// Enable interrupt source `srcno` at priority `prio`.
pub fn enable_source(srcno: u32, prio: u32) {
    unsafe {
        core::ptr::write_volatile(reg(4 * srcno as usize), prio);
        let enable = reg(
            ENABLE_BASE + PLIC_CONTEXT * ENABLE_STRIDE + (srcno as usize / 32) * 4,
        );
        let prev = core::ptr::read_volatile(enable);
        core::ptr::write_volatile(enable, prev | 1 << (srcno % 32));
    }
}

/// Claim the highest-priority pending source, or 0 if none is pending.
pub fn claim() -> u32 {
    unsafe { core::ptr::read_volatile(reg(CONTEXT_BASE + PLIC_CONTEXT * CONTEXT_STRIDE + 4)) }
}

/// Signal completion of a claimed source.
pub fn complete(srcno: u32) {
    unsafe {
        core::ptr::write_volatile(
            reg(CONTEXT_BASE + PLIC_CONTEXT * CONTEXT_STRIDE + 4),
            srcno,
        );
    }
}
