//! Device manager.
//!
//! Drivers register an open function under a `(name, instance)` pair and an
//! interrupt handler under their PLIC source. `open_device` resolves the
//! registration and hands back a fresh I/O endpoint; the external-interrupt
//! path dispatches claimed sources to their handlers.

pub mod rtc;
pub mod uart;
pub mod vioblk;
pub mod viorng;
pub mod virtio;

use crate::io::Io;
use crate::KernelError;
use alloc::boxed::Box;
use alloc::vec::Vec;
use bedrock::spinlock::SpinLock;

/// Base of the first UART's register block.
pub const UART0_MMIO_BASE: usize = 0x1000_0000;
/// Spacing between UART instances.
pub const UART_MMIO_STEP: usize = 0x100;
/// Number of UART instances probed at boot.
pub const NUM_UARTS: usize = 3;
/// PLIC source of UART 0; further instances follow consecutively.
pub const UART0_INTR_SRCNO: u32 = 10;

/// Base of the Goldfish RTC register block.
pub const RTC_MMIO_BASE: usize = 0x10_1000;

/// Base of the first VirtIO MMIO transport.
pub const VIRTIO0_MMIO_BASE: usize = 0x1000_1000;
/// Spacing between VirtIO transports.
pub const VIRTIO_MMIO_STEP: usize = 0x1000;
/// PLIC source of VirtIO transport 0; further slots follow consecutively.
pub const VIRTIO0_INTR_SRCNO: u32 = 1;

/// Register base of UART instance `i`.
pub fn uart_mmio_base(i: usize) -> usize {
    UART0_MMIO_BASE + i * UART_MMIO_STEP
}

struct DevEntry {
    name: &'static str,
    instno: usize,
    open: Box<dyn Fn() -> Result<Io, KernelError> + Send>,
}

struct IsrEntry {
    srcno: u32,
    handler: Box<dyn Fn() + Send>,
}

static DEVTAB: SpinLock<Vec<DevEntry>> = SpinLock::new(Vec::new());
static ISRTAB: SpinLock<Vec<IsrEntry>> = SpinLock::new(Vec::new());

/// Register a device under `(name, instno)`.
pub fn register_device(
    name: &'static str,
    instno: usize,
    open: impl Fn() -> Result<Io, KernelError> + Send + 'static,
) {
    let mut tab = DEVTAB.lock();
    tab.push(DevEntry {
        name,
        instno,
        open: Box::new(open),
    });
    tab.unlock();
}

/// Open device `name#instno`, returning a fresh endpoint.
pub fn open_device(name: &str, instno: usize) -> Result<Io, KernelError> {
    let tab = DEVTAB.lock();
    let result = tab
        .iter()
        .find(|e| e.name == name && e.instno == instno)
        .map(|e| (e.open)())
        .unwrap_or(Err(KernelError::NoSuchEntry));
    tab.unlock();
    result
}

/// Register an interrupt handler for `srcno` and enable the source.
pub fn register_isr(srcno: u32, prio: u32, handler: impl Fn() + Send + 'static) {
    let mut tab = ISRTAB.lock();
    tab.push(IsrEntry {
        srcno,
        handler: Box::new(handler),
    });
    tab.unlock();
    bedrock::plic::enable_source(srcno, prio);
}

/// Run the handler registered for a claimed source.
pub fn dispatch_isr(srcno: u32) {
    let tab = ISRTAB.lock();
    let entry = tab.iter().position(|e| e.srcno == srcno);
    match entry {
        Some(at) => {
            // The handler runs outside the table lock; registrations are
            // permanent, so the entry cannot disappear.
            let handler = &tab[at].handler as *const Box<dyn Fn() + Send>;
            tab.unlock();
            unsafe { (*handler)() };
        }
        None => {
            tab.unlock();
            warning!("interrupt from unregistered source {}", srcno);
        }
    }
}
