//! Kernel print utilities.
//!
//! Formatted output goes to UART0's transmit register with a busy-wait on
//! the line-status register. The interrupt-driven UART driver in the kernel
//! serves user I/O; this sink exists so the kernel can always print, even
//! before the driver is up or from inside a panic.

use crate::spinlock::SpinLock;
use core::fmt::Write;

const UART0_BASE: usize = 0x1000_0000;
const UART_THR: usize = 0;
const UART_LSR: usize = 5;
const UART_LSR_THRE: u8 = 1 << 5;

/// A busy-wait sink over UART0.
pub struct Uart0Sink {
    _p: (),
}

impl Uart0Sink {
    /// Create a new console sink.
    pub const fn new() -> Self {
        Uart0Sink { _p: () }
    }
}

impl Default for Uart0Sink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "riscv64")]
fn put_byte(b: u8) {
    unsafe {
        while core::ptr::read_volatile((UART0_BASE + UART_LSR) as *const u8) & UART_LSR_THRE == 0 {
            core::hint::spin_loop();
        }
        core::ptr::write_volatile((UART0_BASE + UART_THR) as *mut u8, b);
    }
}

#[cfg(not(target_arch = "riscv64"))]
fn put_byte(_b: u8) {
    // Host builds have no console; unit tests assert on return values.
    let _ = (UART_THR, UART_LSR, UART_LSR_THRE, UART0_BASE);
}

impl core::fmt::Write for Uart0Sink {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.as_bytes() {
            put_byte(*b);
        }
        Ok(())
    }
}

// Only replaced when force unlocking is required (i.e. panicking).
static mut SERIAL: SpinLock<Uart0Sink> = SpinLock::new(Uart0Sink::new());

#[doc(hidden)]
#[allow(static_mut_refs)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    let mut guard = unsafe { SERIAL.lock() };
    let _ = write!(&mut *guard, "{fmt}");
    guard.unlock();
}

/// Force unlocking the serial sink. Used by the panic path only.
#[doc(hidden)]
pub unsafe fn force_unlock_serial() {
    unsafe {
        SERIAL = SpinLock::new(Uart0Sink::new());
    }
}

/// Prints out the message.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    () => ($crate::print!("[INFO]\n"));
    ($($arg:tt)*) => ($crate::print!("[INFO] {}\n", format_args!($($arg)*)));
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    () => ($crate::print!("[WARN]\n"));
    ($($arg:tt)*) => ($crate::print!("[WARN] {}\n", format_args!($($arg)*)));
}
