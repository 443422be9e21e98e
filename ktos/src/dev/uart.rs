//! NS16550A UART driver.
//!
//! Receive and transmit run through small ring buffers refilled and
//! drained by the interrupt handler; `read` and `write` block on their
//! ring's condition. The rings use the same free-running `u16` cursor
//! arithmetic as the pipe.

use crate::io::{Io, IoKind};
use crate::thread::Condition;
use crate::KernelError;
use bedrock::interrupt::InterruptGuard;
use bedrock::mmio::MmioAccessor;
use core::cell::UnsafeCell;

const UART_RBR: usize = 0; // receive buffer (read)
const UART_THR: usize = 0; // transmit holding (write)
const UART_IER: usize = 1; // interrupt enable
const UART_LSR: usize = 5; // line status

const IER_DRIE: u8 = 1 << 0; // data ready
const IER_THREIE: u8 = 1 << 1; // transmit holding register empty
const LSR_DR: u8 = 1 << 0;
const LSR_THRE: u8 = 1 << 5;

const RING_SIZE: usize = 64;

struct Ring {
    buf: [u8; RING_SIZE],
    head: u16,
    tail: u16,
}

impl Ring {
    const fn new() -> Self {
        Self {
            buf: [0; RING_SIZE],
            head: 0,
            tail: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        self.tail.wrapping_sub(self.head) as usize == RING_SIZE
    }

    fn putc(&mut self, c: u8) {
        self.buf[self.tail as usize % RING_SIZE] = c;
        self.tail = self.tail.wrapping_add(1);
    }

    fn getc(&mut self) -> u8 {
        let c = self.buf[self.head as usize % RING_SIZE];
        self.head = self.head.wrapping_add(1);
        c
    }
}

/// One UART instance.
pub struct UartDevice {
    base: usize,
    rx: UnsafeCell<Ring>,
    tx: UnsafeCell<Ring>,
    rx_ready: Condition,
    tx_space: Condition,
}

// Rings are only touched inside interrupt-disable sections.
unsafe impl Send for UartDevice {}
unsafe impl Sync for UartDevice {}

impl UartDevice {
    fn reg(&self, offset: usize) -> MmioAccessor<u8, true, true> {
        unsafe { MmioAccessor::at(self.base, offset) }
    }

    fn set_ier(&self, bits: u8, on: bool) {
        let ier = self.reg(UART_IER);
        let prev = ier.read();
        ier.write(if on { prev | bits } else { prev & !bits });
    }

    fn rx(&self) -> &mut Ring {
        unsafe { &mut *self.rx.get() }
    }

    fn tx(&self) -> &mut Ring {
        unsafe { &mut *self.tx.get() }
    }

    /// Read at least one byte, blocking until input arrives.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut n = 0;
        let _guard = InterruptGuard::new();
        while self.rx().is_empty() {
            self.rx_ready.wait();
        }
        while n < buf.len() && !self.rx().is_empty() {
            buf[n] = self.rx().getc();
            n += 1;
        }
        Ok(n)
    }

    /// Write every byte, blocking while the transmit ring is full.
    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        for &b in buf {
            let _guard = InterruptGuard::new();
            while self.tx().is_full() {
                self.tx_space.wait();
            }
            self.tx().putc(b);
            self.set_ier(IER_THREIE, true);
        }
        Ok(buf.len())
    }

    fn isr(&self) {
        let _guard = InterruptGuard::new();
        while self.reg(UART_LSR).read() & LSR_DR != 0 {
            let b = self.reg(UART_RBR).read();
            // A full ring drops input rather than blocking the handler.
            if !self.rx().is_full() {
                self.rx().putc(b);
            }
        }
        self.rx_ready.broadcast();

        while self.reg(UART_LSR).read() & LSR_THRE != 0 && !self.tx().is_empty() {
            let b = self.tx().getc();
            self.reg(UART_THR).write(b);
        }
        if self.tx().is_empty() {
            self.set_ier(IER_THREIE, false);
        }
        self.tx_space.broadcast();
    }
}

/// Attach the UART at `base` as instance `instno`, interrupting on
/// `srcno`.
pub fn attach(base: usize, srcno: u32, instno: usize) {
    let dev: &'static UartDevice = alloc::boxed::Box::leak(alloc::boxed::Box::new(UartDevice {
        base,
        rx: UnsafeCell::new(Ring::new()),
        tx: UnsafeCell::new(Ring::new()),
        rx_ready: Condition::new("uart.rx_ready"),
        tx_space: Condition::new("uart.tx_space"),
    }));

    // Receive interrupts stay on; transmit interrupts are enabled only
    // while the transmit ring holds data.
    dev.reg(UART_IER).write(IER_DRIE);

    crate::dev::register_device("uart", instno, move || {
        Ok(Io::new(IoKind::Uart(dev)))
    });
    crate::dev::register_isr(srcno, 1, move || dev.isr());
}
