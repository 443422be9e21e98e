//! VirtIO entropy device driver.
//!
//! A read posts one device-writable descriptor and returns however many
//! bytes the device produced, bounced through an internal buffer.

use super::virtio::{DESC_F_WRITE, F_VERSION_1, VirtioMmio, Virtq, VirtqDesc};
use crate::io::{Io, IoKind};
use crate::thread::{Condition, Lock};
use crate::KernelError;
use bedrock::interrupt::InterruptGuard;
use core::cell::{Cell, UnsafeCell};

const BOUNCE_SIZE: usize = 512;

#[repr(C)]
struct RngDma {
    vq: Virtq,
    data: [u8; BOUNCE_SIZE],
}

/// One VirtIO entropy source.
pub struct ViorngDevice {
    regs: VirtioMmio,
    lock: Lock,
    used_ready: Condition,
    dma: UnsafeCell<RngDma>,
    last_used: Cell<u16>,
}

// The DMA area is only touched while the device lock is owned.
unsafe impl Send for ViorngDevice {}
unsafe impl Sync for ViorngDevice {}

impl ViorngDevice {
    fn dma(&self) -> &mut RngDma {
        unsafe { &mut *self.dma.get() }
    }

    /// Fill `buf` with up to one bounce buffer of entropy.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let want = buf.len().min(BOUNCE_SIZE);
        self.lock.acquire();
        let dma = self.dma();
        dma.vq.desc[0] = VirtqDesc {
            addr: dma.data.as_ptr() as u64,
            len: want as u32,
            flags: DESC_F_WRITE,
            next: 0,
        };
        let avail_idx = dma.vq.avail.idx;
        dma.vq.avail.ring[avail_idx as usize % super::virtio::QUEUE_SIZE] = 0;
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        unsafe {
            core::ptr::write_volatile(&mut dma.vq.avail.idx, avail_idx.wrapping_add(1));
        }
        self.regs.notify(0);

        loop {
            let _guard = InterruptGuard::new();
            if dma.vq.used_idx() != self.last_used.get() {
                break;
            }
            self.used_ready.wait();
        }
        let used = self.last_used.get();
        let got = dma.vq.used.ring[used as usize % super::virtio::QUEUE_SIZE].len as usize;
        self.last_used.set(used.wrapping_add(1));

        let got = got.min(want);
        buf[..got].copy_from_slice(&dma.data[..got]);
        self.lock.release();
        Ok(got)
    }

    fn isr(&self) {
        self.regs.ack_interrupt();
        self.used_ready.broadcast();
    }
}

/// Finish initialization of a discovered entropy device and register it.
pub fn attach(regs: VirtioMmio, srcno: u32, instno: usize) {
    if regs.negotiate_features(F_VERSION_1, F_VERSION_1).is_err() {
        warning!("viorng {}: feature negotiation failed", instno);
        return;
    }

    let dev: &'static ViorngDevice =
        alloc::boxed::Box::leak(alloc::boxed::Box::new(ViorngDevice {
            regs,
            lock: Lock::new(),
            used_ready: Condition::new("viorng.used_ready"),
            dma: UnsafeCell::new(RngDma {
                vq: Virtq::zeroed(),
                data: [0; BOUNCE_SIZE],
            }),
            last_used: Cell::new(0),
        }));

    if regs.setup_queue(0, &dev.dma().vq).is_err() {
        warning!("viorng {}: queue setup failed", instno);
        return;
    }
    regs.driver_ok();

    crate::dev::register_device("rng", instno, move || Ok(Io::new(IoKind::Rng(dev))));
    crate::dev::register_isr(srcno, 1, move || dev.isr());
}
