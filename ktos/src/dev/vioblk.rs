//! VirtIO block device driver.
//!
//! Requests move one 512-byte sector at a time through a three-descriptor
//! chain — request header, data buffer, status byte — with the device lock
//! held from descriptor setup to status readback, so a single request is
//! in flight per device. Completion arrives through the used ring and the
//! device's interrupt.

use super::virtio::{
    DESC_F_NEXT, DESC_F_WRITE, F_VERSION_1, VirtioMmio, Virtq, VirtqDesc,
};
use crate::io::{Io, IoCtl, IoKind};
use crate::thread::{Condition, Lock};
use crate::KernelError;
use bedrock::interrupt::InterruptGuard;
use core::cell::{Cell, UnsafeCell};

/// Sector size of the block device.
pub const VIOBLK_BLKSZ: usize = 512;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;
const VIRTIO_BLK_S_OK: u8 = 0;

/// Request header preceding the data buffer in every chain.
#[repr(C)]
struct BlkReqHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

// The DMA area: queue, header, bounce buffer and status byte, all at
// stable addresses inside one leaked allocation.
#[repr(C)]
struct BlkDma {
    vq: Virtq,
    header: BlkReqHeader,
    data: [u8; VIOBLK_BLKSZ],
    status: u8,
}

/// One VirtIO block device.
pub struct VioblkDevice {
    regs: VirtioMmio,
    lock: Lock,
    used_ready: Condition,
    dma: UnsafeCell<BlkDma>,
    last_used: Cell<u16>,
    capacity_sectors: u64,
}

// The DMA area is only touched while the device lock is owned.
unsafe impl Send for VioblkDevice {}
unsafe impl Sync for VioblkDevice {}

impl VioblkDevice {
    fn dma(&self) -> &mut BlkDma {
        unsafe { &mut *self.dma.get() }
    }

    // Runs one request for `sector`. The caller owns the device lock and
    // has filled the bounce buffer for a write.
    fn transfer(&self, sector: u64, write: bool) -> Result<(), KernelError> {
        let dma = self.dma();
        dma.header = BlkReqHeader {
            type_: if write { VIRTIO_BLK_T_OUT } else { VIRTIO_BLK_T_IN },
            reserved: 0,
            sector,
        };
        dma.status = 0xff;

        let data_flags = if write {
            DESC_F_NEXT
        } else {
            DESC_F_NEXT | DESC_F_WRITE
        };
        dma.vq.desc[0] = VirtqDesc {
            addr: &dma.header as *const BlkReqHeader as u64,
            len: core::mem::size_of::<BlkReqHeader>() as u32,
            flags: DESC_F_NEXT,
            next: 1,
        };
        dma.vq.desc[1] = VirtqDesc {
            addr: dma.data.as_ptr() as u64,
            len: VIOBLK_BLKSZ as u32,
            flags: data_flags,
            next: 2,
        };
        dma.vq.desc[2] = VirtqDesc {
            addr: &dma.status as *const u8 as u64,
            len: 1,
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

        // Wait for the used index to move past our request.
        loop {
            let _guard = InterruptGuard::new();
            if dma.vq.used_idx() != self.last_used.get() {
                break;
            }
            self.used_ready.wait();
        }
        self.last_used.set(self.last_used.get().wrapping_add(1));

        if dma.status == VIRTIO_BLK_S_OK {
            Ok(())
        } else {
            Err(KernelError::IOError)
        }
    }

    /// Read whole sectors at byte position `pos`.
    pub fn readat(&self, pos: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        if pos % VIOBLK_BLKSZ as u64 != 0 || buf.len() % VIOBLK_BLKSZ != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let end = self.capacity_sectors * VIOBLK_BLKSZ as u64;
        if pos >= end {
            return Ok(0);
        }
        let len = buf.len().min((end - pos) as usize);
        let mut done = 0;
        while done < len {
            let sector = (pos + done as u64) / VIOBLK_BLKSZ as u64;
            self.lock.acquire();
            let result = self.transfer(sector, false);
            if result.is_ok() {
                buf[done..done + VIOBLK_BLKSZ].copy_from_slice(&self.dma().data);
            }
            self.lock.release();
            result?;
            done += VIOBLK_BLKSZ;
        }
        Ok(done)
    }

    /// Write whole sectors at byte position `pos`.
    pub fn writeat(&self, pos: u64, buf: &[u8]) -> Result<usize, KernelError> {
        if pos % VIOBLK_BLKSZ as u64 != 0 || buf.len() % VIOBLK_BLKSZ != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let end = self.capacity_sectors * VIOBLK_BLKSZ as u64;
        if pos >= end {
            return Err(KernelError::InvalidArgument);
        }
        let len = buf.len().min((end - pos) as usize);
        let mut done = 0;
        while done < len {
            let sector = (pos + done as u64) / VIOBLK_BLKSZ as u64;
            self.lock.acquire();
            self.dma().data.copy_from_slice(&buf[done..done + VIOBLK_BLKSZ]);
            let result = self.transfer(sector, true);
            self.lock.release();
            result?;
            done += VIOBLK_BLKSZ;
        }
        Ok(done)
    }

    pub(crate) fn cntl(&self, cmd: IoCtl) -> Result<u64, KernelError> {
        match cmd {
            IoCtl::GetBlkSz => Ok(VIOBLK_BLKSZ as u64),
            IoCtl::GetEnd => Ok(self.capacity_sectors * VIOBLK_BLKSZ as u64),
            _ => Err(KernelError::NotSupportedOperation),
        }
    }

    fn isr(&self) {
        self.regs.ack_interrupt();
        self.used_ready.broadcast();
    }
}

/// Finish initialization of a discovered block device and register it.
pub fn attach(regs: VirtioMmio, srcno: u32, instno: usize) {
    if regs.negotiate_features(F_VERSION_1, F_VERSION_1).is_err() {
        warning!("vioblk {}: feature negotiation failed", instno);
        return;
    }

    // Sector count sits at the start of config space.
    let capacity_sectors =
        regs.config_u32(0) as u64 | (regs.config_u32(4) as u64) << 32;

    let dev: &'static VioblkDevice =
        alloc::boxed::Box::leak(alloc::boxed::Box::new(VioblkDevice {
            regs,
            lock: Lock::new(),
            used_ready: Condition::new("vioblk.used_ready"),
            dma: UnsafeCell::new(BlkDma {
                vq: Virtq::zeroed(),
                header: BlkReqHeader {
                    type_: 0,
                    reserved: 0,
                    sector: 0,
                },
                data: [0; VIOBLK_BLKSZ],
                status: 0,
            }),
            last_used: Cell::new(0),
            capacity_sectors,
        }));

    if regs.setup_queue(0, &dev.dma().vq).is_err() {
        warning!("vioblk {}: queue setup failed", instno);
        return;
    }
    regs.driver_ok();
    info!(
        "vioblk {}: {} KB",
        instno,
        capacity_sectors * VIOBLK_BLKSZ as u64 / 1024
    );

    crate::dev::register_device("vioblk", instno, move || {
        Ok(Io::new(IoKind::Blk(dev)))
    });
    crate::dev::register_isr(srcno, 1, move || dev.isr());
}
