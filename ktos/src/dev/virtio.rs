//! VirtIO MMIO transport.
//!
//! The pieces shared by the block and entropy drivers: the register block,
//! the split-queue structures, feature negotiation and device discovery.
//! Queues here are tiny — one request is in flight per device at a time —
//! so each driver embeds a fixed 4-entry queue in its own DMA area. The
//! kernel is identity-mapped, which makes any kernel pointer its own bus
//! address.

use bedrock::mmio::MmioAccessor;

// Register offsets of the virtio-mmio transport (version 2).
const MAGIC_VALUE: usize = 0x000;
const VERSION: usize = 0x004;
const DEVICE_ID: usize = 0x008;
const DEVICE_FEATURES: usize = 0x010;
const DEVICE_FEATURES_SEL: usize = 0x014;
const DRIVER_FEATURES: usize = 0x020;
const DRIVER_FEATURES_SEL: usize = 0x024;
const QUEUE_SEL: usize = 0x030;
const QUEUE_NUM_MAX: usize = 0x034;
const QUEUE_NUM: usize = 0x038;
const QUEUE_READY: usize = 0x044;
const QUEUE_NOTIFY: usize = 0x050;
const INTERRUPT_STATUS: usize = 0x060;
const INTERRUPT_ACK: usize = 0x064;
const STATUS: usize = 0x070;
const QUEUE_DESC_LOW: usize = 0x080;
const QUEUE_DESC_HIGH: usize = 0x084;
const QUEUE_DRIVER_LOW: usize = 0x090;
const QUEUE_DRIVER_HIGH: usize = 0x094;
const QUEUE_DEVICE_LOW: usize = 0x0a0;
const QUEUE_DEVICE_HIGH: usize = 0x0a4;
/// Offset of the device-specific configuration space.
pub const CONFIG: usize = 0x100;

const MAGIC: u32 = 0x7472_6976; // "virt"

/// Device status bits.
pub const STAT_ACKNOWLEDGE: u32 = 1;
pub const STAT_DRIVER: u32 = 2;
pub const STAT_DRIVER_OK: u32 = 4;
pub const STAT_FEATURES_OK: u32 = 8;

/// Feature bit: the device speaks the modern (v1) protocol.
pub const F_VERSION_1: u64 = 1 << 32;

/// Number of entries in every queue the kernel builds.
pub const QUEUE_SIZE: usize = 4;

/// A descriptor in the descriptor table.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct VirtqDesc {
    /// Bus address of the buffer.
    pub addr: u64,
    /// Buffer length.
    pub len: u32,
    /// `NEXT` and/or `WRITE`.
    pub flags: u16,
    /// Index of the chained descriptor, if `NEXT` is set.
    pub next: u16,
}

/// Descriptor chains to another descriptor.
pub const DESC_F_NEXT: u16 = 1;
/// The device writes the buffer.
pub const DESC_F_WRITE: u16 = 2;

impl VirtqDesc {
    pub const fn zeroed() -> Self {
        Self {
            addr: 0,
            len: 0,
            flags: 0,
            next: 0,
        }
    }
}

/// The driver-owned available ring.
#[repr(C, align(2))]
pub struct VirtqAvail {
    pub flags: u16,
    pub idx: u16,
    pub ring: [u16; QUEUE_SIZE],
}

/// One element of the used ring.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VirtqUsedElem {
    /// Head descriptor of the completed chain.
    pub id: u32,
    /// Number of bytes the device wrote.
    pub len: u32,
}

/// The device-owned used ring.
#[repr(C, align(4))]
pub struct VirtqUsed {
    pub flags: u16,
    pub idx: u16,
    pub ring: [VirtqUsedElem; QUEUE_SIZE],
}

/// A fixed 4-entry split queue.
#[repr(C)]
pub struct Virtq {
    pub desc: [VirtqDesc; QUEUE_SIZE],
    pub avail: VirtqAvail,
    pub used: VirtqUsed,
}

impl Virtq {
    pub const fn zeroed() -> Self {
        Self {
            desc: [VirtqDesc::zeroed(); QUEUE_SIZE],
            avail: VirtqAvail {
                flags: 0,
                idx: 0,
                ring: [0; QUEUE_SIZE],
            },
            used: VirtqUsed {
                flags: 0,
                idx: 0,
                ring: [VirtqUsedElem { id: 0, len: 0 }; QUEUE_SIZE],
            },
        }
    }

    /// The device's view of the used index.
    pub fn used_idx(&self) -> u16 {
        unsafe { core::ptr::read_volatile(&self.used.idx) }
    }
}

/// Handle to one transport's register block.
#[derive(Clone, Copy)]
pub struct VirtioMmio {
    base: usize,
}

impl VirtioMmio {
    fn reg(&self, offset: usize) -> MmioAccessor<u32, true, true> {
        unsafe { MmioAccessor::at(self.base, offset) }
    }

    /// Read a 32-bit word of device configuration space.
    pub fn config_u32(&self, offset: usize) -> u32 {
        self.reg(CONFIG + offset).read()
    }

    fn set_status(&self, bits: u32) {
        let status = self.reg(STATUS);
        status.write(status.read() | bits);
    }

    /// Negotiate features: the intersection of what the device offers and
    /// `wanted` is accepted; `needed` bits missing from the result fail
    /// the handshake.
    pub fn negotiate_features(&self, wanted: u64, needed: u64) -> Result<u64, ()> {
        self.reg(DEVICE_FEATURES_SEL).write(0);
        let lo = self.reg(DEVICE_FEATURES).read() as u64;
        self.reg(DEVICE_FEATURES_SEL).write(1);
        let hi = self.reg(DEVICE_FEATURES).read() as u64;
        let offered = hi << 32 | lo;

        let enabled = offered & wanted;
        if needed & !enabled != 0 {
            return Err(());
        }
        self.reg(DRIVER_FEATURES_SEL).write(0);
        self.reg(DRIVER_FEATURES).write(enabled as u32);
        self.reg(DRIVER_FEATURES_SEL).write(1);
        self.reg(DRIVER_FEATURES).write((enabled >> 32) as u32);

        self.set_status(STAT_FEATURES_OK);
        if self.reg(STATUS).read() & STAT_FEATURES_OK == 0 {
            return Err(());
        }
        Ok(enabled)
    }

    /// Install `vq` as queue `queue` and mark it ready.
    pub fn setup_queue(&self, queue: u32, vq: &Virtq) -> Result<(), ()> {
        self.reg(QUEUE_SEL).write(queue);
        let max = self.reg(QUEUE_NUM_MAX).read();
        if (max as usize) < QUEUE_SIZE {
            return Err(());
        }
        self.reg(QUEUE_NUM).write(QUEUE_SIZE as u32);

        let desc = vq.desc.as_ptr() as u64;
        let avail = &vq.avail as *const VirtqAvail as u64;
        let used = &vq.used as *const VirtqUsed as u64;
        self.reg(QUEUE_DESC_LOW).write(desc as u32);
        self.reg(QUEUE_DESC_HIGH).write((desc >> 32) as u32);
        self.reg(QUEUE_DRIVER_LOW).write(avail as u32);
        self.reg(QUEUE_DRIVER_HIGH).write((avail >> 32) as u32);
        self.reg(QUEUE_DEVICE_LOW).write(used as u32);
        self.reg(QUEUE_DEVICE_HIGH).write((used >> 32) as u32);
        self.reg(QUEUE_READY).write(1);
        Ok(())
    }

    /// Complete initialization.
    pub fn driver_ok(&self) {
        self.set_status(STAT_DRIVER_OK);
    }

    /// Kick queue `queue`.
    pub fn notify(&self, queue: u32) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        self.reg(QUEUE_NOTIFY).write(queue);
    }

    /// Acknowledge every pending interrupt cause.
    pub fn ack_interrupt(&self) {
        let status = self.reg(INTERRUPT_STATUS).read();
        self.reg(INTERRUPT_ACK).write(status);
    }
}

/// Probe the transport at `base` and attach whatever device sits behind
/// it.
pub fn attach(base: usize, srcno: u32) {
    let regs = VirtioMmio { base };
    if regs.reg(MAGIC_VALUE).read() != MAGIC || regs.reg(VERSION).read() != 2 {
        return;
    }
    let device_id = regs.reg(DEVICE_ID).read();
    if device_id == 0 {
        // Empty slot.
        return;
    }

    regs.reg(STATUS).write(0); // reset
    regs.set_status(STAT_ACKNOWLEDGE);
    regs.set_status(STAT_DRIVER);

    let instno = (base - crate::dev::VIRTIO0_MMIO_BASE) / crate::dev::VIRTIO_MMIO_STEP;
    match device_id {
        2 => super::vioblk::attach(regs, srcno, instno),
        4 => super::viorng::attach(regs, srcno, instno),
        id => {
            info!("virtio slot {}: unsupported device id {}", instno, id);
        }
    }
}
