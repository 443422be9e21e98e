//! Goldfish RTC driver.
//!
//! The device exposes a nanosecond wall-clock timestamp in two 32-bit
//! registers; reading the low word latches the high word. A `read` yields
//! the 8-byte little-endian timestamp.

use crate::io::{Io, IoKind};
use crate::KernelError;
use bedrock::mmio::MmioAccessor;

const RTC_TIME_LOW: usize = 0x00;
const RTC_TIME_HIGH: usize = 0x04;

/// The real-time clock.
pub struct RtcDevice {
    base: usize,
}

impl RtcDevice {
    /// Read the current timestamp into `buf`, which must hold 8 bytes.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        if buf.len() < 8 {
            return Err(KernelError::InvalidArgument);
        }
        let low: MmioAccessor<u32, true, false> =
            unsafe { MmioAccessor::at(self.base, RTC_TIME_LOW) };
        let high: MmioAccessor<u32, true, false> =
            unsafe { MmioAccessor::at(self.base, RTC_TIME_HIGH) };
        // Low first; the read latches the matching high word.
        let lo = low.read() as u64;
        let hi = high.read() as u64;
        buf[..8].copy_from_slice(&(hi << 32 | lo).to_le_bytes());
        Ok(8)
    }
}

/// Attach the RTC at `base`.
pub fn attach(base: usize) {
    let dev: &'static RtcDevice =
        alloc::boxed::Box::leak(alloc::boxed::Box::new(RtcDevice { base }));
    crate::dev::register_device("rtc", 0, move || Ok(Io::new(IoKind::Rtc(dev))));
}
