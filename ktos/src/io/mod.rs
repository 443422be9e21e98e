//! The unified I/O object.
//!
//! Every byte source or sink in the kernel — memory buffers, pipes, devices
//! and files — is reached through an [`Io`] handle. A handle is reference
//! counted: [`Io::dup`] takes a new reference and dropping the last one runs
//! the variant's teardown (closing a pipe endpoint, releasing an open file).
//!
//! The backing variants form a sum type, [`IoKind`]; an operation an
//! endpoint does not implement reports [`KernelError::NotSupportedOperation`].
//! Random access goes through `readat`/`writeat`; sequential endpoints
//! implement `read`/`write`; [`Io::new_seekable`] turns the former into the
//! latter by tracking a position and an end.

pub mod pipe;

use crate::KernelError;
use alloc::boxed::Box;
use alloc::sync::Arc;
use bedrock::spinlock::SpinLock;

/// A control operation on an I/O endpoint.
#[derive(Clone, Copy, Debug)]
pub enum IoCtl {
    /// Query the block size. Every endpoint answers; the default is 1.
    GetBlkSz,
    /// Query the current position (seekable endpoints).
    GetPos,
    /// Set the current position (seekable endpoints).
    SetPos(u64),
    /// Query the end position.
    GetEnd,
    /// Truncate or extend the endpoint, where supported.
    SetEnd(u64),
}

/// A reference-counted handle to an I/O endpoint.
///
/// Cloning is `dup`: the backing endpoint stays open until the last handle
/// is dropped.
#[derive(Clone)]
pub struct Io(Arc<IoKind>);

/// The endpoint behind an [`Io`] handle.
pub enum IoKind {
    /// A `(buffer, size)` pair in kernel memory.
    Mem(MemIo),
    /// A positioned wrapper over a random-access endpoint.
    Seek(SeekIo),
    /// The read half of a pipe.
    PipeRead(pipe::ReadEnd),
    /// The write half of a pipe.
    PipeWrite(pipe::WriteEnd),
    /// An open KTFS file.
    File(crate::ktfs::KtfsFile),
    /// A UART instance.
    Uart(&'static crate::dev::uart::UartDevice),
    /// The real-time clock.
    Rtc(&'static crate::dev::rtc::RtcDevice),
    /// A VirtIO block device.
    Blk(&'static crate::dev::vioblk::VioblkDevice),
    /// A VirtIO entropy source.
    Rng(&'static crate::dev::viorng::ViorngDevice),
}

impl Io {
    /// Wrap an endpoint into a fresh handle with one reference.
    pub fn new(kind: IoKind) -> Self {
        Self(Arc::new(kind))
    }

    /// A memory-backed endpoint owning `data`.
    pub fn new_memory(data: Box<[u8]>) -> Self {
        let end = data.len();
        Self::new(IoKind::Mem(MemIo {
            inner: SpinLock::new(MemIoInner { data, end }),
        }))
    }

    /// Wrap a random-access endpoint into a seekable stream.
    ///
    /// The backing block size must be a power of two; the initial position
    /// is 0 and the end is the backing endpoint's current end.
    pub fn new_seekable(backing: Io) -> Result<Self, KernelError> {
        let blksz = backing.cntl(IoCtl::GetBlkSz)?;
        if blksz == 0 || blksz & (blksz - 1) != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let end = backing.cntl(IoCtl::GetEnd)?;
        Ok(Self::new(IoKind::Seek(SeekIo {
            backing,
            blksz,
            state: SpinLock::new(SeekState { pos: 0, end }),
        })))
    }

    /// Take an additional reference to the endpoint.
    pub fn dup(&self) -> Self {
        self.clone()
    }

    /// Read up to `buf.len()` bytes. Short reads are allowed; 0 means
    /// end-of-stream.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        match &*self.0 {
            IoKind::Seek(s) => s.read(buf),
            IoKind::PipeRead(p) => p.read(buf),
            IoKind::Uart(u) => u.read(buf),
            IoKind::Rtc(r) => r.read(buf),
            IoKind::Rng(r) => r.read(buf),
            _ => Err(KernelError::NotSupportedOperation),
        }
    }

    /// Write `buf`, retrying until every byte is written, an error occurs,
    /// or the endpoint stops making progress.
    ///
    /// A pipe that loses its reader mid-write yields the partial count.
    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        let mut pos = 0;
        while pos < buf.len() {
            match self.write_some(&buf[pos..]) {
                Ok(0) => break,
                Ok(n) => pos += n,
                Err(KernelError::BrokenPipe) if pos > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(pos)
    }

    fn write_some(&self, buf: &[u8]) -> Result<usize, KernelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        match &*self.0 {
            IoKind::Seek(s) => s.write(buf),
            IoKind::PipeWrite(p) => p.write(buf),
            IoKind::Uart(u) => u.write(buf),
            _ => Err(KernelError::NotSupportedOperation),
        }
    }

    /// Read up to `buf.len()` bytes at absolute position `pos`.
    pub fn readat(&self, pos: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        match &*self.0 {
            IoKind::Mem(m) => m.readat(pos, buf),
            IoKind::Seek(s) => s.backing.readat(pos, buf),
            IoKind::File(f) => f.readat(pos, buf),
            IoKind::Blk(b) => b.readat(pos, buf),
            _ => Err(KernelError::NotSupportedOperation),
        }
    }

    /// Write `buf` at absolute position `pos`.
    pub fn writeat(&self, pos: u64, buf: &[u8]) -> Result<usize, KernelError> {
        match &*self.0 {
            IoKind::Mem(m) => m.writeat(pos, buf),
            IoKind::Seek(s) => s.backing.writeat(pos, buf),
            IoKind::File(f) => f.writeat(pos, buf),
            IoKind::Blk(b) => b.writeat(pos, buf),
            _ => Err(KernelError::NotSupportedOperation),
        }
    }

    /// Perform a control operation.
    pub fn cntl(&self, cmd: IoCtl) -> Result<u64, KernelError> {
        match &*self.0 {
            IoKind::Mem(m) => m.cntl(cmd),
            IoKind::Seek(s) => s.cntl(cmd),
            IoKind::PipeRead(p) => p.cntl(cmd),
            IoKind::PipeWrite(p) => p.cntl(cmd),
            IoKind::File(f) => f.cntl(cmd),
            IoKind::Blk(b) => b.cntl(cmd),
            _ => match cmd {
                // Stream endpoints all report the default block size.
                IoCtl::GetBlkSz => Ok(1),
                _ => Err(KernelError::NotSupportedOperation),
            },
        }
    }
}

struct MemIoInner {
    data: Box<[u8]>,
    end: usize,
}

/// A memory-backed random-access endpoint.
pub struct MemIo {
    inner: SpinLock<MemIoInner>,
}

impl MemIo {
    fn readat(&self, pos: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        let inner = self.inner.lock();
        let result = (|| {
            let pos = pos as usize;
            if pos > inner.end {
                return Err(KernelError::InvalidArgument);
            }
            let n = buf.len().min(inner.end - pos);
            buf[..n].copy_from_slice(&inner.data[pos..pos + n]);
            Ok(n)
        })();
        inner.unlock();
        result
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> Result<usize, KernelError> {
        let mut inner = self.inner.lock();
        let result = (|| {
            let pos = pos as usize;
            if pos > inner.end {
                return Err(KernelError::InvalidArgument);
            }
            let n = buf.len().min(inner.end - pos);
            inner.data[pos..pos + n].copy_from_slice(&buf[..n]);
            Ok(n)
        })();
        inner.unlock();
        result
    }

    fn cntl(&self, cmd: IoCtl) -> Result<u64, KernelError> {
        let mut inner = self.inner.lock();
        let result = match cmd {
            IoCtl::GetBlkSz => Ok(1),
            IoCtl::GetEnd => Ok(inner.end as u64),
            // The buffer may shrink but never grow.
            IoCtl::SetEnd(v) if (v as usize) < inner.end => {
                inner.end = v as usize;
                Ok(0)
            }
            IoCtl::SetEnd(_) => Err(KernelError::InvalidArgument),
            _ => Err(KernelError::NotSupportedOperation),
        };
        inner.unlock();
        result
    }
}

struct SeekState {
    pos: u64,
    end: u64,
}

/// A positioned wrapper over a random-access endpoint.
pub struct SeekIo {
    backing: Io,
    blksz: u64,
    state: SpinLock<SeekState>,
}

impl SeekIo {
    fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let state = self.state.lock();
        let (pos, end) = (state.pos, state.end);
        state.unlock();

        // Reads stop at the end and are block-granular.
        let mut len = (buf.len() as u64).min(end - pos);
        if len == 0 {
            return Ok(0);
        }
        if len < self.blksz {
            return Err(KernelError::InvalidArgument);
        }
        len &= !(self.blksz - 1);

        let n = self.backing.readat(pos, &mut buf[..len as usize])?;
        let mut state = self.state.lock();
        state.pos = pos + n as u64;
        state.unlock();
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        let state = self.state.lock();
        let (pos, end) = (state.pos, state.end);
        state.unlock();

        if buf.is_empty() {
            return Ok(0);
        }
        let mut len = buf.len() as u64;
        if len < self.blksz {
            return Err(KernelError::InvalidArgument);
        }
        len &= !(self.blksz - 1);

        // Writing past the end grows the backing endpoint first.
        if end - pos < len {
            let new_end = pos.checked_add(len).ok_or(KernelError::InvalidArgument)?;
            self.backing.cntl(IoCtl::SetEnd(new_end))?;
            let mut state = self.state.lock();
            state.end = new_end;
            state.unlock();
        }

        let n = self.backing.writeat(pos, &buf[..len as usize])?;
        let mut state = self.state.lock();
        state.pos = pos + n as u64;
        state.unlock();
        Ok(n)
    }

    fn cntl(&self, cmd: IoCtl) -> Result<u64, KernelError> {
        match cmd {
            IoCtl::GetBlkSz => Ok(self.blksz),
            IoCtl::GetPos => {
                let state = self.state.lock();
                let pos = state.pos;
                state.unlock();
                Ok(pos)
            }
            IoCtl::SetPos(v) => {
                // The position must be block-aligned and within the stream.
                if v & (self.blksz - 1) != 0 {
                    return Err(KernelError::InvalidArgument);
                }
                let mut state = self.state.lock();
                let result = if v > state.end {
                    Err(KernelError::InvalidArgument)
                } else {
                    state.pos = v;
                    Ok(0)
                };
                state.unlock();
                result
            }
            IoCtl::GetEnd => {
                let state = self.state.lock();
                let end = state.end;
                state.unlock();
                Ok(end)
            }
            IoCtl::SetEnd(v) => {
                self.backing.cntl(IoCtl::SetEnd(v))?;
                let mut state = self.state.lock();
                state.end = v;
                state.unlock();
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn memory_io_clamps_to_end() {
        let io = Io::new_memory(vec![7u8; 100].into_boxed_slice());
        let mut buf = [0u8; 64];
        assert_eq!(io.readat(90, &mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], &[7; 10]);
        assert_eq!(io.readat(100, &mut buf).unwrap(), 0);
        assert_eq!(io.readat(101, &mut buf), Err(KernelError::InvalidArgument));

        assert_eq!(io.writeat(96, &[1, 2, 3, 4, 5, 6]).unwrap(), 4);
        assert_eq!(io.readat(96, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn memory_io_end_shrinks_only() {
        let io = Io::new_memory(vec![0u8; 100].into_boxed_slice());
        assert_eq!(io.cntl(IoCtl::GetEnd).unwrap(), 100);
        assert!(io.cntl(IoCtl::SetEnd(40)).is_ok());
        assert_eq!(io.cntl(IoCtl::GetEnd).unwrap(), 40);
        assert_eq!(
            io.cntl(IoCtl::SetEnd(80)),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn seekable_tracks_position() {
        let mem = Io::new_memory((0u8..200).collect::<vec::Vec<u8>>().into_boxed_slice());
        let io = Io::new_seekable(mem).unwrap();
        assert_eq!(io.cntl(IoCtl::GetBlkSz).unwrap(), 1);
        assert_eq!(io.cntl(IoCtl::GetEnd).unwrap(), 200);

        let mut buf = [0u8; 10];
        assert_eq!(io.read(&mut buf).unwrap(), 10);
        assert_eq!(buf[9], 9);
        assert_eq!(io.cntl(IoCtl::GetPos).unwrap(), 10);

        io.cntl(IoCtl::SetPos(190)).unwrap();
        let mut big = [0u8; 64];
        // Reads stop at the end.
        assert_eq!(io.read(&mut big).unwrap(), 10);
        assert_eq!(big[0], 190);
        assert_eq!(io.read(&mut big).unwrap(), 0);

        // A position past the end is rejected.
        assert_eq!(
            io.cntl(IoCtl::SetPos(201)),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn dup_shares_the_endpoint() {
        let io = Io::new_memory(vec![0u8; 16].into_boxed_slice());
        let dup = io.dup();
        dup.writeat(0, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        io.readat(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }
}
