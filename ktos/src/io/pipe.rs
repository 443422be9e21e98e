//! Pipes.
//!
//! A pipe is one shared record referenced by a write endpoint and a read
//! endpoint. Data moves through a page-sized ring buffer with byte-granular
//! head and tail cursors. The cursors are free-running `u16`s: the ring is
//! empty when they are equal and full when `tail - head == PAGE_SIZE`, which
//! distinguishes the two without wasting a slot.
//!
//! Readers block while the ring is empty as long as a writer exists, then
//! see end-of-file. Writers block while the ring is full as long as a reader
//! exists, then see a broken pipe. Closing the last endpoint of either side
//! wakes the other side so it can observe the change.

use super::{Io, IoCtl, IoKind};
use crate::mm::Page;
use crate::thread::{Condition, Lock};
use crate::KernelError;
use alloc::sync::Arc;
use bedrock::addressing::PAGE_SIZE;
use bedrock::interrupt::InterruptGuard;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

struct Ring {
    page: Page,
    head: u16,
    tail: u16,
}

impl Ring {
    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        self.tail.wrapping_sub(self.head) as usize == PAGE_SIZE
    }

    fn readable(&self) -> usize {
        self.tail.wrapping_sub(self.head) as usize
    }

    fn putc(&mut self, c: u8) {
        let tail = self.tail;
        self.page.inner_mut()[tail as usize % PAGE_SIZE] = c;
        self.tail = tail.wrapping_add(1);
    }

    fn getc(&mut self) -> u8 {
        let head = self.head;
        let c = self.page.inner()[head as usize % PAGE_SIZE];
        self.head = head.wrapping_add(1);
        c
    }
}

struct Pipe {
    ring: UnsafeCell<Ring>,
    lock: Lock,
    not_empty: Condition,
    not_full: Condition,
    readers: AtomicUsize,
    writers: AtomicUsize,
}

// The ring is only accessed under the pipe lock with cursor checks inside
// interrupt-disable sections.
unsafe impl Send for Pipe {}
unsafe impl Sync for Pipe {}

impl Pipe {
    fn ring(&self) -> &mut Ring {
        unsafe { &mut *self.ring.get() }
    }
}

/// Create a pipe, returning `(write, read)` endpoints.
pub fn create_pipe() -> Result<(Io, Io), KernelError> {
    let page = Page::new().ok_or(KernelError::NoMemory)?;
    let pipe = Arc::new(Pipe {
        ring: UnsafeCell::new(Ring {
            page,
            head: 0,
            tail: 0,
        }),
        lock: Lock::new(),
        not_empty: Condition::new("notempty"),
        not_full: Condition::new("notfull"),
        readers: AtomicUsize::new(1),
        writers: AtomicUsize::new(1),
    });
    Ok((
        Io::new(IoKind::PipeWrite(WriteEnd { pipe: pipe.clone() })),
        Io::new(IoKind::PipeRead(ReadEnd { pipe })),
    ))
}

/// The read half of a pipe.
pub struct ReadEnd {
    pipe: Arc<Pipe>,
}

impl ReadEnd {
    /// Read up to `buf.len()` bytes, blocking while the pipe is empty and a
    /// writer remains. Returns 0 at end-of-file.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let p = &*self.pipe;
        loop {
            let guard = InterruptGuard::new();
            if !p.ring().is_empty() {
                drop(guard);
                break;
            }
            if p.writers.load(Ordering::SeqCst) == 0 {
                return Ok(0);
            }
            p.not_empty.wait();
        }

        let mut n = 0;
        while n < buf.len() {
            let guard = InterruptGuard::new();
            if p.ring().is_empty() {
                drop(guard);
                break;
            }
            drop(guard);
            p.lock.acquire();
            buf[n] = p.ring().getc();
            p.lock.release();
            n += 1;
        }
        p.not_full.broadcast();
        Ok(n)
    }

    pub(super) fn cntl(&self, cmd: IoCtl) -> Result<u64, KernelError> {
        match cmd {
            IoCtl::GetBlkSz => Ok(1),
            IoCtl::GetEnd => {
                let p = &*self.pipe;
                p.lock.acquire();
                let n = p.ring().readable() as u64;
                p.lock.release();
                Ok(n)
            }
            _ => Err(KernelError::NotSupportedOperation),
        }
    }
}

impl Drop for ReadEnd {
    fn drop(&mut self) {
        self.pipe.readers.fetch_sub(1, Ordering::SeqCst);
        // Writers blocked on a full ring must observe the broken pipe.
        self.pipe.not_full.broadcast();
    }
}

/// The write half of a pipe.
pub struct WriteEnd {
    pipe: Arc<Pipe>,
}

impl WriteEnd {
    /// Write up to `buf.len()` bytes, blocking while the pipe is full and a
    /// reader remains.
    ///
    /// Losing the last reader mid-write returns the partial count if any
    /// byte went through, and a broken-pipe error otherwise.
    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        let p = &*self.pipe;
        if p.readers.load(Ordering::SeqCst) == 0 {
            return Err(KernelError::BrokenPipe);
        }
        let mut written = 0;
        while written < buf.len() {
            loop {
                let guard = InterruptGuard::new();
                if !p.ring().is_full() {
                    drop(guard);
                    break;
                }
                p.not_full.wait();
            }
            // The reader can disappear while the writer sleeps.
            if p.readers.load(Ordering::SeqCst) == 0 {
                if written > 0 {
                    p.not_empty.broadcast();
                    return Ok(written);
                }
                return Err(KernelError::BrokenPipe);
            }
            p.lock.acquire();
            p.ring().putc(buf[written]);
            p.lock.release();
            written += 1;
            if written % PAGE_SIZE == 0 {
                p.not_empty.broadcast();
            }
        }
        p.not_empty.broadcast();
        Ok(written)
    }

    pub(super) fn cntl(&self, cmd: IoCtl) -> Result<u64, KernelError> {
        match cmd {
            IoCtl::GetBlkSz => Ok(1),
            IoCtl::GetEnd => {
                let p = &*self.pipe;
                p.lock.acquire();
                let n = (PAGE_SIZE - p.ring().readable()) as u64;
                p.lock.release();
                Ok(n)
            }
            _ => Err(KernelError::NotSupportedOperation),
        }
    }
}

impl Drop for WriteEnd {
    fn drop(&mut self) {
        self.pipe.writers.fetch_sub(1, Ordering::SeqCst);
        // Readers blocked on an empty ring must observe end-of-file.
        self.pipe.not_empty.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_pool_init;

    #[test]
    fn ring_wraps_without_wasting_a_slot() {
        let _serial = test_pool_init().lock().unwrap_or_else(|e| e.into_inner());
        let mut ring = Ring {
            page: Page::new().unwrap(),
            head: 0,
            tail: 0,
        };
        assert!(ring.is_empty());
        for i in 0..PAGE_SIZE {
            assert!(!ring.is_full());
            ring.putc(i as u8);
        }
        // Every byte of the page is usable.
        assert!(ring.is_full());
        assert_eq!(ring.readable(), PAGE_SIZE);
        for i in 0..PAGE_SIZE {
            assert_eq!(ring.getc(), i as u8);
        }
        assert!(ring.is_empty());

        // The cursors keep working across u16 wraparound.
        ring.head = u16::MAX - 1;
        ring.tail = u16::MAX - 1;
        ring.putc(0xaa);
        ring.putc(0xbb);
        ring.putc(0xcc);
        assert_eq!(ring.readable(), 3);
        assert_eq!(ring.getc(), 0xaa);
        assert_eq!(ring.getc(), 0xbb);
        assert_eq!(ring.getc(), 0xcc);
        assert!(ring.is_empty());
    }

    #[test]
    fn write_then_read_round_trip() {
        let _serial = test_pool_init().lock().unwrap_or_else(|e| e.into_inner());
        let (w, r) = create_pipe().unwrap();
        let msg = b"Hello from kernel pipe!\n";
        assert_eq!(w.write(msg).unwrap(), msg.len());

        let mut buf = [0u8; 64];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(n, msg.len());
        assert_eq!(&buf[..n], msg);
        assert!(buf[n..].iter().all(|&b| b == 0));
    }

    #[test]
    fn reader_sees_eof_after_writer_closes() {
        let _serial = test_pool_init().lock().unwrap_or_else(|e| e.into_inner());
        let (w, r) = create_pipe().unwrap();
        w.write(b"bye").unwrap();
        drop(w);
        let mut buf = [0u8; 16];
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn writer_sees_broken_pipe_without_reader() {
        let _serial = test_pool_init().lock().unwrap_or_else(|e| e.into_inner());
        let (w, r) = create_pipe().unwrap();
        drop(r);
        assert_eq!(w.write(b"x"), Err(KernelError::BrokenPipe));
    }

    #[test]
    fn end_reports_fill_level_per_side() {
        let _serial = test_pool_init().lock().unwrap_or_else(|e| e.into_inner());
        let (w, r) = create_pipe().unwrap();
        w.write(b"1234").unwrap();
        assert_eq!(r.cntl(IoCtl::GetEnd).unwrap(), 4);
        assert_eq!(w.cntl(IoCtl::GetEnd).unwrap(), (PAGE_SIZE - 4) as u64);
    }
}
