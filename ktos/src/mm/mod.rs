//! Memory management.
//!
//! Physical pages are kept in a linked list of *chunks*, where each chunk is
//! a run of consecutive free pages whose first page stores the chunk header.
//! Initially all free pages form a single large chunk; allocation prefers an
//! exact-fit chunk and otherwise breaks up the smallest chunk that is large
//! enough. Freed chunks are inserted back in address order; adjacent chunks
//! are not coalesced.
//!
//! The core abstraction handed to the rest of the kernel is the [`Page`],
//! which represents ownership of a single physical page: dropping a [`Page`]
//! returns the page to the allocator. Page-table entries take ownership of
//! frames through [`Page::into_raw`] and give it back through
//! [`Page::from_pa`].

pub mod page_table;

use crate::KernelError;
use bedrock::addressing::{Kva, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, Pa};
use bedrock::spinlock::SpinLock;
use core::ptr::NonNull;

/// Lowest virtual address of user memory.
pub const UMEM_START_VMA: usize = 0xC000_0000;
/// One past the highest virtual address of user memory.
pub const UMEM_END_VMA: usize = 0x1_0000_0000;

/// Start of RAM on the `virt` machine.
pub const RAM_START_PMA: usize = 0x8000_0000;
/// Size of RAM assumed by the kernel.
pub const RAM_SIZE: usize = 128 * 1024 * 1024;
/// One past the end of RAM.
pub const RAM_END_PMA: usize = RAM_START_PMA + RAM_SIZE;

/// Header written into the first page of every free chunk.
struct ChunkHeader {
    next: Option<NonNull<ChunkHeader>>,
    pagecnt: usize,
}

/// The free-chunk chain.
///
/// Chunks are kept in ascending address order so that a future coalescing
/// pass only needs to look at neighbors. The allocator itself never panics;
/// exhaustion surfaces as `None` and callers propagate it as out-of-memory.
pub struct PageAllocator {
    head: Option<NonNull<ChunkHeader>>,
}

unsafe impl Send for PageAllocator {}

impl PageAllocator {
    /// An empty allocator; pages arrive through [`PageAllocator::foster`].
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Add the page-aligned range `[start, end)` to the free pool.
    ///
    /// # Safety
    /// The range must be unused memory, exclusively owned by this allocator
    /// from now on.
    pub unsafe fn foster(&mut self, start: Kva, end: Kva) {
        let start = start.page_up();
        let end = end.page_down();
        if start >= end {
            return;
        }
        unsafe {
            self.insert(start.into_usize() as *mut ChunkHeader, (end - start) >> PAGE_SHIFT);
        }
    }

    /// Allocate `cnt` consecutive pages.
    ///
    /// First pass: take a chunk of exactly `cnt` pages off the chain.
    /// Second pass: pick the smallest chunk strictly larger than `cnt` and
    /// carve `cnt` pages off its low end, leaving the residual chunk header
    /// at `base + cnt * PAGE_SIZE`.
    pub fn alloc_pages(&mut self, cnt: usize) -> Option<NonNull<u8>> {
        if cnt == 0 {
            return None;
        }
        unsafe {
            // Exact fit.
            let mut prev: Option<NonNull<ChunkHeader>> = None;
            let mut cur = self.head;
            while let Some(c) = cur {
                if c.as_ref().pagecnt == cnt {
                    match prev {
                        None => self.head = c.as_ref().next,
                        Some(mut p) => p.as_mut().next = c.as_ref().next,
                    }
                    return Some(c.cast());
                }
                prev = cur;
                cur = c.as_ref().next;
            }

            // Best fit: smallest chunk strictly larger than the request.
            let mut target: Option<NonNull<ChunkHeader>> = None;
            let mut target_prev: Option<NonNull<ChunkHeader>> = None;
            let mut prev: Option<NonNull<ChunkHeader>> = None;
            let mut cur = self.head;
            while let Some(c) = cur {
                if c.as_ref().pagecnt > cnt
                    && target.is_none_or(|t| c.as_ref().pagecnt < t.as_ref().pagecnt)
                {
                    target = cur;
                    target_prev = prev;
                }
                prev = cur;
                cur = c.as_ref().next;
            }

            let t = target?;
            let rest =
                (t.as_ptr() as usize + cnt * PAGE_SIZE) as *mut ChunkHeader;
            (*rest).pagecnt = t.as_ref().pagecnt - cnt;
            (*rest).next = t.as_ref().next;
            let rest = NonNull::new_unchecked(rest);
            match target_prev {
                None => self.head = Some(rest),
                Some(mut p) => p.as_mut().next = Some(rest),
            }
            Some(t.cast())
        }
    }

    /// Return `cnt` pages starting at `base` to the free pool.
    ///
    /// # Safety
    /// The range must have come from [`PageAllocator::alloc_pages`] on this
    /// allocator and must not be referenced afterwards.
    pub unsafe fn free_pages(&mut self, base: NonNull<u8>, cnt: usize) {
        if cnt == 0 {
            return;
        }
        debug_assert_eq!(base.as_ptr() as usize & PAGE_MASK, 0);
        unsafe {
            self.insert(base.as_ptr() as *mut ChunkHeader, cnt);
        }
    }

    // Writes a fresh header and links the chunk at its address-ordered spot.
    unsafe fn insert(&mut self, chunk: *mut ChunkHeader, pagecnt: usize) {
        unsafe {
            (*chunk).pagecnt = pagecnt;
            let chunk = NonNull::new_unchecked(chunk);

            let mut prev: Option<NonNull<ChunkHeader>> = None;
            let mut cur = self.head;
            while let Some(c) = cur {
                if c > chunk {
                    break;
                }
                prev = cur;
                cur = c.as_ref().next;
            }
            (*chunk.as_ptr()).next = cur;
            match prev {
                None => self.head = Some(chunk),
                Some(mut p) => p.as_mut().next = Some(chunk),
            }
        }
    }

    /// Number of free pages in the chain.
    pub fn free_page_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head;
        while let Some(c) = cur {
            unsafe {
                count += c.as_ref().pagecnt;
                cur = c.as_ref().next;
            }
        }
        count
    }
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

static PALLOC: SpinLock<PageAllocator> = SpinLock::new(PageAllocator::new());

/// Number of physical pages currently free.
pub fn free_page_count() -> usize {
    let allocator = PALLOC.lock();
    let count = allocator.free_page_count();
    allocator.unlock();
    count
}

/// A representation of a memory page.
///
/// Encapsulates a single physical page. The page is zeroed on allocation
/// and returned to the allocator when the instance is dropped, tying frame
/// lifetime to ownership.
pub struct Page {
    kva: Kva,
}

impl Page {
    /// Allocate a new zeroed page, or `None` if physical memory is
    /// exhausted.
    #[inline]
    pub fn new() -> Option<Self> {
        let mut allocator = PALLOC.lock();
        let p = allocator.alloc_pages(1);
        allocator.unlock();
        p.map(|p| {
            unsafe {
                core::ptr::write_bytes(p.as_ptr(), 0, PAGE_SIZE);
            }
            Self {
                kva: Kva::new(p.as_ptr() as usize).unwrap(),
            }
        })
    }

    /// Get the kernel virtual address of this page.
    #[inline]
    pub fn kva(&self) -> Kva {
        self.kva
    }

    /// Get the physical address of this page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.kva.into_pa()
    }

    /// Consumes the page, returning its physical address.
    ///
    /// The caller becomes responsible for the frame; reconstitute it with
    /// [`Page::from_pa`] to release it.
    #[inline]
    pub fn into_raw(self) -> Pa {
        core::mem::ManuallyDrop::new(self).pa()
    }

    /// Reconstructs a page from a physical address.
    ///
    /// # Safety
    /// `pa` must have come from [`Page::into_raw`] and must not be in use by
    /// any other owner; reconstructing twice double-frees.
    #[inline]
    pub unsafe fn from_pa(pa: Pa) -> Self {
        Page {
            kva: pa.into_kva(),
        }
    }

    /// Read-only view of the page contents.
    pub fn inner(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.kva.into_usize() as *const u8, PAGE_SIZE) }
    }

    /// Mutable view of the page contents.
    pub fn inner_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.kva.into_usize() as *mut u8, PAGE_SIZE) }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let mut allocator = PALLOC.lock();
        unsafe {
            allocator.free_pages(
                NonNull::new_unchecked(self.kva.into_usize() as *mut u8),
                1,
            );
        }
        allocator.unlock();
    }
}

/// A run of consecutive physical pages.
pub struct ContigPages {
    kva: Kva,
    cnt: usize,
}

impl ContigPages {
    /// Allocate `size` bytes of consecutive zeroed pages.
    pub fn new(size: usize) -> Option<Self> {
        let cnt = size.div_ceil(PAGE_SIZE);
        let mut allocator = PALLOC.lock();
        let p = allocator.alloc_pages(cnt);
        allocator.unlock();
        p.map(|p| {
            unsafe {
                core::ptr::write_bytes(p.as_ptr(), 0, cnt * PAGE_SIZE);
            }
            Self {
                kva: Kva::new(p.as_ptr() as usize).unwrap(),
                cnt,
            }
        })
    }

    /// Get the kernel virtual address of the first page.
    #[inline]
    pub fn kva(&self) -> Kva {
        self.kva
    }

    /// Get the physical address of the first page.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.kva.into_pa()
    }

    /// Number of pages in the run.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.cnt
    }
}

impl Drop for ContigPages {
    fn drop(&mut self) {
        let mut allocator = PALLOC.lock();
        unsafe {
            allocator.free_pages(
                NonNull::new_unchecked(self.kva.into_usize() as *mut u8),
                self.cnt,
            );
        }
        allocator.unlock();
    }
}

/// Allocate one page, propagating exhaustion as an error.
pub fn alloc_page() -> Result<Page, KernelError> {
    Page::new().ok_or(KernelError::NoMemory)
}

/// Initialize the memory manager: build the kernel's identity mapping, turn
/// on paging, seed the kernel heap, and foster the remaining RAM into the
/// page pool.
///
/// # Safety
/// Must be called exactly once, before any allocation.
#[cfg(target_arch = "riscv64")]
pub unsafe fn init() {
    unsafe {
        page_table::init_main_mspace();
    }
}

/// Hand the page pool its memory on the host, for unit tests.
#[cfg(test)]
pub(crate) fn test_pool_init() -> &'static std::sync::Mutex<()> {
    use std::sync::{Mutex, Once};
    static ONCE: Once = Once::new();
    static LOCK: Mutex<()> = Mutex::new(());
    ONCE.call_once(|| {
        // 16 MiB arena, leaked for the duration of the test process.
        let arena = alloc::vec![0u8; 16 * 1024 * 1024].leak();
        let start = Kva::new(arena.as_mut_ptr() as usize).unwrap();
        let end = start + arena.len();
        let mut allocator = PALLOC.lock();
        unsafe { allocator.foster(start, end) };
        allocator.unlock();
    });
    &LOCK
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena(pages: usize) -> (PageAllocator, Kva) {
        let buf = alloc::vec![0u8; (pages + 1) * PAGE_SIZE].leak();
        let start = Kva::new(buf.as_mut_ptr() as usize).unwrap().page_up();
        let mut a = PageAllocator::new();
        unsafe { a.foster(start, start + pages * PAGE_SIZE) };
        (a, start)
    }

    #[test]
    fn conservation() {
        let (mut a, _) = arena(64);
        assert_eq!(a.free_page_count(), 64);
        let p1 = a.alloc_pages(3).unwrap();
        let p2 = a.alloc_pages(1).unwrap();
        let p3 = a.alloc_pages(7).unwrap();
        assert_eq!(a.free_page_count(), 64 - 11);
        unsafe {
            a.free_pages(p2, 1);
            a.free_pages(p1, 3);
            a.free_pages(p3, 7);
        }
        assert_eq!(a.free_page_count(), 64);
    }

    #[test]
    fn exact_fit_preferred() {
        let (mut a, base) = arena(64);
        // Carve the arena into chunks of 4, 2 and 58 pages.
        let p4 = a.alloc_pages(4).unwrap();
        let p2 = a.alloc_pages(2).unwrap();
        unsafe {
            a.free_pages(p4, 4);
            a.free_pages(p2, 2);
        }
        // An exact-fit request of 2 pages must take the 2-page chunk, not
        // split the 4-page chunk that precedes it in address order.
        let got = a.alloc_pages(2).unwrap();
        assert_eq!(got.as_ptr() as usize, base.into_usize() + 4 * PAGE_SIZE);
        unsafe { a.free_pages(got, 2) };
    }

    #[test]
    fn best_fit_splits_low_end() {
        let (mut a, base) = arena(64);
        let p8 = a.alloc_pages(8).unwrap();
        let hold = a.alloc_pages(1).unwrap();
        unsafe { a.free_pages(p8, 8) };
        // Chain now holds an 8-page chunk at `base` and a 55-page tail.
        // A 3-page request has no exact fit; it must split the 8-page chunk
        // from its low end.
        let got = a.alloc_pages(3).unwrap();
        assert_eq!(got.as_ptr() as usize, base.into_usize());
        // The residual 5-page chunk is an exact fit for 5.
        let rest = a.alloc_pages(5).unwrap();
        assert_eq!(rest.as_ptr() as usize, base.into_usize() + 3 * PAGE_SIZE);
        unsafe {
            a.free_pages(got, 3);
            a.free_pages(rest, 5);
            a.free_pages(hold, 1);
        }
        assert_eq!(a.free_page_count(), 64);
    }

    #[test]
    fn oom_returns_none() {
        let (mut a, _) = arena(4);
        assert!(a.alloc_pages(5).is_none());
        let p = a.alloc_pages(4).unwrap();
        assert!(a.alloc_pages(1).is_none());
        unsafe { a.free_pages(p, 4) };
    }

    #[test]
    fn freed_chunks_keep_address_order() {
        let (mut a, base) = arena(16);
        let p1 = a.alloc_pages(2).unwrap();
        let p2 = a.alloc_pages(2).unwrap();
        let p3 = a.alloc_pages(2).unwrap();
        unsafe {
            a.free_pages(p3, 2);
            a.free_pages(p1, 2);
            a.free_pages(p2, 2);
        }
        // Walking the chain must visit strictly ascending addresses.
        let mut cur = a.head;
        let mut last = 0usize;
        while let Some(c) = cur {
            let addr = c.as_ptr() as usize;
            assert!(addr > last);
            last = addr;
            cur = unsafe { c.as_ref().next };
        }
        assert!(last >= base.into_usize());
        assert_eq!(a.free_page_count(), 16);
    }
}
