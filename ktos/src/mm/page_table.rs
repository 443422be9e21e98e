//! Sv39 three-level page tables and address spaces.
//!
//! A virtual address translates through three levels of 512-entry tables:
//!
//! ```text
//! 63      39 38            30 29            21 20            12 11         0
//! +---------+----------------+----------------+----------------+-----------+
//! |  Sign   |     VPN[2]     |     VPN[1]     |     VPN[0]     |  Offset   |
//! +---------+----------------+----------------+----------------+-----------+
//! ```
//!
//! A PTE is a *leaf* if any of R/W/X is set, otherwise it points at the next
//! table level. The G bit is the single source of truth for "kernel-shared":
//! a global entry is copied by reference on [`clone_active_mspace`] and left
//! untouched by [`reset_active_mspace`], so the kernel mapping survives every
//! user address-space lifecycle operation.
//!
//! An address space is identified by an [`MSpace`] tag, the value written to
//! `satp`: paging mode, ASID and the physical page number of the root table.

use super::{Page, UMEM_END_VMA, UMEM_START_VMA};
use crate::KernelError;
use bedrock::addressing::{PAGE_SHIFT, PAGE_SIZE, Pa, Va};
use bedrock::riscv;

bitflags::bitflags! {
    /// Flags of a page-table entry.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PteFlags: usize {
        /// Valid; must be 1 for the entry to take part in translation.
        const V = 1 << 0;
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// Accessible to user mode.
        const U = 1 << 4;
        /// Global; the mapping exists in every address space.
        const G = 1 << 5;
        /// Accessed.
        const A = 1 << 6;
        /// Dirty.
        const D = 1 << 7;
    }
}

/// Number of entries in one table.
const PTE_CNT: usize = 512;
/// Bit position of the PPN field within a PTE.
const PTE_PPN_SHIFT: usize = 10;
/// satp mode field for Sv39.
const SATP_MODE_SV39: usize = 8;
const SATP_MODE_SHIFT: usize = 60;
const SATP_ASID_SHIFT: usize = 44;

/// A page-table entry.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Pte(pub usize);

impl Pte {
    /// The invalid entry.
    pub const fn null() -> Self {
        Self(0)
    }

    /// Build a leaf entry mapping `pa` with `flags` plus V, A and D.
    pub fn leaf(pa: Pa, flags: PteFlags) -> Self {
        Self(
            (pa.into_usize() >> PAGE_SHIFT) << PTE_PPN_SHIFT
                | (flags | PteFlags::V | PteFlags::A | PteFlags::D).bits(),
        )
    }

    /// Build a non-leaf entry pointing at the subtable `pa`. The global
    /// flag propagates the parent policy.
    pub fn table(pa: Pa, global: bool) -> Self {
        let mut flags = PteFlags::V;
        if global {
            flags |= PteFlags::G;
        }
        Self((pa.into_usize() >> PAGE_SHIFT) << PTE_PPN_SHIFT | flags.bits())
    }

    /// Get the flags of this entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Get the physical address this entry refers to, if valid.
    #[inline]
    pub fn pa(&self) -> Option<Pa> {
        if self.is_valid() {
            Pa::new((self.0 >> PTE_PPN_SHIFT) << PAGE_SHIFT)
        } else {
            None
        }
    }

    /// Whether the entry takes part in translation.
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0 & PteFlags::V.bits() != 0
    }

    /// Whether the entry maps a page (any of R/W/X set) rather than a
    /// subtable.
    #[inline]
    pub const fn is_leaf(&self) -> bool {
        self.0 & (PteFlags::R.bits() | PteFlags::W.bits() | PteFlags::X.bits()) != 0
    }

    /// Whether the entry is kernel-shared.
    #[inline]
    pub const fn is_global(&self) -> bool {
        self.0 & PteFlags::G.bits() != 0
    }

    /// Rewrites the R/W/X/U/G flag bits, preserving V, A and D.
    ///
    /// # Safety
    /// The caller must fence the TLB afterwards.
    #[inline]
    pub unsafe fn set_rwxug(&mut self, flags: PteFlags) {
        let keep = PteFlags::V | PteFlags::A | PteFlags::D;
        let set = flags & (PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U | PteFlags::G);
        self.0 = self.0 & !(PteFlags::all().bits() & !keep.bits()) | set.bits();
    }

    /// Clears the entry, returning the physical address it held.
    ///
    /// # Safety
    /// The caller must fence the TLB afterwards.
    #[inline]
    pub unsafe fn clear(&mut self) -> Option<Pa> {
        let pa = self.pa();
        self.0 = 0;
        pa
    }
}

// View the table stored in the frame `pa`.
unsafe fn table_of(pa: Pa) -> &'static mut [Pte; PTE_CNT] {
    unsafe { &mut *(pa.into_kva().into_usize() as *mut [Pte; PTE_CNT]) }
}

// Index of `va` at the given table level (2 = root).
fn vpn(level: usize, va: Va) -> usize {
    (va.into_usize() >> (PAGE_SHIFT + 9 * level)) & (PTE_CNT - 1)
}

fn pt_empty(pt: &[Pte; PTE_CNT]) -> bool {
    pt.iter().all(|pte| !pte.is_valid())
}

/// An address-space tag: the satp value identifying one address space.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct MSpace(usize);

impl MSpace {
    /// Build a tag for the root table at `root` with the given ASID.
    pub fn new(root: Pa, asid: u16) -> Self {
        Self(
            SATP_MODE_SV39 << SATP_MODE_SHIFT
                | (asid as usize) << SATP_ASID_SHIFT
                | root.into_usize() >> PAGE_SHIFT,
        )
    }

    /// The currently active address space.
    pub fn active() -> Self {
        Self(riscv::csrr_satp())
    }

    /// Make this address space active, returning the previous one.
    pub fn switch(self) -> Self {
        let prev = riscv::csrrw_satp(self.0);
        riscv::sfence_vma();
        Self(prev)
    }

    /// Physical address of the root table.
    pub fn root(&self) -> Pa {
        Pa::new((self.0 & (1 << SATP_ASID_SHIFT) - 1) << PAGE_SHIFT).unwrap()
    }

    /// The raw satp value.
    pub fn into_usize(self) -> usize {
        self.0
    }
}

static MAIN_MSPACE: bedrock::spinlock::SpinLock<MSpace> =
    bedrock::spinlock::SpinLock::new(MSpace(0));

/// The boot address space that owns the global kernel mappings.
pub fn main_mspace() -> MSpace {
    let guard = MAIN_MSPACE.lock();
    let m = *guard;
    guard.unlock();
    m
}

fn set_main_mspace(m: MSpace) {
    let mut guard = MAIN_MSPACE.lock();
    *guard = m;
    guard.unlock();
}

fn active_root() -> &'static mut [Pte; PTE_CNT] {
    unsafe { table_of(MSpace::active().root()) }
}

/// Map the page `pg` at `vma` in the active address space.
///
/// Missing intermediate tables are allocated on the fly. If a valid leaf
/// already exists at `vma` the call is a no-op and the passed page is
/// released. The mapping is fenced before returning.
pub fn map_page(vma: Va, pg: Page, rwxug: PteFlags) -> Result<Va, KernelError> {
    let pa = pg.into_raw();
    match install_leaf(vma, pa, rwxug) {
        Ok(true) => Ok(vma.page_down()),
        Ok(false) => {
            // Already mapped; the new frame is not needed.
            unsafe { drop(Page::from_pa(pa)) };
            Ok(vma.page_down())
        }
        Err(e) => {
            unsafe { drop(Page::from_pa(pa)) };
            Err(e)
        }
    }
}

/// Map the frame `pa` at `vma` in the active address space.
///
/// # Safety
/// `pa` must be a frame the page table may own; on success the mapping owns
/// it until [`unmap_and_free_range`] or a space-lifecycle operation frees
/// it.
pub unsafe fn map_page_raw(vma: Va, pa: Pa, rwxug: PteFlags) -> Result<Va, KernelError> {
    install_leaf(vma, pa, rwxug).map(|_| vma.page_down())
}

// Walks to the leaf slot for `vma`, creating subtables as needed, and
// installs a leaf for `pa` unless one is already present. Returns whether
// the entry was installed.
fn install_leaf(vma: Va, pa: Pa, rwxug: PteFlags) -> Result<bool, KernelError> {
    let vma = vma.page_down();
    let root = active_root();

    let installed = unsafe {
        let pt1 = walk_or_create(&mut root[vpn(2, vma)])?;
        let pt0 = walk_or_create(&mut pt1[vpn(1, vma)])?;
        let pte = &mut pt0[vpn(0, vma)];
        if pte.is_valid() {
            false
        } else {
            *pte = Pte::leaf(pa, rwxug);
            true
        }
    };
    riscv::sfence_vma();
    Ok(installed)
}

// Follow a non-leaf entry, allocating a zeroed subtable if absent.
unsafe fn walk_or_create(pte: &mut Pte) -> Result<&'static mut [Pte; PTE_CNT], KernelError> {
    if pte.is_valid() {
        if pte.is_leaf() {
            return Err(KernelError::InvalidArgument);
        }
        return Ok(unsafe { table_of(pte.pa().unwrap()) });
    }
    let sub = Page::new().ok_or(KernelError::NoMemory)?;
    let pa = sub.into_raw();
    *pte = Pte::table(pa, false);
    Ok(unsafe { table_of(pa) })
}

// Find the level-0 table covering `vma`, without allocating.
fn walk(vma: Va) -> Option<&'static mut [Pte; PTE_CNT]> {
    let root = active_root();
    let pte2 = &root[vpn(2, vma)];
    if !pte2.is_valid() || pte2.is_leaf() {
        return None;
    }
    let pt1 = unsafe { table_of(pte2.pa().unwrap()) };
    let pte1 = &pt1[vpn(1, vma)];
    if !pte1.is_valid() || pte1.is_leaf() {
        return None;
    }
    Some(unsafe { table_of(pte1.pa().unwrap()) })
}

/// Map `size` bytes of consecutive physical memory starting at `pa` to the
/// contiguous virtual range at `vma`.
///
/// # Safety
/// As [`map_page_raw`], for every page in the range.
pub unsafe fn map_range(vma: Va, size: usize, pa: Pa, rwxug: PteFlags) -> Result<Va, KernelError> {
    let vma = vma.page_down();
    let mut off = 0;
    while off < size {
        unsafe {
            map_page_raw(vma + off, pa + off, rwxug)?;
        }
        off += PAGE_SIZE;
    }
    Ok(vma)
}

/// Allocate and map `size` bytes at the contiguous virtual range starting
/// at `vma`. The backing pages are allocated independently and need not be
/// physically contiguous.
pub fn alloc_and_map_range(vma: Va, size: usize, rwxug: PteFlags) -> Result<Va, KernelError> {
    let vma = vma.page_down();
    let mut off = 0;
    while off < size {
        let pg = Page::new().ok_or(KernelError::NoMemory)?;
        map_page(vma + off, pg, rwxug)?;
        off += PAGE_SIZE;
    }
    Ok(vma)
}

/// Rewrite the leaf flags over the range; unmapped pages are skipped.
pub fn set_range_flags(vma: Va, size: usize, rwxug: PteFlags) {
    let vma = vma.page_down();
    let mut off = 0;
    while off < size {
        if let Some(pt0) = walk(vma + off) {
            let pte = &mut pt0[vpn(0, vma + off)];
            if pte.is_valid() && pte.is_leaf() {
                unsafe { pte.set_rwxug(rwxug) };
            }
        }
        off += PAGE_SIZE;
    }
    riscv::sfence_vma();
}

/// Unmap every page in the range and free its backing frame. Subtables that
/// become empty are freed as well, up to the root.
pub fn unmap_and_free_range(vma: Va, size: usize) {
    let vma = vma.page_down();
    let mut off = 0;
    while off < size {
        let va = vma + off;
        off += PAGE_SIZE;
        let Some(pt0) = walk(va) else { continue };
        let pte = &mut pt0[vpn(0, va)];
        if !pte.is_leaf() {
            continue;
        }
        unsafe {
            if let Some(pa) = pte.clear() {
                drop(Page::from_pa(pa));
            }
            riscv::sfence_vma();

            if pt_empty(pt0) {
                let root = active_root();
                let pt1 = table_of(root[vpn(2, va)].pa().unwrap());
                if let Some(pa) = pt1[vpn(1, va)].clear() {
                    drop(Page::from_pa(pa));
                }
                riscv::sfence_vma();
                if pt_empty(pt1)
                    && let Some(pa) = root[vpn(2, va)].clear()
                {
                    drop(Page::from_pa(pa));
                    riscv::sfence_vma();
                }
            }
        }
    }
}

/// Deep-copy the active address space into a new one.
///
/// Global entries are shared by copying the PTE unchanged; everything else
/// is duplicated, table by table and page by page.
pub fn clone_active_mspace() -> Result<MSpace, KernelError> {
    let src_root = active_root();
    let new_root_pg = Page::new().ok_or(KernelError::NoMemory)?;
    let new_root_pa = new_root_pg.into_raw();
    let new_root = unsafe { table_of(new_root_pa) };

    for i in 0..PTE_CNT {
        let pte2 = src_root[i];
        if !pte2.is_valid() {
            continue;
        }
        if pte2.is_global() {
            new_root[i] = pte2;
            continue;
        }
        let src1 = unsafe { table_of(pte2.pa().unwrap()) };
        let new1_pa = Page::new().ok_or(KernelError::NoMemory)?.into_raw();
        new_root[i] = Pte::table(new1_pa, false);
        let new1 = unsafe { table_of(new1_pa) };

        for j in 0..PTE_CNT {
            let pte1 = src1[j];
            if !pte1.is_valid() {
                continue;
            }
            if pte1.is_global() {
                new1[j] = pte1;
                continue;
            }
            let src0 = unsafe { table_of(pte1.pa().unwrap()) };
            let new0_pa = Page::new().ok_or(KernelError::NoMemory)?.into_raw();
            new1[j] = Pte::table(new0_pa, false);
            let new0 = unsafe { table_of(new0_pa) };

            for k in 0..PTE_CNT {
                let pte0 = src0[k];
                if !pte0.is_valid() {
                    continue;
                }
                if pte0.is_global() {
                    new0[k] = pte0;
                    continue;
                }
                let copy = Page::new().ok_or(KernelError::NoMemory)?;
                let copy_pa = copy.into_raw();
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        pte0.pa().unwrap().into_kva().into_usize() as *const u8,
                        copy_pa.into_kva().into_usize() as *mut u8,
                        PAGE_SIZE,
                    );
                }
                new0[k] = Pte::leaf(copy_pa, pte0.flags());
            }
        }
    }
    Ok(MSpace::new(new_root_pa, 0))
}

/// Unmap and free every non-global page of the active address space.
///
/// Global mappings are preserved. Subtables that end up empty are freed and
/// their parent entries cleared.
pub fn reset_active_mspace() {
    let root = active_root();
    for i in 0..PTE_CNT {
        let pte2 = root[i];
        if !pte2.is_valid() || pte2.is_global() || pte2.is_leaf() {
            continue;
        }
        let pt1 = unsafe { table_of(pte2.pa().unwrap()) };
        for j in 0..PTE_CNT {
            let pte1 = pt1[j];
            if !pte1.is_valid() || pte1.is_global() || pte1.is_leaf() {
                continue;
            }
            let pt0 = unsafe { table_of(pte1.pa().unwrap()) };
            for k in 0..PTE_CNT {
                let pte0 = pt0[k];
                if !pte0.is_valid() || pte0.is_global() {
                    continue;
                }
                unsafe {
                    if let Some(pa) = pt0[k].clear() {
                        drop(Page::from_pa(pa));
                    }
                }
                riscv::sfence_vma();
            }
            if pt_empty(pt0) {
                unsafe {
                    if let Some(pa) = pt1[j].clear() {
                        drop(Page::from_pa(pa));
                    }
                }
                riscv::sfence_vma();
            }
        }
        if pt_empty(pt1) {
            unsafe {
                if let Some(pa) = root[i].clear() {
                    drop(Page::from_pa(pa));
                }
            }
            riscv::sfence_vma();
        }
    }
    riscv::sfence_vma();
}

/// Reset the active address space, then switch back to the main one.
///
/// The root table of the discarded space is freed unless it is the main
/// space itself.
pub fn discard_active_mspace() -> MSpace {
    reset_active_mspace();
    let main = main_mspace();
    let prev = main.switch();
    if prev != main && prev.into_usize() != 0 {
        unsafe { drop(Page::from_pa(prev.root())) };
    }
    main
}

/// Handle a user-mode page fault at `vma`.
///
/// Faults inside user memory are satisfied by mapping a fresh zeroed page
/// readable and writable by user code; anything else is fatal for the
/// faulting process.
pub fn handle_umode_page_fault(vma: usize) -> bool {
    if !(UMEM_START_VMA..UMEM_END_VMA).contains(&vma) {
        return false;
    }
    let Some(va) = Va::new(vma) else { return false };
    let Some(pg) = Page::new() else { return false };
    map_page(va, pg, PteFlags::R | PteFlags::W | PteFlags::U).is_ok()
}

/// Build the kernel's identity mapping, enable paging, and seed the kernel
/// heap and the page pool with the memory the image does not occupy.
///
/// The layout mirrors the physical machine:
///
/// - `0` to `RAM_START_PMA`: RW global gigapages (the MMIO region),
/// - kernel text RX, rodata R, data RW as global 4 KiB pages,
/// - the rest of RAM as RW global 2 MiB megapages.
///
/// # Safety
/// Must run once, before paging is enabled, on the boot stack.
#[cfg(target_arch = "riscv64")]
pub unsafe fn init_main_mspace() {
    use super::{PALLOC, RAM_END_PMA, RAM_SIZE, RAM_START_PMA};
    use bedrock::addressing::Kva;

    const MEGA_SIZE: usize = 512 * PAGE_SIZE;
    const GIGA_SIZE: usize = 512 * MEGA_SIZE;

    unsafe extern "C" {
        static _kimg_start: u8;
        static _kimg_text_start: u8;
        static _kimg_text_end: u8;
        static _kimg_rodata_start: u8;
        static _kimg_rodata_end: u8;
        static _kimg_data_start: u8;
        static _kimg_end: u8;
    }

    #[repr(C, align(4096))]
    struct BootTable([Pte; PTE_CNT]);
    static mut MAIN_PT2: BootTable = BootTable([Pte::null(); PTE_CNT]);
    static mut MAIN_PT1: BootTable = BootTable([Pte::null(); PTE_CNT]);
    static mut MAIN_PT0: BootTable = BootTable([Pte::null(); PTE_CNT]);

    unsafe {
        let text_start = &_kimg_text_start as *const u8 as usize;
        let text_end = &_kimg_text_end as *const u8 as usize;
        let rodata_start = &_kimg_rodata_start as *const u8 as usize;
        let rodata_end = &_kimg_rodata_end as *const u8 as usize;
        let data_start = &_kimg_data_start as *const u8 as usize;
        let kimg_end = &_kimg_end as *const u8 as usize;

        info!(
            "           RAM: [0x{:x},0x{:x}): {} MB",
            RAM_START_PMA,
            RAM_END_PMA,
            RAM_SIZE / 1024 / 1024
        );
        info!(
            "  Kernel image: [0x{:x},0x{:x})",
            &_kimg_start as *const u8 as usize, kimg_end
        );

        // The kernel must fit inside one 2 MiB megapage.
        assert!(kimg_end - RAM_START_PMA <= MEGA_SIZE);

        let pt2 = &mut *core::ptr::addr_of_mut!(MAIN_PT2);
        let pt1 = &mut *core::ptr::addr_of_mut!(MAIN_PT1);
        let pt0 = &mut *core::ptr::addr_of_mut!(MAIN_PT0);

        // Identity-map the MMIO region as RW gigapages.
        let mut pma = 0;
        while pma < RAM_START_PMA {
            let va = Va::new(pma).unwrap();
            pt2.0[vpn(2, va)] = Pte::leaf(
                Pa::new(pma).unwrap(),
                PteFlags::R | PteFlags::W | PteFlags::G,
            );
            pma += GIGA_SIZE;
        }

        // The first megapage of RAM is mapped as individual pages with
        // permissions following the kernel image sections.
        let ram_va = Va::new(RAM_START_PMA).unwrap();
        pt2.0[vpn(2, ram_va)] = Pte::table(
            Pa::new(pt1 as *mut BootTable as usize).unwrap(),
            true,
        );
        pt1.0[vpn(1, ram_va)] = Pte::table(
            Pa::new(pt0 as *mut BootTable as usize).unwrap(),
            true,
        );

        let mut map_section = |start: usize, end: usize, flags: PteFlags| {
            let mut p = start;
            while p < end {
                pt0.0[vpn(0, Va::new(p).unwrap())] =
                    Pte::leaf(Pa::new(p).unwrap(), flags | PteFlags::G);
                p += PAGE_SIZE;
            }
        };
        map_section(text_start, text_end, PteFlags::R | PteFlags::X);
        map_section(rodata_start, rodata_end, PteFlags::R);
        map_section(
            data_start,
            RAM_START_PMA + MEGA_SIZE,
            PteFlags::R | PteFlags::W,
        );

        // The remaining RAM as RW megapages.
        let mut pma = RAM_START_PMA + MEGA_SIZE;
        while pma < RAM_END_PMA {
            pt1.0[vpn(1, Va::new(pma).unwrap())] = Pte::leaf(
                Pa::new(pma).unwrap(),
                PteFlags::R | PteFlags::W | PteFlags::G,
            );
            pma += MEGA_SIZE;
        }

        // Turn on paging.
        let main = MSpace::new(Pa::new(pt2 as *mut BootTable as usize).unwrap(), 0);
        set_main_mspace(main);
        riscv::csrw_satp(main.into_usize());
        riscv::sfence_vma();

        // The page between the image end and the next megapage boundary is
        // split between the kernel heap and the page pool.
        let heap_start = (kimg_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let heap_end = heap_start + 4 * MEGA_SIZE;
        assert!(heap_end <= RAM_END_PMA);
        crate::heap_init(heap_start, heap_end);
        info!(
            "Heap allocator: [0x{:x},0x{:x}): {} KB free",
            heap_start,
            heap_end,
            (heap_end - heap_start) / 1024
        );

        let mut allocator = PALLOC.lock();
        allocator.foster(Kva::new(heap_end).unwrap(), Kva::new(RAM_END_PMA).unwrap());
        allocator.unlock();

        // Allow supervisor code to touch user pages (syscall buffers).
        riscv::csrs_sstatus(riscv::SSTATUS_SUM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::test_pool_init;

    // Build a fresh root with one global megapage-style marker entry, make
    // it active, run `f`, then tear the space down.
    fn with_space(f: impl FnOnce()) {
        let pool = test_pool_init();
        let _serial = pool.lock().unwrap_or_else(|e| e.into_inner());

        let root = Page::new().unwrap();
        let root_pa = root.into_raw();
        // A fake global kernel mapping that lifecycle operations must not
        // touch: a global leaf at the top slot of the root.
        unsafe {
            table_of(root_pa)[511] = Pte::leaf(
                Pa::new(0x8000_0000).unwrap(),
                PteFlags::R | PteFlags::W | PteFlags::G,
            );
        }
        let space = MSpace::new(root_pa, 0);
        set_main_mspace(space);
        let prev = space.switch();
        f();
        reset_active_mspace();
        MSpace(prev.into_usize()).switch();
        unsafe { drop(Page::from_pa(root_pa)) };
    }

    #[test]
    fn map_unmap_restores_free_pages() {
        with_space(|| {
            let before = crate::mm::free_page_count();
            let va = Va::new(UMEM_START_VMA).unwrap();
            alloc_and_map_range(va, 8 * PAGE_SIZE, PteFlags::R | PteFlags::W | PteFlags::U)
                .unwrap();
            assert!(crate::mm::free_page_count() < before);
            unmap_and_free_range(va, 8 * PAGE_SIZE);
            assert_eq!(crate::mm::free_page_count(), before);
        });
    }

    #[test]
    fn map_page_is_idempotent() {
        with_space(|| {
            let va = Va::new(UMEM_START_VMA).unwrap();
            let first = Page::new().unwrap();
            let first_kva = first.kva();
            map_page(va, first, PteFlags::R | PteFlags::W | PteFlags::U).unwrap();

            // A second mapping at the same address is a no-op; the original
            // frame stays in place.
            let second = Page::new().unwrap();
            map_page(va, second, PteFlags::R | PteFlags::W | PteFlags::U).unwrap();
            let pt0 = walk(va).unwrap();
            assert_eq!(
                pt0[vpn(0, va)].pa().unwrap().into_kva().into_usize(),
                first_kva.into_usize()
            );
            unmap_and_free_range(va, PAGE_SIZE);
        });
    }

    #[test]
    fn clone_duplicates_leaves_and_shares_globals() {
        with_space(|| {
            let va = Va::new(UMEM_START_VMA).unwrap();
            alloc_and_map_range(va, PAGE_SIZE, PteFlags::R | PteFlags::W | PteFlags::U).unwrap();

            // Host tests reach mapped frames through their kernel address,
            // not through the user virtual address.
            let frame_u64 = |pa: Pa| pa.into_kva().into_usize() as *mut u64;
            let parent_pa = {
                let pt0 = walk(va).unwrap();
                pt0[vpn(0, va)].pa().unwrap()
            };
            unsafe { *frame_u64(parent_pa) = 0x1122_3344_5566_7788 };

            let parent = MSpace::active();
            let child = clone_active_mspace().unwrap();
            child.switch();
            let child_pa = {
                let pt0 = walk(va).unwrap();
                pt0[vpn(0, va)].pa().unwrap()
            };

            // The child's leaf is a different frame with identical bytes.
            assert_ne!(parent_pa, child_pa);
            assert_eq!(unsafe { *frame_u64(child_pa) }, 0x1122_3344_5566_7788);

            // Writes in the child are invisible to the parent.
            unsafe { *frame_u64(child_pa) = 0xdead_beef };
            assert_eq!(unsafe { *frame_u64(parent_pa) }, 0x1122_3344_5566_7788);

            // The global root slot was shared, not copied.
            let child_root = unsafe { table_of(MSpace::active().root()) };
            assert!(child_root[511].is_global());

            reset_active_mspace();
            let child_tag = parent.switch();
            unsafe { drop(Page::from_pa(child_tag.root())) };
            unmap_and_free_range(va, PAGE_SIZE);
        });
    }

    #[test]
    fn reset_preserves_globals() {
        with_space(|| {
            let before = crate::mm::free_page_count();
            let va = Va::new(UMEM_START_VMA).unwrap();
            alloc_and_map_range(va, 4 * PAGE_SIZE, PteFlags::R | PteFlags::W | PteFlags::U)
                .unwrap();
            reset_active_mspace();
            assert_eq!(crate::mm::free_page_count(), before);
            let root = active_root();
            assert!(root[511].is_valid() && root[511].is_global());
            // The user mapping is gone.
            assert!(walk(va).is_none());
        });
    }

    #[test]
    fn fault_handler_maps_user_memory_only(){
        with_space(|| {
            assert!(handle_umode_page_fault(UMEM_START_VMA + 0x123));
            assert!(!handle_umode_page_fault(UMEM_END_VMA));
            assert!(!handle_umode_page_fault(0x1000));
            unmap_and_free_range(Va::new(UMEM_START_VMA).unwrap(), PAGE_SIZE);
        });
    }
}
