//! ELF64 loader.
//!
//! Loads a RISC-V executable from a readable endpoint into the active
//! address space. Each `PT_LOAD` segment is mapped writable first so its
//! file bytes can be read in and the remainder zeroed, then narrowed to the
//! permissions the segment asks for, always user-accessible.

use crate::io::Io;
use crate::mm::page_table::{self, PteFlags};
use crate::mm::{UMEM_END_VMA, UMEM_START_VMA};
use crate::KernelError;
use bedrock::addressing::Va;

const EI_NIDENT: usize = 16;
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;

const PT_LOAD: u32 = 1;

bitflags::bitflags! {
    /// Segment permission flags of an ELF program header.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PFlags: u32 {
        /// Segment is executable.
        const X = 1 << 0;
        /// Segment is writable.
        const W = 1 << 1;
        /// Segment is readable.
        const R = 1 << 2;
    }
}

/// The ELF file header.
#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Ehdr {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

/// An ELF program header.
#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

fn read_struct<T: Copy>(io: &Io, pos: u64) -> Result<T, KernelError> {
    let mut raw = [0u8; 128];
    let size = core::mem::size_of::<T>();
    debug_assert!(size <= raw.len());
    if io.readat(pos, &mut raw[..size])? != size {
        return Err(KernelError::IOError);
    }
    // The header types are plain `repr(C)` integer records.
    Ok(unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const T) })
}

fn validate(header: &Elf64Ehdr) -> Result<(), KernelError> {
    if header.e_ident[..4] != *b"\x7fELF" {
        return Err(KernelError::NoExec);
    }
    if header.e_ident[EI_CLASS] != ELFCLASS64
        || header.e_ident[EI_DATA] != ELFDATA2LSB
        || header.e_ident[EI_VERSION] != EV_CURRENT
    {
        return Err(KernelError::NoExec);
    }
    if header.e_machine != EM_RISCV || header.e_type != ET_EXEC {
        return Err(KernelError::NoExec);
    }
    let entry = header.e_entry as usize;
    if !(UMEM_START_VMA..UMEM_END_VMA).contains(&entry) {
        return Err(KernelError::InvalidAccess);
    }
    Ok(())
}

/// Load the executable at `io` into the active address space.
///
/// Returns the entry address. The endpoint must support `readat`; every
/// loadable segment must fall inside user memory.
pub fn elf_load(io: &Io) -> Result<usize, KernelError> {
    let header: Elf64Ehdr = read_struct(io, 0)?;
    validate(&header)?;

    for i in 0..header.e_phnum {
        let phdr: Elf64Phdr = read_struct(
            io,
            header.e_phoff + i as u64 * header.e_phentsize as u64,
        )?;
        if phdr.p_type != PT_LOAD {
            continue;
        }
        let vaddr = phdr.p_vaddr as usize;
        let memsz = phdr.p_memsz as usize;
        if vaddr < UMEM_START_VMA || vaddr.saturating_add(memsz) > UMEM_END_VMA {
            return Err(KernelError::InvalidAccess);
        }
        if phdr.p_filesz > phdr.p_memsz {
            continue;
        }

        // Map writable, pull in the file bytes, zero the rest, then narrow
        // to the segment's own permissions.
        let va = Va::new(vaddr).ok_or(KernelError::InvalidAccess)?;
        page_table::alloc_and_map_range(va, memsz, PteFlags::R | PteFlags::W | PteFlags::U)?;
        let dst =
            unsafe { core::slice::from_raw_parts_mut(vaddr as *mut u8, phdr.p_filesz as usize) };
        if io.readat(phdr.p_offset, dst)? != phdr.p_filesz as usize {
            return Err(KernelError::IOError);
        }
        unsafe {
            core::ptr::write_bytes(
                (vaddr + phdr.p_filesz as usize) as *mut u8,
                0,
                memsz - phdr.p_filesz as usize,
            );
        }

        let flags = PFlags::from_bits_truncate(phdr.p_flags);
        let mut pte_flags = PteFlags::U;
        if flags.contains(PFlags::R) {
            pte_flags |= PteFlags::R;
        }
        if flags.contains(PFlags::W) {
            pte_flags |= PteFlags::W;
        }
        if flags.contains(PFlags::X) {
            pte_flags |= PteFlags::X;
        }
        page_table::set_range_flags(va, memsz, pte_flags);
    }

    Ok(header.e_entry as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn header_bytes(patch: impl FnOnce(&mut [u8])) -> Io {
        let mut raw = vec![0u8; 4096];
        raw[0..4].copy_from_slice(b"\x7fELF");
        raw[EI_CLASS] = ELFCLASS64;
        raw[EI_DATA] = ELFDATA2LSB;
        raw[EI_VERSION] = EV_CURRENT;
        raw[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        raw[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
        // Entry inside user memory, no program headers.
        raw[24..32].copy_from_slice(&(UMEM_START_VMA as u64).to_le_bytes());
        patch(&mut raw);
        Io::new_memory(raw.into_boxed_slice())
    }

    #[test]
    fn accepts_a_minimal_valid_header() {
        let io = header_bytes(|_| {});
        assert_eq!(elf_load(&io).unwrap(), UMEM_START_VMA);
    }

    #[test]
    fn rejects_bad_magic() {
        let io = header_bytes(|raw| raw[0] = 0x7e);
        assert_eq!(elf_load(&io), Err(KernelError::NoExec));
    }

    #[test]
    fn rejects_wrong_class_endianness_machine_and_type() {
        let io = header_bytes(|raw| raw[EI_CLASS] = 1);
        assert_eq!(elf_load(&io), Err(KernelError::NoExec));

        let io = header_bytes(|raw| raw[EI_DATA] = 2);
        assert_eq!(elf_load(&io), Err(KernelError::NoExec));

        let io = header_bytes(|raw| raw[18..20].copy_from_slice(&0x3eu16.to_le_bytes()));
        assert_eq!(elf_load(&io), Err(KernelError::NoExec));

        let io = header_bytes(|raw| raw[16..18].copy_from_slice(&3u16.to_le_bytes()));
        assert_eq!(elf_load(&io), Err(KernelError::NoExec));
    }

    #[test]
    fn rejects_an_entry_outside_user_memory() {
        let io = header_bytes(|raw| {
            raw[24..32].copy_from_slice(&0x8000_0000u64.to_le_bytes());
        });
        assert_eq!(elf_load(&io), Err(KernelError::InvalidAccess));
    }

    #[test]
    fn rejects_a_segment_outside_user_memory() {
        let io = header_bytes(|raw| {
            // One program header at offset 64.
            raw[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
            raw[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
            raw[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
            let ph = &mut raw[64..64 + 56];
            ph[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
            // p_vaddr below user memory.
            ph[16..24].copy_from_slice(&0x1000u64.to_le_bytes());
            ph[40..48].copy_from_slice(&0x1000u64.to_le_bytes()); // p_memsz
        });
        assert_eq!(elf_load(&io), Err(KernelError::InvalidAccess));
    }
}
