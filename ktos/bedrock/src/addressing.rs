//! Physical and virtual memory addressing schemes.
//!
//! This module provides abstractions for physical and virtual addresses. The
//! kernel of this machine runs identity-mapped: a kernel virtual address and
//! the physical address it names have the same numeric value, so conversion
//! between [`Pa`] and [`Kva`] is a type change only. The types still exist
//! separately because half the bugs in a memory manager come from handing a
//! physical frame number to something that wanted a pointer, or vice versa.
//!
//! [`Va`] is an address as seen through the active page table — kernel or
//! user. Its constructor enforces the Sv39 canonical form: bits 63:38 must
//! all equal bit 38.

/// The size of a single page in memory, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page number from an address.
pub const PAGE_SHIFT: usize = 12;

/// A mask for extracting the offset within a page from an address.
pub const PAGE_MASK: usize = 0xfff;

/// Represents a physical address.
///
/// A thin wrapper around `usize` for addresses in the machine's physical
/// address space. Sv39 physical addresses are at most 56 bits.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is valid.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 1 << 56 { Some(Self(addr)) } else { None }
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Convert the physical address to a kernel virtual address.
    ///
    /// The kernel is identity-mapped, so this is a type-level conversion.
    #[inline]
    pub const fn into_kva(self) -> Kva {
        Kva(self.0)
    }

    /// Align down to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Offset within the containing page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a kernel virtual address.
///
/// Because the kernel runs identity-mapped, every [`Kva`] is numerically
/// equal to the [`Pa`] it refers to. The type exists so that code which
/// dereferences memory is visibly distinct from code which programs page
/// tables with frame numbers.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Kva(usize);

impl Kva {
    /// Creates a new kernel virtual address if the address is non-null.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr != 0 { Some(Self(addr)) } else { None }
    }

    /// Returns the raw `usize` representation of the address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Converts the kernel virtual address to a physical address.
    #[inline]
    pub const fn into_pa(self) -> Pa {
        Pa(self.0)
    }

    /// Align down to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Offset within the containing page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Converts into a general virtual address.
    #[inline]
    pub const fn into_va(self) -> Va {
        Va(self.0)
    }
}

/// Represents a virtual address, kernel or user.
///
/// The constructor enforces Sv39 well-formedness: bits 63:38 must all be
/// equal, i.e. the address sign-extends from bit 38.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is well-formed.
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        let high = (addr as isize) >> 38;
        if high == 0 || high == -1 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns the raw `usize` representation of the address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align up to the page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Offset within the containing page.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::SubAssign<usize> for $t {
            fn sub_assign(&mut self, other: usize) {
                self.0 = self.0 - other
            }
        }
    };
}

impl_arith!(Kva);
impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Kva {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Kva(0x{:x})", self.0)
    }
}

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
