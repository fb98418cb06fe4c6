//! User Virtual and Physical Addressing.
//!
//! This module provides the address types the VM core works with: [`Va`]
//! for a user virtual address and [`Pa`] for the physical address of a frame
//! handed out by the frame pool. Both are thin `usize` wrappers so that a
//! virtual address can never be passed where a physical one is expected.
//!
//! The user address space spans from zero up to [`KERNEL_BASE`]. Everything
//! at or above [`KERNEL_BASE`] belongs to the kernel and is never demand
//! paged. The user stack grows downward from [`USER_STACK`] and may extend at
//! most [`STACK_LIMIT`] bytes below it.
//!
//! ## Arithmetic Operations
//!
//! Both types support adding and subtracting byte offsets, and subtracting
//! two addresses of the same kind yields the distance in bytes:
//!
//! ```
//! use keos_vm::addressing::{PAGE_SIZE, Va};
//!
//! let va = Va::new(0x1234_5678).unwrap();
//! let next = va.page_down() + PAGE_SIZE;
//! assert_eq!(next - va.page_down(), PAGE_SIZE);
//! ```

/// The size of a single page in memory, in bytes.
///
/// Every page tracked by the supplemental page table, every frame and every
/// swap slot is exactly this large.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page number from a given address.
pub const PAGE_SHIFT: usize = 12;

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// The first address of the kernel address space.
///
/// Faults at or above this address are never resolved by the pager.
pub const KERNEL_BASE: usize = 0x80_0400_0000;

/// Default top of the user stack.
///
/// The initial stack page lives right below this address.
pub const USER_STACK: Va = Va(0x4748_0000);

/// Default maximum size of the user stack, in bytes.
pub const STACK_LIMIT: usize = 1 << 20;

/// Represents a physical address.
///
/// [`Pa`] names a frame handed out by a [`FramePool`]. The VM core never
/// dereferences it; the contents of the frame live in the owning
/// [`Frame`].
///
/// [`FramePool`]: crate::frame::FramePool
/// [`Frame`]: crate::frame::Frame
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is valid.
    ///
    /// # Returns
    /// - `Some(Pa)` if the address is below `0xffff_0000_0000_0000`.
    /// - `None` if the address is outside the valid range.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < 0xffff_0000_0000_0000 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Align down the physical address to the page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Extracts the page offset from the physical address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a user virtual address.
///
/// The supplemental page table is keyed by page-aligned [`Va`]s. Callers
/// round a faulting address down with [`Va::page_down`] before looking it
/// up.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new virtual address if the address is canonical.
    ///
    /// # Arguments
    /// - `addr`: A `usize` representing the virtual address.
    ///
    /// # Returns
    /// - `Some(Va)`: If the address is in the canonical lower or upper half.
    /// - `None`: If the address is non-canonical.
    ///
    /// # Example
    /// ```
    /// use keos_vm::addressing::Va;
    ///
    /// assert!(Va::new(0x4000_0000).is_some());
    /// assert!(Va::new(0x0001_0000_0000_0000).is_none());
    /// ```
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Aligns the virtual address down to the nearest page boundary.
    ///
    /// # Example
    /// ```
    /// use keos_vm::addressing::Va;
    ///
    /// let va = Va::new(0x1234_5678).unwrap();
    /// assert_eq!(va.page_down().into_usize(), 0x1234_5000);
    /// ```
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the page offset from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Returns true if the address is aligned to a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.offset() == 0
    }

    /// Returns true if the address lies in the kernel address space.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 >= KERNEL_BASE
    }

    /// Adds `len` bytes to the address, returning `None` on overflow or when
    /// the result leaves the canonical address space.
    #[inline]
    pub const fn checked_add(self, len: usize) -> Option<Self> {
        match self.0.checked_add(len) {
            Some(addr) => Self::new(addr),
            None => None,
        }
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
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        let va = Va::new(0x4000_1234).unwrap();
        assert_eq!(va.page_down(), Va::new(0x4000_1000).unwrap());
        assert_eq!(va.page_up(), Va::new(0x4000_2000).unwrap());
        assert_eq!(va.offset(), 0x234);
        assert!(!va.is_page_aligned());
        assert!(va.page_down().is_page_aligned());
    }

    #[test]
    fn kernel_boundary() {
        assert!(!Va::new(KERNEL_BASE - 1).unwrap().is_kernel());
        assert!(Va::new(KERNEL_BASE).unwrap().is_kernel());
        assert!(!USER_STACK.is_kernel());
    }

    #[test]
    fn non_canonical() {
        assert!(Va::new(0x0000_8000_0000_0000).is_none());
        assert!(Va::new(0xffff_8000_0000_0000).is_some());
        assert!(Va::new(0x7fff_ffff_f000).unwrap().checked_add(0x1000).is_none());
    }
}
