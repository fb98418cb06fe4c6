//! Address-space page table interface.
//!
//! The VM core never walks hardware page tables itself. It installs and
//! removes translations through the [`PageTable`] trait and reads back the
//! accessed and dirty bits the MMU records in each [`Pte`]. The page table is
//! the single source of truth for "currently mapped" and "written since
//! load": eviction consults the accessed bit for its second-chance policy,
//! and write-back of file-backed pages consults the dirty bit.
//!
//! [`SoftPageTable`] is an in-memory implementation of the trait. It keeps
//! one [`Pte`] per mapped page and lets the kernel record accesses the way
//! the hardware would (see [`PageTable::record_access`]).

use crate::{
    addressing::{PAGE_MASK, Pa, Va},
    sync::SpinLock,
};
use alloc::collections::BTreeMap;

bitflags::bitflags! {
    /// Flags for a page table entry.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page.
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page.
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed.
        const US = 1 << 2;
        /// Accessed; indicates whether software has accessed the page.
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the page.
        const D = 1 << 6;
        /// If IA32_EFER.NXE = 1, execute-disable.
        const XD = 1 << 63;
    }
}

/// Page Table Entry (PTE).
///
/// The upper bits hold the physical address of the mapped frame and the low
/// bits hold the [`PteFlags`].
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct Pte(pub usize);

impl Pte {
    /// Get the physical address pointed to by this entry.
    ///
    /// # Returns
    /// - `Some(Pa)` if the page is present, containing the physical address.
    /// - `None` if the page is not present (i.e., the "P" flag is not set).
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Pa::new(self.0 & !PteFlags::all().bits() & !PAGE_MASK)
        } else {
            None
        }
    }

    /// Get the flags associated with this page table entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Set the physical address for this entry, marking it present.
    ///
    /// # Returns
    /// - `Ok(&mut Self)` if the address is valid and the update is successful.
    /// - `Err(PageTableMappingError::Unaligned)` if the provided physical
    ///   address is not aligned.
    #[inline]
    pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, PageTableMappingError> {
        let pa = pa.into_usize();
        if pa & PAGE_MASK != 0 {
            Err(PageTableMappingError::Unaligned)
        } else {
            self.0 = pa | self.flags().bits() | PteFlags::P.bits();
            Ok(self)
        }
    }

    /// Replace the flags of this entry, keeping the physical address.
    #[inline]
    pub fn set_flags(&mut self, flags: PteFlags) -> &mut Self {
        self.0 = (self.0 & !PteFlags::all().bits()) | flags.bits();
        self
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte({:?}, {:?})", self.pa(), self.flags())
    }
}

/// Errors that can occur during page table operations.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PageTableMappingError {
    /// Unaligned address.
    ///
    /// This error is returned when an address provided for a page table entry
    /// is not properly aligned to the page size.
    Unaligned,

    /// Not exist.
    ///
    /// This error is returned when a requested page table entry does not exist
    /// or has not been mapped yet.
    NotExist,

    /// Duplicated mapping.
    ///
    /// This error is returned when an attempt is made to create a duplicate
    /// mapping for an address that already has an existing mapping.
    Duplicated,
}

/// An address-space page table.
///
/// Implementors translate user virtual pages to physical frames for one
/// address space. All methods take `&self`: the table is shared between the
/// owning address space and the global frame table, which clears mappings
/// of evicted pages.
pub trait PageTable
where
    Self: Send + Sync,
{
    /// Maps the page at `va` to the frame at `pa`.
    ///
    /// # Returns
    /// - `Ok(())` if the mapping was installed.
    /// - `Err(PageTableMappingError::Duplicated)` if `va` is already mapped.
    /// - `Err(PageTableMappingError::Unaligned)` if either address is not
    ///   page aligned.
    fn map(&self, va: Va, pa: Pa, writable: bool) -> Result<(), PageTableMappingError>;

    /// Removes the mapping at `va`, returning the frame it pointed to.
    fn unmap(&self, va: Va) -> Result<Pa, PageTableMappingError>;

    /// Returns a copy of the entry mapping `va`.
    fn walk(&self, va: Va) -> Result<Pte, PageTableMappingError>;

    /// Sets the flags in `set` and clears the flags in `clear` on the entry
    /// mapping `va`.
    fn update_flags(
        &self,
        va: Va,
        set: PteFlags,
        clear: PteFlags,
    ) -> Result<(), PageTableMappingError>;

    /// Returns true if the page at `va` is mapped and was written since the
    /// dirty bit was last cleared.
    fn is_dirty(&self, va: Va) -> bool {
        self.walk(va)
            .map(|pte| pte.flags().contains(PteFlags::D))
            .unwrap_or(false)
    }

    /// Clears the dirty bit of the page at `va`, if mapped.
    fn clear_dirty(&self, va: Va) {
        let _ = self.update_flags(va, PteFlags::empty(), PteFlags::D);
    }

    /// Sets the dirty bit of the page at `va`, if mapped.
    fn set_dirty(&self, va: Va) {
        let _ = self.update_flags(va, PteFlags::D, PteFlags::empty());
    }

    /// Returns true if the page at `va` is mapped and was accessed since the
    /// accessed bit was last cleared.
    fn is_accessed(&self, va: Va) -> bool {
        self.walk(va)
            .map(|pte| pte.flags().contains(PteFlags::A))
            .unwrap_or(false)
    }

    /// Clears the accessed bit of the page at `va`, if mapped.
    fn clear_accessed(&self, va: Va) {
        let _ = self.update_flags(va, PteFlags::empty(), PteFlags::A);
    }

    /// Records an access to the page at `va` as the MMU would: the accessed
    /// bit is set, and the dirty bit too if `is_write`.
    fn record_access(&self, va: Va, is_write: bool) {
        let flags = if is_write {
            PteFlags::A | PteFlags::D
        } else {
            PteFlags::A
        };
        let _ = self.update_flags(va, flags, PteFlags::empty());
    }
}

/// An in-memory page table.
///
/// Keeps one [`Pte`] per mapped user page. Useful wherever the hardware
/// table is not reachable, e.g. for host-side testing of the pager.
#[derive(Default)]
pub struct SoftPageTable {
    entries: SpinLock<BTreeMap<Va, Pte>>,
}

impl SoftPageTable {
    /// Creates an empty page table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of installed mappings.
    pub fn len(&self) -> usize {
        let guard = self.entries.lock();
        let len = guard.len();
        guard.unlock();
        len
    }

    /// Returns true if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PageTable for SoftPageTable {
    fn map(&self, va: Va, pa: Pa, writable: bool) -> Result<(), PageTableMappingError> {
        if !va.is_page_aligned() {
            return Err(PageTableMappingError::Unaligned);
        }
        let mut pte = Pte(0);
        pte.set_pa(pa)?.set_flags(if writable {
            PteFlags::P | PteFlags::US | PteFlags::RW
        } else {
            PteFlags::P | PteFlags::US
        });

        let mut guard = self.entries.lock();
        let result = if guard.contains_key(&va) {
            Err(PageTableMappingError::Duplicated)
        } else {
            guard.insert(va, pte);
            Ok(())
        };
        guard.unlock();
        result
    }

    fn unmap(&self, va: Va) -> Result<Pa, PageTableMappingError> {
        let mut guard = self.entries.lock();
        let pte = guard.remove(&va);
        guard.unlock();
        pte.and_then(|pte| pte.pa())
            .ok_or(PageTableMappingError::NotExist)
    }

    fn walk(&self, va: Va) -> Result<Pte, PageTableMappingError> {
        let guard = self.entries.lock();
        let pte = guard.get(&va).copied();
        guard.unlock();
        pte.ok_or(PageTableMappingError::NotExist)
    }

    fn update_flags(
        &self,
        va: Va,
        set: PteFlags,
        clear: PteFlags,
    ) -> Result<(), PageTableMappingError> {
        let mut guard = self.entries.lock();
        let result = match guard.get_mut(&va) {
            Some(pte) => {
                let flags = (pte.flags() | set) - clear;
                pte.set_flags(flags);
                Ok(())
            }
            None => Err(PageTableMappingError::NotExist),
        };
        guard.unlock();
        result
    }
}
