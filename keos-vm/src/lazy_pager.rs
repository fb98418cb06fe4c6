//! # Lazy Paging
//!
//! Nothing is loaded until it is touched. Allocating a page, loading a
//! segment or mapping a file only records metadata in the supplemental page
//! table; the physical frame is claimed when the first access faults.
//!
//! ## Page Fault Resolution
//!
//! The trap handler decodes the hardware error code and the faulting address
//! into a [`PageFaultReason`] and hands it to
//! [`SupplementalPageTable::handle_page_fault`], which classifies the fault:
//!
//! 1. A fault on a kernel address, or a write to a page that is present but
//!    read-only, is never resolved.
//! 2. Otherwise the faulting address is rounded down to its page and looked
//!    up. A hit is the common demand-paging path: the page is claimed, which
//!    loads it from its file, its swap slot, or fills it with zeroes.
//! 3. A miss may still be a stack access. If the address lies below the top
//!    of the user stack and above `top - stack_limit`, and is no further than
//!    one stack slot (8 bytes) below the stack pointer, the stack is grown
//!    down to the faulting page and the page is claimed.
//! 4. Anything else is a bogus access. The error is returned to the caller,
//!    which terminates the faulting process.
//!
//! The stack pointer used by the heuristic is the user `rsp` at the time of
//! the fault: the one in the interrupt frame for faults raised in user mode,
//! or the one saved on entry to the kernel for faults raised while the
//! kernel accesses user memory.

use crate::{
    SupplementalPageTable, VmError,
    addressing::{PAGE_SIZE, Va},
    page::{VmMarker, VmType},
};
use alloc::vec::Vec;
use log::{debug, info};

/// Distance below the stack pointer that still counts as a stack access.
const STACK_SLOT: usize = 8;

bitflags::bitflags! {
    /// Error code pushed by the CPU on a page fault.
    pub struct PFErrorCode: u64 {
        /// The fault was caused by a page-protection violation rather than
        /// a non-present page.
        const PRESENT = 1 << 0;
        /// The access causing the fault was a write.
        const WRITE_ACCESS = 1 << 1;
        /// The access causing the fault originated in user mode.
        const USER = 1 << 2;
        /// A reserved bit was set in a paging-structure entry.
        const RESERVED = 1 << 3;
        /// The access causing the fault was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// Represents the reason for a page fault.
///
/// This struct captures the faulting address, the type of access that caused
/// the fault, and the user stack pointer at the time of the fault.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultReason {
    /// The address that caused the page fault.
    pub fault_addr: Va,

    /// Indicates whether the fault was due to a write access.
    pub is_write_access: bool,

    /// Indicates whether the page that caused the fault is present in
    /// memory.
    ///
    /// A value of `true` means the fault is a protection violation on a
    /// mapped page. A value of `false` means the page is not mapped, e.g. it
    /// was never loaded or it was evicted.
    pub is_present: bool,

    /// Indicates whether the fault was raised in user mode.
    pub is_user: bool,

    /// The user stack pointer at the time of the fault.
    pub rsp: Va,
}

impl PageFaultReason {
    /// Decodes the cause of a page fault into a [`PageFaultReason`].
    ///
    /// # Parameters
    /// - `ec`: The error code pushed by the CPU.
    /// - `cr2`: The faulting address.
    /// - `rsp`: The user stack pointer at the time of the fault.
    pub fn new(ec: PFErrorCode, cr2: Va, rsp: Va) -> Self {
        PageFaultReason {
            fault_addr: cr2,
            is_write_access: ec.contains(PFErrorCode::WRITE_ACCESS),
            is_present: ec.contains(PFErrorCode::PRESENT),
            is_user: ec.contains(PFErrorCode::USER),
            rsp,
        }
    }

    /// Returns true if the fault can be resolved by loading a page, i.e. the
    /// faulting page is not present.
    #[inline]
    pub fn is_demand_paging_fault(&self) -> bool {
        !self.is_present
    }
}

impl SupplementalPageTable {
    /// Resolves a page fault.
    ///
    /// # Returns
    /// - `Ok(())` if the faulting page is now resident and mapped.
    /// - `Err(VmError::IllegalAddress)` if the address is in kernel space, or
    ///   is neither a known page nor a valid stack access.
    /// - `Err(VmError::WriteProtectionFault)` if the access writes a
    ///   read-only page.
    /// - Any error raised while claiming the page, such as
    ///   [`VmError::FrameExhausted`] or [`VmError::ShortRead`].
    pub fn handle_page_fault(&mut self, reason: &PageFaultReason) -> Result<(), VmError> {
        let addr = reason.fault_addr;
        if addr.is_kernel() {
            return Err(VmError::IllegalAddress);
        }
        if !reason.is_demand_paging_fault() {
            return Err(if reason.is_write_access {
                VmError::WriteProtectionFault
            } else {
                VmError::IllegalAddress
            });
        }

        let va = addr.page_down();
        let page = match self.find(va) {
            Some(page) => page,
            None if self.is_stack_access(addr, reason.rsp) => {
                self.grow_stack(va)?;
                self.find(va).ok_or(VmError::IllegalAddress)?
            }
            None => return Err(VmError::IllegalAddress),
        };

        let guard = page.lock();
        let writable = guard.writable();
        guard.unlock();
        if reason.is_write_access && !writable {
            return Err(VmError::WriteProtectionFault);
        }
        self.claim(&page)
    }

    /// Resolves a page fault, reporting only whether it succeeded.
    ///
    /// A `false` return means the faulting process must be terminated.
    pub fn try_handle_fault(
        &mut self,
        addr: Va,
        is_user: bool,
        is_write: bool,
        is_not_present: bool,
        rsp: Va,
    ) -> bool {
        let reason = PageFaultReason {
            fault_addr: addr,
            is_write_access: is_write,
            is_present: !is_not_present,
            is_user,
            rsp,
        };
        match self.handle_page_fault(&reason) {
            Ok(()) => true,
            Err(e) => {
                info!("unresolvable page fault: {:?} ({:?})", reason, e);
                false
            }
        }
    }

    fn is_stack_access(&self, addr: Va, rsp: Va) -> bool {
        let top = self.vm.user_stack().into_usize();
        let bottom = top.saturating_sub(self.vm.stack_limit());
        let addr = addr.into_usize();
        addr < top && addr > bottom && addr.saturating_add(STACK_SLOT) >= rsp.into_usize()
    }

    /// Extends the stack down to `va`, creating every missing page between
    /// `va` and the lowest existing stack page.
    fn grow_stack(&mut self, va: Va) -> Result<(), VmError> {
        let top = self.vm.user_stack();
        let mut created = Vec::new();
        let mut page = va;
        while page < top && !self.pages.contains_key(&page) {
            if let Err(e) = self.alloc_page_with_initializer(
                VmType::Anon,
                VmMarker::STACK,
                page,
                true,
                None,
            ) {
                for page in created {
                    let _ = self.remove(page);
                }
                return Err(e);
            }
            created.push(page);
            page += PAGE_SIZE;
        }
        debug!("stack grown to {:?} by {} pages", va, created.len());
        Ok(())
    }
}
