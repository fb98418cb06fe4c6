//! Kernel access to user memory.
//!
//! System calls read and write user buffers through the pager rather than
//! through raw pointers. Each access walks the buffer page by page: a page
//! that is not resident is claimed first, exactly as a fault on it would,
//! and the access is recorded in the page table so the accessed and dirty
//! bits reflect it like a hardware access.

use crate::{
    SupplementalPageTable, VmError,
    addressing::{PAGE_SIZE, Va},
};

impl SupplementalPageTable {
    /// Returns true if every byte of `[addr, addr + len)` belongs to a page
    /// of this address space, writable if `is_write`.
    ///
    /// No page is loaded.
    pub fn access_ok(&self, addr: Va, len: usize, is_write: bool) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        if len == 0 {
            return !addr.is_kernel();
        }
        let mut va = addr.page_down();
        while va < end {
            if va.is_kernel() {
                return false;
            }
            let Some(page) = self.find(va) else {
                return false;
            };
            let guard = page.lock();
            let writable = guard.writable();
            guard.unlock();
            if is_write && !writable {
                return false;
            }
            va += PAGE_SIZE;
        }
        true
    }

    /// Copies user memory at `addr` into `buf`.
    pub fn read_user(&self, addr: Va, buf: &mut [u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let va = addr.checked_add(done).ok_or(VmError::IllegalAddress)?;
            let (offset, len) = (va.offset(), (PAGE_SIZE - va.offset()).min(buf.len() - done));
            self.with_user_page(va.page_down(), false, |data| {
                buf[done..done + len].copy_from_slice(&data[offset..offset + len]);
            })?;
            done += len;
        }
        Ok(())
    }

    /// Copies `buf` into user memory at `addr`.
    ///
    /// # Returns
    /// - `Err(VmError::WriteProtectionFault)`: Part of the range is
    ///   read-only. Pages before it were already written.
    pub fn write_user(&self, addr: Va, buf: &[u8]) -> Result<(), VmError> {
        let mut done = 0;
        while done < buf.len() {
            let va = addr.checked_add(done).ok_or(VmError::IllegalAddress)?;
            let (offset, len) = (va.offset(), (PAGE_SIZE - va.offset()).min(buf.len() - done));
            self.with_user_page(va.page_down(), true, |data| {
                data[offset..offset + len].copy_from_slice(&buf[done..done + len]);
            })?;
            done += len;
        }
        Ok(())
    }

    /// Runs `f` on the contents of the resident page at `va`, claiming it if
    /// needed.
    fn with_user_page(
        &self,
        va: Va,
        is_write: bool,
        mut f: impl FnMut(&mut [u8; PAGE_SIZE]),
    ) -> Result<(), VmError> {
        if va.is_kernel() {
            return Err(VmError::IllegalAddress);
        }
        let page = self.find(va).ok_or(VmError::IllegalAddress)?;
        loop {
            let mut guard = page.lock();
            if is_write && !guard.writable() {
                guard.unlock();
                return Err(VmError::WriteProtectionFault);
            }
            if let Some(frame) = guard.frame_mut() {
                f(frame.inner_mut());
                self.page_table.record_access(va, is_write);
                guard.unlock();
                return Ok(());
            }
            guard.unlock();
            // Evicted again before we could lock it; claim and retry.
            self.claim(&page)?;
        }
    }
}
