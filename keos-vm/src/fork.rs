//! # Fork
//!
//! `fork` gives the child a private copy of the parent's address space. The
//! child's supplemental page table receives one new page per page of the
//! parent, at the same address, with the same permissions and in the same
//! lifecycle stage:
//!
//! - An uninitialized page is copied as an uninitialized page with the same
//!   target type and lazy-load descriptor. Neither side has loaded it, so
//!   both will load it from the same source on their own first fault.
//! - A decoded page (anonymous or file-backed) gets a fresh frame in the
//!   child, filled with the parent's current contents: the resident frame,
//!   the swap slot of an evicted anonymous page, or the file range of an
//!   evicted file-backed page. A file-backed page dirty in the parent is
//!   marked dirty in the child as well.
//!
//! The child also inherits the parent's mapping runs. Its file-backed pages
//! share the parent run's reopened file handle.
//!
//! The copy is all-or-nothing. If any page cannot be copied, e.g. because
//! no frame can be found, the partially built child table is torn down and
//! the error is returned.

use crate::{
    SupplementalPageTable, VmError,
    addressing::PAGE_SIZE,
    page::{AnonPage, FilePage, Page, PageState},
    page_table::PageTable,
};
use alloc::{boxed::Box, sync::Arc};
use log::warn;

impl SupplementalPageTable {
    /// Copies every page of `src` into `dst`.
    ///
    /// On failure `dst` is torn down and left empty.
    pub fn copy(dst: &mut Self, src: &Self) -> Result<(), VmError> {
        match Self::copy_pages(dst, src) {
            Ok(()) => {
                dst.mmaps = src.mmaps.clone();
                Ok(())
            }
            Err(e) => {
                warn!("fork: copy of the address space failed: {:?}", e);
                dst.teardown();
                Err(e)
            }
        }
    }

    fn copy_pages(dst: &mut Self, src: &Self) -> Result<(), VmError> {
        let mut contents = Box::new([0u8; PAGE_SIZE]);
        for (va, page) in src.pages.iter() {
            let va = *va;
            let guard = page.lock();
            let (writable, marker) = (guard.writable(), guard.marker());
            let state = match guard.state() {
                PageState::Uninit(uninit) => PageState::Uninit(uninit.clone()),
                PageState::Anon(_) => PageState::Anon(AnonPage::new()),
                PageState::File(file) => PageState::File(FilePage::new(file.aux().clone())),
            };
            let decoded = !matches!(state, PageState::Uninit(_));
            let dirty = decoded && src.page_table.is_dirty(va);
            let snapshot = if decoded {
                guard.snapshot(&mut contents, &src.vm)
            } else {
                Ok(())
            };
            guard.unlock();
            snapshot?;

            let child = dst.insert(Page::new(va, writable, marker, state))?;
            if decoded {
                // The dirty bit must be in place before the frame becomes an
                // eviction candidate.
                let child_pt = dst.page_table.clone();
                dst.claim_with(&child, |_, frame, _| {
                    frame.inner_mut().copy_from_slice(&contents[..]);
                    if dirty {
                        child_pt.set_dirty(va);
                    }
                    Ok(())
                })?;
            }
        }
        Ok(())
    }

    /// Creates a copy of this address space translated by `page_table`.
    pub fn fork(&self, page_table: Arc<dyn PageTable>) -> Result<Self, VmError> {
        let mut child = Self::new(self.vm.clone(), page_table);
        Self::copy(&mut child, self)?;
        Ok(child)
    }
}
