//! # Supplemental Page Table
//!
//! The hardware page table only knows about pages that are resident. The
//! **supplemental page table** (SPT) knows about every page an address space
//! may legally touch: pages that were never loaded, pages that were evicted
//! to swap, pages backed by a mapped file, and resident pages alike. It is
//! the first thing the pager consults on a page fault.
//!
//! Each address space owns exactly one [`SupplementalPageTable`]. It maps
//! page-aligned virtual addresses to [`Page`]s, and owns those pages
//! exclusively: no page is ever shared between two tables. Next to the
//! pages, it keeps the list of mapping runs created by `mmap` (see
//! [`mmap`](crate::mmap)).
//!
//! ## Claiming a page
//!
//! Making a page resident is called **claiming** it:
//!
//! 1. A [`Frame`] is obtained from the global frame table, evicting another
//!    page if physical memory is exhausted.
//! 2. The frame is mapped at the page's address with the page's writable
//!    flag.
//! 3. The page's type-specific `swap_in` fills the frame.
//! 4. The frame is attached to the page and registered in the frame table,
//!    which makes it a candidate for eviction.
//!
//! If any step fails, the mapping is removed and the frame goes back to the
//! pool; the page is left exactly as it was.
//!
//! ## Teardown
//!
//! When the address space dies, [`SupplementalPageTable::teardown`] first
//! unmaps every mapping run, so that dirty file-backed pages reach their
//! file, and then destroys the remaining pages, releasing their frames and
//! swap slots. Dropping the table tears it down.

use crate::{
    Vm, VmError,
    addressing::{PAGE_SIZE, Va},
    frame::Frame,
    fs::RegularFile,
    mmap::MmapRun,
    page::{LazyLoad, Page, PageRef, PageState, UninitPage, VmMarker, VmType},
    page_table::PageTable,
    sync::SpinLock,
};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use log::warn;

/// The supplemental page table of an address space.
pub struct SupplementalPageTable {
    pub(crate) pages: BTreeMap<Va, PageRef>,
    pub(crate) mmaps: Vec<MmapRun>,
    pub(crate) page_table: Arc<dyn PageTable>,
    pub(crate) vm: Arc<Vm>,
}

impl SupplementalPageTable {
    /// Creates an empty table for the address space translated by
    /// `page_table`.
    pub fn new(vm: Arc<Vm>, page_table: Arc<dyn PageTable>) -> Self {
        Self {
            pages: BTreeMap::new(),
            mmaps: Vec::new(),
            page_table,
            vm,
        }
    }

    /// The shared virtual memory services.
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// The page table of the address space.
    pub fn page_table(&self) -> &Arc<dyn PageTable> {
        &self.page_table
    }

    /// Number of pages in the table.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns true if the table holds no page.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Iterates over the pages in address order.
    pub fn pages(&self) -> impl Iterator<Item = (Va, &PageRef)> + '_ {
        self.pages.iter().map(|(va, page)| (*va, page))
    }

    /// The mapping runs created by `mmap`, in address order.
    pub fn mmaps(&self) -> &[MmapRun] {
        &self.mmaps
    }

    /// Finds the page containing `va`.
    ///
    /// The address is rounded down to its page before the lookup.
    pub fn find(&self, va: Va) -> Option<PageRef> {
        self.pages.get(&va.page_down()).cloned()
    }

    /// Inserts `page` into the table.
    ///
    /// # Returns
    /// - `Ok(PageRef)`: The handle of the inserted page.
    /// - `Err(VmError::DuplicateMapping)`: A page already exists at that
    ///   address; the table is left unchanged.
    pub fn insert(&mut self, page: Page) -> Result<PageRef, VmError> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(VmError::DuplicateMapping);
        }
        let page = Arc::new(SpinLock::new(page));
        self.pages.insert(va, page.clone());
        Ok(page)
    }

    /// Removes the page containing `va` and destroys it.
    ///
    /// # Returns
    /// - `Err(VmError::InvalidArgument)`: The page belongs to a mapping run;
    ///   runs are only removed as a whole with `munmap`.
    /// - `Err(VmError::NoSuchEntry)`: No page exists at that address.
    pub fn remove(&mut self, va: Va) -> Result<(), VmError> {
        if self.mmaps.iter().any(|run| run.contains(va.page_down())) {
            return Err(VmError::InvalidArgument);
        }
        let page = self
            .pages
            .remove(&va.page_down())
            .ok_or(VmError::NoSuchEntry)?;
        self.destroy_page(&page);
        Ok(())
    }

    pub(crate) fn destroy_page(&self, page: &PageRef) {
        let mut guard = page.lock();
        guard.destroy(self.page_table.as_ref(), &self.vm);
        guard.unlock();
    }

    /// Creates an uninitialized page at `va` that becomes a `ty` page on
    /// its first fault.
    ///
    /// # Parameters
    /// - `ty`: Type of the page once loaded, [`VmType::Anon`] or
    ///   [`VmType::File`].
    /// - `marker`: Markers attached to the page.
    /// - `va`: Page-aligned user address of the page.
    /// - `writable`: Whether user code may write to the page.
    /// - `aux`: How to populate the page. Mandatory for file-backed pages.
    ///
    /// # Returns
    /// - `Err(VmError::InvalidArgument)`: `va` is not page aligned, `ty` is
    ///   [`VmType::Uninit`], or a file-backed page has no descriptor.
    /// - `Err(VmError::IllegalAddress)`: `va` is a kernel address.
    /// - `Err(VmError::DuplicateMapping)`: A page already exists at `va`.
    pub fn alloc_page_with_initializer(
        &mut self,
        ty: VmType,
        marker: VmMarker,
        va: Va,
        writable: bool,
        aux: Option<LazyLoad>,
    ) -> Result<(), VmError> {
        if !va.is_page_aligned() {
            return Err(VmError::InvalidArgument);
        }
        if va.is_kernel() {
            return Err(VmError::IllegalAddress);
        }
        let uninit = UninitPage::new(ty, aux)?;
        self.insert(Page::new(va, writable, marker, PageState::Uninit(uninit)))?;
        Ok(())
    }

    /// Creates an uninitialized page at `va` without a lazy-load descriptor.
    pub fn alloc_page(&mut self, ty: VmType, va: Va, writable: bool) -> Result<(), VmError> {
        self.alloc_page_with_initializer(ty, VmMarker::empty(), va, writable, None)
    }

    /// Claims the page containing `va`.
    pub fn claim_page(&self, va: Va) -> Result<(), VmError> {
        let page = self.find(va).ok_or(VmError::NoSuchEntry)?;
        self.claim(&page)
    }

    /// Makes `page` resident.
    ///
    /// Does nothing if the page is already resident.
    pub(crate) fn claim(&self, page: &PageRef) -> Result<(), VmError> {
        self.claim_with(page, |guard, frame, vm| guard.swap_in(frame, vm))
    }

    /// Makes `page` resident, filling its frame with `fill`.
    pub(crate) fn claim_with(
        &self,
        page: &PageRef,
        fill: impl FnOnce(&mut Page, &mut Frame, &Vm) -> Result<(), VmError>,
    ) -> Result<(), VmError> {
        let mut frame = self.vm.frames().get_frame(&self.vm)?;

        let mut guard = page.lock();
        if guard.is_resident() {
            guard.unlock();
            return Ok(());
        }
        let va = guard.va();
        if let Err(e) = self.page_table.map(va, frame.pa(), guard.writable()) {
            guard.unlock();
            return Err(e.into());
        }
        if let Err(e) = fill(&mut *guard, &mut frame, &self.vm) {
            if let Err(unmap_err) = self.page_table.unmap(va) {
                warn!("claim {:?}: mapping vanished before rollback: {:?}", va, unmap_err);
            }
            guard.unlock();
            return Err(e);
        }
        let pa = frame.pa();
        guard.attach(frame);
        self.vm
            .frames()
            .register(pa, va, page, self.page_table.clone());
        guard.unlock();
        Ok(())
    }

    /// Registers an executable segment to be loaded lazily.
    ///
    /// The segment covers `read_bytes + zero_bytes` bytes starting at
    /// `upage`: the first `read_bytes` come from `file` at `offset`, the
    /// rest are zero. One uninitialized anonymous page is created per page
    /// of the segment, each with its own descriptor.
    ///
    /// # Returns
    /// - `Err(VmError::InvalidArgument)`: `upage` is not page aligned, or
    ///   the segment size is not a multiple of [`PAGE_SIZE`].
    /// - Any error of [`Self::alloc_page_with_initializer`]; pages created
    ///   for the segment so far are removed again.
    pub fn load_segment(
        &mut self,
        file: &RegularFile,
        offset: usize,
        upage: Va,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        let total = read_bytes
            .checked_add(zero_bytes)
            .ok_or(VmError::InvalidArgument)?;
        if !upage.is_page_aligned() || total % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }

        let (mut read_bytes, mut offset, mut va) = (read_bytes, offset, upage);
        let mut created = Vec::new();
        for _ in 0..total / PAGE_SIZE {
            let page_read_bytes = read_bytes.min(PAGE_SIZE);
            let page_zero_bytes = PAGE_SIZE - page_read_bytes;
            let result = LazyLoad::new(file.clone(), offset, page_read_bytes, page_zero_bytes)
                .and_then(|aux| {
                    self.alloc_page_with_initializer(
                        VmType::Anon,
                        VmMarker::empty(),
                        va,
                        writable,
                        Some(aux),
                    )
                });
            if let Err(e) = result {
                for va in created {
                    let _ = self.remove(va);
                }
                return Err(e);
            }
            created.push(va);
            read_bytes -= page_read_bytes;
            offset += page_read_bytes;
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// Creates and claims the topmost stack page.
    ///
    /// # Returns
    /// - `Ok(Va)`: The initial stack pointer, i.e. the top of the stack.
    pub fn setup_stack(&mut self) -> Result<Va, VmError> {
        let top = self.vm.user_stack();
        let va = top - PAGE_SIZE;
        self.alloc_page_with_initializer(VmType::Anon, VmMarker::STACK, va, true, None)?;
        if let Err(e) = self.claim_page(va) {
            let _ = self.remove(va);
            return Err(e);
        }
        Ok(top)
    }

    /// Tears the address space down.
    ///
    /// Every mapping run is unmapped first, writing dirty pages back to
    /// their files; then every remaining page is destroyed. The table is
    /// empty afterward.
    pub fn teardown(&mut self) {
        for run in core::mem::take(&mut self.mmaps) {
            if let Err(e) = self.flush_run(&run) {
                warn!("teardown: write-back of {:?} failed: {:?}", run.addr(), e);
            }
            self.remove_run(&run);
        }
        for (_, page) in core::mem::take(&mut self.pages) {
            self.destroy_page(&page);
        }
    }
}

impl Drop for SupplementalPageTable {
    fn drop(&mut self) {
        self.teardown();
    }
}
