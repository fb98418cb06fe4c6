//! # Memory-Mapped Files
//!
//! `mmap` maps a range of a file into the address space. Like everything
//! else in the pager it is lazy: one uninitialized file-backed page is
//! recorded per page of the range, and each page reads its part of the file
//! on its first fault.
//!
//! The pages created by one `mmap` call form a **mapping run**, remembered
//! as an [`MmapRun`] (its first address, page count and file handle). A run
//! is the unit of `munmap`: it is flushed and removed as a whole, never in
//! part. Removing a single page of a run is refused.
//!
//! The run reopens the file once; the run and all its pages share the
//! reopened handle, so the mapping stays valid after the caller closes its
//! own handle. The handle is closed once the run is unmapped and its pages
//! are destroyed.
//!
//! A file-backed page only ever writes back the bytes it read. The last page
//! of a mapping over a file whose size is not a multiple of the page size
//! reads the tail of the file and zero-fills the rest; unmapping it writes
//! back the tail only.

use crate::{
    SupplementalPageTable, VmError,
    addressing::{KERNEL_BASE, PAGE_SIZE, Va},
    fs::RegularFile,
    page::{LazyLoad, Page, PageState, VmMarker, VmType},
};
use log::{info, warn};

/// A run of file-backed pages created by one `mmap` call.
#[derive(Debug, Clone)]
pub struct MmapRun {
    addr: Va,
    page_count: usize,
    file: RegularFile,
}

impl MmapRun {
    /// First address of the run.
    pub fn addr(&self) -> Va {
        self.addr
    }

    /// Number of pages in the run.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// The file handle shared by the pages of the run.
    pub fn file(&self) -> &RegularFile {
        &self.file
    }

    /// Iterates over the page addresses of the run in address order.
    pub fn pages(&self) -> impl Iterator<Item = Va> + use<> {
        let addr = self.addr;
        (0..self.page_count).map(move |i| addr + i * PAGE_SIZE)
    }

    /// Returns true if `va` lies within the run.
    pub fn contains(&self, va: Va) -> bool {
        va >= self.addr
            && va.into_usize() < self.addr.into_usize() + self.page_count * PAGE_SIZE
    }

    /// Returns true if `page` was created by this run.
    fn owns(&self, page: &Page) -> bool {
        let aux = match page.state() {
            PageState::Uninit(uninit) if uninit.target() == VmType::File => uninit.aux(),
            PageState::File(file) => Some(file.aux()),
            _ => None,
        };
        self.contains(page.va()) && aux.is_some_and(|aux| aux.file().ptr_eq(&self.file))
    }
}

impl PartialEq for MmapRun {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
            && self.page_count == other.page_count
            && self.file.ptr_eq(&other.file)
    }
}

impl Eq for MmapRun {}

impl SupplementalPageTable {
    /// Maps `length` bytes of `file`, starting at `offset`, at `addr`.
    ///
    /// Only the part of the range backed by the file is mapped: the range is
    /// clipped to the bytes remaining in the file after `offset`, and the
    /// last page is zero-padded past the end of the file.
    ///
    /// # Returns
    /// - `Ok(Va)`: The mapped address, `addr`.
    /// - `Err(VmError::InvalidArgument)`: `length` is zero, `addr` is null
    ///   or misaligned, `offset` is misaligned, or no byte of the file lies
    ///   at or after `offset`.
    /// - `Err(VmError::IllegalAddress)`: The range reaches into kernel space.
    /// - `Err(VmError::OverlappingMmap)`: A page already exists in the
    ///   range. No page is created.
    pub fn mmap(
        &mut self,
        addr: Va,
        length: usize,
        writable: bool,
        file: &RegularFile,
        offset: usize,
    ) -> Result<Va, VmError> {
        if length == 0
            || addr.into_usize() == 0
            || !addr.is_page_aligned()
            || offset % PAGE_SIZE != 0
        {
            return Err(VmError::InvalidArgument);
        }
        let end = addr.checked_add(length).ok_or(VmError::IllegalAddress)?;
        if end.into_usize() > KERNEL_BASE {
            return Err(VmError::IllegalAddress);
        }
        let mapped = length.min(file.size().saturating_sub(offset));
        if mapped == 0 {
            return Err(VmError::InvalidArgument);
        }
        if self.pages.range(addr..end).next().is_some() {
            return Err(VmError::OverlappingMmap);
        }

        let file = file.reopen()?;
        let page_count = mapped.div_ceil(PAGE_SIZE);
        for i in 0..page_count {
            let va = addr + i * PAGE_SIZE;
            let read_bytes = (mapped - i * PAGE_SIZE).min(PAGE_SIZE);
            let result = LazyLoad::new(
                file.clone(),
                offset + i * PAGE_SIZE,
                read_bytes,
                PAGE_SIZE - read_bytes,
            )
            .and_then(|aux| {
                self.alloc_page_with_initializer(
                    VmType::File,
                    VmMarker::empty(),
                    va,
                    writable,
                    Some(aux),
                )
            });
            if let Err(e) = result {
                for j in 0..i {
                    let _ = self.remove(addr + j * PAGE_SIZE);
                }
                return Err(e);
            }
        }

        let run = MmapRun {
            addr,
            page_count,
            file,
        };
        let idx = self.mmaps.partition_point(|run| run.addr < addr);
        self.mmaps.insert(idx, run);
        info!("mmap {:?}: {} pages at offset {:#x}", addr, page_count, offset);
        Ok(addr)
    }

    /// Unmaps the mapping run starting at `addr`.
    ///
    /// Every dirty resident page of the run is written back to the file
    /// first. Only once all write-backs succeeded are the pages removed, so a
    /// failing `munmap` leaves the run intact.
    ///
    /// # Returns
    /// - `Err(VmError::NoSuchEntry)`: `addr` is not the start of a run.
    /// - `Err(VmError::ShortWrite)` or any file error: the write-back
    ///   failed; the run is still mapped.
    pub fn munmap(&mut self, addr: Va) -> Result<(), VmError> {
        let idx = self
            .mmaps
            .iter()
            .position(|run| run.addr == addr)
            .ok_or(VmError::NoSuchEntry)?;
        let run = self.mmaps[idx].clone();
        self.flush_run(&run)?;
        self.mmaps.remove(idx);
        self.remove_run(&run);
        info!("munmap {:?}: {} pages", addr, run.page_count);
        Ok(())
    }

    /// Writes every dirty resident page of `run` back to its file.
    pub(crate) fn flush_run(&self, run: &MmapRun) -> Result<(), VmError> {
        for va in run.pages() {
            let Some(page) = self.pages.get(&va) else {
                continue;
            };
            let guard = page.lock();
            let result = match (guard.state(), guard.frame()) {
                (PageState::File(file), Some(frame)) if run.owns(&guard) => {
                    file.flush(va, frame, self.page_table.as_ref(), &self.vm)
                }
                _ => Ok(()),
            };
            guard.unlock();
            result?;
        }
        Ok(())
    }

    /// Removes and destroys every page created by `run`.
    ///
    /// A page at an address of the run that was not created by it is left
    /// alone.
    pub(crate) fn remove_run(&mut self, run: &MmapRun) {
        for va in run.pages() {
            let Some(page) = self.pages.get(&va) else {
                continue;
            };
            let guard = page.lock();
            let owned = run.owns(&guard);
            guard.unlock();
            if !owned {
                warn!("munmap {:?}: {:?} does not belong to the run", run.addr, va);
                continue;
            }
            if let Some(page) = self.pages.remove(&va) {
                self.destroy_page(&page);
            }
        }
    }
}
