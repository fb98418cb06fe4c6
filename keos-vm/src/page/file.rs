//! File-backed pages.
//!
//! A file-backed page mirrors `read_bytes` bytes of a file starting at
//! `offset`, zero-padded to a full page. Unlike an anonymous page, it keeps
//! its [`LazyLoad`] descriptor for its whole life: every load reads from the
//! file, and every eviction of a dirty page writes the same byte range back.
//! A clean page is simply dropped, since the file already holds its
//! contents.
//!
//! The file handle inside the descriptor is shared by all pages of one
//! mapping run and closed when the last of them is gone.

use super::{LazyLoad, PageOperations};
use crate::{Vm, VmError, addressing::Va, frame::Frame, page_table::PageTable};

/// A page backed by a file.
#[derive(Debug)]
pub struct FilePage {
    aux: LazyLoad,
}

impl FilePage {
    /// Creates a file-backed page described by `aux`.
    pub fn new(aux: LazyLoad) -> Self {
        Self { aux }
    }

    /// The file range backing the page.
    pub fn aux(&self) -> &LazyLoad {
        &self.aux
    }

    /// Writes the page contents back if the page is dirty in `page_table`.
    pub(crate) fn flush(
        &self,
        va: Va,
        frame: &Frame,
        page_table: &dyn PageTable,
        vm: &Vm,
    ) -> Result<(), VmError> {
        if page_table.is_dirty(va) {
            self.aux.write_back(frame.inner(), vm)?;
            page_table.clear_dirty(va);
        }
        Ok(())
    }
}

impl PageOperations for FilePage {
    fn swap_in(&mut self, _va: Va, frame: &mut Frame, vm: &Vm) -> Result<(), VmError> {
        self.aux.load(frame.inner_mut(), vm)
    }

    fn swap_out(
        &mut self,
        va: Va,
        frame: &Frame,
        page_table: &dyn PageTable,
        vm: &Vm,
    ) -> Result<(), VmError> {
        self.flush(va, frame, page_table, vm)
    }

    fn destroy(&mut self, _vm: &Vm) {}
}
