//! # Pages
//!
//! A [`Page`] describes one page-aligned virtual page of an address space:
//! where it lives, whether it may be written, which [`Frame`] currently
//! backs it (if any), and how to bring its contents back when it is not
//! resident.
//!
//! ## Lifecycle
//!
//! Every page starts **uninitialized** ([`UninitPage`]). It carries the
//! type it will become and, optionally, a [`LazyLoad`] descriptor saying how
//! to populate it. On the first fault the page is promoted, exactly once,
//! into its target type:
//!
//! - [`AnonPage`]: heap, stack and executable segments. The first load
//!   zero-fills the frame and overlays the segment bytes described by the
//!   descriptor. Evicted contents go to a swap slot.
//! - [`FilePage`]: memory-mapped files. The descriptor is kept for the whole
//!   life of the page, since every load reads from the file and every
//!   eviction or unmap writes dirty contents back to it.
//!
//! A promoted page may lose its frame to eviction and get a new one on the
//! next fault any number of times; its type-specific state holds whatever is
//! needed to reload it.
//!
//! ## Type-specific operations
//!
//! The three stages form the closed enum [`PageState`]. The decoded stages
//! implement [`PageOperations`] (`swap_in`, `swap_out`, `destroy`), and
//! [`PageState`] dispatches to them. Uninitialized pages are handled by
//! [`PageState`] itself: swapping one in runs its initializer and then
//! swaps in the promoted page.

pub mod anon;
pub mod file;
pub mod uninit;

pub use anon::AnonPage;
pub use file::FilePage;
pub use uninit::UninitPage;

use crate::{
    Vm, VmError,
    addressing::{PAGE_SIZE, Va},
    frame::Frame,
    fs::RegularFile,
    page_table::PageTable,
    sync::SpinLock,
};
use alloc::sync::Arc;
use log::warn;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// A shared handle to a [`Page`].
///
/// The supplemental page table owns the page; the frame table only keeps a
/// weak back-reference to it.
pub type PageRef = Arc<SpinLock<Page>>;

/// Type of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum VmType {
    /// Not loaded yet.
    Uninit = 0,
    /// Not backed by a file.
    Anon = 1,
    /// Backed by a file.
    File = 2,
}

impl VmType {
    const MASK: u8 = 0x7;

    /// Splits a byte produced by [`Page::full_type`] into its type and
    /// markers.
    pub fn decode(raw: u8) -> Option<(VmType, VmMarker)> {
        VmType::try_from(raw & Self::MASK)
            .ok()
            .map(|ty| (ty, VmMarker::from_bits_truncate(raw & !Self::MASK)))
    }
}

bitflags::bitflags! {
    /// Auxiliary markers attached to a page.
    pub struct VmMarker: u8 {
        /// The page belongs to the user stack.
        const STACK = 1 << 3;
    }
}

/// Describes how to populate a page the first time it is loaded.
///
/// `read_bytes` bytes are read from `file` at `offset`; the remaining
/// `zero_bytes` bytes of the page are zero-filled.
#[derive(Clone, Debug)]
pub struct LazyLoad {
    file: RegularFile,
    offset: usize,
    read_bytes: usize,
    zero_bytes: usize,
}

impl LazyLoad {
    /// Creates a descriptor covering exactly one page.
    ///
    /// # Returns
    /// - `Err(VmError::InvalidArgument)` if `read_bytes + zero_bytes` is not
    ///   [`PAGE_SIZE`].
    pub fn new(
        file: RegularFile,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<Self, VmError> {
        if read_bytes.checked_add(zero_bytes) != Some(PAGE_SIZE) {
            return Err(VmError::InvalidArgument);
        }
        Ok(Self {
            file,
            offset,
            read_bytes,
            zero_bytes,
        })
    }

    /// The file to read from.
    pub fn file(&self) -> &RegularFile {
        &self.file
    }

    /// Offset of the page contents within the file.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of bytes to read from the file.
    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    /// Number of bytes to zero-fill after the file contents.
    pub fn zero_bytes(&self) -> usize {
        self.zero_bytes
    }

    /// Fills `buf` from the file, zero-padding the tail.
    pub(crate) fn load(&self, buf: &mut [u8; PAGE_SIZE], vm: &Vm) -> Result<(), VmError> {
        let (head, tail) = buf.split_at_mut(self.read_bytes);
        vm.file_io(|| self.file.read_exact_at(self.offset, head))?;
        tail.fill(0);
        Ok(())
    }

    /// Writes the file-backed part of `buf` back to the file.
    pub(crate) fn write_back(&self, buf: &[u8; PAGE_SIZE], vm: &Vm) -> Result<(), VmError> {
        vm.file_io(|| {
            self.file
                .write_all_at(self.offset, &buf[..self.read_bytes])
        })
    }
}

/// Operations every decoded page type provides.
pub trait PageOperations {
    /// Populates `frame` with the contents of the page at `va`.
    fn swap_in(&mut self, va: Va, frame: &mut Frame, vm: &Vm) -> Result<(), VmError>;

    /// Saves the contents of `frame` so that the page at `va` can later be
    /// swapped back in.
    ///
    /// `page_table` still maps the page, so its dirty bit is valid.
    fn swap_out(
        &mut self,
        va: Va,
        frame: &Frame,
        page_table: &dyn PageTable,
        vm: &Vm,
    ) -> Result<(), VmError>;

    /// Releases the resources the page holds besides its frame.
    fn destroy(&mut self, vm: &Vm);
}

/// Lifecycle stage of a page with its type-specific state.
pub enum PageState {
    /// Not loaded yet.
    Uninit(UninitPage),
    /// Anonymous page.
    Anon(AnonPage),
    /// File-backed page.
    File(FilePage),
}

impl PageState {
    /// Returns the current stage.
    pub fn stage(&self) -> VmType {
        match self {
            PageState::Uninit(_) => VmType::Uninit,
            PageState::Anon(_) => VmType::Anon,
            PageState::File(_) => VmType::File,
        }
    }

    fn swap_in(&mut self, va: Va, frame: &mut Frame, vm: &Vm) -> Result<(), VmError> {
        match self {
            PageState::Uninit(uninit) => {
                let promoted = uninit.initialize()?;
                *self = promoted;
                self.swap_in(va, frame, vm)
            }
            PageState::Anon(anon) => anon.swap_in(va, frame, vm),
            PageState::File(file) => file.swap_in(va, frame, vm),
        }
    }

    fn swap_out(
        &mut self,
        va: Va,
        frame: &Frame,
        page_table: &dyn PageTable,
        vm: &Vm,
    ) -> Result<(), VmError> {
        match self {
            // Reloads from its descriptor.
            PageState::Uninit(_) => Ok(()),
            PageState::Anon(anon) => anon.swap_out(va, frame, page_table, vm),
            PageState::File(file) => file.swap_out(va, frame, page_table, vm),
        }
    }

    fn destroy(&mut self, vm: &Vm) {
        match self {
            PageState::Uninit(uninit) => uninit.destroy(),
            PageState::Anon(anon) => anon.destroy(vm),
            PageState::File(file) => file.destroy(vm),
        }
    }
}

/// A virtual page of an address space.
pub struct Page {
    va: Va,
    writable: bool,
    marker: VmMarker,
    state: PageState,
    frame: Option<Frame>,
}

impl Page {
    pub(crate) fn new(va: Va, writable: bool, marker: VmMarker, state: PageState) -> Self {
        Self {
            va,
            writable,
            marker,
            state,
            frame: None,
        }
    }

    /// Page-aligned virtual address of the page.
    #[inline]
    pub fn va(&self) -> Va {
        self.va
    }

    /// Returns true if user code may write to the page.
    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Markers attached to the page.
    #[inline]
    pub fn marker(&self) -> VmMarker {
        self.marker
    }

    /// Current lifecycle stage of the page.
    pub fn stage(&self) -> VmType {
        self.state.stage()
    }

    /// Type of the page. For an uninitialized page this is the type it will
    /// become once loaded.
    pub fn ty(&self) -> VmType {
        match &self.state {
            PageState::Uninit(uninit) => uninit.target(),
            state => state.stage(),
        }
    }

    /// Packs [`Page::ty`] and [`Page::marker`] into one byte.
    pub fn full_type(&self) -> u8 {
        u8::from(self.ty()) | self.marker.bits()
    }

    /// Type-specific state of the page.
    pub fn state(&self) -> &PageState {
        &self.state
    }

    /// Returns true if the page is backed by a frame.
    #[inline]
    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// The frame backing the page, if resident.
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    pub(crate) fn frame_mut(&mut self) -> Option<&mut Frame> {
        self.frame.as_mut()
    }

    pub(crate) fn attach(&mut self, frame: Frame) {
        self.frame = Some(frame);
    }

    pub(crate) fn swap_in(&mut self, frame: &mut Frame, vm: &Vm) -> Result<(), VmError> {
        self.state.swap_in(self.va, frame, vm)
    }

    /// Saves the page contents, clears its mapping and detaches its frame.
    pub(crate) fn evict(&mut self, page_table: &dyn PageTable, vm: &Vm) -> Result<Frame, VmError> {
        let frame = self.frame.as_ref().ok_or(VmError::NoSuchEntry)?;
        self.state.swap_out(self.va, frame, page_table, vm)?;
        if let Err(e) = page_table.unmap(self.va) {
            warn!("evict {:?}: page was not mapped: {:?}", self.va, e);
        }
        self.frame.take().ok_or(VmError::NoSuchEntry)
    }

    /// Releases the frame and the type-specific resources of the page.
    pub(crate) fn destroy(&mut self, page_table: &dyn PageTable, vm: &Vm) {
        if let Some(frame) = self.frame.take() {
            vm.frames().unregister(frame.pa());
            if let Err(e) = page_table.unmap(self.va) {
                warn!("destroy {:?}: page was not mapped: {:?}", self.va, e);
            }
        }
        self.state.destroy(vm);
    }

    /// Copies the current contents of the page into `buf` without changing
    /// the page.
    pub(crate) fn snapshot(&self, buf: &mut [u8; PAGE_SIZE], vm: &Vm) -> Result<(), VmError> {
        if let Some(frame) = &self.frame {
            buf.copy_from_slice(frame.inner());
            return Ok(());
        }
        match &self.state {
            PageState::Uninit(_) => Err(VmError::InvalidArgument),
            PageState::Anon(anon) => anon.snapshot(buf, vm),
            PageState::File(file) => file.aux().load(buf, vm),
        }
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Page")
            .field("va", &self.va)
            .field("stage", &self.stage())
            .field("ty", &self.ty())
            .field("writable", &self.writable)
            .field("frame", &self.frame)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_type_round_trip() {
        let raw = u8::from(VmType::Anon) | VmMarker::STACK.bits();
        assert_eq!(VmType::decode(raw), Some((VmType::Anon, VmMarker::STACK)));
        assert_eq!(
            VmType::decode(u8::from(VmType::File)),
            Some((VmType::File, VmMarker::empty()))
        );
        assert_eq!(VmType::decode(0x5), None);
    }
}
