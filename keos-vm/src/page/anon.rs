//! Anonymous pages.
//!
//! Anonymous pages back the heap, the stack and the segments of an
//! executable. They have no file to write their contents back to, so an
//! evicted anonymous page is written to a swap slot and read back from it
//! on the next fault.
//!
//! The first load of an anonymous page zero-fills the frame. If the page was
//! created for an executable segment, the bytes described by its segment
//! descriptor are then read over the zeroes; the descriptor is dropped once
//! the load succeeds.

use super::{LazyLoad, PageOperations};
use crate::{
    Vm, VmError,
    addressing::{PAGE_SIZE, Va},
    frame::Frame,
    page_table::PageTable,
    swap::SwapSlot,
};

/// A page not backed by a file.
#[derive(Debug, Default)]
pub struct AnonPage {
    slot: Option<SwapSlot>,
    segment: Option<LazyLoad>,
}

impl AnonPage {
    /// Creates a zero-filled anonymous page.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an anonymous page whose first load reads `segment`.
    pub fn with_segment(segment: Option<LazyLoad>) -> Self {
        Self {
            slot: None,
            segment,
        }
    }

    /// The swap slot holding the contents of the evicted page.
    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    /// Copies the contents of the non-resident page into `buf`.
    pub(crate) fn snapshot(&self, buf: &mut [u8; PAGE_SIZE], vm: &Vm) -> Result<(), VmError> {
        match (self.slot, &self.segment) {
            (Some(slot), _) => vm.swap().read_slot(slot, buf),
            (None, Some(segment)) => segment.load(buf, vm),
            (None, None) => {
                buf.fill(0);
                Ok(())
            }
        }
    }
}

impl PageOperations for AnonPage {
    fn swap_in(&mut self, _va: Va, frame: &mut Frame, vm: &Vm) -> Result<(), VmError> {
        if let Some(slot) = self.slot {
            vm.swap().read_slot(slot, frame.inner_mut())?;
            vm.swap().free_slot(slot);
            self.slot = None;
            return Ok(());
        }
        match &self.segment {
            Some(segment) => segment.load(frame.inner_mut(), vm)?,
            None => frame.inner_mut().fill(0),
        }
        self.segment = None;
        Ok(())
    }

    fn swap_out(
        &mut self,
        _va: Va,
        frame: &Frame,
        _page_table: &dyn PageTable,
        vm: &Vm,
    ) -> Result<(), VmError> {
        self.slot = Some(vm.swap().write_slot(frame.inner())?);
        Ok(())
    }

    fn destroy(&mut self, vm: &Vm) {
        if let Some(slot) = self.slot.take() {
            vm.swap().free_slot(slot);
        }
        self.segment = None;
    }
}
