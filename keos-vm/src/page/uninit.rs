//! Uninitialized pages.
//!
//! Every page is created uninitialized. It only remembers which type it is
//! going to become and the optional [`LazyLoad`] descriptor telling how to
//! fill it. No frame is allocated until the page is first touched.

use super::{AnonPage, FilePage, LazyLoad, PageState, VmType};
use crate::VmError;

/// A page that was never loaded.
#[derive(Clone, Debug)]
pub struct UninitPage {
    target: VmType,
    aux: Option<LazyLoad>,
}

impl UninitPage {
    /// Creates an uninitialized page that becomes a `target` page on its
    /// first load.
    ///
    /// # Returns
    /// - `Err(VmError::InvalidArgument)` if `target` is [`VmType::Uninit`],
    ///   or if a file-backed page comes without a descriptor.
    pub fn new(target: VmType, aux: Option<LazyLoad>) -> Result<Self, VmError> {
        match (target, &aux) {
            (VmType::Uninit, _) | (VmType::File, None) => Err(VmError::InvalidArgument),
            _ => Ok(Self { target, aux }),
        }
    }

    /// Type the page becomes once loaded.
    pub fn target(&self) -> VmType {
        self.target
    }

    /// The lazy-load descriptor, if any.
    pub fn aux(&self) -> Option<&LazyLoad> {
        self.aux.as_ref()
    }

    /// Runs the type initializer, handing the descriptor over to the
    /// promoted page.
    pub(crate) fn initialize(&mut self) -> Result<PageState, VmError> {
        match (self.target, self.aux.take()) {
            (VmType::Anon, segment) => Ok(PageState::Anon(AnonPage::with_segment(segment))),
            (VmType::File, Some(aux)) => Ok(PageState::File(FilePage::new(aux))),
            (_, aux) => {
                self.aux = aux;
                Err(VmError::InvalidArgument)
            }
        }
    }

    pub(crate) fn destroy(&mut self) {
        self.aux = None;
    }
}
