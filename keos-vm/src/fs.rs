//! File service seen by the pager.
//!
//! File-backed pages and lazily loaded segments read their contents from a
//! [`RegularFile`] and write dirty contents back to it. The pager only needs
//! positional reads and writes, the file size, and the ability to reopen a
//! file so that a mapping survives the caller closing its own handle.
//!
//! The pager never issues a partial transfer silently: [`RegularFile::read_exact_at`]
//! and [`RegularFile::write_all_at`] turn a short transfer into
//! [`VmError::ShortRead`] or [`VmError::ShortWrite`].

use crate::VmError;
use alloc::sync::Arc;

/// Traits for implementing a file.
pub mod traits {
    use crate::VmError;

    /// Trait representing a regular file.
    ///
    /// Implementations are provided by the file system. All methods take
    /// `&self`; the implementation synchronizes internally.
    pub trait RegularFile
    where
        Self: Send + Sync,
    {
        /// Returns the size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads data from the file at `position` into `buf`.
        ///
        /// # Returns
        /// - `Ok(usize)`: The number of bytes read, which is smaller than
        ///   `buf.len()` only at the end of the file.
        /// - `Err(VmError)`: An error occured while the read operation.
        fn read_at(&self, position: usize, buf: &mut [u8]) -> Result<usize, VmError>;

        /// Writes `buf` to the file at `position`.
        ///
        /// # Returns
        /// - `Ok(usize)`: The number of bytes written.
        /// - `Err(VmError)`: An error occured while the write operation.
        fn write_at(&self, position: usize, buf: &[u8]) -> Result<usize, VmError>;

        /// Opens a new, independent handle to the same file.
        fn reopen(&self) -> Result<super::RegularFile, VmError>;
    }
}

/// A handle to a regular file.
///
/// Cloning the handle shares the same underlying open file; the file is
/// closed when the last clone is dropped.
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Creates a new [`RegularFile`] handle from a given implementation of
    /// [`traits::RegularFile`].
    pub fn new(r: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(r))
    }

    /// Returns the size of the file in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Reads data from the file at `position` into `buf`.
    #[inline]
    pub fn read_at(&self, position: usize, buf: &mut [u8]) -> Result<usize, VmError> {
        self.0.read_at(position, buf)
    }

    /// Writes `buf` to the file at `position`.
    #[inline]
    pub fn write_at(&self, position: usize, buf: &[u8]) -> Result<usize, VmError> {
        self.0.write_at(position, buf)
    }

    /// Opens a new, independent handle to the same file.
    pub fn reopen(&self) -> Result<Self, VmError> {
        self.0.reopen()
    }

    /// Reads exactly `buf.len()` bytes at `position`.
    ///
    /// # Returns
    /// - `Ok(())` if the whole buffer was filled.
    /// - `Err(VmError::ShortRead)` if the file returned fewer bytes.
    pub fn read_exact_at(&self, position: usize, buf: &mut [u8]) -> Result<(), VmError> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.read_at(position, buf)? {
            n if n == buf.len() => Ok(()),
            _ => Err(VmError::ShortRead),
        }
    }

    /// Writes all of `buf` at `position`.
    ///
    /// # Returns
    /// - `Ok(())` if every byte was written.
    /// - `Err(VmError::ShortWrite)` if the file accepted fewer bytes.
    pub fn write_all_at(&self, position: usize, buf: &[u8]) -> Result<(), VmError> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.write_at(position, buf)? {
            n if n == buf.len() => Ok(()),
            _ => Err(VmError::ShortWrite),
        }
    }

    /// Returns true if both handles share the same open file.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl core::fmt::Debug for RegularFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegularFile")
            .field("size", &self.size())
            .finish()
    }
}
