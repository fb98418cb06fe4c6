//! # KeOS Virtual Memory
//!
//! This crate is the demand-paged virtual memory core of KeOS. It gives each
//! user address space a **supplemental page table** that records every
//! virtual page the process may touch, whether or not the page currently
//! occupies physical memory, and resolves page faults against it.
//!
//! Pages are loaded lazily. Allocating a page, loading an executable
//! segment or mapping a file only records *how* to populate the page; the
//! frame is claimed and filled on the first access fault. When physical
//! memory runs out, the global frame table evicts a resident page with the
//! clock algorithm, writing anonymous contents to swap and dirty file-backed
//! contents back to their file.
//!
//! ## Components
//!
//! - [`frame`]: the physical frame pool interface, owned frames, and the
//!   global frame table with its evictor.
//! - [`swap`]: the slot allocator over the swap disk.
//! - [`page`]: the page object and its three stages (uninitialized,
//!   anonymous, file-backed).
//! - [`spt`]: the supplemental page table of one address space.
//! - [`lazy_pager`]: page fault resolution and stack growth.
//! - [`mmap`]: memory-mapped files.
//! - [`fork`]: duplication of an address space.
//! - [`uaccess`]: kernel access to user memory through the pager.
//!
//! The page table, the frame pool, the file system and the swap disk are
//! collaborators outside of this crate; they are reached through the
//! [`page_table::PageTable`], [`frame::FramePool`],
//! [`fs::traits::RegularFile`] and [`swap::Disk`] traits.
//!
//! ## Getting Started
//!
//! The services shared by all address spaces are bundled in a [`Vm`],
//! assembled once at boot with [`Vm::builder`]. Each address space then
//! creates its own [`SupplementalPageTable`] over its page table:
//!
//! ```
//! use std::sync::Arc;
//! use keos_vm::{SupplementalPageTable, Vm, frame::UserPool, page_table::SoftPageTable};
//!
//! let vm = Vm::builder(Arc::new(UserPool::new(16))).build();
//! let mut spt = SupplementalPageTable::new(vm, Arc::new(SoftPageTable::new()));
//! let rsp = spt.setup_stack().unwrap();
//! assert!(spt.find(rsp - 8).is_some());
//! ```
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addressing;
pub mod fork;
pub mod frame;
pub mod fs;
pub mod lazy_pager;
pub mod mmap;
pub mod page;
pub mod page_table;
pub mod spt;
pub mod swap;
pub mod sync;
pub mod uaccess;

pub use spt::SupplementalPageTable;

use addressing::{STACK_LIMIT, USER_STACK, Va};
use alloc::{boxed::Box, sync::Arc};
use frame::{FramePool, FrameTable};
use page_table::PageTableMappingError;
use swap::{Disk, SwapTable};
use sync::SpinLock;

/// Enum representing errors that can occur during a virtual memory
/// operation.
///
/// A failing page fault reports one of these to the caller, which then
/// terminates the faulting process. System calls return them to the user
/// program through [`VmError::into_usize`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VmError {
    /// A page already exists at the virtual address. (EEXIST)
    DuplicateMapping,
    /// No free frame and no evictable resident page. (ENOMEM)
    FrameExhausted,
    /// The file returned fewer bytes than required. (EIO)
    ShortRead,
    /// The file accepted fewer bytes than required. (EIO)
    ShortWrite,
    /// Kernel address, or unmapped address outside the stack. (EFAULT)
    IllegalAddress,
    /// Write to a read-only page. (EACCES)
    WriteProtectionFault,
    /// The mapping overlaps an existing page. (EEXIST)
    OverlappingMmap,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// No such page or mapping. (ENOENT)
    NoSuchEntry,
    /// No swap slot left. (ENOSPC)
    NoSpace,
    /// IO Error. (EIO)
    IOError,
    /// The page table refused the mapping. (ENOMEM)
    MappingFailed(PageTableMappingError),
}

impl VmError {
    /// Converts the [`VmError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            VmError::NoSuchEntry => -2isize,
            VmError::IOError | VmError::ShortRead | VmError::ShortWrite => -5,
            VmError::FrameExhausted | VmError::MappingFailed(_) => -12,
            VmError::WriteProtectionFault => -13,
            VmError::IllegalAddress => -14,
            VmError::DuplicateMapping | VmError::OverlappingMmap => -17,
            VmError::InvalidArgument => -22,
            VmError::NoSpace => -28,
        }) as usize
    }
}

impl From<PageTableMappingError> for VmError {
    fn from(e: PageTableMappingError) -> Self {
        VmError::MappingFailed(e)
    }
}

/// Services shared by every address space.
///
/// The frame table and the swap table are global: any address space may
/// evict a page of any other. File I/O issued by the pager is serialized by
/// a single lock, so write-back never races with a load of the same file
/// region.
pub struct Vm {
    frames: FrameTable,
    swap: SwapTable,
    file_lock: SpinLock<()>,
    user_stack: Va,
    stack_limit: usize,
}

impl Vm {
    /// Starts configuring the virtual memory subsystem on top of `pool`.
    pub fn builder(pool: Arc<dyn FramePool>) -> VmConfigurationBuilder {
        VmConfigurationBuilder {
            pool,
            swap_disk: None,
            user_stack: USER_STACK,
            stack_limit: STACK_LIMIT,
        }
    }

    /// The global frame table.
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// The global swap table.
    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// Top of the user stack.
    pub fn user_stack(&self) -> Va {
        self.user_stack
    }

    /// Maximum size of the user stack, in bytes.
    pub fn stack_limit(&self) -> usize {
        self.stack_limit
    }

    /// Runs `f` with the file I/O lock held.
    pub(crate) fn file_io<R>(&self, f: impl FnOnce() -> R) -> R {
        let guard = self.file_lock.lock();
        let result = f();
        guard.unlock();
        result
    }
}

/// A builder for the [`Vm`].
pub struct VmConfigurationBuilder {
    pool: Arc<dyn FramePool>,
    swap_disk: Option<Box<dyn Disk>>,
    user_stack: Va,
    stack_limit: usize,
}

impl VmConfigurationBuilder {
    /// Uses `disk` as the swap area.
    ///
    /// Without a swap disk, anonymous pages are never evicted.
    pub fn swap_disk(mut self, disk: impl Disk + 'static) -> Self {
        self.swap_disk = Some(Box::new(disk));
        self
    }

    /// Sets the top of the user stack. Defaults to [`USER_STACK`].
    pub fn user_stack(mut self, user_stack: Va) -> Self {
        self.user_stack = user_stack.page_down();
        self
    }

    /// Sets the maximum size of the user stack. Defaults to [`STACK_LIMIT`].
    pub fn stack_limit(mut self, stack_limit: usize) -> Self {
        self.stack_limit = stack_limit;
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> Arc<Vm> {
        Arc::new(Vm {
            frames: FrameTable::new(self.pool),
            swap: SwapTable::new(self.swap_disk),
            file_lock: SpinLock::new(()),
            user_stack: self.user_stack,
            stack_limit: self.stack_limit,
        })
    }
}
