//! Swap backend.
//!
//! Anonymous pages have no file to fall back on, so when the evictor picks
//! one as a victim its contents are written to the swap disk. The swap disk
//! is a plain block device of 512-byte sectors; the [`SwapTable`] carves it
//! into page-sized slots of [`SECTORS_PER_PAGE`] consecutive sectors and
//! hands them out to evicted pages.
//!
//! Slot allocation is lock-free. Slots are first handed out in order from a
//! high-water mark; a freed slot is pushed on a [`SegQueue`] and reused
//! before the high-water mark advances again.

use crate::{VmError, addressing::PAGE_SIZE};
use alloc::boxed::Box;
use core::sync::atomic::{AtomicUsize, Ordering};
use crossbeam_queue::SegQueue;

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of sectors that make up one swap slot.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// A block device backing the swap area.
pub trait Disk
where
    Self: Send + Sync,
{
    /// Number of sectors on the device.
    fn sector_count(&self) -> usize;

    /// Reads the sector `sector` into `buf`.
    fn read(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), VmError>;

    /// Writes `buf` to the sector `sector`.
    fn write(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) -> Result<(), VmError>;
}

/// Index of a page-sized slot on the swap disk.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct SwapSlot(usize);

impl SwapSlot {
    /// Returns the slot index.
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Returns the first sector of the slot.
    pub const fn first_sector(self) -> usize {
        self.0 * SECTORS_PER_PAGE
    }
}

/// Allocator of swap slots over a [`Disk`].
pub struct SwapTable {
    disk: Option<Box<dyn Disk>>,
    capacity: usize,
    next: AtomicUsize,
    free: SegQueue<SwapSlot>,
    in_use: AtomicUsize,
}

impl SwapTable {
    /// Creates a swap table over `disk`.
    ///
    /// Without a disk the table has no slot at all, and every attempt to
    /// swap out fails with [`VmError::NoSpace`].
    pub fn new(disk: Option<Box<dyn Disk>>) -> Self {
        let capacity = disk
            .as_ref()
            .map(|disk| disk.sector_count() / SECTORS_PER_PAGE)
            .unwrap_or(0);
        Self {
            disk,
            capacity,
            next: AtomicUsize::new(0),
            free: SegQueue::new(),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently holding a swapped-out page.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    fn alloc_slot(&self) -> Result<SwapSlot, VmError> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => self
                .next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                    (next < self.capacity).then_some(next + 1)
                })
                .map(SwapSlot)
                .map_err(|_| VmError::NoSpace)?,
        };
        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(slot)
    }

    fn disk(&self) -> Result<&dyn Disk, VmError> {
        self.disk.as_deref().ok_or(VmError::NoSpace)
    }

    /// Writes a page to a freshly allocated slot.
    ///
    /// # Returns
    /// - `Ok(SwapSlot)`: The slot now holding the page.
    /// - `Err(VmError::NoSpace)`: Every slot is in use.
    /// - `Err(VmError)`: The disk failed; the slot is released again.
    pub fn write_slot(&self, buf: &[u8; PAGE_SIZE]) -> Result<SwapSlot, VmError> {
        let slot = self.alloc_slot()?;
        if let Err(e) = self.write_sectors(slot, buf) {
            self.free_slot(slot);
            return Err(e);
        }
        Ok(slot)
    }

    fn write_sectors(&self, slot: SwapSlot, buf: &[u8; PAGE_SIZE]) -> Result<(), VmError> {
        let disk = self.disk()?;
        for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            let sector = <&[u8; SECTOR_SIZE]>::try_from(chunk).map_err(|_| VmError::IOError)?;
            disk.write(slot.first_sector() + i, sector)?;
        }
        Ok(())
    }

    /// Reads the page stored in `slot` into `buf`.
    ///
    /// The slot stays allocated; release it with [`SwapTable::free_slot`].
    pub fn read_slot(&self, slot: SwapSlot, buf: &mut [u8; PAGE_SIZE]) -> Result<(), VmError> {
        if slot.0 >= self.capacity {
            return Err(VmError::InvalidArgument);
        }
        let disk = self.disk()?;
        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let sector =
                <&mut [u8; SECTOR_SIZE]>::try_from(chunk).map_err(|_| VmError::IOError)?;
            disk.read(slot.first_sector() + i, sector)?;
        }
        Ok(())
    }

    /// Returns `slot` to the allocator.
    pub fn free_slot(&self, slot: SwapSlot) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.free.push(slot);
    }
}
