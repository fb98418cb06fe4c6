//! Frame allocation and eviction.
//!
//! A [`Frame`] is one physical page frame backing a resident user page. It
//! is obtained from a [`FramePool`] and returned to it when dropped, so a
//! frame can never leak: it is owned by exactly one [`Page`] at a time, and
//! destroying the page drops the frame.
//!
//! The [`FrameTable`] is shared by every address space. It records, for each
//! resident frame, the page occupying it and the page table mapping it.
//! When the pool runs dry, [`FrameTable::get_frame`] reclaims a frame with
//! the clock (second-chance) policy:
//!
//! 1. The clock hand sweeps the resident frames in the order they were
//!    claimed.
//! 2. A frame whose page is busy (its lock is held elsewhere) is ineligible
//!    for the rest of the sweep.
//! 3. A frame whose page was accessed since the last visit gets a second
//!    chance: the accessed bit is cleared and the hand moves on.
//! 4. Otherwise the page is evicted: its contents are saved with its
//!    type-specific `swap_out`, its mapping is cleared, and the frame is
//!    handed to the caller.
//!
//! The hand visits every frame at most twice per sweep. When the sweep ends
//! without a victim the request fails with [`VmError::FrameExhausted`].
//!
//! Allocation and eviction run as one critical section under the frame
//! table lock, so two faulting threads can never evict the same frame or
//! receive the same frame twice.

use crate::{
    Vm, VmError,
    addressing::{PAGE_SIZE, Pa, Va},
    page::{Page, PageRef},
    page_table::PageTable,
    sync::SpinLock,
};
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
use log::{debug, warn};

/// The physical frame pool user pages are carved from.
pub trait FramePool
where
    Self: Send + Sync,
{
    /// Takes a free frame out of the pool, or `None` if the pool is empty.
    fn acquire_user_frame(&self) -> Option<Pa>;

    /// Returns a frame to the pool.
    fn release_user_frame(&self, pa: Pa);
}

/// A bounded pool of user frames.
pub struct UserPool {
    free: SpinLock<Vec<Pa>>,
    capacity: usize,
}

impl UserPool {
    const BASE: usize = 0x100_0000;

    /// Creates a pool holding `frames` frames.
    pub fn new(frames: usize) -> Self {
        let free = (0..frames)
            .rev()
            .filter_map(|i| Pa::new(Self::BASE + i * PAGE_SIZE))
            .collect();
        Self {
            free: SpinLock::new(free),
            capacity: frames,
        }
    }

    /// Total number of frames managed by the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of frames currently in the pool.
    pub fn available(&self) -> usize {
        let guard = self.free.lock();
        let len = guard.len();
        guard.unlock();
        len
    }
}

impl FramePool for UserPool {
    fn acquire_user_frame(&self) -> Option<Pa> {
        let mut guard = self.free.lock();
        let pa = guard.pop();
        guard.unlock();
        pa
    }

    fn release_user_frame(&self, pa: Pa) {
        let mut guard = self.free.lock();
        guard.push(pa);
        guard.unlock();
    }
}

/// A physical page frame.
///
/// The frame returns itself to its pool when dropped.
pub struct Frame {
    pa: Pa,
    data: Box<[u8; PAGE_SIZE]>,
    pool: Arc<dyn FramePool>,
}

impl Frame {
    fn new(pa: Pa, pool: Arc<dyn FramePool>) -> Self {
        Self {
            pa,
            data: Box::new([0; PAGE_SIZE]),
            pool,
        }
    }

    /// Physical address of the frame.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Contents of the frame.
    #[inline]
    pub fn inner(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Mutable contents of the frame.
    #[inline]
    pub fn inner_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.pool.release_user_frame(self.pa);
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Frame({:?})", self.pa)
    }
}

struct FrameEntry {
    pa: Pa,
    va: Va,
    page: Weak<SpinLock<Page>>,
    page_table: Arc<dyn PageTable>,
}

struct FrameTableInner {
    entries: Vec<FrameEntry>,
    hand: usize,
}

/// The global table of resident frames.
pub struct FrameTable {
    pool: Arc<dyn FramePool>,
    inner: SpinLock<FrameTableInner>,
}

impl FrameTable {
    /// Creates an empty frame table over `pool`.
    pub fn new(pool: Arc<dyn FramePool>) -> Self {
        Self {
            pool,
            inner: SpinLock::new(FrameTableInner {
                entries: Vec::new(),
                hand: 0,
            }),
        }
    }

    /// Obtains a frame, evicting a resident page if the pool is empty.
    ///
    /// The returned frame is not registered; the caller registers it with
    /// [`FrameTable::register`] once it is bound to a page.
    ///
    /// # Returns
    /// - `Ok(Frame)`: A frame owned by the caller.
    /// - `Err(VmError::FrameExhausted)`: The pool is empty and no resident
    ///   page could be evicted.
    pub fn get_frame(&self, vm: &Vm) -> Result<Frame, VmError> {
        let mut inner = self.inner.lock();
        let frame = match self.pool.acquire_user_frame() {
            Some(pa) => Ok(Frame::new(pa, self.pool.clone())),
            None => Self::evict_victim(&mut inner, vm),
        };
        inner.unlock();
        frame
    }

    fn evict_victim(inner: &mut FrameTableInner, vm: &Vm) -> Result<Frame, VmError> {
        let len = inner.entries.len();
        let mut ineligible = vec![false; len];
        for _ in 0..2 * len {
            let idx = inner.hand % len;
            inner.hand = (idx + 1) % len;
            if ineligible[idx] {
                continue;
            }

            let entry = &inner.entries[idx];
            let (va, page_table) = (entry.va, entry.page_table.clone());
            let Some(page) = entry.page.upgrade() else {
                ineligible[idx] = true;
                continue;
            };
            let Ok(mut guard) = page.try_lock() else {
                ineligible[idx] = true;
                continue;
            };
            if page_table.is_accessed(va) {
                page_table.clear_accessed(va);
                guard.unlock();
                continue;
            }

            match guard.evict(page_table.as_ref(), vm) {
                Ok(frame) => {
                    debug!("evicted {:?} ({:?}) from {:?}", va, guard.stage(), frame.pa());
                    guard.unlock();
                    inner.entries.remove(idx);
                    inner.hand = if inner.entries.is_empty() {
                        0
                    } else {
                        idx % inner.entries.len()
                    };
                    return Ok(frame);
                }
                Err(e) => {
                    warn!("failed to evict {:?}: {:?}", va, e);
                    guard.unlock();
                    ineligible[idx] = true;
                }
            }
        }
        Err(VmError::FrameExhausted)
    }

    /// Records that the frame at `pa` now backs `page`, mapped at `va` in
    /// `page_table`.
    pub(crate) fn register(
        &self,
        pa: Pa,
        va: Va,
        page: &PageRef,
        page_table: Arc<dyn PageTable>,
    ) {
        let mut inner = self.inner.lock();
        inner.entries.push(FrameEntry {
            pa,
            va,
            page: Arc::downgrade(page),
            page_table,
        });
        inner.unlock();
    }

    /// Forgets the frame at `pa`.
    pub(crate) fn unregister(&self, pa: Pa) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.entries.iter().position(|entry| entry.pa == pa) {
            inner.entries.remove(idx);
            if idx < inner.hand {
                inner.hand -= 1;
            }
            if inner.hand >= inner.entries.len() {
                inner.hand = 0;
            }
        }
        inner.unlock();
    }

    /// Number of resident frames.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        let len = inner.entries.len();
        inner.unlock();
        len
    }

    /// Returns true if no frame is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the page occupying the frame at `pa`.
    pub fn owner_of(&self, pa: Pa) -> Option<PageRef> {
        let inner = self.inner.lock();
        let page = inner
            .entries
            .iter()
            .find(|entry| entry.pa == pa)
            .and_then(|entry| entry.page.upgrade());
        inner.unlock();
        page
    }
}
