#![allow(dead_code)]

use keos_vm::{
    SupplementalPageTable, Vm, VmError,
    addressing::{PAGE_SIZE, Va},
    frame::UserPool,
    fs::{RegularFile, traits},
    lazy_pager::{PFErrorCode, PageFaultReason},
    page_table::SoftPageTable,
    swap::{Disk, SECTOR_SIZE, SECTORS_PER_PAGE},
};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

pub const HEAP: usize = 0x1000_0000;

pub fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

/// State shared by every handle of a [`MemFile`].
#[derive(Default)]
pub struct FileState {
    pub data: Mutex<Vec<u8>>,
    pub writes: AtomicUsize,
    pub open: AtomicUsize,
    pub short_writes: AtomicBool,
}

impl FileState {
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

/// An in-memory file that counts its writes and open handles.
pub struct MemFile(Arc<FileState>);

impl MemFile {
    pub fn create(data: Vec<u8>) -> (RegularFile, Arc<FileState>) {
        let state = Arc::new(FileState {
            data: Mutex::new(data),
            ..Default::default()
        });
        state.open.fetch_add(1, Ordering::SeqCst);
        (RegularFile::new(MemFile(state.clone())), state)
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.0.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl traits::RegularFile for MemFile {
    fn size(&self) -> usize {
        self.0.data.lock().unwrap().len()
    }

    fn read_at(&self, position: usize, buf: &mut [u8]) -> Result<usize, VmError> {
        let data = self.0.data.lock().unwrap();
        if position >= data.len() {
            return Ok(0);
        }
        let len = buf.len().min(data.len() - position);
        buf[..len].copy_from_slice(&data[position..position + len]);
        Ok(len)
    }

    fn write_at(&self, position: usize, buf: &[u8]) -> Result<usize, VmError> {
        if self.0.short_writes.load(Ordering::SeqCst) {
            return Ok(0);
        }
        self.0.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.0.data.lock().unwrap();
        if data.len() < position + buf.len() {
            data.resize(position + buf.len(), 0);
        }
        data[position..position + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn reopen(&self) -> Result<RegularFile, VmError> {
        self.0.open.fetch_add(1, Ordering::SeqCst);
        Ok(RegularFile::new(MemFile(self.0.clone())))
    }
}

/// A swap disk held in memory.
pub struct RamDisk(Mutex<Vec<[u8; SECTOR_SIZE]>>);

impl RamDisk {
    pub fn with_slots(slots: usize) -> Self {
        Self(Mutex::new(vec![[0; SECTOR_SIZE]; slots * SECTORS_PER_PAGE]))
    }
}

impl Disk for RamDisk {
    fn sector_count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn read(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), VmError> {
        let disk = self.0.lock().unwrap();
        buf.copy_from_slice(disk.get(sector).ok_or(VmError::IOError)?);
        Ok(())
    }

    fn write(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) -> Result<(), VmError> {
        let mut disk = self.0.lock().unwrap();
        disk.get_mut(sector).ok_or(VmError::IOError)?.copy_from_slice(buf);
        Ok(())
    }
}

/// Builds a [`Vm`] over `frames` user frames and `swap_slots` swap slots.
pub fn vm(frames: usize, swap_slots: usize) -> (Arc<Vm>, Arc<UserPool>) {
    let pool = Arc::new(UserPool::new(frames));
    let mut builder = Vm::builder(pool.clone());
    if swap_slots > 0 {
        builder = builder.swap_disk(RamDisk::with_slots(swap_slots));
    }
    (builder.build(), pool)
}

pub fn spt(vm: &Arc<Vm>) -> (SupplementalPageTable, Arc<SoftPageTable>) {
    let pt = Arc::new(SoftPageTable::new());
    (SupplementalPageTable::new(vm.clone(), pt.clone()), pt)
}

/// Raises a user-mode not-present fault at `addr` with the stack pointer at
/// `rsp`.
pub fn fault_with_rsp(
    spt: &mut SupplementalPageTable,
    addr: Va,
    is_write: bool,
    rsp: Va,
) -> Result<(), VmError> {
    let ec = if is_write {
        PFErrorCode::USER | PFErrorCode::WRITE_ACCESS
    } else {
        PFErrorCode::USER
    };
    spt.handle_page_fault(&PageFaultReason::new(ec, addr, rsp))
}

pub fn fault(spt: &mut SupplementalPageTable, addr: Va, is_write: bool) -> Result<(), VmError> {
    let rsp = spt.vm().user_stack();
    fault_with_rsp(spt, addr, is_write, rsp)
}

/// A page filled with a byte derived from `seed`.
pub fn pattern(seed: usize) -> Vec<u8> {
    (0..PAGE_SIZE).map(|i| (i * 7 + seed * 31) as u8).collect()
}

pub fn read_page(spt: &SupplementalPageTable, addr: Va) -> Vec<u8> {
    let mut buf = vec![0; PAGE_SIZE];
    spt.read_user(addr, &mut buf).unwrap();
    buf
}

/// Checks that every resident page is registered in the frame table and
/// mapped in `pt` to its own frame.
pub fn assert_frames_consistent(spt: &SupplementalPageTable, pt: &SoftPageTable) {
    use keos_vm::page_table::PageTable;

    for (va, page) in spt.pages() {
        let guard = page.lock();
        if let Some(frame) = guard.frame() {
            let owner = spt.vm().frames().owner_of(frame.pa()).unwrap();
            assert!(Arc::ptr_eq(&owner, page));
            assert_eq!(pt.walk(va).unwrap().pa(), Some(frame.pa()));
        } else {
            assert!(pt.walk(va).is_err());
        }
        guard.unlock();
    }
}
