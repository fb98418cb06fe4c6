mod common;

use common::*;
use keos_vm::{VmError, addressing::PAGE_SIZE, page::VmType};
use std::sync::atomic::Ordering;

const MAP: usize = 0x2000_0000;

#[test]
fn mmap_is_lazy() {
    let (vm, _pool) = vm(4, 0);
    let (mut spt, pt) = spt(&vm);
    let data: Vec<u8> = (0..2 * PAGE_SIZE + 100).map(|i| (i % 199) as u8).collect();
    let (file, state) = MemFile::create(data.clone());

    assert_eq!(spt.mmap(va(MAP), 3 * PAGE_SIZE, true, &file, 0), Ok(va(MAP)));
    assert_eq!(spt.len(), 3);
    assert_eq!(vm.frames().len(), 0);
    assert_eq!(state.open_handles(), 2);
    for (_, page) in spt.pages() {
        let guard = page.lock();
        assert_eq!(guard.stage(), VmType::Uninit);
        assert_eq!(guard.ty(), VmType::File);
        guard.unlock();
    }

    let tail = read_page(&spt, va(MAP + 2 * PAGE_SIZE));
    assert_eq!(&tail[..100], &data[2 * PAGE_SIZE..]);
    assert!(tail[100..].iter().all(|b| *b == 0));
    assert_eq!(vm.frames().len(), 1);
    assert_frames_consistent(&spt, &pt);
}

#[test]
fn mmap_is_clipped_to_the_file() {
    let (vm, _pool) = vm(4, 0);
    let (mut spt, _pt) = spt(&vm);
    let (file, _state) = MemFile::create(vec![3; 5000]);

    spt.mmap(va(MAP), 10 * PAGE_SIZE, false, &file, 0).unwrap();
    assert_eq!(spt.len(), 2);
    assert_eq!(spt.mmaps()[0].addr(), va(MAP));
    assert_eq!(spt.mmaps()[0].page_count(), 2);

    let (other, _state) = MemFile::create(vec![4; 3 * PAGE_SIZE]);
    spt.mmap(va(MAP + 0x10_0000), PAGE_SIZE, false, &other, 2 * PAGE_SIZE)
        .unwrap();
    assert_eq!(read_page(&spt, va(MAP + 0x10_0000)), vec![4; PAGE_SIZE]);
}

#[test]
fn mmap_rejects_bad_requests() {
    let (vm, _pool) = vm(4, 0);
    let (mut spt, _pt) = spt(&vm);
    let (file, state) = MemFile::create(vec![0; 2 * PAGE_SIZE]);

    assert_eq!(
        spt.mmap(va(MAP), 0, true, &file, 0),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        spt.mmap(va(0), PAGE_SIZE, true, &file, 0),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        spt.mmap(va(MAP + 1), PAGE_SIZE, true, &file, 0),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        spt.mmap(va(MAP), PAGE_SIZE, true, &file, 1),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        spt.mmap(va(MAP), PAGE_SIZE, true, &file, 2 * PAGE_SIZE),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        spt.mmap(va(0x80_0400_0000 - PAGE_SIZE), 2 * PAGE_SIZE, true, &file, 0),
        Err(VmError::IllegalAddress)
    );

    spt.alloc_page(VmType::Anon, va(MAP + 3 * PAGE_SIZE), true)
        .unwrap();
    assert_eq!(
        spt.mmap(va(MAP), 4 * PAGE_SIZE, true, &file, 0),
        Err(VmError::OverlappingMmap)
    );
    assert_eq!(spt.len(), 1);
    assert!(spt.mmaps().is_empty());
    assert_eq!(state.open_handles(), 1);
}

#[test]
fn munmap_writes_back_dirty_pages_only() {
    let (vm, pool) = vm(4, 0);
    let (mut spt, pt) = spt(&vm);
    let (file, state) = MemFile::create(vec![0; 2 * PAGE_SIZE]);
    let addr = spt.mmap(va(MAP), 2 * PAGE_SIZE, true, &file, 0).unwrap();

    spt.write_user(addr, b"hello").unwrap();
    read_page(&spt, addr + PAGE_SIZE);
    assert_eq!(vm.frames().len(), 2);

    spt.munmap(addr).unwrap();
    assert_eq!(state.writes(), 1);
    assert_eq!(&state.contents()[..5], b"hello");
    assert!(spt.is_empty());
    assert!(spt.mmaps().is_empty());
    assert!(pt.is_empty());
    assert_eq!(pool.available(), 4);
    assert_eq!(state.open_handles(), 1);
    assert_eq!(fault(&mut spt, addr, false), Err(VmError::IllegalAddress));
}

#[test]
fn munmap_writes_back_the_file_tail_only() {
    let (vm, _pool) = vm(4, 0);
    let (mut spt, _pt) = spt(&vm);
    let (file, state) = MemFile::create(vec![0; 5000]);
    let addr = spt.mmap(va(MAP), 2 * PAGE_SIZE, true, &file, 0).unwrap();

    spt.write_user(addr + PAGE_SIZE, &[0xaa; PAGE_SIZE]).unwrap();
    spt.munmap(addr).unwrap();
    let contents = state.contents();
    assert_eq!(contents.len(), 5000);
    assert!(contents[..PAGE_SIZE].iter().all(|b| *b == 0));
    assert!(contents[PAGE_SIZE..].iter().all(|b| *b == 0xaa));
}

#[test]
fn munmap_needs_the_run_head() {
    let (vm, _pool) = vm(4, 0);
    let (mut spt, _pt) = spt(&vm);
    let (file, _state) = MemFile::create(vec![0; 2 * PAGE_SIZE]);
    let addr = spt.mmap(va(MAP), 2 * PAGE_SIZE, true, &file, 0).unwrap();

    assert_eq!(spt.munmap(addr + PAGE_SIZE), Err(VmError::NoSuchEntry));
    assert_eq!(spt.munmap(va(HEAP)), Err(VmError::NoSuchEntry));
    assert_eq!(spt.len(), 2);
    spt.munmap(addr).unwrap();
    assert_eq!(spt.munmap(addr), Err(VmError::NoSuchEntry));
}

#[test]
fn failed_write_back_keeps_the_run() {
    let (vm, _pool) = vm(4, 0);
    let (mut spt, _pt) = spt(&vm);
    let (file, state) = MemFile::create(vec![0; PAGE_SIZE]);
    let addr = spt.mmap(va(MAP), PAGE_SIZE, true, &file, 0).unwrap();
    spt.write_user(addr, b"keep").unwrap();

    state.short_writes.store(true, Ordering::SeqCst);
    assert_eq!(spt.munmap(addr), Err(VmError::ShortWrite));
    assert_eq!(spt.len(), 1);
    assert_eq!(spt.mmaps().len(), 1);
    assert_eq!(&read_page(&spt, addr)[..4], b"keep");

    state.short_writes.store(false, Ordering::SeqCst);
    spt.munmap(addr).unwrap();
    assert_eq!(&state.contents()[..4], b"keep");
}

#[test]
fn mapping_outlives_the_callers_handle() {
    let (vm, _pool) = vm(4, 0);
    let (mut spt, _pt) = spt(&vm);
    let (file, state) = MemFile::create(vec![5; PAGE_SIZE]);
    let addr = spt.mmap(va(MAP), PAGE_SIZE, false, &file, 0).unwrap();
    drop(file);
    assert_eq!(state.open_handles(), 1);

    assert_eq!(read_page(&spt, addr), vec![5; PAGE_SIZE]);
    assert_eq!(
        spt.write_user(addr, b"no"),
        Err(VmError::WriteProtectionFault)
    );
    drop(spt);
    assert_eq!(state.open_handles(), 0);
}

#[test]
fn runs_are_kept_in_address_order() {
    let (vm, _pool) = vm(4, 0);
    let (mut spt, _pt) = spt(&vm);
    let (file, _state) = MemFile::create(vec![0; PAGE_SIZE]);

    spt.mmap(va(MAP + 4 * PAGE_SIZE), PAGE_SIZE, true, &file, 0).unwrap();
    spt.mmap(va(MAP), PAGE_SIZE, true, &file, 0).unwrap();
    spt.mmap(va(MAP + 2 * PAGE_SIZE), PAGE_SIZE, true, &file, 0).unwrap();
    let heads: Vec<_> = spt.mmaps().iter().map(|run| run.addr()).collect();
    assert_eq!(
        heads,
        vec![va(MAP), va(MAP + 2 * PAGE_SIZE), va(MAP + 4 * PAGE_SIZE)]
    );
}

#[test]
fn run_pages_are_only_removed_by_munmap() {
    let (vm, pool) = vm(4, 0);
    let (mut spt, _pt) = spt(&vm);
    let (file, state) = MemFile::create(vec![0; 2 * PAGE_SIZE]);
    let addr = spt.mmap(va(MAP), 2 * PAGE_SIZE, true, &file, 0).unwrap();
    spt.write_user(addr + PAGE_SIZE, b"tail").unwrap();

    assert_eq!(spt.remove(addr + PAGE_SIZE), Err(VmError::InvalidArgument));
    assert_eq!(spt.remove(addr), Err(VmError::InvalidArgument));
    assert_eq!(spt.len(), 2);
    assert_eq!(&read_page(&spt, addr + PAGE_SIZE)[..4], b"tail");

    spt.munmap(addr).unwrap();
    assert!(spt.is_empty());
    assert_eq!(pool.available(), 4);
    assert_eq!(&state.contents()[PAGE_SIZE..PAGE_SIZE + 4], b"tail");
    assert_eq!(spt.remove(addr), Err(VmError::NoSuchEntry));
}
