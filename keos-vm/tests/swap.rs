mod common;

use common::*;
use keos_vm::{VmError, addressing::PAGE_SIZE, page::VmType, page_table::PageTable};
use std::{sync::Arc, thread};

#[test]
fn anon_pages_survive_eviction() {
    let (vm, pool) = vm(2, 8);
    let (mut spt, pt) = spt(&vm);

    for i in 0..4 {
        spt.alloc_page(VmType::Anon, va(HEAP + i * PAGE_SIZE), true)
            .unwrap();
    }
    for i in 0..4 {
        spt.write_user(va(HEAP + i * PAGE_SIZE), &pattern(i)).unwrap();
        assert!(vm.frames().len() <= 2);
    }
    assert_eq!(pool.available(), 0);
    assert!(vm.swap().in_use() >= 2);
    assert_frames_consistent(&spt, &pt);

    for i in (0..4).rev() {
        assert_eq!(read_page(&spt, va(HEAP + i * PAGE_SIZE)), pattern(i));
    }
    assert_frames_consistent(&spt, &pt);
    assert_eq!(vm.swap().in_use(), 2);
}

#[test]
fn swap_slot_is_released_on_swap_in() {
    let (vm, _pool) = vm(1, 4);
    let (mut spt, _pt) = spt(&vm);
    let (a, b) = (va(HEAP), va(HEAP + PAGE_SIZE));
    spt.alloc_page(VmType::Anon, a, true).unwrap();
    spt.alloc_page(VmType::Anon, b, true).unwrap();

    spt.write_user(a, &pattern(1)).unwrap();
    assert_eq!(vm.swap().in_use(), 0);
    spt.write_user(b, &pattern(2)).unwrap();
    assert_eq!(vm.swap().in_use(), 1);

    let page = spt.find(a).unwrap();
    let guard = page.lock();
    assert!(!guard.is_resident());
    assert_eq!(guard.stage(), VmType::Anon);
    guard.unlock();

    assert_eq!(read_page(&spt, a), pattern(1));
    assert_eq!(vm.swap().in_use(), 1);
    drop(spt);
    assert_eq!(vm.swap().in_use(), 0);
}

#[test]
fn exhaustion_without_swap() {
    let (vm, _pool) = vm(1, 0);
    let (mut spt, pt) = spt(&vm);
    let (a, b) = (va(HEAP), va(HEAP + PAGE_SIZE));
    spt.alloc_page(VmType::Anon, a, true).unwrap();
    spt.alloc_page(VmType::Anon, b, true).unwrap();

    spt.write_user(a, &pattern(3)).unwrap();
    assert_eq!(fault(&mut spt, b, true), Err(VmError::FrameExhausted));
    assert_eq!(vm.frames().len(), 1);
    assert!(pt.walk(a).is_ok());
    assert!(pt.walk(b).is_err());
    assert_eq!(read_page(&spt, a), pattern(3));
    assert_frames_consistent(&spt, &pt);
}

#[test]
fn clean_file_page_is_dropped_dirty_one_written_back() {
    let (vm, _pool) = vm(1, 0);
    let (mut spt, pt) = spt(&vm);
    let data: Vec<u8> = (0..2 * PAGE_SIZE).map(|i| (i % 13) as u8).collect();
    let (file, state) = MemFile::create(data.clone());
    let addr = spt.mmap(va(HEAP), 2 * PAGE_SIZE, true, &file, 0).unwrap();

    assert_eq!(read_page(&spt, addr), &data[..PAGE_SIZE]);
    assert_eq!(read_page(&spt, addr + PAGE_SIZE), &data[PAGE_SIZE..]);
    assert_eq!(state.writes(), 0);

    spt.write_user(addr + 5, b"dirty").unwrap();
    assert!(pt.is_dirty(addr));
    assert_eq!(read_page(&spt, addr + PAGE_SIZE), &data[PAGE_SIZE..]);
    assert_eq!(state.writes(), 1);
    assert_eq!(&state.contents()[5..10], b"dirty");
    assert_eq!(vm.swap().in_use(), 0);

    assert_eq!(&read_page(&spt, addr)[5..10], b"dirty");
    assert_frames_consistent(&spt, &pt);
}

#[test]
fn segment_page_goes_to_swap_not_file() {
    let (vm, _pool) = vm(1, 4);
    let (mut spt, _pt) = spt(&vm);
    let (file, state) = MemFile::create(vec![9; PAGE_SIZE]);
    spt.load_segment(&file, 0, va(HEAP), PAGE_SIZE, 0, true).unwrap();
    spt.alloc_page(VmType::Anon, va(HEAP + PAGE_SIZE), true).unwrap();

    spt.write_user(va(HEAP), &[1; 16]).unwrap();
    fault(&mut spt, va(HEAP + PAGE_SIZE), false).unwrap();
    assert_eq!(state.writes(), 0);
    assert_eq!(vm.swap().in_use(), 1);

    let page = read_page(&spt, va(HEAP));
    assert_eq!(&page[..16], &[1; 16]);
    assert!(page[16..].iter().all(|b| *b == 9));
}

#[test]
fn concurrent_address_spaces() {
    const PAGES: usize = 16;
    let (vm, pool) = vm(8, 64);

    let workers: Vec<_> = (0..2)
        .map(|t| {
            let vm = vm.clone();
            thread::spawn(move || {
                let (mut spt, pt) = spt(&vm);
                for i in 0..PAGES {
                    spt.alloc_page(VmType::Anon, va(HEAP + i * PAGE_SIZE), true)
                        .unwrap();
                }
                for round in 0..3 {
                    for i in 0..PAGES {
                        spt.write_user(va(HEAP + i * PAGE_SIZE), &pattern(t * 100 + i + round))
                            .unwrap();
                    }
                    for i in 0..PAGES {
                        assert_eq!(
                            read_page(&spt, va(HEAP + i * PAGE_SIZE)),
                            pattern(t * 100 + i + round)
                        );
                    }
                }
                assert_frames_consistent(&spt, &pt);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(pool.available(), 8);
    assert_eq!(vm.frames().len(), 0);
    assert_eq!(vm.swap().in_use(), 0);
    assert_eq!(Arc::strong_count(&vm), 1);
}

#[test]
fn eviction_tolerates_a_missing_mapping() {
    let (vm, pool) = vm(1, 4);
    let (mut spt, pt) = spt(&vm);
    let (a, b) = (va(HEAP), va(HEAP + PAGE_SIZE));
    spt.alloc_page(VmType::Anon, a, true).unwrap();
    spt.alloc_page(VmType::Anon, b, true).unwrap();
    spt.write_user(a, &pattern(1)).unwrap();

    pt.unmap(a).unwrap();
    spt.write_user(b, &pattern(2)).unwrap();
    assert_eq!(vm.swap().in_use(), 1);
    assert_eq!(read_page(&spt, a), pattern(1));

    pt.unmap(a).unwrap();
    spt.remove(a).unwrap();
    assert_eq!(pool.available(), 1);
    assert!(vm.frames().is_empty());
    assert_frames_consistent(&spt, &pt);
    assert_eq!(read_page(&spt, b), pattern(2));
}
