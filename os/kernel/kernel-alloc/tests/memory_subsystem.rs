//! The frame allocator, VMM, and heap working together over simulated memory.

use kernel_alloc::{BitmapFrameAlloc, BumpHeap, HeapError, Vmm};
use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::sim::{SimPaging, SimPhys};
use kernel_vmem::{AddressSpace, FrameAlloc, PageFlags, PagingControl, VmmError};

const USER_VA: u64 = 0x0000_1234_5678_9000;
const KERNEL_VA: u64 = 0xffff_c000_0000_0000;

fn pmm_over(phys: &SimPhys) -> BitmapFrameAlloc<'static> {
    let mut regions = [MemoryRegion::usable(0, phys.bytes())];
    unsafe { BitmapFrameAlloc::init(&mut regions, phys) }
}

fn booted<'m>(phys: &'m SimPhys, pmm: &mut BitmapFrameAlloc<'_>) -> Vmm<'m, SimPhys, SimPaging> {
    let root = AddressSpace::create(phys, pmm).unwrap().root();
    Vmm::new(phys, SimPaging::booted(root))
}

#[test]
fn bitmap_occupies_the_first_usable_page() {
    let phys = SimPhys::new(8);
    let mut pmm = pmm_over(&phys);
    assert_eq!(pmm.free_memory(), 7 * PAGE_SIZE);

    let frames: Vec<_> = (0..7).map(|_| pmm.alloc_4k().unwrap()).collect();
    assert_eq!(frames[0].frame_index(), 1);
    assert_eq!(pmm.free_memory(), 0);
    assert!(pmm.alloc_4k().is_none());

    for frame in frames {
        pmm.free_4k(frame);
    }
    assert_eq!(pmm.free_memory(), 7 * PAGE_SIZE);
}

#[test]
fn reserved_regions_are_never_handed_out() {
    let phys = SimPhys::new(16);
    let mut regions = [
        MemoryRegion::usable(0, 4 * PAGE_SIZE),
        MemoryRegion::new(4 * PAGE_SIZE, 8 * PAGE_SIZE, MemoryRegionKind::KernelAndModules),
        MemoryRegion::usable(12 * PAGE_SIZE, 4 * PAGE_SIZE),
    ];
    let mut pmm = unsafe { BitmapFrameAlloc::init(&mut regions, &phys) };

    let mut seen = Vec::new();
    while let Some(frame) = pmm.alloc_4k() {
        seen.push(frame.frame_index());
    }
    assert_eq!(seen, [1, 2, 3, 12, 13, 14, 15]);
}

#[test]
fn map_then_unmap_returns_every_table_frame() {
    let phys = SimPhys::new(32);
    let mut pmm = pmm_over(&phys);
    let vmm = booted(&phys, &mut pmm);
    let root = vmm.kernel_root();
    let va = VirtualAddress::new(USER_VA);

    let data = pmm.alloc_4k().unwrap();
    let before = pmm.free_memory();

    vmm.map(&mut pmm, root, va, data.base(), PageFlags::WRITABLE).unwrap();
    assert_eq!(pmm.free_memory(), before - 3 * PAGE_SIZE, "L3, L2 and L1 created");
    assert!(vmm.is_mapped(root, va));

    let t = vmm.translate(root, VirtualAddress::new(USER_VA + 0x123)).unwrap();
    assert_eq!(t.address, PhysicalAddress::new(data.base().as_u64() + 0x123));
    assert!(t.flags.contains(PageFlags::PRESENT | PageFlags::WRITABLE));
    assert_eq!(t.page_size, PAGE_SIZE);

    assert_eq!(vmm.unmap(&mut pmm, root, va), Ok(data));
    assert!(!vmm.is_mapped(root, va));
    assert_eq!(pmm.free_memory(), before);
    assert_eq!(vmm.arch().invalidations(), [VirtualPage::<Size4K>::containing(va); 2]);
}

#[test]
fn low_page_maps_and_unmaps() {
    let phys = SimPhys::new(16);
    let mut pmm = pmm_over(&phys);
    let vmm = booted(&phys, &mut pmm);
    let root = vmm.kernel_root();
    let va = VirtualAddress::new(0x1000);

    assert!(vmm
        .map(&mut pmm, root, va, PhysicalAddress::new(0x2000), PageFlags::WRITABLE)
        .is_ok());
    assert!(vmm.is_mapped(root, va));
    assert!(vmm.unmap(&mut pmm, root, va).is_ok());
    assert!(!vmm.is_mapped(root, va));
}

#[test]
fn no_frame_is_handed_out_twice() {
    let phys = SimPhys::new(64);
    let mut pmm = pmm_over(&phys);

    let mut held = Vec::new();
    for round in 0..8 {
        for _ in 0..6 {
            held.push(pmm.alloc_4k().unwrap());
        }
        // Free the oldest three on even rounds so later rounds reuse the holes.
        if round % 2 == 0 {
            for frame in held.drain(..3) {
                pmm.free_4k(frame);
            }
        }
    }
    let mut indices: Vec<_> = held.iter().map(|f| f.frame_index()).collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), held.len());
    assert_eq!(
        pmm.free_memory(),
        pmm.total_memory() - PAGE_SIZE - held.len() as u64 * PAGE_SIZE
    );
}

#[test]
fn failed_map_on_drained_memory_leaves_no_tables_behind() {
    let phys = SimPhys::new(16);
    let mut pmm = pmm_over(&phys);
    let vmm = booted(&phys, &mut pmm);
    let root = vmm.kernel_root();

    let mut hoard = Vec::new();
    while pmm.free_memory() > 2 * PAGE_SIZE {
        hoard.push(pmm.alloc_4k().unwrap());
    }

    let va = VirtualAddress::new(USER_VA);
    assert_eq!(
        vmm.map(&mut pmm, root, va, hoard[0].base(), PageFlags::new()),
        Err(VmmError::OutOfMemory)
    );
    assert_eq!(pmm.free_memory(), 2 * PAGE_SIZE);
    assert!(!vmm.is_mapped(root, va));
    assert!(vmm.arch().invalidations().is_empty());
}

#[test]
fn second_map_of_a_page_is_rejected() {
    let phys = SimPhys::new(32);
    let mut pmm = pmm_over(&phys);
    let vmm = booted(&phys, &mut pmm);
    let root = vmm.kernel_root();
    let va = VirtualAddress::new(USER_VA);

    let first = pmm.alloc_4k().unwrap();
    let second = pmm.alloc_4k().unwrap();
    vmm.map(&mut pmm, root, va, first.base(), PageFlags::new()).unwrap();
    assert_eq!(
        vmm.map(&mut pmm, root, va, second.base(), PageFlags::WRITABLE),
        Err(VmmError::AlreadyMapped)
    );
    assert_eq!(vmm.translate(root, va).unwrap().address, first.base());
}

#[test]
fn queries_never_allocate() {
    let phys = SimPhys::new(32);
    let mut pmm = pmm_over(&phys);
    let vmm = booted(&phys, &mut pmm);
    let root = vmm.kernel_root();
    let before = pmm.free_memory();

    for va in [USER_VA, KERNEL_VA, 0, 0x0000_8000_0000_0000] {
        let va = VirtualAddress::new(va);
        assert!(!vmm.is_mapped(root, va));
        assert!(vmm.translate(root, va).is_err());
    }
    assert_eq!(
        vmm.unmap(&mut pmm, root, VirtualAddress::new(USER_VA)),
        Err(VmmError::NotMapped)
    );
    assert_eq!(pmm.free_memory(), before);
}

#[test]
fn address_spaces_share_the_kernel_half_only() {
    let phys = SimPhys::new(64);
    let mut pmm = pmm_over(&phys);
    let vmm = booted(&phys, &mut pmm);
    let kernel = vmm.kernel_root();

    let kdata = pmm.alloc_4k().unwrap();
    let kva = VirtualAddress::new(KERNEL_VA);
    vmm.map(&mut pmm, kernel, kva, kdata.base(), PageFlags::WRITABLE).unwrap();

    let a = vmm.create_kernel_address_space(&mut pmm).unwrap();
    let b = vmm.create_kernel_address_space(&mut pmm).unwrap();
    assert_ne!(a, b);
    assert_eq!(vmm.translate(a, kva).unwrap().address, kdata.base());
    assert_eq!(vmm.translate(b, kva).unwrap().address, kdata.base());

    let uva = VirtualAddress::new(USER_VA);
    let fa = pmm.alloc_4k().unwrap();
    let fb = pmm.alloc_4k().unwrap();
    vmm.map(&mut pmm, a, uva, fa.base(), PageFlags::USER).unwrap();
    vmm.map(&mut pmm, b, uva, fb.base(), PageFlags::USER).unwrap();
    assert_eq!(vmm.translate(a, uva).unwrap().address, fa.base());
    assert_eq!(vmm.translate(b, uva).unwrap().address, fb.base());
    assert!(!vmm.is_mapped(kernel, uva));

    unsafe { vmm.switch(a) };
    assert_eq!(vmm.active_root(), a);
    assert_eq!(vmm.kernel_root(), kernel);
}

#[test]
fn empty_address_space_maps_nothing() {
    let phys = SimPhys::new(32);
    let mut pmm = pmm_over(&phys);
    let vmm = booted(&phys, &mut pmm);

    let kva = VirtualAddress::new(KERNEL_VA);
    let frame = pmm.alloc_4k().unwrap();
    vmm.map(&mut pmm, vmm.kernel_root(), kva, frame.base(), PageFlags::new())
        .unwrap();

    let bare = vmm.create_address_space(&mut pmm).unwrap();
    assert!(!vmm.is_mapped(bare, kva));
}

#[test]
fn identity_map_skips_pages_already_present() {
    let phys = SimPhys::new(32);
    let mut pmm = pmm_over(&phys);
    let vmm = booted(&phys, &mut pmm);
    let root = vmm.kernel_root();
    let base = 0x0010_0000;

    vmm.map(
        &mut pmm,
        root,
        VirtualAddress::new(base + 2 * PAGE_SIZE),
        PhysicalAddress::new(0xdead_0000),
        PageFlags::new(),
    )
    .unwrap();

    let mapped = vmm
        .identity_map(
            &mut pmm,
            VirtualAddress::new(base),
            PhysicalAddress::new(base),
            4 * PAGE_SIZE + 100,
            PageFlags::WRITABLE,
        )
        .unwrap();
    assert_eq!(mapped, 3);

    for k in [0, 1, 3] {
        let va = VirtualAddress::new(base + k * PAGE_SIZE);
        assert_eq!(vmm.translate(root, va).unwrap().address.as_u64(), base + k * PAGE_SIZE);
    }
    let kept = vmm.translate(root, VirtualAddress::new(base + 2 * PAGE_SIZE)).unwrap();
    assert_eq!(kept.address, PhysicalAddress::new(0xdead_0000));
    assert!(!vmm.is_mapped(root, VirtualAddress::new(base + 4 * PAGE_SIZE)));
}

#[test]
fn identity_map_of_less_than_a_page_maps_nothing() {
    let phys = SimPhys::new(16);
    let mut pmm = pmm_over(&phys);
    let vmm = booted(&phys, &mut pmm);
    let before = pmm.free_memory();

    let mapped = vmm
        .identity_map(
            &mut pmm,
            VirtualAddress::new(0x1000),
            PhysicalAddress::new(0x1000),
            PAGE_SIZE - 1,
            PageFlags::new(),
        )
        .unwrap();
    assert_eq!(mapped, 0);
    assert_eq!(pmm.free_memory(), before);
}

#[test]
fn paging_is_enabled_once() {
    let phys = SimPhys::new(16);
    let mut pmm = pmm_over(&phys);
    let root = AddressSpace::create(&phys, &mut pmm).unwrap().root();
    let mut vmm = Vmm::new(&phys, SimPaging::disabled(root));
    assert!(!vmm.arch().paging_enabled());

    unsafe { vmm.enable_paging(root) }.unwrap();
    assert!(vmm.arch().paging_enabled());
    assert_eq!(vmm.arch().root_loads(), 1);

    assert!(matches!(
        unsafe { vmm.enable_paging(root) },
        Err(VmmError::InvalidRequest(_))
    ));
    assert_eq!(vmm.arch().root_loads(), 1);
}

#[test]
fn identity_maps_land_in_the_root_paging_was_enabled_with() {
    let phys = SimPhys::new(64);
    let mut pmm = pmm_over(&phys);
    let mut vmm = booted(&phys, &mut pmm);
    let boot = vmm.kernel_root();

    let root = vmm.create_kernel_address_space(&mut pmm).unwrap();
    unsafe { vmm.enable_paging(root) }.unwrap();
    assert_eq!(vmm.active_root(), root);
    assert_eq!(vmm.kernel_root(), root);

    let mapped = vmm
        .identity_map(
            &mut pmm,
            VirtualAddress::new(0x10_0000),
            PhysicalAddress::new(0x10_0000),
            2 * PAGE_SIZE,
            PageFlags::WRITABLE,
        )
        .unwrap();
    assert_eq!(mapped, 2);

    for va in [0x10_0000, 0x10_1000].map(VirtualAddress::new) {
        assert!(vmm.is_mapped(vmm.active_root(), va));
        assert!(!vmm.is_mapped(boot, va));
    }

    let va = VirtualAddress::new(kernel_info::memory::VMM_SELF_TEST_VA);
    vmm.self_test(&mut pmm, va).unwrap();
    assert!(vmm.arch().invalidations().contains(&VirtualPage::<Size4K>::containing(va)));
}

#[test]
fn self_test_leaves_memory_as_it_found_it() {
    let phys = SimPhys::new(32);
    let mut pmm = pmm_over(&phys);
    let vmm = booted(&phys, &mut pmm);
    let before = pmm.free_memory();

    let va = VirtualAddress::new(kernel_info::memory::VMM_SELF_TEST_VA);
    vmm.self_test(&mut pmm, va).unwrap();
    assert_eq!(pmm.free_memory(), before);
    assert!(!vmm.is_mapped(vmm.kernel_root(), va));
}

#[test]
fn heap_allocations_are_aligned_and_disjoint() {
    let phys = SimPhys::new(64);
    let mut pmm = pmm_over(&phys);
    let before = pmm.free_memory();
    let mut heap = BumpHeap::new(&phys, &mut pmm).unwrap();

    let mut ranges = Vec::new();
    let mut expected = 0;
    for size in (1..200).step_by(7) {
        let p = heap.alloc(&mut pmm, size).unwrap();
        assert_eq!(p.addr().get() % 8, 0);
        ranges.push((p.addr().get(), size));
        expected += size.next_multiple_of(8) as u64;
    }
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlap: {pair:?}");
    }

    assert_eq!(heap.used(), expected);
    assert_eq!(before - pmm.free_memory(), heap.total());
    assert_eq!(heap.alloc(&mut pmm, 0), Err(HeapError::InvalidRequest("zero-sized allocation")));
}

#[test]
fn heap_stops_growing_when_frames_run_out() {
    let phys = SimPhys::new(4);
    let mut pmm = pmm_over(&phys);
    let mut heap = BumpHeap::new(&phys, &mut pmm).unwrap();

    assert_eq!(heap.alloc(&mut pmm, 16 * 4096), Err(HeapError::OutOfMemory));
    assert_eq!(pmm.free_memory(), 0);
    assert_eq!(heap.total(), 3 * PAGE_SIZE);
    assert_eq!(heap.spans().len(), 1);
}
