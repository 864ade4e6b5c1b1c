//! # Memory Layout

/// Size of a physical frame and of a virtual page, in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Number of entries in one page table at any level.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// First root-table (L4) index of the kernel half of every address space.
///
/// Entries `KERNEL_HALF_START_INDEX..PAGE_TABLE_ENTRIES` cover
/// `0xffff_8000_0000_0000..`, where the bootloader places the HHDM and the
/// kernel image.
pub const KERNEL_HALF_START_INDEX: usize = 256;

/// Where the kernel executes (VMA), matches the linker script.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Upper bound of memory map entries copied out of the boot protocol.
pub const MAX_MEMORY_REGIONS: usize = 256;

/// Upper bound of discontiguous physical extents the bootstrap heap tracks.
pub const MAX_HEAP_SPANS: usize = 32;

/// Lower-half address used by the boot-time paging self test.
///
/// It must not be used by anything else; the test maps and unmaps a single
/// page there.
pub const VMM_SELF_TEST_VA: u64 = 0x0000_4000_0000_0000;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(PAGE_TABLE_ENTRIES * 8 == PAGE_SIZE as usize);
    assert!(KERNEL_HALF_START_INDEX == PAGE_TABLE_ENTRIES / 2);
    assert!(KERNEL_BASE.is_multiple_of(2 * 1024 * 1024));
    assert!(VMM_SELF_TEST_VA.is_multiple_of(PAGE_SIZE));
    assert!(VMM_SELF_TEST_VA < 0x0000_8000_0000_0000);
    assert!(MAX_HEAP_SPANS > 0);
};
