//! Host-side stand-ins for physical memory and the paging hardware.
//!
//! [`SimPhys`] is a heap-allocated arena posing as physical memory starting
//! at address 0; [`SimPaging`] records what the VMM asks of the processor.
//! Together they let page-table code run in ordinary unit tests.

use crate::info::PAGE_SIZE;
use crate::{FrameAlloc, PagingControl, PhysMapper, RootPage};
use alloc::alloc::{Layout, alloc_zeroed, dealloc};
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};

/// Simulated physical memory of `frames` 4 KiB frames at `[0, frames * 4096)`.
pub struct SimPhys {
    base: NonNull<u8>,
    layout: Layout,
    frames: u64,
}

impl SimPhys {
    /// # Panics
    /// If `frames` is zero or the host allocation fails.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(frames: u64) -> Self {
        assert!(frames > 0, "simulated memory needs at least one frame");
        let size = (frames * PAGE_SIZE) as usize;
        let layout =
            Layout::from_size_align(size, PAGE_SIZE as usize).expect("valid arena layout");
        // SAFETY: the layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).expect("host allocation failed");
        Self {
            base,
            layout,
            frames,
        }
    }

    #[must_use]
    pub const fn frames(&self) -> u64 {
        self.frames
    }

    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.frames * PAGE_SIZE
    }

    /// Read a `u64` at `pa`.
    #[must_use]
    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        // SAFETY: bounds are checked by `phys_to_ptr`; the arena is 4 KiB aligned.
        unsafe { self.phys_to_ptr(pa).cast::<u64>().read_unaligned() }
    }

    /// Write a `u64` at `pa`.
    pub fn write_u64(&self, pa: PhysicalAddress, value: u64) {
        // SAFETY: bounds are checked by `phys_to_ptr`.
        unsafe { self.phys_to_ptr(pa).cast::<u64>().write_unaligned(value) }
    }
}

impl PhysMapper for SimPhys {
    #[allow(clippy::cast_possible_truncation)]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!(
            pa.as_u64() < self.bytes(),
            "physical address {pa:?} outside simulated memory of {} frames",
            self.frames
        );
        // SAFETY: in bounds of the arena allocation, checked above.
        unsafe { self.base.as_ptr().add(pa.as_u64() as usize) }
    }
}

impl Drop for SimPhys {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Frame source over a fixed pool of simulated frames.
///
/// Frames are handed out lowest-first; freed frames are reused before fresh
/// ones.
#[derive(Debug, Default)]
pub struct SimFrameAlloc {
    free: Vec<PhysicalPage<Size4K>>,
    outstanding: usize,
}

impl SimFrameAlloc {
    /// Pool of frames `first..first + count`.
    #[must_use]
    pub fn new(first: u64, count: u64) -> Self {
        let free = (first..first + count)
            .rev()
            .map(PhysicalPage::from_frame_index)
            .collect();
        Self {
            free,
            outstanding: 0,
        }
    }

    /// An allocator that never has a frame.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Frames currently handed out.
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Frames still available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Keep only the next `count` frames; the rest vanish from the pool.
    pub fn limit(&mut self, count: usize) {
        let len = self.free.len();
        if count < len {
            self.free.drain(..len - count);
        }
    }
}

impl FrameAlloc for SimFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let frame = self.free.pop()?;
        self.outstanding += 1;
        Some(frame)
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        assert!(
            !self.free.contains(&frame),
            "double free of {frame:?} in simulated frame pool"
        );
        self.outstanding -= 1;
        self.free.push(frame);
    }
}

/// Recording [`PagingControl`] for host tests.
#[derive(Debug)]
pub struct SimPaging {
    root: Cell<RootPage>,
    enabled: Cell<bool>,
    fault: Cell<VirtualAddress>,
    invalidated: RefCell<Vec<VirtualPage<Size4K>>>,
    root_loads: Cell<usize>,
}

impl SimPaging {
    /// Processor state as left by a bootloader: `root` active, paging on.
    #[must_use]
    pub fn booted(root: RootPage) -> Self {
        let sim = Self::disabled(root);
        sim.enabled.set(true);
        sim
    }

    /// Processor state before paging was turned on.
    #[must_use]
    pub fn disabled(root: RootPage) -> Self {
        Self {
            root: Cell::new(root),
            enabled: Cell::new(false),
            fault: Cell::new(VirtualAddress::zero()),
            invalidated: RefCell::new(Vec::new()),
            root_loads: Cell::new(0),
        }
    }

    /// Pretend the processor faulted on `va`.
    pub fn raise_fault(&self, va: VirtualAddress) {
        self.fault.set(va);
    }

    /// Pages invalidated so far, oldest first.
    #[must_use]
    pub fn invalidations(&self) -> Vec<VirtualPage<Size4K>> {
        self.invalidated.borrow().clone()
    }

    /// Number of root loads so far.
    #[must_use]
    pub fn root_loads(&self) -> usize {
        self.root_loads.get()
    }
}

impl PagingControl for SimPaging {
    fn active_root(&self) -> RootPage {
        self.root.get()
    }

    unsafe fn load_root(&self, root: RootPage) {
        self.root.set(root);
        self.root_loads.set(self.root_loads.get() + 1);
    }

    fn paging_enabled(&self) -> bool {
        self.enabled.get()
    }

    unsafe fn enable_paging(&self) {
        self.enabled.set(true);
    }

    fn invalidate_page(&self, page: VirtualPage<Size4K>) {
        self.invalidated.borrow_mut().push(page);
    }

    fn fault_address(&self) -> VirtualAddress {
        self.fault.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_reads_back_writes() {
        let phys = SimPhys::new(4);
        let pa = PhysicalAddress::new(0x2008);
        assert_eq!(phys.read_u64(pa), 0);
        phys.write_u64(pa, 0xDEAD_BEEF);
        assert_eq!(phys.read_u64(pa), 0xDEAD_BEEF);
    }

    #[test]
    #[should_panic(expected = "outside simulated memory")]
    fn arena_rejects_out_of_range_access() {
        let phys = SimPhys::new(2);
        let _ = phys.phys_to_ptr(PhysicalAddress::new(0x2000));
    }

    #[test]
    fn frame_pool_hands_out_lowest_first() {
        let mut pool = SimFrameAlloc::new(3, 2);
        let a = pool.alloc_4k().map(PhysicalPage::frame_index);
        let b = pool.alloc_4k().map(PhysicalPage::frame_index);
        assert_eq!((a, b), (Some(3), Some(4)));
        assert!(pool.alloc_4k().is_none());
        assert_eq!(pool.outstanding(), 2);

        pool.free_4k(PhysicalPage::from_frame_index(3));
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn limited_pool_keeps_lowest_frames() {
        let mut pool = SimFrameAlloc::new(10, 8);
        pool.limit(2);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.alloc_4k().map(PhysicalPage::frame_index), Some(10));
    }

    #[test]
    fn paging_records_requests() {
        let root = PhysicalPage::from_frame_index(1);
        let sim = SimPaging::disabled(root);
        assert!(!sim.paging_enabled());
        unsafe {
            sim.load_root(PhysicalPage::from_frame_index(2));
            sim.enable_paging();
        }
        assert!(sim.paging_enabled());
        assert_eq!(sim.active_root().frame_index(), 2);
        assert_eq!(sim.root_loads(), 1);

        let page = VirtualAddress::new(0x5000).page::<Size4K>();
        sim.invalidate_page(page);
        assert_eq!(sim.invalidations(), [page]);
    }
}
