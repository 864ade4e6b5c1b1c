//! # Bitmap Physical Frame Allocator
//!
//! One bit per 4 KiB frame of physical memory, frame index = `address / 4096`.
//! A set bit means "not allocatable" (allocated, reserved, or not RAM); a
//! clear bit means free.
//!
//! ```text
//!  regions:  [usable ........][reserved][usable ......]
//!             ▲ bitmap lives here, region shrunk past it
//!  bitmap:    1111 0000 0000 ... 1111 ... 0000 0000 ...
//!             ^^^^ bitmap's own frames stay set
//! ```
//!
//! The bitmap is stored in the first usable region large enough to hold it
//! and is reached through a [`PhysMapper`]. Allocation is a first-fit scan
//! from frame 0, one 64-bit word at a time.

use kernel_info::boot::MemoryRegion;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, info, warn};

const BITS_PER_WORD: u64 = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("no free physical frame")]
    OutOfMemory,
    #[error("frame allocator has no bitmap (no usable region could hold it)")]
    Uninitialized,
}

/// Bitmap-backed physical memory manager.
pub struct BitmapFrameAlloc<'m> {
    bitmap: &'m mut [u64],
    total_pages: u64,
}

impl BitmapFrameAlloc<'static> {
    /// An allocator without a bitmap; every allocation fails.
    #[must_use]
    pub const fn uninitialized() -> Self {
        Self {
            bitmap: &mut [],
            total_pages: 0,
        }
    }
}

impl<'m> BitmapFrameAlloc<'m> {
    /// Build the allocator from the boot memory map.
    ///
    /// `total_pages` spans up to the highest region end. The bitmap is placed
    /// at the start of the first usable region that can hold it after page
    /// alignment, and that region is shrunk in `regions` to exclude it.
    /// If no region qualifies the allocator stays uninitialized.
    ///
    /// # Safety
    /// - Every usable region must be RAM that nothing else uses, reachable
    ///   through `mapper` for the lifetime `'m`.
    /// - Only one allocator may be built from the same regions.
    pub unsafe fn init<M: PhysMapper>(regions: &mut [MemoryRegion], mapper: &M) -> Self {
        let top = regions.iter().map(MemoryRegion::end).max().unwrap_or(0);
        let total_pages = top / PAGE_SIZE;
        let words = total_pages.div_ceil(BITS_PER_WORD);
        let reservation = align_up(words * size_of::<u64>() as u64);

        let Some((host, start)) = regions.iter_mut().filter(|r| r.is_usable()).find_map(|r| {
            let (start, end) = usable_span(r)?;
            (end - start >= reservation).then_some((r, start))
        }) else {
            warn!(
                "no usable region can hold the {reservation} byte frame bitmap for {total_pages} pages"
            );
            return Self {
                bitmap: &mut [],
                total_pages: 0,
            };
        };

        let end = host.end();
        host.base = start + reservation;
        host.length = end - host.base;

        let bitmap_pa = PhysicalAddress::new(start);
        #[allow(clippy::cast_possible_truncation)]
        // SAFETY: the reservation lies inside a usable region the caller hands over.
        let bitmap = unsafe { mapper.phys_to_slice_mut::<u64>(bitmap_pa, words as usize) };
        bitmap.fill(u64::MAX);

        let mut pmm = Self {
            bitmap,
            total_pages,
        };
        for region in regions.iter().filter(|r| r.is_usable()) {
            if let Some((start, end)) = usable_span(region) {
                pmm.release_range(start / PAGE_SIZE, end / PAGE_SIZE);
            }
        }

        info!(
            "frame bitmap: {total_pages} pages, {reservation} bytes at {bitmap_pa}, {} KiB free",
            pmm.free_memory() / 1024
        );
        pmm
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.bitmap.is_empty()
    }

    /// Number of frames the bitmap covers, usable or not.
    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }

    #[must_use]
    pub const fn total_memory(&self) -> u64 {
        self.total_pages * PAGE_SIZE
    }

    /// Take the lowest-numbered free frame.
    ///
    /// # Errors
    /// - [`FrameAllocError::Uninitialized`] without a bitmap.
    /// - [`FrameAllocError::OutOfMemory`] if every frame is taken.
    pub fn allocate(&mut self) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        if !self.is_initialized() {
            return Err(FrameAllocError::Uninitialized);
        }

        for (word_index, word) in (0u64..).zip(self.bitmap.iter_mut()) {
            if *word == u64::MAX {
                continue;
            }
            let bit = u64::from((!*word).trailing_zeros());
            let frame = word_index * BITS_PER_WORD + bit;
            if frame >= self.total_pages {
                break;
            }
            *word |= 1 << bit;
            return Ok(PhysicalPage::from_frame_index(frame));
        }

        Err(FrameAllocError::OutOfMemory)
    }

    /// Mark the frame containing `pa` free.
    ///
    /// There is no ownership check: freeing a free or reserved frame simply
    /// makes it allocatable. Frames outside the bitmap are ignored.
    pub fn free(&mut self, pa: PhysicalAddress) {
        if !self.is_initialized() {
            warn!("free of {pa} before the frame allocator was initialized");
            return;
        }

        let frame = pa.as_u64() / PAGE_SIZE;
        if frame >= self.total_pages {
            warn!("free of {pa} beyond the {} managed pages", self.total_pages);
            return;
        }
        if self.is_free(frame) {
            debug!("double free of frame {frame:#x}");
        }
        self.release_range(frame, frame + 1);
    }

    /// Free bytes, counted afresh.
    #[must_use]
    pub fn free_memory(&self) -> u64 {
        let set: u64 = self.bitmap.iter().map(|w| u64::from(w.count_ones())).sum();
        let padding = self.bitmap.len() as u64 * BITS_PER_WORD - self.total_pages;
        (self.total_pages - (set - padding)) * PAGE_SIZE
    }

    #[must_use]
    pub fn used_memory(&self) -> u64 {
        self.total_memory() - self.free_memory()
    }

    /// Whether `frame` is currently allocatable.
    #[must_use]
    pub fn is_frame_free(&self, frame: PhysicalPage<Size4K>) -> bool {
        let index = frame.frame_index();
        index < self.total_pages && self.is_free(index)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn is_free(&self, frame: u64) -> bool {
        let word = self.bitmap[(frame / BITS_PER_WORD) as usize];
        word & (1 << (frame % BITS_PER_WORD)) == 0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn release_range(&mut self, first: u64, end: u64) {
        for frame in first..end.min(self.total_pages) {
            self.bitmap[(frame / BITS_PER_WORD) as usize] &= !(1 << (frame % BITS_PER_WORD));
        }
    }
}

impl FrameAlloc for BitmapFrameAlloc<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate().ok()
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        self.free(frame.base());
    }
}

const fn align_up(value: u64) -> u64 {
    value.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Whole pages of a region: `[align_up(base), align_down(end))`, if any.
fn usable_span(region: &MemoryRegion) -> Option<(u64, u64)> {
    let start = region.base.checked_next_multiple_of(PAGE_SIZE)?;
    let end = region.end() / PAGE_SIZE * PAGE_SIZE;
    (start < end).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryRegionKind;
    use kernel_vmem::sim::SimPhys;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn eight_usable_pages_leave_seven_after_bitmap() {
        let phys = SimPhys::new(8);
        let mut regions = [MemoryRegion::usable(0, 8 * PAGE_SIZE)];
        let pmm = unsafe { BitmapFrameAlloc::init(&mut regions, &phys) };

        assert!(pmm.is_initialized());
        assert_eq!(pmm.total_pages(), 8);
        assert_eq!(pmm.free_memory(), 7 * PAGE_SIZE);
        assert_eq!(regions[0].base, PAGE_SIZE);
        assert_eq!(regions[0].length, 7 * PAGE_SIZE);
        assert!(!pmm.is_frame_free(PhysicalPage::from_frame_index(0)));
    }

    #[test]
    fn bitmap_skips_regions_too_small_after_alignment() {
        let phys = SimPhys::new(32);
        let mut regions = [
            MemoryRegion::usable(0x800, PAGE_SIZE),
            MemoryRegion::new(0x2000, 0x2000, MemoryRegionKind::Reserved),
            MemoryRegion::usable(0x4000, 0x1C000),
        ];
        let pmm = unsafe { BitmapFrameAlloc::init(&mut regions, &phys) };

        assert_eq!(pmm.total_pages(), 32);
        assert_eq!(regions[0].base, 0x800, "unaligned region untouched");
        assert_eq!(regions[2].base, 0x5000);
        // 28 pages in the second usable region, one holds the bitmap.
        assert_eq!(pmm.free_memory(), 27 * PAGE_SIZE);
        assert!(!pmm.is_frame_free(PhysicalPage::from_frame_index(0)));
        assert!(!pmm.is_frame_free(PhysicalPage::from_frame_index(2)));
        assert!(pmm.is_frame_free(PhysicalPage::from_frame_index(5)));
    }

    #[test]
    fn allocation_is_first_fit_and_exhausts() {
        let phys = SimPhys::new(8);
        let mut regions = [MemoryRegion::usable(0, 8 * PAGE_SIZE)];
        let mut pmm = unsafe { BitmapFrameAlloc::init(&mut regions, &phys) };

        let frames: Vec<u64> = (0..7)
            .map(|_| pmm.allocate().unwrap().frame_index())
            .collect();
        assert_eq!(frames, [1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(pmm.allocate(), Err(FrameAllocError::OutOfMemory));
        assert_eq!(pmm.free_memory(), 0);

        pmm.free(PhysicalAddress::new(3 * PAGE_SIZE));
        assert_eq!(pmm.allocate().unwrap().frame_index(), 3);
    }

    #[test]
    fn free_outside_bitmap_and_double_free_do_not_panic() {
        let phys = SimPhys::new(8);
        let mut regions = [MemoryRegion::usable(0, 8 * PAGE_SIZE)];
        let mut pmm = unsafe { BitmapFrameAlloc::init(&mut regions, &phys) };

        pmm.free(PhysicalAddress::new(1024 * MIB));
        assert_eq!(pmm.free_memory(), 7 * PAGE_SIZE);

        let frame = pmm.allocate().unwrap();
        pmm.free(frame.base());
        pmm.free(frame.base());
        assert_eq!(pmm.free_memory(), 7 * PAGE_SIZE);
    }

    #[test]
    fn free_of_reserved_frame_makes_it_allocatable() {
        let phys = SimPhys::new(8);
        let mut regions = [MemoryRegion::usable(0, 8 * PAGE_SIZE)];
        let mut pmm = unsafe { BitmapFrameAlloc::init(&mut regions, &phys) };
        pmm.free(PhysicalAddress::new(0));
        assert_eq!(pmm.free_memory(), 8 * PAGE_SIZE);
    }

    #[test]
    fn no_fitting_region_leaves_allocator_uninitialized() {
        let phys = SimPhys::new(1);
        // Highest end at 1 GiB needs a 32 KiB bitmap; the only usable region holds 4 KiB.
        let mut regions = [
            MemoryRegion::usable(0, PAGE_SIZE),
            MemoryRegion::new(1024 * MIB - PAGE_SIZE, PAGE_SIZE, MemoryRegionKind::Reserved),
        ];
        let mut pmm = unsafe { BitmapFrameAlloc::init(&mut regions, &phys) };

        assert!(!pmm.is_initialized());
        assert_eq!(pmm.allocate(), Err(FrameAllocError::Uninitialized));
        assert_eq!(pmm.free_memory(), 0);
        pmm.free(PhysicalAddress::new(0));
        assert_eq!(regions[0].length, PAGE_SIZE);
    }

    #[test]
    fn bitmap_padding_bits_are_never_handed_out() {
        // 70 pages: two bitmap words, the second one mostly padding.
        let phys = SimPhys::new(70);
        let mut regions = [MemoryRegion::usable(0, 70 * PAGE_SIZE)];
        let mut pmm = unsafe { BitmapFrameAlloc::init(&mut regions, &phys) };
        assert_eq!(pmm.free_memory(), 69 * PAGE_SIZE);

        let mut count = 0;
        while let Ok(frame) = pmm.allocate() {
            assert!(frame.frame_index() < 70);
            count += 1;
        }
        assert_eq!(count, 69);
        assert_eq!(pmm.used_memory(), 70 * PAGE_SIZE);
    }

    #[test]
    fn uninitialized_constructor() {
        let mut pmm = BitmapFrameAlloc::uninitialized();
        assert!(pmm.alloc_4k().is_none());
        assert_eq!(pmm.total_memory(), 0);
    }
}
