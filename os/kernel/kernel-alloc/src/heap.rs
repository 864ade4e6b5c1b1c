//! # Bump Heap
//!
//! Byte-granular kernel allocations carved from physical frames and
//! addressed through the [`PhysMapper`] (the HHDM), never through page tables.
//!
//! Memory grows one frame at a time. A frame physically adjacent to the
//! last span extends it; any other frame starts a new span:
//!
//! ```text
//! span 0: [frame 7][frame 8][frame 9]   used ███████░░░
//! span 1: [frame 42]                    used ██░░░░░░░░  ◄ bump cursor
//! ```
//!
//! Allocations are 8-byte aligned and never returned; `free` is a no-op.

use arrayvec::ArrayVec;
use core::ptr::NonNull;
use kernel_info::memory::{MAX_HEAP_SPANS, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, trace};

/// Alignment of every allocation.
pub const HEAP_ALIGN: u64 = 8;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap cannot grow: physical memory or span slots exhausted")]
    OutOfMemory,
    #[error("invalid heap request: {0}")]
    InvalidRequest(&'static str),
}

/// A physically contiguous extent owned by the heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapSpan {
    base: PhysicalAddress,
    length: u64,
    used: u64,
}

impl HeapSpan {
    const fn new(frame: PhysicalPage<Size4K>) -> Self {
        Self {
            base: frame.base(),
            length: PAGE_SIZE,
            used: 0,
        }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Bytes handed out from this span.
    #[must_use]
    pub const fn used(&self) -> u64 {
        self.used
    }

    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.length - self.used
    }

    const fn end(&self) -> u64 {
        self.base.as_u64() + self.length
    }
}

/// Bump allocator over a list of physical spans.
pub struct BumpHeap<'m, M: PhysMapper> {
    mapper: &'m M,
    spans: ArrayVec<HeapSpan, MAX_HEAP_SPANS>,
}

impl<'m, M: PhysMapper> BumpHeap<'m, M> {
    /// Start a heap with one frame from `frames`.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if no frame is available.
    pub fn new<A: FrameAlloc>(mapper: &'m M, frames: &mut A) -> Result<Self, HeapError> {
        let frame = frames.alloc_4k().ok_or(HeapError::OutOfMemory)?;
        let mut spans = ArrayVec::new();
        spans.push(HeapSpan::new(frame));
        debug!("heap: first span at {frame:?}");
        Ok(Self { mapper, spans })
    }

    /// Allocate `size` bytes, 8-byte aligned.
    ///
    /// Frames taken while growing stay with the heap even if the request
    /// ultimately fails.
    ///
    /// # Errors
    /// - [`HeapError::InvalidRequest`] for `size == 0`.
    /// - [`HeapError::OutOfMemory`] if the heap cannot grow far enough.
    pub fn alloc<A: FrameAlloc>(&mut self, frames: &mut A, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidRequest("zero-sized allocation"));
        }
        let size = (size as u64)
            .checked_next_multiple_of(HEAP_ALIGN)
            .ok_or(HeapError::InvalidRequest("allocation size overflows"))?;

        while self.last_remaining() < size {
            self.grow(frames)?;
        }

        let span = self.spans.last_mut().ok_or(HeapError::OutOfMemory)?;
        let pa = PhysicalAddress::new(span.base.as_u64() + span.used);
        span.used += size;

        trace!("heap: {size} bytes at {pa}");
        NonNull::new(self.mapper.phys_to_ptr(pa)).ok_or(HeapError::OutOfMemory)
    }

    /// Release an allocation. The bump heap never reuses memory.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.contains(ptr.as_ptr()), "free of foreign pointer {ptr:p}");
        trace!("heap: ignoring free of {ptr:p}");
    }

    /// Bytes handed out.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.spans.iter().map(HeapSpan::used).sum()
    }

    /// Bytes owned, used or not.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.spans.iter().map(HeapSpan::length).sum()
    }

    #[must_use]
    pub fn spans(&self) -> &[HeapSpan] {
        &self.spans
    }

    /// Whether `ptr` points into memory owned by the heap.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr.addr();
        self.spans.iter().any(|span| {
            let start = self.mapper.phys_to_ptr(span.base).addr();
            #[allow(clippy::cast_possible_truncation)]
            let len = span.length as usize;
            addr >= start && addr - start < len
        })
    }

    fn last_remaining(&self) -> u64 {
        self.spans.last().map_or(0, HeapSpan::remaining)
    }

    fn grow<A: FrameAlloc>(&mut self, frames: &mut A) -> Result<(), HeapError> {
        let frame = frames.alloc_4k().ok_or(HeapError::OutOfMemory)?;

        if let Some(last) = self.spans.last_mut()
            && last.end() == frame.base().as_u64()
        {
            last.length += PAGE_SIZE;
            return Ok(());
        }

        if self.spans.try_push(HeapSpan::new(frame)).is_err() {
            frames.free_4k(frame);
            return Err(HeapError::OutOfMemory);
        }
        debug!("heap: new span at {frame:?} ({} spans)", self.spans.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::sim::{SimFrameAlloc, SimPhys};

    #[test]
    fn zero_size_is_rejected() {
        let phys = SimPhys::new(4);
        let mut frames = SimFrameAlloc::new(1, 3);
        let mut heap = BumpHeap::new(&phys, &mut frames).unwrap();
        assert_eq!(
            heap.alloc(&mut frames, 0),
            Err(HeapError::InvalidRequest("zero-sized allocation"))
        );
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn sizes_round_to_eight() {
        let phys = SimPhys::new(4);
        let mut frames = SimFrameAlloc::new(1, 3);
        let mut heap = BumpHeap::new(&phys, &mut frames).unwrap();

        let a = heap.alloc(&mut frames, 1).unwrap();
        let b = heap.alloc(&mut frames, 9).unwrap();
        let c = heap.alloc(&mut frames, 8).unwrap();
        assert_eq!(b.addr().get() - a.addr().get(), 8);
        assert_eq!(c.addr().get() - b.addr().get(), 16);
        assert_eq!(heap.used(), 32);
        assert_eq!(heap.total(), PAGE_SIZE);
        for p in [a, b, c] {
            assert_eq!(p.addr().get() % 8, 0);
            assert!(heap.contains(p.as_ptr()));
        }
    }

    #[test]
    fn contiguous_frames_extend_the_span() {
        let phys = SimPhys::new(8);
        let mut frames = SimFrameAlloc::new(1, 7);
        let mut heap = BumpHeap::new(&phys, &mut frames).unwrap();

        heap.alloc(&mut frames, 4000).unwrap();
        heap.alloc(&mut frames, 4000).unwrap();
        assert_eq!(heap.spans().len(), 1);
        assert_eq!(heap.total(), 2 * PAGE_SIZE);
        assert_eq!(heap.used(), 8000);
    }

    #[test]
    fn large_request_spans_several_frames() {
        let phys = SimPhys::new(8);
        let mut frames = SimFrameAlloc::new(1, 7);
        let mut heap = BumpHeap::new(&phys, &mut frames).unwrap();

        let p = heap.alloc(&mut frames, 3 * 4096 + 1).unwrap();
        assert_eq!(heap.spans().len(), 1);
        assert_eq!(heap.total(), 4 * PAGE_SIZE);
        assert!(heap.contains(p.as_ptr()));
    }

    #[test]
    fn discontiguous_frame_starts_a_new_span() {
        let phys = SimPhys::new(16);
        let mut frames = SimFrameAlloc::new(1, 15);
        let mut heap = BumpHeap::new(&phys, &mut frames).unwrap();
        // Take frame 2 away so the next frame is not adjacent to frame 1.
        let hole = frames.alloc_4k().unwrap();

        let first = heap.alloc(&mut frames, 4096).unwrap();
        let second = heap.alloc(&mut frames, 16).unwrap();
        assert_eq!(heap.spans().len(), 2);
        assert_eq!(heap.spans()[1].base(), PhysicalAddress::new(3 * PAGE_SIZE));
        assert_eq!(heap.spans()[1].used(), 16);
        assert!(!heap.contains(phys.phys_to_ptr(hole.base())));
        assert!(heap.contains(first.as_ptr()) && heap.contains(second.as_ptr()));
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let phys = SimPhys::new(4);
        let mut frames = SimFrameAlloc::new(1, 2);
        let mut heap = BumpHeap::new(&phys, &mut frames).unwrap();

        assert_eq!(
            heap.alloc(&mut frames, 3 * 4096),
            Err(HeapError::OutOfMemory)
        );
        // The frame taken while trying stays with the heap.
        assert_eq!(heap.total(), 2 * PAGE_SIZE);
        assert_eq!(heap.used(), 0);
        assert!(heap.alloc(&mut frames, 8).is_ok());
    }

    #[test]
    fn allocations_do_not_overlap_and_keep_contents() {
        let phys = SimPhys::new(8);
        let mut frames = SimFrameAlloc::new(1, 7);
        let mut heap = BumpHeap::new(&phys, &mut frames).unwrap();

        let mut ptrs = Vec::new();
        for i in 0..100_u8 {
            let p = heap.alloc(&mut frames, 24).unwrap();
            unsafe { p.as_ptr().write_bytes(i, 24) };
            ptrs.push(p);
        }
        for (i, p) in (0..100_u8).zip(&ptrs) {
            let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 24) };
            assert!(bytes.iter().all(|&b| b == i));
        }
        heap.free(ptrs[0]);
        assert_eq!(heap.used(), 2400);
    }

    #[test]
    fn no_heap_without_a_first_frame() {
        let phys = SimPhys::new(1);
        let mut frames = SimFrameAlloc::empty();
        assert!(matches!(
            BumpHeap::new(&phys, &mut frames),
            Err(HeapError::OutOfMemory)
        ));
    }
}
