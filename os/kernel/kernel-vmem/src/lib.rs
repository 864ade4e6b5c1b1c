//! # Virtual Memory Support
//!
//! Four-level x86-64 page tables for the kernel's memory subsystem.
//!
//! ## What you get
//! - [`AddressSpace`]: walk, map, unmap, and translate inside one tree rooted
//!   at an L4 table, with lazily created intermediate tables.
//! - [`PageEntry`] / [`PageFlags`]: bitfield models of table entries and of
//!   the flags callers may request.
//! - [`PageTable`] and [`TableFrame<L>`]: 4 KiB tables and level-tagged
//!   handles to the frames holding them.
//! - [`FrameAlloc`] / [`PhysMapper`]: the seams through which tables are
//!   obtained from the frame allocator and made addressable.
//! - [`PagingControl`]: the architecture interface (root register, paging
//!   enable, TLB invalidation, fault address) with an x86-64 implementation
//!   and, behind the `sim` feature, a simulated one for host tests.
//! - [`fault`]: decoding of page-fault error codes and the fail-stop fault
//!   state machine.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 63‒48 | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! | sign  |   L4  |   L3  |   L2  |   L1  | Offset |
//! ```
//!
//! Bits 63‒48 must copy bit 47 (canonical form); the walk rejects any other
//! address before touching a table.
//!
//! ```text
//!  L4 (root) → L3 → L2 → L1 → 4 KiB frame
//!      │        │     │     └─► leaf entry: frame | flags | present
//!      │        │     └───────► non-leaf entry: table | present | writable
//!      │        └─────────────► non-leaf entry
//!      └──────────────────────► non-leaf entry, root frame loaded into CR3
//! ```
//!
//! ## Table lifetime
//!
//! Every non-leaf entry created by this crate is tagged `owned` and carries
//! the number of present entries in the table it points to. When an unmap
//! drops that count to zero the table frame goes back to the frame
//! allocator and the parent entry is cleared, recursively up to (but never
//! including) the root. Entries copied from another root (the bootloader's
//! kernel half) are not `owned` and the tables behind them are never freed.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

pub mod address_space;
pub mod arch;
mod entry;
mod error;
pub mod fault;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
mod table;

pub use crate::address_space::{AddressSpace, LeafSlot, RootPage, Translation};
pub use crate::arch::PagingControl;
#[cfg(target_arch = "x86_64")]
pub use crate::arch::X86Paging;
pub use crate::entry::{PageEntry, PageFlags};
pub use crate::error::VmmError;
pub use crate::table::{L1, L2, L3, L4, NonLeafLevel, PageTable, TableFrame, TableLevel};

pub use kernel_info::memory as info;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Source of zero-initialized 4 KiB frames for page tables.
pub trait FrameAlloc {
    /// Take one free frame, or `None` if physical memory is exhausted.
    ///
    /// The frame's contents are unspecified; callers zero it through a
    /// [`PhysMapper`] before use.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Give a frame back.
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>);
}

/// Makes physical memory addressable by the running code.
///
/// The kernel implements this with the higher-half direct map; tests use a
/// heap-allocated arena.
pub trait PhysMapper {
    /// Pointer through which the byte at `pa` can be accessed.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// View the memory at `pa` as a `T`.
    ///
    /// # Safety
    /// - `pa` must be suitably aligned for `T` and backed by `size_of::<T>()`
    ///   bytes of accessible memory.
    /// - No other live reference may alias the returned one.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }

    /// View `len` consecutive `T`s at `pa` as a slice.
    ///
    /// # Safety
    /// Same requirements as [`PhysMapper::phys_to_mut`], for the whole range.
    #[inline]
    unsafe fn phys_to_slice_mut<'a, T>(&self, pa: PhysicalAddress, len: usize) -> &'a mut [T] {
        unsafe { core::slice::from_raw_parts_mut(self.phys_to_ptr(pa).cast::<T>(), len) }
    }

    /// Fill the frame with zeros.
    #[inline]
    fn zero_frame(&self, frame: PhysicalPage<Size4K>) {
        // SAFETY: a frame is exactly one `PageTable` worth of accessible memory.
        unsafe {
            core::ptr::write_bytes(self.phys_to_ptr(frame.base()).cast::<PageTable>(), 0, 1);
        }
    }
}

impl<T: FrameAlloc + ?Sized> FrameAlloc for &mut T {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    #[inline]
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        (**self).free_4k(frame);
    }
}
