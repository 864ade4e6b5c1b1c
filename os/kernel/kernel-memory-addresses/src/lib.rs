//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and page bases used by the
//! frame allocator, the page-table code and the kernel heap.
//!
//! ## Overview
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 64-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//!
//! These are wrapped to distinguish between the two address spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory frames. |
//!
//! ## Page Sizes
//!
//! The memory subsystem only manages 4 KiB frames, so [`Size4K`] is the one
//! marker implementing [`PageSize`]. The trait is sealed.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_8000_0000_1234);
//! assert!(va.is_canonical());
//!
//! let (page, offset) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0xFFFF_8000_0000_1000);
//! assert_eq!(offset, 0x234);
//!
//! let frame = PhysicalPage::<Size4K>::from_frame_index(3);
//! assert_eq!(frame.base().as_u64(), 0x3000);
//! assert_eq!(frame.join(0x10).as_u64(), 0x3010);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod memory_address;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_address::MemoryAddress;
pub use memory_page::MemoryPage;
pub use page_size::{PageSize, Size4K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;
