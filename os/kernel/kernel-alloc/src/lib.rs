//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! The three allocators the kernel runs on, stacked like this:
//!
//! ```text
//! ┌──────────────────────────┐   ┌──────────────────────────┐
//! │ Vmm                      │   │ BumpHeap                 │
//! │  page tables, TLB,       │   │  8-byte aligned bytes,   │
//! │  roots, paging enable    │   │  never freed             │
//! └────────────┬─────────────┘   └────────────┬─────────────┘
//!              │ table frames                 │ backing frames
//! ┌────────────▼──────────────────────────────▼─────────────┐
//! │ BitmapFrameAlloc                                         │
//! │  one bit per 4 KiB frame, bitmap lives in usable memory  │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ reached through
//! ┌────────────────────────────▼─────────────────────────────┐
//! │ HhdmPhysMapper  (physical address + HHDM offset)         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! None of these types lock. The kernel wraps them in its own
//! interrupt-safe spin lock; host tests drive them directly over the
//! simulated memory from `kernel_vmem::sim`.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

pub mod frame_alloc;
pub mod heap;
pub mod phys_mapper;
pub mod vmm;

pub use crate::frame_alloc::{BitmapFrameAlloc, FrameAllocError};
pub use crate::heap::{BumpHeap, HeapError, HeapSpan};
pub use crate::phys_mapper::HhdmPhysMapper;
pub use crate::vmm::Vmm;
